//! Node-local NUMA resource topology exporter
//!
//! This crate provides the core functionality for:
//! - Static NUMA topology and PCI device mapping discovery
//! - Scanning the container runtime for granted CPUs, memory and devices
//! - Aggregating capacity and allocation per NUMA node
//! - Publishing `NodeResourceTopology` objects
//! - Health checks and observability

pub mod aggregator;
pub mod driver;
pub mod error;
pub mod exporter;
pub mod finder;
pub mod health;
pub mod models;
pub mod observability;
pub mod proto;
pub mod topology;

pub use aggregator::{Aggregation, AggregationWarnings, ResourceAggregator};
pub use driver::{CycleState, Driver, DriverBuilder};
pub use error::ExporterError;
pub use exporter::{Exporter, KubeTopologyStore, SnapshotPublisher, TopologyStore};
pub use finder::{CriScanner, RuntimeKind, RuntimeScanner};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ExporterMetrics, StructuredLogger};
pub use topology::{HostTopology, ResourceMapper};
