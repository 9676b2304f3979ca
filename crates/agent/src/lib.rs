//! Operator-facing surface of the resource topology exporter

pub mod api;
pub mod config;
