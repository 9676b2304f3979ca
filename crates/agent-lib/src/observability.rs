//! Prometheus metrics and structured lifecycle events

use crate::aggregator::AggregationWarnings;
use crate::models::NumaResourceSnapshot;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::{debug, info, warn};

/// Buckets for cycle duration, in seconds
const CYCLE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Exporter metrics, each handle shares the underlying series
#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,
    cycle_duration_seconds: Histogram,
    scan_failures: IntCounter,
    aggregation_failures: IntCounter,
    unresolved_units: IntGauge,
    unrecognized_devices: IntGauge,
    workloads_scanned: IntGauge,
    publish_conflicts: IntCounter,
    snapshots_published: IntCounter,
}

impl ExporterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cycle_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "rte_cycle_duration_seconds",
                "Time spent on one scan, aggregate and publish cycle",
            )
            .buckets(CYCLE_BUCKETS.to_vec()),
        )?;
        let scan_failures = IntCounter::new(
            "rte_scan_failures_total",
            "Cycles skipped because the container runtime was unreachable",
        )?;
        let aggregation_failures = IntCounter::new(
            "rte_aggregation_failures_total",
            "Cycles skipped because allocations exceeded capacity",
        )?;
        let unresolved_units = IntGauge::new(
            "rte_unresolved_units",
            "Granted units with no known NUMA node in the last cycle",
        )?;
        let unrecognized_devices = IntGauge::new(
            "rte_unrecognized_devices",
            "Granted devices without a resource mapping in the last cycle",
        )?;
        let workloads_scanned = IntGauge::new(
            "rte_workloads_scanned",
            "Running containers reported by the last scan",
        )?;
        let publish_conflicts = IntCounter::new(
            "rte_publish_conflicts_total",
            "Publish attempts lost to a concurrent writer",
        )?;
        let snapshots_published = IntCounter::new(
            "rte_snapshots_published_total",
            "Snapshots successfully published",
        )?;

        registry.register(Box::new(cycle_duration_seconds.clone()))?;
        registry.register(Box::new(scan_failures.clone()))?;
        registry.register(Box::new(aggregation_failures.clone()))?;
        registry.register(Box::new(unresolved_units.clone()))?;
        registry.register(Box::new(unrecognized_devices.clone()))?;
        registry.register(Box::new(workloads_scanned.clone()))?;
        registry.register(Box::new(publish_conflicts.clone()))?;
        registry.register(Box::new(snapshots_published.clone()))?;

        Ok(Self {
            registry,
            cycle_duration_seconds,
            scan_failures,
            aggregation_failures,
            unresolved_units,
            unrecognized_devices,
            workloads_scanned,
            publish_conflicts,
            snapshots_published,
        })
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.cycle_duration_seconds.observe(duration_secs);
    }

    pub fn inc_scan_failures(&self) {
        self.scan_failures.inc();
    }

    pub fn inc_aggregation_failures(&self) {
        self.aggregation_failures.inc();
    }

    pub fn set_workloads_scanned(&self, count: usize) {
        self.workloads_scanned.set(count as i64);
    }

    pub fn record_warnings(&self, warnings: &AggregationWarnings) {
        self.unresolved_units.set(warnings.unresolved_units as i64);
        self.unrecognized_devices.set(warnings.unrecognized_devices as i64);
    }

    /// Count a successful publish that needed `attempts` tries
    pub fn record_publish(&self, attempts: u32) {
        self.publish_conflicts.inc_by(u64::from(attempts.saturating_sub(1)));
        self.snapshots_published.inc();
    }

    pub fn snapshots_published(&self) -> u64 {
        self.snapshots_published.get()
    }

    pub fn scan_failures(&self) -> u64 {
        self.scan_failures.get()
    }

    pub fn aggregation_failures(&self) -> u64 {
        self.aggregation_failures.get()
    }

    /// Text exposition of every exporter metric
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Structured logger for exporter lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(
        &self,
        version: &str,
        runtime: &str,
        policy: &str,
        numa_nodes: usize,
        mapped_devices: usize,
    ) {
        info!(
            event = "exporter_started",
            node = %self.node_name,
            exporter_version = %version,
            runtime = %runtime,
            topology_policy = %policy,
            numa_nodes,
            mapped_devices,
            "Resource topology exporter started"
        );
    }

    /// A cycle that ended without publishing
    pub fn log_cycle_skipped(&self, stage: &str, reason: &str) {
        warn!(
            event = "cycle_skipped",
            node = %self.node_name,
            stage = %stage,
            reason = %reason,
            "Cycle skipped"
        );
    }

    /// Summary at info, the full snapshot at debug
    pub fn log_snapshot_published(
        &self,
        snapshot: &NumaResourceSnapshot,
        workloads: usize,
        warnings: &AggregationWarnings,
        attempts: u32,
    ) {
        info!(
            event = "snapshot_published",
            node = %self.node_name,
            workloads,
            entries = snapshot.len(),
            unresolved_units = warnings.unresolved_units,
            unrecognized_devices = warnings.unrecognized_devices,
            attempts,
            "Published NUMA resource snapshot"
        );

        match serde_json::to_string(snapshot) {
            Ok(json) => debug!(event = "snapshot", node = %self.node_name, snapshot = %json),
            Err(e) => debug!(error = %e, "Failed to serialize snapshot for logging"),
        }
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Resource topology exporter shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_isolated_per_instance() {
        let first = ExporterMetrics::new().unwrap();
        let second = ExporterMetrics::new().unwrap();

        first.inc_scan_failures();
        assert_eq!(first.scan_failures(), 1);
        assert_eq!(second.scan_failures(), 0);
    }

    #[test]
    fn test_publish_counts_conflicts() {
        let metrics = ExporterMetrics::new().unwrap();
        metrics.record_publish(1);
        metrics.record_publish(3);
        metrics.observe_cycle_duration(0.02);
        metrics.record_warnings(&AggregationWarnings {
            unresolved_units: 2,
            unrecognized_devices: 1,
        });

        assert_eq!(metrics.snapshots_published(), 2);
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("rte_publish_conflicts_total 2"));
        assert!(text.contains("rte_unresolved_units 2"));
        assert!(text.contains("rte_cycle_duration_seconds_count 1"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("worker-0");
        assert_eq!(logger.node_name, "worker-0");
    }
}
