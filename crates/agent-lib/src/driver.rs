//! Scan, aggregate, publish, sleep
//!
//! The loop is an explicit state machine. [`Driver::step`] performs exactly
//! one transition:
//!
//! | state       | success               | failure                           |
//! |-------------|-----------------------|-----------------------------------|
//! | `Scan`      | `Aggregate(workloads)`| any scan error: `Sleep`           |
//! | `Aggregate` | `Publish(snapshot)`   | any aggregation error: `Sleep`    |
//! | `Publish`   | `Sleep`               | fatal publish error: exit         |
//! | `Sleep`     | `Scan`                |                                   |
//!
//! Only fatal errors leave the machine.

use crate::aggregator::{AggregationWarnings, ResourceAggregator};
use crate::error::ExporterError;
use crate::exporter::{SnapshotPublisher, DEFAULT_PUBLISH_NAMESPACE};
use crate::finder::RuntimeScanner;
use crate::health::{components, HealthRegistry};
use crate::models::{NumaResourceSnapshot, WorkloadAllocation};
use crate::observability::{ExporterMetrics, StructuredLogger};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(3);

/// Named states of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleState {
    Scan,
    Aggregate(Vec<WorkloadAllocation>),
    Publish(NumaResourceSnapshot),
    Sleep,
}

impl CycleState {
    pub fn name(&self) -> &'static str {
        match self {
            CycleState::Scan => "scan",
            CycleState::Aggregate(_) => "aggregate",
            CycleState::Publish(_) => "publish",
            CycleState::Sleep => "sleep",
        }
    }
}

/// What the current cycle has seen so far, reported when it ends
#[derive(Debug, Default)]
struct CycleStats {
    started: Option<Instant>,
    workloads: usize,
    warnings: AggregationWarnings,
}

/// The exporter's control loop
pub struct Driver<S, P> {
    scanner: S,
    aggregator: ResourceAggregator,
    publisher: P,
    scope: String,
    sleep_interval: Duration,
    metrics: ExporterMetrics,
    health: HealthRegistry,
    logger: StructuredLogger,
    cycle: CycleStats,
}

impl<S: RuntimeScanner, P: SnapshotPublisher> Driver<S, P> {
    pub fn builder(
        scanner: S,
        aggregator: ResourceAggregator,
        publisher: P,
    ) -> DriverBuilder<S, P> {
        DriverBuilder {
            scanner,
            aggregator,
            publisher,
            scope: DEFAULT_PUBLISH_NAMESPACE.to_string(),
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            metrics: None,
            health: None,
            logger: None,
        }
    }

    pub fn metrics(&self) -> &ExporterMetrics {
        &self.metrics
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Perform one transition
    pub async fn step(&mut self, state: CycleState) -> Result<CycleState, ExporterError> {
        match state {
            CycleState::Scan => {
                self.cycle = CycleStats {
                    started: Some(Instant::now()),
                    ..Default::default()
                };
                match self.scanner.scan().await {
                    Ok(allocations) => {
                        self.cycle.workloads = allocations.len();
                        self.metrics.set_workloads_scanned(allocations.len());
                        self.health.set_healthy(components::SCANNER).await;
                        Ok(CycleState::Aggregate(allocations))
                    }
                    Err(err) => {
                        self.metrics.inc_scan_failures();
                        self.skip(components::SCANNER, err).await
                    }
                }
            }
            CycleState::Aggregate(allocations) => match self.aggregator.aggregate(&allocations) {
                Ok(aggregation) => {
                    self.cycle.warnings = aggregation.warnings;
                    self.metrics.record_warnings(&aggregation.warnings);
                    self.health.set_healthy(components::AGGREGATOR).await;
                    Ok(CycleState::Publish(aggregation.snapshot))
                }
                Err(err) => {
                    self.metrics.inc_aggregation_failures();
                    self.skip(components::AGGREGATOR, err).await
                }
            },
            CycleState::Publish(snapshot) => {
                match self.publisher.publish(&self.scope, &snapshot).await {
                    Ok(report) => {
                        self.metrics.record_publish(report.attempts);
                        self.health.record_publish().await;
                        self.logger.log_snapshot_published(
                            &snapshot,
                            self.cycle.workloads,
                            &self.cycle.warnings,
                            report.attempts,
                        );
                        Ok(CycleState::Sleep)
                    }
                    Err(err) if err.is_fatal() => {
                        self.health
                            .set_unhealthy(components::PUBLISHER, err.to_string())
                            .await;
                        Err(err)
                    }
                    Err(err) => self.skip(components::PUBLISHER, err).await,
                }
            }
            CycleState::Sleep => {
                if let Some(started) = self.cycle.started.take() {
                    self.metrics
                        .observe_cycle_duration(started.elapsed().as_secs_f64());
                }
                tokio::time::sleep(self.sleep_interval).await;
                Ok(CycleState::Scan)
            }
        }
    }

    /// Drive cycles until a fatal error occurs
    pub async fn run(&mut self) -> ExporterError {
        debug!(
            scope = %self.scope,
            interval_ms = self.sleep_interval.as_millis() as u64,
            "Starting driver loop"
        );
        let mut state = CycleState::Scan;
        loop {
            state = match self.step(state).await {
                Ok(next) => next,
                Err(err) => return err,
            };
        }
    }

    /// End the cycle early and retry on the next one
    async fn skip(&self, stage: &str, err: ExporterError) -> Result<CycleState, ExporterError> {
        self.health.set_degraded(stage, err.to_string()).await;
        self.logger.log_cycle_skipped(stage, &err.to_string());
        Ok(CycleState::Sleep)
    }
}

/// Builder for [`Driver`]
pub struct DriverBuilder<S, P> {
    scanner: S,
    aggregator: ResourceAggregator,
    publisher: P,
    scope: String,
    sleep_interval: Duration,
    metrics: Option<ExporterMetrics>,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl<S: RuntimeScanner, P: SnapshotPublisher> DriverBuilder<S, P> {
    /// Namespace the snapshot is published into
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = interval;
        self
    }

    pub fn metrics(mut self, metrics: ExporterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<Driver<S, P>, ExporterError> {
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => ExporterMetrics::new()
                .map_err(|e| ExporterError::config(format!("Failed to register metrics: {}", e)))?,
        };

        Ok(Driver {
            scanner: self.scanner,
            aggregator: self.aggregator,
            publisher: self.publisher,
            scope: self.scope,
            sleep_interval: self.sleep_interval,
            metrics,
            health: self.health.unwrap_or_default(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("unknown")),
            cycle: CycleStats::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::PublishReport;
    use crate::health::ComponentStatus;
    use crate::models::{GrantedUnit, NumaNodeId, CPU_RESOURCE};
    use crate::topology::{HostTopology, PciResourceMap, ResourceMapper};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    type ScanResult = Result<Vec<WorkloadAllocation>, ExporterError>;

    #[derive(Clone, Default)]
    struct ScriptedScanner {
        results: Arc<Mutex<VecDeque<ScanResult>>>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedScanner {
        fn push(&self, result: ScanResult) {
            self.results.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl RuntimeScanner for ScriptedScanner {
        async fn scan(&self) -> ScanResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPublisher {
        published: Arc<Mutex<Vec<NumaResourceSnapshot>>>,
        fail_with_conflict: bool,
    }

    #[async_trait]
    impl SnapshotPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _scope: &str,
            snapshot: &NumaResourceSnapshot,
        ) -> Result<PublishReport, ExporterError> {
            if self.fail_with_conflict {
                return Err(ExporterError::PublishConflict {
                    attempts: 5,
                    message: "modified".into(),
                });
            }
            self.published.lock().unwrap().push(snapshot.clone());
            Ok(PublishReport {
                attempts: 1,
                created: false,
            })
        }
    }

    fn aggregator() -> ResourceAggregator {
        let topology = HostTopology::builder()
            .node(NumaNodeId(0), 0..2, 0)
            .node(NumaNodeId(1), 2..4, 0)
            .build()
            .unwrap();
        ResourceAggregator::new(Arc::new(ResourceMapper::new(
            topology,
            PciResourceMap::default(),
        )))
    }

    fn workload(cpus: &[u32]) -> WorkloadAllocation {
        WorkloadAllocation {
            namespace: "default".into(),
            pod_name: "pod".into(),
            container_name: "app".into(),
            container_id: "id".into(),
            grants: cpus.iter().copied().map(GrantedUnit::Cpu).collect(),
        }
    }

    async fn driver(
        scanner: ScriptedScanner,
        publisher: RecordingPublisher,
    ) -> Driver<ScriptedScanner, RecordingPublisher> {
        Driver::builder(scanner, aggregator(), publisher)
            .sleep_interval(Duration::from_millis(1))
            .health(HealthRegistry::for_pipeline().await)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let scanner = ScriptedScanner::default();
        scanner.push(Ok(vec![workload(&[1])]));
        let publisher = RecordingPublisher::default();
        let mut driver = driver(scanner, publisher.clone()).await;

        let state = driver.step(CycleState::Scan).await.unwrap();
        assert_eq!(state.name(), "aggregate");
        let state = driver.step(state).await.unwrap();
        assert_eq!(state.name(), "publish");
        let state = driver.step(state).await.unwrap();
        assert_eq!(state, CycleState::Sleep);
        assert_eq!(driver.step(state).await.unwrap(), CycleState::Scan);

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].get(NumaNodeId(0), CPU_RESOURCE).map(|a| a.allocated),
            Some(1)
        );
        assert_eq!(driver.metrics().snapshots_published(), 1);
        assert!(driver.health().readiness().await.ready);
    }

    #[tokio::test]
    async fn test_scan_failure_skips_to_sleep() {
        let scanner = ScriptedScanner::default();
        scanner.push(Err(ExporterError::runtime_unavailable("connection refused")));
        let publisher = RecordingPublisher::default();
        let mut driver = driver(scanner, publisher.clone()).await;

        let state = driver.step(CycleState::Scan).await.unwrap();
        assert_eq!(state, CycleState::Sleep);
        assert!(publisher.published.lock().unwrap().is_empty());
        assert_eq!(driver.metrics().scan_failures(), 1);

        let health = driver.health().health().await;
        assert_eq!(
            health.components[components::SCANNER].status,
            ComponentStatus::Degraded
        );

        // The next cycle recovers
        let state = driver.step(state).await.unwrap();
        let state = driver.step(state).await.unwrap();
        assert_eq!(state.name(), "aggregate");
    }

    #[tokio::test]
    async fn test_inconsistency_skips_publish() {
        let scanner = ScriptedScanner::default();
        scanner.push(Ok(vec![workload(&[0]), workload(&[0, 1, 0])]));
        let publisher = RecordingPublisher::default();
        let mut driver = driver(scanner, publisher.clone()).await;

        let state = driver.step(CycleState::Scan).await.unwrap();
        let state = driver.step(state).await.unwrap();

        assert_eq!(state, CycleState::Sleep);
        assert!(publisher.published.lock().unwrap().is_empty());
        assert_eq!(driver.metrics().aggregation_failures(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_fatal() {
        let scanner = ScriptedScanner::default();
        let publisher = RecordingPublisher {
            fail_with_conflict: true,
            ..Default::default()
        };
        let mut driver = driver(scanner.clone(), publisher).await;

        let err = driver.run().await;

        assert!(matches!(err, ExporterError::PublishConflict { .. }));
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);
        let health = driver.health().health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_any_scan_error_only_skips_the_cycle() {
        let scanner = ScriptedScanner::default();
        scanner.push(Err(ExporterError::config("bad endpoint")));
        scanner.push(Err(ExporterError::topology("node vanished")));
        let mut driver = driver(scanner, RecordingPublisher::default()).await;

        for _ in 0..2 {
            let state = driver.step(CycleState::Scan).await.unwrap();
            assert_eq!(state, CycleState::Sleep);
        }
        assert_eq!(driver.metrics().scan_failures(), 2);

        let health = driver.health().health().await;
        assert_eq!(
            health.components[components::SCANNER].status,
            ComponentStatus::Degraded
        );
        assert_ne!(health.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_run_keeps_going_after_skipped_cycles() {
        let scanner = ScriptedScanner::default();
        scanner.push(Err(ExporterError::runtime_unavailable("down")));
        scanner.push(Err(ExporterError::runtime_unavailable("down")));
        scanner.push(Ok(vec![workload(&[2, 3])]));
        let publisher = RecordingPublisher::default();
        let mut driver = driver(scanner.clone(), publisher.clone()).await;

        let mut state = CycleState::Scan;
        while publisher.published.lock().unwrap().is_empty() {
            state = driver.step(state).await.unwrap();
        }

        assert_eq!(scanner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(driver.metrics().scan_failures(), 2);
    }
}
