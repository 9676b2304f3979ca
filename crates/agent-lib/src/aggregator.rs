//! Per-NUMA resource aggregation
//!
//! Combines one scan's workload allocations with the static topology into a
//! [`NumaResourceSnapshot`]. The snapshot is built in full before it is
//! returned, so a failed aggregation never leaves partial numbers behind.

use crate::error::ExporterError;
use crate::models::{GrantedUnit, NumaResourceSnapshot, WorkloadAllocation};
use crate::topology::ResourceMapper;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Non-fatal anomalies observed while aggregating
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationWarnings {
    /// Granted units with no known NUMA node (stale or hot-removed hardware)
    pub unresolved_units: usize,
    /// Granted devices without an entry in the PCI resource map
    pub unrecognized_devices: usize,
}

/// Result of one successful aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    pub snapshot: NumaResourceSnapshot,
    pub warnings: AggregationWarnings,
}

/// Computes capacity and allocation per (NUMA node, resource name)
#[derive(Debug, Clone)]
pub struct ResourceAggregator {
    mapper: Arc<ResourceMapper>,
    capacity: NumaResourceSnapshot,
}

impl ResourceAggregator {
    /// Create an aggregator; static capacity is computed once here
    pub fn new(mapper: Arc<ResourceMapper>) -> Self {
        let mut capacity = NumaResourceSnapshot::new();
        for unit in mapper.static_units() {
            capacity.entry_mut(unit.node, &unit.resource_name).capacity += unit.capacity;
        }
        Self { mapper, capacity }
    }

    pub fn mapper(&self) -> &ResourceMapper {
        &self.mapper
    }

    /// Aggregate the allocations of one scan
    pub fn aggregate(
        &self,
        allocations: &[WorkloadAllocation],
    ) -> Result<Aggregation, ExporterError> {
        // Explicit zero entries for everything with static capacity
        let mut snapshot = self.capacity.clone();
        let mut warnings = AggregationWarnings::default();

        for allocation in allocations {
            for unit in &allocation.grants {
                let Some(resource) = self.mapper.resource_name_of(unit) else {
                    warnings.unrecognized_devices += 1;
                    debug!(
                        namespace = %allocation.namespace,
                        pod = %allocation.pod_name,
                        container = %allocation.container_name,
                        unit = ?unit,
                        "Granted device has no resource mapping"
                    );
                    continue;
                };

                let Some(node) = self.mapper.node_of(unit) else {
                    warnings.unresolved_units += 1;
                    debug!(
                        namespace = %allocation.namespace,
                        pod = %allocation.pod_name,
                        container = %allocation.container_name,
                        unit = ?unit,
                        "Granted unit not attached to any known NUMA node"
                    );
                    continue;
                };

                let entry = snapshot.entry_mut(node, resource);
                entry.allocated = entry
                    .allocated
                    .checked_add(unit_amount(unit))
                    .ok_or_else(|| ExporterError::Inconsistency {
                        message: format!(
                            "node {} {}: allocated amount overflows (pod {}/{})",
                            node, resource, allocation.namespace, allocation.pod_name
                        ),
                    })?;
            }
        }

        let over_allocated: Vec<String> = snapshot
            .iter()
            .filter(|(_, _, amount)| amount.allocated > amount.capacity)
            .map(|(node, name, amount)| {
                format!(
                    "node {} {}: allocated {} > capacity {}",
                    node, name, amount.allocated, amount.capacity
                )
            })
            .collect();
        if !over_allocated.is_empty() {
            return Err(ExporterError::Inconsistency {
                message: over_allocated.join("; "),
            });
        }

        if warnings.unresolved_units > 0 {
            warn!(
                unresolved_units = warnings.unresolved_units,
                "Excluded granted units with no known NUMA node"
            );
        }

        Ok(Aggregation { snapshot, warnings })
    }
}

fn unit_amount(unit: &GrantedUnit) -> u64 {
    match unit {
        GrantedUnit::Cpu(_) | GrantedUnit::Device(_) => 1,
        GrantedUnit::Memory { bytes, .. } => *bytes,
    }
}
