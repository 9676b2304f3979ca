//! Core data models for the topology exporter

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource name used for exclusively allocated CPUs
pub const CPU_RESOURCE: &str = "cpu";

/// Resource name used for NUMA-local memory
pub const MEMORY_RESOURCE: &str = "memory";

/// NUMA node index as exposed by the host (`/sys/devices/system/node/node<N>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NumaNodeId(pub u32);

impl fmt::Display for NumaNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a physical resource unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Device,
}

/// A unit of hardware attached to a NUMA node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalResourceUnit {
    pub kind: ResourceKind,
    pub resource_name: String,
    pub node: NumaNodeId,
    pub capacity: u64,
}

/// Normalized PCI address in `dddd:bb:dd.f` form
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PciAddress(String);

impl PciAddress {
    /// Parse a full (`0000:3b:02.1`) or short (`3b:02.1`) PCI address
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        let parts: Vec<&str> = raw.split(':').collect();
        let (domain, bus, slot_func) = match parts.as_slice() {
            [domain, bus, slot_func] => (*domain, *bus, *slot_func),
            [bus, slot_func] => ("0000", *bus, *slot_func),
            _ => return None,
        };
        let (slot, func) = slot_func.split_once('.')?;

        let is_hex = |s: &str, len: usize| s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit());
        if !is_hex(domain, 4) || !is_hex(bus, 2) || !is_hex(slot, 2) {
            return None;
        }
        if func.len() != 1 || !func.chars().all(|c| ('0'..='7').contains(&c)) {
            return None;
        }

        Some(Self(format!("{}:{}:{}.{}", domain, bus, slot, func)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource unit the container runtime reports as granted to a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantedUnit {
    /// An exclusively assigned logical CPU
    Cpu(u32),
    /// Memory pinned to a single NUMA node
    Memory { node: NumaNodeId, bytes: u64 },
    /// A PCI device (typically an SR-IOV virtual function)
    Device(PciAddress),
}

/// Resources granted to one running container in the current scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadAllocation {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub container_id: String,
    pub grants: Vec<GrantedUnit>,
}

/// Capacity and current allocation of one resource on one NUMA node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAmount {
    pub capacity: u64,
    pub allocated: u64,
}

impl ResourceAmount {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.allocated)
    }
}

/// Per-NUMA aggregation result of a single cycle
///
/// Entries are kept ordered by node then resource name so that identical
/// inputs always produce identical output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NumaResourceSnapshot {
    entries: BTreeMap<(NumaNodeId, String), ResourceAmount>,
}

impl NumaResourceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: NumaNodeId, resource: &str) -> Option<&ResourceAmount> {
        self.entries.get(&(node, resource.to_string()))
    }

    pub(crate) fn entry_mut(&mut self, node: NumaNodeId, resource: &str) -> &mut ResourceAmount {
        self.entries.entry((node, resource.to_string())).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NumaNodeId, &str, &ResourceAmount)> {
        self.entries
            .iter()
            .map(|((node, name), amount)| (*node, name.as_str(), amount))
    }

    /// Entries grouped by node, in node order
    pub fn by_node(&self) -> BTreeMap<NumaNodeId, Vec<(&str, &ResourceAmount)>> {
        let mut nodes: BTreeMap<NumaNodeId, Vec<(&str, &ResourceAmount)>> = BTreeMap::new();
        for (node, name, amount) in self.iter() {
            nodes.entry(node).or_default().push((name, amount));
        }
        nodes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for NumaResourceSnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let nested: BTreeMap<String, BTreeMap<&str, &ResourceAmount>> = self
            .by_node()
            .into_iter()
            .map(|(node, resources)| (format!("node-{}", node), resources.into_iter().collect()))
            .collect();
        nested.serialize(serializer)
    }
}

/// Kubelet topology manager policy, attached to every published snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopologyManagerPolicy(pub String);

impl TopologyManagerPolicy {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TopologyManagerPolicy {
    fn default() -> Self {
        Self("none".to_string())
    }
}

impl fmt::Display for TopologyManagerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
