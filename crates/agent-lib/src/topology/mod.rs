//! Static NUMA topology and device-to-resource mapping
//!
//! Everything here is discovered once at startup and is read-only afterwards:
//! - `pciconf` turns the SR-IOV device plugin config into a PCI address table
//! - `sysfs` reads CPU, memory and device placement per NUMA node
//! - `kubeconf` reads the kubelet topology manager policy

pub mod kubeconf;
pub mod pciconf;
pub mod sysfs;

pub use kubeconf::topology_manager_policy;
pub use pciconf::{build_pci_resource_map, PciResourceMap};

use crate::error::ExporterError;
use crate::models::{
    GrantedUnit, NumaNodeId, PciAddress, PhysicalResourceUnit, ResourceKind, CPU_RESOURCE,
    MEMORY_RESOURCE,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::Path;
use tokio::fs::{self, DirEntry};

/// Resources physically attached to one NUMA node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeResources {
    pub cpus: BTreeSet<u32>,
    pub memory_bytes: u64,
}

/// Immutable host topology
#[derive(Debug, Clone, Default)]
pub struct HostTopology {
    nodes: BTreeMap<NumaNodeId, NodeResources>,
    cpu_nodes: HashMap<u32, NumaNodeId>,
    device_nodes: BTreeMap<PciAddress, NumaNodeId>,
}

impl HostTopology {
    pub fn builder() -> HostTopologyBuilder {
        HostTopologyBuilder::default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NumaNodeId, &NodeResources)> {
        self.nodes.iter().map(|(id, res)| (*id, res))
    }

    pub fn contains_node(&self, node: NumaNodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn node_of_cpu(&self, cpu: u32) -> Option<NumaNodeId> {
        self.cpu_nodes.get(&cpu).copied()
    }

    pub fn node_of_device(&self, addr: &PciAddress) -> Option<NumaNodeId> {
        self.device_nodes.get(addr).copied()
    }

    pub fn memory_bytes(&self, node: NumaNodeId) -> u64 {
        self.nodes.get(&node).map(|n| n.memory_bytes).unwrap_or(0)
    }

    pub fn devices(&self) -> impl Iterator<Item = (&PciAddress, NumaNodeId)> {
        self.device_nodes.iter().map(|(addr, node)| (addr, *node))
    }

    pub fn device_count(&self) -> usize {
        self.device_nodes.len()
    }
}

/// Builder for [`HostTopology`]
#[derive(Debug, Default)]
pub struct HostTopologyBuilder {
    nodes: BTreeMap<NumaNodeId, NodeResources>,
    devices: BTreeMap<PciAddress, NumaNodeId>,
}

impl HostTopologyBuilder {
    /// Add a NUMA node with its CPUs and local memory
    pub fn node(
        mut self,
        id: NumaNodeId,
        cpus: impl IntoIterator<Item = u32>,
        memory_bytes: u64,
    ) -> Self {
        self.nodes.insert(
            id,
            NodeResources {
                cpus: cpus.into_iter().collect(),
                memory_bytes,
            },
        );
        self
    }

    /// Attach a PCI device to a NUMA node
    pub fn device(mut self, addr: PciAddress, node: NumaNodeId) -> Self {
        self.devices.insert(addr, node);
        self
    }

    /// Build the topology, rejecting CPUs or devices placed on unknown or multiple nodes
    pub fn build(self) -> Result<HostTopology, ExporterError> {
        let mut cpu_nodes = HashMap::new();
        for (id, resources) in &self.nodes {
            for cpu in &resources.cpus {
                if let Some(other) = cpu_nodes.insert(*cpu, *id) {
                    return Err(ExporterError::topology(format!(
                        "CPU {} listed on both node {} and node {}",
                        cpu, other, id
                    )));
                }
            }
        }

        for (addr, node) in &self.devices {
            if !self.nodes.contains_key(node) {
                return Err(ExporterError::topology(format!(
                    "Device {} attached to unknown node {}",
                    addr, node
                )));
            }
        }

        Ok(HostTopology {
            nodes: self.nodes,
            cpu_nodes,
            device_nodes: self.devices,
        })
    }
}

/// Lookup facade over the static topology and the PCI resource table
#[derive(Debug, Clone)]
pub struct ResourceMapper {
    topology: HostTopology,
    pci_map: PciResourceMap,
}

impl ResourceMapper {
    pub fn new(topology: HostTopology, pci_map: PciResourceMap) -> Self {
        Self { topology, pci_map }
    }

    pub fn topology(&self) -> &HostTopology {
        &self.topology
    }

    pub fn pci_map(&self) -> &PciResourceMap {
        &self.pci_map
    }

    pub fn nodes(&self) -> impl Iterator<Item = NumaNodeId> + '_ {
        self.topology.nodes().map(|(id, _)| id)
    }

    /// Logical resource name of a device, `None` for unmanaged devices
    pub fn resource_name_for(&self, addr: &PciAddress) -> Option<&str> {
        self.pci_map.resource_name_for(addr)
    }

    /// NUMA node owning a granted unit, `None` when the unit is unknown to the host
    pub fn node_of(&self, unit: &GrantedUnit) -> Option<NumaNodeId> {
        match unit {
            GrantedUnit::Cpu(cpu) => self.topology.node_of_cpu(*cpu),
            GrantedUnit::Memory { node, .. } => {
                self.topology.contains_node(*node).then_some(*node)
            }
            GrantedUnit::Device(addr) => self.topology.node_of_device(addr),
        }
    }

    /// Resource name a granted unit is accounted under
    pub fn resource_name_of<'a>(&'a self, unit: &GrantedUnit) -> Option<&'a str> {
        match unit {
            GrantedUnit::Cpu(_) => Some(CPU_RESOURCE),
            GrantedUnit::Memory { .. } => Some(MEMORY_RESOURCE),
            GrantedUnit::Device(addr) => self.resource_name_for(addr),
        }
    }

    /// Every physical unit with known NUMA placement
    pub fn static_units(&self) -> Vec<PhysicalResourceUnit> {
        let mut units = Vec::new();

        for (node, resources) in self.topology.nodes() {
            units.extend(resources.cpus.iter().map(|_| PhysicalResourceUnit {
                kind: ResourceKind::Cpu,
                resource_name: CPU_RESOURCE.to_string(),
                node,
                capacity: 1,
            }));
            if resources.memory_bytes > 0 {
                units.push(PhysicalResourceUnit {
                    kind: ResourceKind::Memory,
                    resource_name: MEMORY_RESOURCE.to_string(),
                    node,
                    capacity: resources.memory_bytes,
                });
            }
        }

        for (addr, node) in self.topology.devices() {
            if let Some(name) = self.pci_map.resource_name_for(addr) {
                units.push(PhysicalResourceUnit {
                    kind: ResourceKind::Device,
                    resource_name: name.to_string(),
                    node,
                    capacity: 1,
                });
            }
        }

        units
    }
}

/// List a directory in full; an error on any entry fails the whole listing
pub(crate) async fn dir_entries(dir: &Path) -> io::Result<Vec<DirEntry>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut all = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        all.push(entry);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: &str) -> PciAddress {
        PciAddress::parse(raw).unwrap()
    }

    fn test_mapper() -> ResourceMapper {
        let topology = HostTopology::builder()
            .node(NumaNodeId(0), 0..4, 8 << 30)
            .node(NumaNodeId(1), 4..8, 8 << 30)
            .device(addr("0000:3b:02.0"), NumaNodeId(0))
            .device(addr("0000:3b:02.1"), NumaNodeId(0))
            .build()
            .unwrap();
        let pci_map = PciResourceMap::from_pairs([("0000:3b:02.0", "intel.com/vf")]).unwrap();
        ResourceMapper::new(topology, pci_map)
    }

    #[test]
    fn test_builder_rejects_duplicate_cpu() {
        let result = HostTopology::builder()
            .node(NumaNodeId(0), [0, 1], 0)
            .node(NumaNodeId(1), [1, 2], 0)
            .build();
        assert!(matches!(result, Err(ExporterError::Topology { .. })));
    }

    #[test]
    fn test_builder_rejects_device_on_unknown_node() {
        let result = HostTopology::builder()
            .node(NumaNodeId(0), [0], 0)
            .device(addr("0000:3b:02.0"), NumaNodeId(3))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_node_of_units() {
        let mapper = test_mapper();

        assert_eq!(mapper.node_of(&GrantedUnit::Cpu(6)), Some(NumaNodeId(1)));
        assert_eq!(mapper.node_of(&GrantedUnit::Cpu(64)), None);
        assert_eq!(
            mapper.node_of(&GrantedUnit::Memory {
                node: NumaNodeId(1),
                bytes: 1
            }),
            Some(NumaNodeId(1))
        );
        assert_eq!(
            mapper.node_of(&GrantedUnit::Memory {
                node: NumaNodeId(7),
                bytes: 1
            }),
            None
        );
        assert_eq!(
            mapper.node_of(&GrantedUnit::Device(addr("0000:3b:02.1"))),
            Some(NumaNodeId(0))
        );
    }

    #[test]
    fn test_resource_name_of_units() {
        let mapper = test_mapper();
        assert_eq!(mapper.resource_name_of(&GrantedUnit::Cpu(0)), Some(CPU_RESOURCE));
        assert_eq!(
            mapper.resource_name_of(&GrantedUnit::Device(addr("0000:3b:02.0"))),
            Some("intel.com/vf")
        );
        assert_eq!(
            mapper.resource_name_of(&GrantedUnit::Device(addr("0000:3b:02.1"))),
            None
        );
    }

    #[test]
    fn test_static_units_skip_unmapped_devices() {
        let mapper = test_mapper();
        let units = mapper.static_units();

        let cpus = units.iter().filter(|u| u.kind == ResourceKind::Cpu).count();
        let memory = units.iter().filter(|u| u.kind == ResourceKind::Memory).count();
        let devices: Vec<_> = units.iter().filter(|u| u.kind == ResourceKind::Device).collect();

        assert_eq!(cpus, 8);
        assert_eq!(memory, 2);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].resource_name, "intel.com/vf");
        assert_eq!(devices[0].node, NumaNodeId(0));
    }

    #[tokio::test]
    async fn test_dir_entries_lists_everything_or_fails() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        for name in ["node0", "node1", "possible"] {
            std::fs::create_dir(temp_dir.path().join(name)).unwrap();
        }

        let mut names: Vec<String> = dir_entries(temp_dir.path())
            .await
            .unwrap()
            .iter()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["node0", "node1", "possible"]);

        let file = temp_dir.path().join("online");
        std::fs::write(&file, "0-1\n").unwrap();
        assert!(dir_entries(&file).await.is_err());
    }
}
