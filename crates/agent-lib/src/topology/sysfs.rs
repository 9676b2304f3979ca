//! Host NUMA topology discovery from sysfs
//!
//! Reads, relative to the configured sysfs mount point:
//! - devices/system/node/node<N>/cpulist for CPU placement
//! - devices/system/node/node<N>/meminfo for node-local memory
//! - bus/pci/devices/<addr>/numa_node for device affinity

use super::{dir_entries, HostTopology, PciResourceMap};
use crate::error::ExporterError;
use crate::models::NumaNodeId;
use std::collections::BTreeSet;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

/// Discover NUMA nodes and the affinity of every mapped PCI device
pub async fn discover(
    sysfs_root: &Path,
    pci_map: &PciResourceMap,
) -> Result<HostTopology, ExporterError> {
    let node_root = sysfs_root.join("devices/system/node");
    let entries = dir_entries(&node_root).await.map_err(|e| {
        ExporterError::topology(format!(
            "NUMA topology not exposed at {}: {}",
            node_root.display(),
            e
        ))
    })?;

    let mut builder = HostTopology::builder();
    let mut node_count = 0usize;

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = name
            .strip_prefix("node")
            .and_then(|idx| idx.parse::<u32>().ok())
        else {
            continue;
        };
        let node_path = entry.path();

        let cpulist = fs::read_to_string(node_path.join("cpulist"))
            .await
            .map_err(|e| ExporterError::topology(format!("Failed to read cpulist of {}: {}", name, e)))?;
        let cpus = parse_cpulist(&cpulist).ok_or_else(|| {
            ExporterError::topology(format!("Unparsable cpulist of {}: {:?}", name, cpulist.trim()))
        })?;

        let meminfo = fs::read_to_string(node_path.join("meminfo"))
            .await
            .map_err(|e| ExporterError::topology(format!("Failed to read meminfo of {}: {}", name, e)))?;
        let memory_bytes = parse_node_mem_total(&meminfo).ok_or_else(|| {
            ExporterError::topology(format!("No MemTotal in meminfo of {}", name))
        })?;

        builder = builder.node(NumaNodeId(id), cpus, memory_bytes);
        node_count += 1;
    }

    if node_count == 0 {
        return Err(ExporterError::topology(format!(
            "No NUMA nodes found under {}",
            node_root.display()
        )));
    }

    let device_root = sysfs_root.join("bus/pci/devices");
    for (addr, resource) in pci_map.iter() {
        let numa_path = device_root.join(addr.as_str()).join("numa_node");
        let node = fs::read_to_string(&numa_path)
            .await
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok());

        match node.and_then(|n| u32::try_from(n).ok()) {
            Some(n) => builder = builder.device(addr.clone(), NumaNodeId(n)),
            None => warn!(
                device = %addr,
                resource = %resource,
                "Device has no NUMA affinity, excluding it from capacity"
            ),
        }
    }

    let topology = builder.build()?;
    info!(
        nodes = node_count,
        devices = topology.device_count(),
        "Discovered host NUMA topology"
    );
    Ok(topology)
}

/// Parse the Linux cpulist format (`0-3,8,10-11`)
///
/// An empty list is valid (memory-only node); any malformed range is not.
pub fn parse_cpulist(content: &str) -> Option<BTreeSet<u32>> {
    let mut cpus = BTreeSet::new();
    let content = content.trim();
    if content.is_empty() {
        return Some(cpus);
    }

    for part in content.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().ok()?;
                let end: u32 = end.trim().parse().ok()?;
                if start > end {
                    return None;
                }
                cpus.extend(start..=end);
            }
            None => {
                cpus.insert(part.parse().ok()?);
            }
        }
    }

    Some(cpus)
}

/// Extract `MemTotal` in bytes from a per-node meminfo file
///
/// Lines look like `Node 0 MemTotal:       32614596 kB`.
pub fn parse_node_mem_total(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (_, rest) = line.split_once("MemTotal:")?;
        let mut parts = rest.split_whitespace();
        let value: u64 = parts.next()?.parse().ok()?;
        match parts.next() {
            Some("kB") | None => Some(value * 1024),
            Some(_) => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PciAddress;
    use tempfile::TempDir;

    fn write_node(root: &Path, id: u32, cpulist: &str, mem_kb: u64) {
        let node = root.join(format!("devices/system/node/node{}", id));
        std::fs::create_dir_all(&node).unwrap();
        std::fs::write(node.join("cpulist"), format!("{}\n", cpulist)).unwrap();
        std::fs::write(
            node.join("meminfo"),
            format!(
                "Node {id} MemTotal:       {mem_kb} kB\nNode {id} MemFree:        1024 kB\n"
            ),
        )
        .unwrap();
    }

    fn write_device(root: &Path, addr: &str, numa_node: &str) {
        let dev = root.join("bus/pci/devices").join(addr);
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("numa_node"), format!("{}\n", numa_node)).unwrap();
    }

    #[test]
    fn test_parse_cpulist() {
        let cpus = parse_cpulist("0-3,8,10-11\n").unwrap();
        assert_eq!(cpus.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 8, 10, 11]);

        assert!(parse_cpulist("").unwrap().is_empty());
        assert!(parse_cpulist("3-1").is_none());
        assert!(parse_cpulist("0-a").is_none());
    }

    #[test]
    fn test_parse_node_mem_total() {
        let content = "Node 1 MemTotal:       32614596 kB\nNode 1 MemFree: 100 kB\n";
        assert_eq!(parse_node_mem_total(content), Some(32614596 * 1024));
        assert_eq!(parse_node_mem_total("Node 1 MemFree: 100 kB"), None);
    }

    #[tokio::test]
    async fn test_discover_two_nodes_with_devices() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write_node(root, 0, "0-3", 1024);
        write_node(root, 1, "4-7", 2048);
        std::fs::create_dir_all(root.join("devices/system/node/power")).unwrap();
        write_device(root, "0000:3b:02.0", "0");
        write_device(root, "0000:3b:02.1", "-1");

        let pci_map = PciResourceMap::from_pairs([
            ("0000:3b:02.0", "intel.com/vf"),
            ("0000:3b:02.1", "intel.com/vf"),
            ("0000:3b:02.2", "intel.com/vf"),
        ])
        .unwrap();

        let topology = discover(root, &pci_map).await.unwrap();

        assert_eq!(topology.nodes().count(), 2);
        assert_eq!(topology.node_of_cpu(5), Some(NumaNodeId(1)));
        assert_eq!(topology.memory_bytes(NumaNodeId(1)), 2048 * 1024);
        assert_eq!(
            topology.node_of_device(&PciAddress::parse("0000:3b:02.0").unwrap()),
            Some(NumaNodeId(0))
        );
        // Negative affinity and missing sysfs entry are both excluded
        assert_eq!(topology.device_count(), 1);
    }

    #[tokio::test]
    async fn test_discover_missing_node_directory() {
        let temp_dir = TempDir::new().unwrap();
        let result = discover(temp_dir.path(), &PciResourceMap::default()).await;
        assert!(matches!(result, Err(ExporterError::Topology { .. })));
    }

    #[tokio::test]
    async fn test_discover_no_nodes() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("devices/system/node")).unwrap();
        let result = discover(temp_dir.path(), &PciResourceMap::default()).await;
        assert!(matches!(result, Err(ExporterError::Topology { .. })));
    }

    #[tokio::test]
    async fn test_discover_unparsable_cpulist() {
        let temp_dir = TempDir::new().unwrap();
        write_node(temp_dir.path(), 0, "zero-three", 1024);
        let result = discover(temp_dir.path(), &PciResourceMap::default()).await;
        assert!(matches!(result, Err(ExporterError::Topology { .. })));
    }
}
