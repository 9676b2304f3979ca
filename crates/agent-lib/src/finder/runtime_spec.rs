//! Grant extraction from the OCI runtime spec
//!
//! Container runtimes expose the spec of a running container in the verbose
//! `ContainerStatus` info. The parts used here:
//! - `linux.resources.cpu` (cpuset, mems, quota/period, shares)
//! - `linux.resources.memory.limit`
//! - `process.env` for `PCIDEVICE_*` variables set by the SR-IOV device plugin

use crate::models::{GrantedUnit, NumaNodeId, PciAddress};
use crate::topology::sysfs::parse_cpulist;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Environment variable prefix the SR-IOV device plugin uses for allocated devices
pub const PCI_DEVICE_ENV_PREFIX: &str = "PCIDEVICE_";

/// `cpu.shares` granted per whole CPU
const SHARES_PER_CPU: u64 = 1024;

/// JSON stored under the `info` key of a verbose container status
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerboseInfo {
    pub runtime_spec: Option<RuntimeSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RuntimeSpec {
    pub process: Option<Process>,
    pub linux: Option<Linux>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Linux {
    pub resources: Option<LinuxResources>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LinuxResources {
    pub cpu: Option<LinuxCpu>,
    pub memory: Option<LinuxMemory>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LinuxCpu {
    pub shares: Option<u64>,
    pub quota: Option<i64>,
    pub period: Option<u64>,
    pub cpus: Option<String>,
    pub mems: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LinuxMemory {
    pub limit: Option<i64>,
}

impl RuntimeSpec {
    /// Resources this container owns: exclusive CPUs, NUMA-pinned memory and PCI devices
    pub fn grants(&self) -> Vec<GrantedUnit> {
        let mut grants = Vec::new();
        let resources = self.linux.as_ref().and_then(|l| l.resources.as_ref());
        let cpu = resources.and_then(|r| r.cpu.as_ref());

        if let Some(cpu) = cpu {
            grants.extend(exclusive_cpus(cpu).into_iter().map(GrantedUnit::Cpu));
        }

        let limit = resources
            .and_then(|r| r.memory.as_ref())
            .and_then(|m| m.limit)
            .and_then(|limit| u64::try_from(limit).ok())
            .filter(|limit| *limit > 0);
        let mems = cpu
            .and_then(|c| c.mems.as_deref())
            .and_then(parse_cpulist)
            .unwrap_or_default();
        if let (Some(bytes), Some(node)) = (limit, single_node(&mems)) {
            grants.push(GrantedUnit::Memory { node, bytes });
        }

        if let Some(process) = &self.process {
            grants.extend(pci_devices(&process.env).into_iter().map(GrantedUnit::Device));
        }

        grants
    }
}

/// The cpuset, when the container owns it exclusively
///
/// A cpuset is exclusive when its size equals the whole number of CPUs the
/// container was granted, taken from the CFS quota or, when quota is unset,
/// from `cpu.shares`. Containers running on the shared pool get a cpuset
/// larger than their grant.
fn exclusive_cpus(cpu: &LinuxCpu) -> BTreeSet<u32> {
    let Some(cpus) = cpu.cpus.as_deref().and_then(parse_cpulist) else {
        return BTreeSet::new();
    };
    if cpus.is_empty() {
        return cpus;
    }

    let from_quota = match (cpu.quota, cpu.period) {
        (Some(quota), Some(period)) if quota > 0 && period > 0 => {
            let quota = quota as u64;
            (quota % period == 0).then_some(quota / period)
        }
        _ => None,
    };
    let from_shares = cpu
        .shares
        .filter(|shares| *shares >= SHARES_PER_CPU && shares % SHARES_PER_CPU == 0)
        .map(|shares| shares / SHARES_PER_CPU);

    let size = cpus.len() as u64;
    if from_quota == Some(size) || (from_quota.is_none() && from_shares == Some(size)) {
        cpus
    } else {
        BTreeSet::new()
    }
}

fn single_node(mems: &BTreeSet<u32>) -> Option<NumaNodeId> {
    match mems.len() {
        1 => mems.iter().next().map(|n| NumaNodeId(*n)),
        _ => None,
    }
}

/// PCI addresses listed in `PCIDEVICE_<RESOURCE>=addr[,addr...]` variables
pub fn pci_devices(env: &[String]) -> BTreeSet<PciAddress> {
    env.iter()
        .filter_map(|var| var.split_once('='))
        .filter(|(key, _)| key.starts_with(PCI_DEVICE_ENV_PREFIX) && !key.ends_with("_INFO"))
        .flat_map(|(_, value)| value.split(','))
        .filter_map(PciAddress::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_from(json: &str) -> RuntimeSpec {
        let info: VerboseInfo = serde_json::from_str(json).unwrap();
        info.runtime_spec.unwrap()
    }

    #[test]
    fn test_guaranteed_container_with_vf() {
        let spec = spec_from(
            r#"{
                "sandboxID": "f00",
                "pid": 4242,
                "runtimeSpec": {
                    "process": {"env": [
                        "PATH=/usr/bin",
                        "PCIDEVICE_INTEL_COM_SRIOV_NETDEVICE=0000:3b:02.0,0000:3b:02.1",
                        "PCIDEVICE_INTEL_COM_SRIOV_NETDEVICE_INFO={\"0000:3b:02.0\":{}}"
                    ]},
                    "linux": {"resources": {
                        "cpu": {"shares": 2048, "quota": 200000, "period": 100000, "cpus": "2-3", "mems": "0"},
                        "memory": {"limit": 1073741824}
                    }}
                }
            }"#,
        );

        let grants = spec.grants();
        assert_eq!(
            grants,
            vec![
                GrantedUnit::Cpu(2),
                GrantedUnit::Cpu(3),
                GrantedUnit::Memory {
                    node: NumaNodeId(0),
                    bytes: 1073741824
                },
                GrantedUnit::Device(PciAddress::parse("0000:3b:02.0").unwrap()),
                GrantedUnit::Device(PciAddress::parse("0000:3b:02.1").unwrap()),
            ]
        );
    }

    #[test]
    fn test_shared_pool_cpus_are_not_grants() {
        let cpu = LinuxCpu {
            shares: Some(512),
            quota: Some(50000),
            period: Some(100000),
            cpus: Some("0-15".to_string()),
            mems: Some("0-1".to_string()),
        };
        assert!(exclusive_cpus(&cpu).is_empty());
    }

    #[test]
    fn test_exclusive_cpus_without_quota() {
        let cpu = LinuxCpu {
            shares: Some(4096),
            quota: None,
            period: Some(100000),
            cpus: Some("4-7".to_string()),
            mems: None,
        };
        assert_eq!(exclusive_cpus(&cpu).len(), 4);
    }

    #[test]
    fn test_quota_mismatch_wins_over_shares() {
        let cpu = LinuxCpu {
            shares: Some(2048),
            quota: Some(400000),
            period: Some(100000),
            cpus: Some("0-1".to_string()),
            mems: None,
        };
        assert!(exclusive_cpus(&cpu).is_empty());
    }

    #[test]
    fn test_memory_spread_over_nodes_is_not_attributed() {
        let spec = spec_from(
            r#"{"runtimeSpec": {"linux": {"resources": {
                "cpu": {"cpus": "0-31", "mems": "0-1", "shares": 2},
                "memory": {"limit": 1048576}
            }}}}"#,
        );
        assert!(spec.grants().is_empty());
    }

    #[test]
    fn test_pci_devices_skip_garbage() {
        let env = vec![
            "PCIDEVICE_EXAMPLE_COM_VF=3b:02.4, bogus ,".to_string(),
            "PCIDEVICE_BROKEN".to_string(),
            "OTHER=0000:3b:02.5".to_string(),
        ];
        let devices = pci_devices(&env);
        assert_eq!(devices.len(), 1);
        assert!(devices.contains(&PciAddress::parse("0000:3b:02.4").unwrap()));
    }

    #[test]
    fn test_spec_without_resources() {
        let spec = spec_from(r#"{"runtimeSpec": {"process": {"env": []}}}"#);
        assert!(spec.grants().is_empty());
    }
}
