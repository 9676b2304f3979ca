//! PCI address to resource name mapping
//!
//! Builds the table from the SR-IOV network device plugin configuration by
//! matching its resource selectors against the PCI devices exposed in sysfs:
//! - `vendor` / `device` files for vendor and device ids
//! - `driver` symlink for the bound driver
//! - `physfn` symlink and `net/` directories for the physical function

use super::dir_entries;
use crate::error::ExporterError;
use crate::models::PciAddress;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Prefix used by the device plugin when an entry does not declare one
pub const DEFAULT_RESOURCE_PREFIX: &str = "intel.com";

/// Read-only table of PCI device address -> logical resource name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciResourceMap {
    entries: BTreeMap<PciAddress, String>,
}

impl PciResourceMap {
    /// Build the table from explicit pairs
    ///
    /// The same address may appear more than once only if it maps to the
    /// same name every time.
    pub fn from_pairs<I, A, N>(pairs: I) -> Result<Self, ExporterError>
    where
        I: IntoIterator<Item = (A, N)>,
        A: AsRef<str>,
        N: Into<String>,
    {
        let mut entries = BTreeMap::new();
        for (raw_addr, name) in pairs {
            let addr = PciAddress::parse(raw_addr.as_ref()).ok_or_else(|| {
                ExporterError::config(format!("Invalid PCI address: {}", raw_addr.as_ref()))
            })?;
            let name = name.into();
            if let Some(existing) = entries.get(&addr) {
                if existing != &name {
                    return Err(ExporterError::config(format!(
                        "PCI device {} mapped to both {} and {}",
                        addr, existing, name
                    )));
                }
            }
            entries.insert(addr, name);
        }
        Ok(Self { entries })
    }

    /// Look up the resource name of a device; `None` means the device is not managed
    pub fn resource_name_for(&self, addr: &PciAddress) -> Option<&str> {
        self.entries.get(addr).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PciAddress, &str)> {
        self.entries.iter().map(|(addr, name)| (addr, name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// SR-IOV device plugin configuration file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SriovConfig {
    #[serde(default)]
    resource_list: Vec<ResourceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceConfig {
    resource_name: Option<String>,
    resource_prefix: Option<String>,
    #[serde(default)]
    root_devices: Vec<String>,
    selectors: Option<SelectorList>,
}

/// Older plugin releases take a single selector object, newer ones a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SelectorList {
    One(Selectors),
    Many(Vec<Selectors>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Selectors {
    #[serde(default)]
    vendors: Vec<String>,
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    drivers: Vec<String>,
    #[serde(default)]
    pf_names: Vec<String>,
}

impl Selectors {
    fn is_empty(&self) -> bool {
        self.vendors.is_empty()
            && self.devices.is_empty()
            && self.drivers.is_empty()
            && self.pf_names.is_empty()
    }

    fn matches(&self, device: &PciDeviceInfo) -> bool {
        let contains = |list: &[String], value: &str| {
            list.iter().any(|v| v.trim().eq_ignore_ascii_case(value))
        };

        if !self.vendors.is_empty() && !contains(&self.vendors, &device.vendor) {
            return false;
        }
        if !self.devices.is_empty() && !contains(&self.devices, &device.device) {
            return false;
        }
        if !self.drivers.is_empty() {
            match &device.driver {
                Some(driver) if contains(&self.drivers, driver) => {}
                _ => return false,
            }
        }
        if !self.pf_names.is_empty() {
            // "ens785f0#0-3" restricts VF indexes; only the interface part is matched
            let wanted: Vec<&str> = self
                .pf_names
                .iter()
                .map(|name| name.split('#').next().unwrap_or(name).trim())
                .collect();
            if !device.pf_names.iter().any(|n| wanted.contains(&n.as_str())) {
                return false;
            }
        }
        true
    }
}

impl ResourceConfig {
    fn full_name(&self, name: &str) -> String {
        let prefix = self
            .resource_prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_RESOURCE_PREFIX);
        format!("{}/{}", prefix, name)
    }

    fn selector_sets(&self) -> Vec<&Selectors> {
        let all: Vec<&Selectors> = match &self.selectors {
            None => Vec::new(),
            Some(SelectorList::One(s)) => vec![s],
            Some(SelectorList::Many(list)) => list.iter().collect(),
        };
        all.into_iter().filter(|s| !s.is_empty()).collect()
    }

    fn matches(&self, device: &PciDeviceInfo) -> bool {
        let selectors = self.selector_sets();
        if selectors.is_empty() && self.root_devices.is_empty() {
            return false;
        }

        if !self.root_devices.is_empty() {
            let root = device.pf_address.as_ref().unwrap_or(&device.address);
            let listed = self
                .root_devices
                .iter()
                .filter_map(|raw| PciAddress::parse(raw))
                .any(|addr| &addr == root);
            if !listed {
                return false;
            }
        }

        selectors.is_empty() || selectors.iter().any(|s| s.matches(device))
    }
}

/// Attributes of one PCI device as read from sysfs
#[derive(Debug, Clone)]
struct PciDeviceInfo {
    address: PciAddress,
    vendor: String,
    device: String,
    driver: Option<String>,
    pf_address: Option<PciAddress>,
    pf_names: Vec<String>,
}

/// Build the PCI resource map from the SR-IOV device plugin config file
pub async fn build_pci_resource_map(
    sysfs_root: &Path,
    config_path: &Path,
) -> Result<PciResourceMap, ExporterError> {
    let content = fs::read_to_string(config_path).await.map_err(|e| {
        ExporterError::config(format!(
            "Failed to read SR-IOV config {}: {}",
            config_path.display(),
            e
        ))
    })?;
    let config = parse_sriov_config(&content)?;

    let devices = scan_pci_devices(&sysfs_root.join("bus/pci/devices")).await?;
    let map = match_devices(&config, &devices)?;

    info!(
        config = %config_path.display(),
        resources = config.resource_list.len(),
        devices = map.len(),
        "Built PCI resource map"
    );
    Ok(map)
}

fn parse_sriov_config(content: &str) -> Result<SriovConfig, ExporterError> {
    let config: SriovConfig = serde_json::from_str(content)
        .map_err(|e| ExporterError::config(format!("Malformed SR-IOV config: {}", e)))?;

    for (idx, resource) in config.resource_list.iter().enumerate() {
        match resource.resource_name.as_deref() {
            Some(name) if !name.trim().is_empty() => {}
            _ => {
                return Err(ExporterError::config(format!(
                    "resourceList[{}] has no resourceName",
                    idx
                )))
            }
        }
    }

    Ok(config)
}

fn match_devices(
    config: &SriovConfig,
    devices: &[PciDeviceInfo],
) -> Result<PciResourceMap, ExporterError> {
    let mut pairs = Vec::new();
    for device in devices {
        let matched = config.resource_list.iter().find_map(|resource| {
            let name = resource.resource_name.as_deref()?;
            resource
                .matches(device)
                .then(|| resource.full_name(name.trim()))
        });
        if let Some(name) = matched {
            debug!(device = %device.address, resource = %name, "Mapped PCI device");
            pairs.push((device.address.to_string(), name));
        }
    }
    PciResourceMap::from_pairs(pairs)
}

/// Read every device under `<sysfs>/bus/pci/devices`, sorted by address
async fn scan_pci_devices(devices_dir: &Path) -> Result<Vec<PciDeviceInfo>, ExporterError> {
    let entries = dir_entries(devices_dir).await.map_err(|e| {
        ExporterError::config(format!(
            "Failed to list PCI devices in {}: {}",
            devices_dir.display(),
            e
        ))
    })?;

    let mut devices = Vec::new();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(address) = PciAddress::parse(&name) else {
            continue;
        };
        devices.push(read_device(entry.path(), address).await);
    }

    devices.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(devices)
}

async fn read_device(path: PathBuf, address: PciAddress) -> PciDeviceInfo {
    let vendor = read_hex_id(&path.join("vendor")).await;
    let device = read_hex_id(&path.join("device")).await;
    let driver = link_basename(&path.join("driver")).await;

    let pf_address = link_basename(&path.join("physfn"))
        .await
        .and_then(|name| PciAddress::parse(&name));
    let net_dir = if pf_address.is_some() {
        path.join("physfn").join("net")
    } else {
        path.join("net")
    };
    let pf_names = list_dir_names(&net_dir).await;

    PciDeviceInfo {
        address,
        vendor,
        device,
        driver,
        pf_address,
        pf_names,
    }
}

async fn read_hex_id(path: &Path) -> String {
    fs::read_to_string(path)
        .await
        .map(|s| {
            let s = s.trim().to_ascii_lowercase();
            s.strip_prefix("0x").map(str::to_string).unwrap_or(s)
        })
        .unwrap_or_default()
}

async fn link_basename(path: &Path) -> Option<String> {
    let target = fs::read_link(path).await.ok()?;
    target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
}

async fn list_dir_names(path: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(mut entries) = fs::read_dir(path).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn addr(raw: &str) -> PciAddress {
        PciAddress::parse(raw).unwrap()
    }

    /// Lay out a PF with two VFs bound to iavf, plus an unrelated NVMe device
    fn create_mock_pci_tree(temp_dir: &TempDir) {
        let root = temp_dir.path();
        let devices = root.join("bus/pci/devices");
        let drivers = root.join("bus/pci/drivers");
        std::fs::create_dir_all(drivers.join("iavf")).unwrap();
        std::fs::create_dir_all(drivers.join("i40e")).unwrap();
        std::fs::create_dir_all(drivers.join("nvme")).unwrap();

        let pf = devices.join("0000:3b:00.0");
        std::fs::create_dir_all(pf.join("net/ens785f0")).unwrap();
        std::fs::write(pf.join("vendor"), "0x8086\n").unwrap();
        std::fs::write(pf.join("device"), "0x1572\n").unwrap();
        symlink(drivers.join("i40e"), pf.join("driver")).unwrap();

        for vf in ["0000:3b:02.0", "0000:3b:02.1"] {
            let vf_path = devices.join(vf);
            std::fs::create_dir_all(&vf_path).unwrap();
            std::fs::write(vf_path.join("vendor"), "0x8086\n").unwrap();
            std::fs::write(vf_path.join("device"), "0x154c\n").unwrap();
            symlink(drivers.join("iavf"), vf_path.join("driver")).unwrap();
            symlink(&pf, vf_path.join("physfn")).unwrap();
        }

        let nvme = devices.join("0000:5e:00.0");
        std::fs::create_dir_all(&nvme).unwrap();
        std::fs::write(nvme.join("vendor"), "0x144d\n").unwrap();
        std::fs::write(nvme.join("device"), "0xa808\n").unwrap();
        symlink(drivers.join("nvme"), nvme.join("driver")).unwrap();
    }

    async fn build_with_config(temp_dir: &TempDir, config: &str) -> Result<PciResourceMap, ExporterError> {
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, config).unwrap();
        build_pci_resource_map(temp_dir.path(), &config_path).await
    }

    #[test]
    fn test_from_pairs_rejects_conflicting_names() {
        let result = PciResourceMap::from_pairs([
            ("0000:3b:02.0", "intel.com/a"),
            ("3b:02.0", "intel.com/b"),
        ]);
        assert!(matches!(result, Err(ExporterError::Config { .. })));
    }

    #[test]
    fn test_resource_name_for_unmapped_device() {
        let map = PciResourceMap::from_pairs([("0000:3b:02.0", "intel.com/vf")]).unwrap();
        assert_eq!(map.resource_name_for(&addr("0000:3b:02.0")), Some("intel.com/vf"));
        assert_eq!(map.resource_name_for(&addr("0000:3b:02.1")), None);
    }

    #[tokio::test]
    async fn test_selector_matching() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_pci_tree(&temp_dir);

        let map = build_with_config(
            &temp_dir,
            r#"{"resourceList": [{
                "resourceName": "intel_sriov_netdevice",
                "selectors": {"vendors": ["8086"], "devices": ["154c"], "drivers": ["iavf"]}
            }]}"#,
        )
        .await
        .unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(
            map.resource_name_for(&addr("0000:3b:02.1")),
            Some("intel.com/intel_sriov_netdevice")
        );
        assert_eq!(map.resource_name_for(&addr("0000:3b:00.0")), None);
        assert_eq!(map.resource_name_for(&addr("0000:5e:00.0")), None);
    }

    #[tokio::test]
    async fn test_pf_name_and_prefix() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_pci_tree(&temp_dir);

        let map = build_with_config(
            &temp_dir,
            r#"{"resourceList": [{
                "resourceName": "vf_net",
                "resourcePrefix": "example.com",
                "selectors": [{"pfNames": ["ens785f0#0-7"]}]
            }]}"#,
        )
        .await
        .unwrap();

        // The PF itself owns net/ens785f0 too
        assert_eq!(map.len(), 3);
        assert_eq!(
            map.resource_name_for(&addr("0000:3b:02.0")),
            Some("example.com/vf_net")
        );
    }

    #[tokio::test]
    async fn test_root_devices() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_pci_tree(&temp_dir);

        let map = build_with_config(
            &temp_dir,
            r#"{"resourceList": [{"resourceName": "legacy", "rootDevices": ["3b:00.0"]}]}"#,
        )
        .await
        .unwrap();

        assert_eq!(map.len(), 3);
        assert!(map.resource_name_for(&addr("0000:5e:00.0")).is_none());
    }

    #[tokio::test]
    async fn test_first_matching_entry_wins() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_pci_tree(&temp_dir);

        let map = build_with_config(
            &temp_dir,
            r#"{"resourceList": [
                {"resourceName": "vfs", "selectors": {"drivers": ["iavf"]}},
                {"resourceName": "intel_all", "selectors": {"vendors": ["8086"]}}
            ]}"#,
        )
        .await
        .unwrap();

        assert_eq!(map.resource_name_for(&addr("0000:3b:02.0")), Some("intel.com/vfs"));
        assert_eq!(
            map.resource_name_for(&addr("0000:3b:00.0")),
            Some("intel.com/intel_all")
        );
    }

    #[tokio::test]
    async fn test_entry_without_selectors_matches_nothing() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_pci_tree(&temp_dir);

        let map = build_with_config(&temp_dir, r#"{"resourceList": [{"resourceName": "empty"}]}"#)
            .await
            .unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_config() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_pci_tree(&temp_dir);

        let result = build_with_config(&temp_dir, "{not json").await;
        assert!(matches!(result, Err(ExporterError::Config { .. })));

        let result = build_with_config(&temp_dir, r#"{"resourceList": [{"selectors": {}}]}"#).await;
        assert!(matches!(result, Err(ExporterError::Config { .. })));
    }

    #[tokio::test]
    async fn test_missing_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let result =
            build_pci_resource_map(temp_dir.path(), &temp_dir.path().join("absent.json")).await;
        assert!(matches!(result, Err(ExporterError::Config { .. })));
    }

    #[tokio::test]
    async fn test_unlistable_device_directory_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("bus/pci")).unwrap();
        std::fs::write(temp_dir.path().join("bus/pci/devices"), "").unwrap();

        let result = build_with_config(
            &temp_dir,
            r#"{"resourceList": [{"resourceName": "vf", "selectors": {"vendors": ["8086"]}}]}"#,
        )
        .await;
        assert!(matches!(result, Err(ExporterError::Config { .. })));
    }
}
