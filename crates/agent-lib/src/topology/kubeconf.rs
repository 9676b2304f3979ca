//! Kubelet configuration reader

use crate::error::ExporterError;
use crate::models::TopologyManagerPolicy;
use serde::Deserialize;
use std::path::Path;
use tokio::fs;

/// The subset of `KubeletConfiguration` the exporter cares about
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration {
    topology_manager_policy: Option<String>,
}

/// Read the topology manager policy from a local kubelet config file (YAML or JSON)
///
/// A config without the field runs the kubelet default, `none`.
pub async fn topology_manager_policy(path: &Path) -> Result<TopologyManagerPolicy, ExporterError> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        ExporterError::config(format!(
            "Failed to read kubelet config {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_topology_manager_policy(&content)
}

fn parse_topology_manager_policy(content: &str) -> Result<TopologyManagerPolicy, ExporterError> {
    let config: Option<KubeletConfiguration> = serde_yaml::from_str(content)
        .map_err(|e| ExporterError::config(format!("Malformed kubelet config: {}", e)))?;

    Ok(config
        .and_then(|c| c.topology_manager_policy)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(TopologyManagerPolicy)
        .unwrap_or_default())
}
