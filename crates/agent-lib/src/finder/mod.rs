//! Workload discovery from the container runtime
//!
//! A [`RuntimeScanner`] reports, for every running container, the concrete
//! CPUs, memory and PCI devices it was granted. Each call produces a fresh
//! snapshot; nothing is cached between calls.

mod cri;
pub mod runtime_spec;

pub use cri::CriScanner;

use crate::error::ExporterError;
use crate::models::WorkloadAllocation;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub use async_trait::async_trait;

/// Trait for runtime scanner implementations
#[async_trait]
pub trait RuntimeScanner: Send + Sync {
    /// List the allocations of all running containers
    async fn scan(&self) -> Result<Vec<WorkloadAllocation>, ExporterError>;
}

/// Supported container runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Containerd,
    CriO,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Containerd => "containerd",
            RuntimeKind::CriO => "cri-o",
        }
    }

    /// Runtime socket as mounted into the exporter pod
    pub fn default_endpoint(&self) -> &'static Path {
        match self {
            RuntimeKind::Containerd => Path::new("/host-run/containerd/containerd.sock"),
            RuntimeKind::CriO => Path::new("/host-run/crio/crio.sock"),
        }
    }

    /// Keys of the verbose status info map holding the runtime spec, in lookup order
    pub(crate) fn info_keys(&self) -> &'static [&'static str] {
        match self {
            RuntimeKind::Containerd => &["info"],
            RuntimeKind::CriO => &["info", "runtimeSpec"],
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "containerd" => Ok(RuntimeKind::Containerd),
            "cri-o" => Ok(RuntimeKind::CriO),
            other => Err(ExporterError::config(format!(
                "Unsupported container runtime '{}', expected 'containerd' or 'cri-o'",
                other
            ))),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_kind_parsing() {
        assert_eq!("containerd".parse::<RuntimeKind>().unwrap(), RuntimeKind::Containerd);
        assert_eq!("cri-o".parse::<RuntimeKind>().unwrap(), RuntimeKind::CriO);
        assert_eq!(RuntimeKind::CriO.to_string(), "cri-o");

        let err = "docker".parse::<RuntimeKind>().unwrap_err();
        assert!(matches!(err, ExporterError::Config { .. }));
        assert!(err.to_string().contains("docker"));
    }

    #[test]
    fn test_default_endpoints() {
        assert_eq!(
            RuntimeKind::Containerd.default_endpoint(),
            Path::new("/host-run/containerd/containerd.sock")
        );
        assert!(RuntimeKind::CriO.default_endpoint().ends_with("crio.sock"));
    }
}
