//! CRI scanner for containerd and CRI-O
//!
//! Speaks `runtime.v1.RuntimeService` over the runtime's unix socket. Each
//! scan opens its own channel, so a restarted runtime is picked up on the
//! next cycle without reconnect bookkeeping.

use super::runtime_spec::{RuntimeSpec, VerboseInfo};
use super::{RuntimeKind, RuntimeScanner};
use crate::error::ExporterError;
use crate::models::WorkloadAllocation;
use crate::proto::runtime_service_client::RuntimeServiceClient;
use crate::proto::{
    Container, ContainerFilter, ContainerState, ContainerStateValue, ContainerStatusRequest,
    ContainerStatusResponse, ListContainersRequest, ListPodSandboxRequest, PodSandboxFilter,
    PodSandboxMetadata, PodSandboxState, PodSandboxStateValue,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a single container was left out of a scan
#[derive(Debug, Error)]
pub(crate) enum SkipReason {
    #[error("status call failed: {0}")]
    Status(#[from] tonic::Status),
    #[error("container is not running")]
    NotRunning,
    #[error("verbose info carries no runtime spec")]
    MissingSpec,
    #[error("malformed verbose info: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Runtime scanner backed by the Container Runtime Interface
#[derive(Debug, Clone)]
pub struct CriScanner {
    kind: RuntimeKind,
    endpoint: PathBuf,
    namespace: Option<String>,
}

impl CriScanner {
    /// Create a scanner; an empty namespace means all namespaces
    pub fn new(kind: RuntimeKind, endpoint: impl AsRef<Path>, namespace: Option<String>) -> Self {
        let raw = endpoint.as_ref().to_string_lossy();
        let endpoint = PathBuf::from(raw.strip_prefix("unix://").unwrap_or(&raw));
        Self {
            kind,
            endpoint,
            namespace: namespace.filter(|ns| !ns.is_empty()),
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Channel, ExporterError> {
        let path = self.endpoint.clone();
        // The URI is required by tonic but unused by the unix connector
        Endpoint::from_static("http://[::]:50051")
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
            .await
            .map_err(|e| {
                ExporterError::runtime_unavailable(format!(
                    "Failed to connect to {} at {}: {}",
                    self.kind,
                    self.endpoint.display(),
                    e
                ))
            })
    }

    /// Ready pod sandboxes, keyed by sandbox id
    async fn ready_sandboxes(
        &self,
        client: &mut RuntimeServiceClient,
    ) -> Result<HashMap<String, PodSandboxMetadata>, ExporterError> {
        let request = ListPodSandboxRequest {
            filter: Some(PodSandboxFilter {
                state: Some(PodSandboxStateValue {
                    state: PodSandboxState::SandboxReady as i32,
                }),
                ..Default::default()
            }),
        };
        let response = client.list_pod_sandbox(request).await.map_err(|status| {
            ExporterError::runtime_unavailable(format!("ListPodSandbox failed: {}", status))
        })?;

        Ok(response
            .items
            .into_iter()
            .filter_map(|sandbox| sandbox.metadata.map(|meta| (sandbox.id, meta)))
            .filter(|(_, meta)| self.in_scope(&meta.namespace))
            .collect())
    }

    async fn running_containers(
        &self,
        client: &mut RuntimeServiceClient,
    ) -> Result<Vec<Container>, ExporterError> {
        let request = ListContainersRequest {
            filter: Some(ContainerFilter {
                state: Some(ContainerStateValue {
                    state: ContainerState::ContainerRunning as i32,
                }),
                ..Default::default()
            }),
        };
        let response = client.list_containers(request).await.map_err(|status| {
            ExporterError::runtime_unavailable(format!("ListContainers failed: {}", status))
        })?;
        Ok(response.containers)
    }

    fn in_scope(&self, namespace: &str) -> bool {
        self.namespace.as_deref().map_or(true, |ns| ns == namespace)
    }
}

#[async_trait]
impl RuntimeScanner for CriScanner {
    async fn scan(&self) -> Result<Vec<WorkloadAllocation>, ExporterError> {
        let channel = self.connect().await?;
        let mut client = RuntimeServiceClient::new(channel);

        let sandboxes = self.ready_sandboxes(&mut client).await?;
        let containers = self.running_containers(&mut client).await?;

        let (allocations, skipped) =
            collect_allocations(self.kind, &sandboxes, &containers, |container_id| {
                let mut client = client.clone();
                async move {
                    client
                        .container_status(ContainerStatusRequest {
                            container_id,
                            verbose: true,
                        })
                        .await
                }
            })
            .await;

        debug!(
            runtime = %self.kind,
            sandboxes = sandboxes.len(),
            containers = allocations.len(),
            skipped,
            "Runtime scan complete"
        );
        Ok(allocations)
    }
}

/// Inspect every container of an in-scope sandbox
///
/// A container whose status cannot be fetched or understood is logged and
/// counted as skipped; it never fails the scan. Returns the allocations and
/// the skip count.
pub(crate) async fn collect_allocations<F, Fut>(
    kind: RuntimeKind,
    sandboxes: &HashMap<String, PodSandboxMetadata>,
    containers: &[Container],
    fetch_status: F,
) -> (Vec<WorkloadAllocation>, usize)
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<ContainerStatusResponse, tonic::Status>>,
{
    let mut allocations = Vec::new();
    let mut skipped = 0usize;
    for container in containers {
        let Some(pod) = sandboxes.get(&container.pod_sandbox_id) else {
            continue;
        };
        let result = match fetch_status(container.id.clone()).await {
            Ok(response) => allocation_from_status(kind, pod, container, &response),
            Err(status) => Err(SkipReason::from(status)),
        };
        match result {
            Ok(allocation) => allocations.push(allocation),
            Err(reason) => {
                skipped += 1;
                warn!(
                    container_id = %container.id,
                    namespace = %pod.namespace,
                    pod = %pod.name,
                    reason = %reason,
                    "Skipping container"
                );
            }
        }
    }
    (allocations, skipped)
}

/// Build the allocation of one container from its verbose status
pub(crate) fn allocation_from_status(
    kind: RuntimeKind,
    pod: &PodSandboxMetadata,
    container: &Container,
    response: &ContainerStatusResponse,
) -> Result<WorkloadAllocation, SkipReason> {
    let running = response
        .status
        .as_ref()
        .map_or(false, |s| s.state() == ContainerState::ContainerRunning);
    if !running {
        return Err(SkipReason::NotRunning);
    }

    let spec = runtime_spec(kind, &response.info)?;
    let container_name = container
        .metadata
        .as_ref()
        .map(|m| m.name.clone())
        .unwrap_or_default();

    Ok(WorkloadAllocation {
        namespace: pod.namespace.clone(),
        pod_name: pod.name.clone(),
        container_name,
        container_id: container.id.clone(),
        grants: spec.grants(),
    })
}

fn runtime_spec(
    kind: RuntimeKind,
    info: &HashMap<String, String>,
) -> Result<RuntimeSpec, SkipReason> {
    for key in kind.info_keys() {
        let Some(raw) = info.get(*key) else {
            continue;
        };
        if *key == "runtimeSpec" {
            return Ok(serde_json::from_str(raw)?);
        }
        let verbose: VerboseInfo = serde_json::from_str(raw)?;
        if let Some(spec) = verbose.runtime_spec {
            return Ok(spec);
        }
    }
    Err(SkipReason::MissingSpec)
}
