//! Publishing snapshots as `NodeResourceTopology` objects
//!
//! One object per node, named after the node, in the publish namespace. Every
//! publish reads the current object first and then creates or replaces it.
//! Replacing carries the read `resourceVersion`, so a concurrent writer turns
//! into a conflict that is retried with a fresh read.

use crate::error::ExporterError;
use crate::models::{NumaResourceSnapshot, TopologyManagerPolicy};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::core::TypeMeta;
use kube::Client;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const API_GROUP: &str = "topology.node.k8s.io";
pub const API_VERSION: &str = "v1alpha1";
pub const KIND: &str = "NodeResourceTopology";
pub const PLURAL: &str = "noderesourcetopologies";

/// Namespace the exporter publishes into unless told otherwise
pub const DEFAULT_PUBLISH_NAMESPACE: &str = "default";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Zone type used for NUMA nodes
pub const ZONE_TYPE_NODE: &str = "Node";

/// Per-node topology custom resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceTopology {
    #[serde(flatten)]
    pub types: TypeMeta,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub topology_policies: Vec<String>,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Zone {
    pub name: String,
    #[serde(rename = "type")]
    pub zone_type: String,
    #[serde(default)]
    pub resources: Vec<ZoneResource>,
}

/// `ResourceInfo` of the v1alpha1 schema
///
/// Nothing is reserved outside the granted units, so `allocatable` and
/// `available` both carry capacity minus what is currently granted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ZoneResource {
    pub name: String,
    pub capacity: Quantity,
    pub allocatable: Quantity,
    pub available: Quantity,
}

impl NodeResourceTopology {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            types: type_meta(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Overwrite the payload while leaving metadata untouched
    pub fn set_payload(&mut self, policy: &TopologyManagerPolicy, snapshot: &NumaResourceSnapshot) {
        self.types = type_meta();
        self.topology_policies = vec![policy.as_str().to_string()];
        self.zones = zones_from_snapshot(snapshot);
    }
}

impl kube::Resource for NodeResourceTopology {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn group(_dt: &()) -> Cow<'_, str> {
        API_GROUP.into()
    }

    fn version(_dt: &()) -> Cow<'_, str> {
        API_VERSION.into()
    }

    fn kind(_dt: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn plural(_dt: &()) -> Cow<'_, str> {
        PLURAL.into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

fn type_meta() -> TypeMeta {
    TypeMeta {
        api_version: format!("{}/{}", API_GROUP, API_VERSION),
        kind: KIND.to_string(),
    }
}

/// One zone per NUMA node, resources in name order
pub fn zones_from_snapshot(snapshot: &NumaResourceSnapshot) -> Vec<Zone> {
    snapshot
        .by_node()
        .into_iter()
        .map(|(node, resources)| Zone {
            name: format!("node-{}", node),
            zone_type: ZONE_TYPE_NODE.to_string(),
            resources: resources
                .into_iter()
                .map(|(name, amount)| ZoneResource {
                    name: name.to_string(),
                    capacity: Quantity(amount.capacity.to_string()),
                    allocatable: Quantity(amount.available().to_string()),
                    available: Quantity(amount.available().to_string()),
                })
                .collect(),
        })
        .collect()
}

/// Failures of a single store operation
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency check lost against another writer
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Object store holding published topology objects
#[async_trait]
pub trait TopologyStore: Send + Sync {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NodeResourceTopology>, StoreError>;

    async fn create(
        &self,
        namespace: &str,
        object: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError>;

    /// Replace an existing object; fails with a conflict on a stale resource version
    async fn replace(
        &self,
        namespace: &str,
        object: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError>;
}

/// [`TopologyStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeTopologyStore {
    client: Client,
}

impl KubeTopologyStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<NodeResourceTopology> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl TopologyStore for KubeTopologyStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NodeResourceTopology>, StoreError> {
        self.api(namespace).get_opt(name).await.map_err(store_error)
    }

    async fn create(
        &self,
        namespace: &str,
        object: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        self.api(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(store_error)
    }

    async fn replace(
        &self,
        namespace: &str,
        object: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        let name = object.metadata.name.as_deref().unwrap_or_default();
        self.api(namespace)
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(store_error)
    }
}

fn store_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict(response.message),
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// Outcome of a successful publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Attempts used, 1 when no conflict occurred
    pub attempts: u32,
    /// Whether the object did not exist before
    pub created: bool,
}

/// Capability consumed by the driver loop
#[async_trait]
pub trait SnapshotPublisher: Send + Sync {
    async fn publish(
        &self,
        scope: &str,
        snapshot: &NumaResourceSnapshot,
    ) -> Result<PublishReport, ExporterError>;
}

/// Publishes snapshots for one node through a [`TopologyStore`]
pub struct Exporter<S> {
    store: S,
    policy: TopologyManagerPolicy,
    node_name: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl<S: TopologyStore> Exporter<S> {
    pub fn new(store: S, policy: TopologyManagerPolicy, node_name: impl Into<String>) -> Self {
        Self {
            store,
            policy,
            node_name: node_name.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }

    /// Override the conflict retry budget; at least one attempt is always made
    pub fn with_retry(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn policy(&self) -> &TopologyManagerPolicy {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Make the stored object reflect `snapshot`
    pub async fn create_or_update(
        &self,
        scope: &str,
        snapshot: &NumaResourceSnapshot,
    ) -> Result<PublishReport, ExporterError> {
        let mut backoff = self.initial_backoff;
        let mut last_conflict = String::new();

        for attempt in 1..=self.max_attempts {
            match self.try_publish(scope, snapshot).await {
                Ok(created) => {
                    if created {
                        info!(
                            namespace = %scope,
                            name = %self.node_name,
                            "Created NodeResourceTopology"
                        );
                    } else {
                        debug!(
                            namespace = %scope,
                            name = %self.node_name,
                            attempt,
                            "Updated NodeResourceTopology"
                        );
                    }
                    return Ok(PublishReport {
                        attempts: attempt,
                        created,
                    });
                }
                Err(StoreError::Conflict(message)) => {
                    warn!(
                        namespace = %scope,
                        name = %self.node_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %message,
                        "Publish conflict"
                    );
                    last_conflict = message;
                    if attempt < self.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
                Err(StoreError::Unavailable(message)) => {
                    return Err(ExporterError::PublishUnavailable { message });
                }
            }
        }

        Err(ExporterError::PublishConflict {
            attempts: self.max_attempts,
            message: last_conflict,
        })
    }

    /// One read-then-write round; returns whether the object was created
    async fn try_publish(
        &self,
        scope: &str,
        snapshot: &NumaResourceSnapshot,
    ) -> Result<bool, StoreError> {
        match self.store.get(scope, &self.node_name).await? {
            Some(mut current) => {
                current.set_payload(&self.policy, snapshot);
                self.store.replace(scope, &current).await?;
                Ok(false)
            }
            None => {
                let mut object = NodeResourceTopology::new(&self.node_name, scope);
                object.set_payload(&self.policy, snapshot);
                self.store.create(scope, &object).await?;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl<S: TopologyStore> SnapshotPublisher for Exporter<S> {
    async fn publish(
        &self,
        scope: &str,
        snapshot: &NumaResourceSnapshot,
    ) -> Result<PublishReport, ExporterError> {
        self.create_or_update(scope, snapshot).await
    }
}
