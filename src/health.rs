//! Pool health probing
//!
//! Read-only checks against the orchestrator: is the node hosting a pool
//! instance ready, and is the pool's storage-management container ready.
//! A check that cannot complete is reported as
//! [`Error::HealthIndeterminate`], never as healthy.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{Api, ListParams},
    Client, ResourceExt,
};
use tracing::{debug, instrument};

use crate::config::{LabelKeys, ENV_POOL_ID};
use crate::error::{Error, Result};
use crate::metrics::STALLED_JOBS;

/// Pod and node reads used by the checker
#[async_trait]
pub trait ClusterView: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
}

/// [`ClusterView`] over the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterView {
    client: Client,
}

impl KubeClusterView {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterView for KubeClusterView {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

/// Observed state of a pool instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolHealth {
    Healthy,
    /// The pod has not been assigned a node
    Unscheduled,
    NodeNotReady(String),
    ManagementContainerNotReady,
}

impl PoolHealth {
    /// Jobs on a pool in any state other than `Healthy` are stalled
    pub fn is_stalled(&self) -> bool {
        !matches!(self, PoolHealth::Healthy)
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    cluster: Arc<dyn ClusterView>,
    namespace: String,
    labels: LabelKeys,
}

impl HealthChecker {
    pub fn new(cluster: Arc<dyn ClusterView>, namespace: impl Into<String>, labels: LabelKeys) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            labels,
        }
    }

    /// Find the pod hosting a pool instance.
    ///
    /// Matches the pool identity label first, then the identity passed to the
    /// pool container's environment.
    pub async fn find_pool_pod(&self, pool_id: &str) -> Result<Pod> {
        let pods = self
            .cluster
            .list_pods(&self.namespace, &self.labels.pool_pod_selector)
            .await
            .map_err(|e| Error::HealthIndeterminate(format!("listing pool pods: {}", e)))?;

        let by_label = pods.iter().find(|pod| {
            pod.labels()
                .get(&self.labels.pool_uid)
                .is_some_and(|v| v == pool_id)
        });
        let by_env = || {
            pods.iter().find(|pod| {
                pod.spec
                    .as_ref()
                    .and_then(|spec| spec.containers.first())
                    .and_then(|c| c.env.as_ref())
                    .is_some_and(|env| {
                        env.iter()
                            .any(|var| var.name == ENV_POOL_ID && var.value.as_deref() == Some(pool_id))
                    })
            })
        };

        by_label
            .or_else(by_env)
            .cloned()
            .ok_or_else(|| Error::HealthIndeterminate(format!("no pod found for pool {}", pool_id)))
    }

    /// Check the node and the management container of a pool instance
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn check(&self, pool_id: &str) -> Result<PoolHealth> {
        if pool_id.is_empty() {
            return Err(Error::HealthIndeterminate("job has no pool identity".to_string()));
        }
        let pod = self.find_pool_pod(pool_id).await?;

        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty());
        let Some(node_name) = node_name else {
            debug!(pod = %pod.name_any(), "Pool pod is not scheduled");
            return Ok(PoolHealth::Unscheduled);
        };

        let node = self
            .cluster
            .get_node(&node_name)
            .await
            .map_err(|e| Error::HealthIndeterminate(format!("reading node {}: {}", node_name, e)))?
            .ok_or_else(|| Error::HealthIndeterminate(format!("node {} not found", node_name)))?;
        if !node_ready(&node) {
            return Ok(PoolHealth::NodeNotReady(node_name));
        }

        if !container_ready(&pod, &self.labels.pool_mgmt_container) {
            return Ok(PoolHealth::ManagementContainerNotReady);
        }
        Ok(PoolHealth::Healthy)
    }

    /// Whether jobs of a pool instance are stalled; errors stay indeterminate
    pub async fn is_stalled(&self, pool_id: &str) -> Result<bool> {
        let health = self.check(pool_id).await?;
        if health.is_stalled() {
            debug!(pool = %pool_id, health = ?health, "Pool instance is stalled");
            STALLED_JOBS.inc();
        }
        Ok(health.is_stalled())
    }
}

/// A node is down when its `Ready` condition is present and not `True`
fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .map_or(true, |c| c.status == "True")
}

/// A missing container counts as not ready
fn container_ready(pod: &Pod, container: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == container))
        .is_some_and(|c| c.ready)
}
