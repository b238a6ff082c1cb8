use crate::{
    core::FIELD_MANAGER,
    k8s::{
        self, Api, CNINodeMigration, CNINodeMigrationStatus, ListParams, Patch, PatchParams, Pod,
        MIGRATION_MARKER_ANNOTATION,
    },
};
use anyhow::{Context as _, Result};
use kube::api::EvictParams;
use tokio::time;

const API_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// The outcome of asking the API server to evict a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Eviction {
    Evicted,
    /// The pod no longer exists.
    Gone,
    /// The eviction was refused, e.g. by a disruption budget.
    Blocked(String),
}

/// The node-scoped reads and writes the agent depends on.
#[async_trait::async_trait]
pub trait NodeApi: Send + Sync {
    /// Lists the pods scheduled on this node.
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    async fn mark_pod(&self, namespace: &str, name: &str, migration: &str) -> Result<()>;

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<Eviction>;

    async fn patch_status(&self, name: &str, status: &CNINodeMigrationStatus) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeNode {
    client: k8s::Client,
    node: String,
}

// === impl KubeNode ===

impl KubeNode {
    pub fn new(client: k8s::Client, node: impl ToString) -> Self {
        Self {
            client,
            node: node.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl NodeApi for KubeNode {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node));
        let pods = time::timeout(
            API_TIMEOUT,
            Api::<Pod>::all(self.client.clone()).list(&params),
        )
        .await?
        .with_context(|| format!("failed to list pods on node {}", self.node))?;
        Ok(pods.items)
    }

    async fn mark_pod(&self, namespace: &str, name: &str, migration: &str) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    (MIGRATION_MARKER_ANNOTATION): migration,
                },
            },
        });
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        match time::timeout(
            API_TIMEOUT,
            api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch)),
        )
        .await?
        {
            Ok(_) => Ok(()),
            Err(error) if k8s::is_not_found(&error) => {
                tracing::debug!(%namespace, %name, "Pod is already gone");
                Ok(())
            }
            Err(error) => {
                Err(error).with_context(|| format!("failed to mark pod {namespace}/{name}"))
            }
        }
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<Eviction> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        match time::timeout(API_TIMEOUT, api.evict(name, &EvictParams::default())).await? {
            Ok(_) => Ok(Eviction::Evicted),
            Err(error) if k8s::is_not_found(&error) => Ok(Eviction::Gone),
            Err(error) if k8s::is_too_many_requests(&error) => {
                Ok(Eviction::Blocked(error.to_string()))
            }
            Err(error) => {
                Err(error).with_context(|| format!("failed to evict pod {namespace}/{name}"))
            }
        }
    }

    async fn patch_status(&self, name: &str, status: &CNINodeMigrationStatus) -> Result<()> {
        let api = Api::<CNINodeMigration>::all(self.client.clone());
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        time::timeout(
            API_TIMEOUT,
            api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &patch),
        )
        .await?
        .with_context(|| format!("failed to patch CNINodeMigration {name} status"))?;
        Ok(())
    }
}
