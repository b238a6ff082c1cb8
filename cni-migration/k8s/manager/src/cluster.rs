use crate::{
    core::FIELD_MANAGER,
    k8s::{
        self, api::admissionregistration::v1 as admissionv1, Api, CNIMigration,
        CNIMigrationStatus, CNINodeMigration, ListParams, Node, NodePhase, Patch, PatchParams,
        Pod, PostParams, ResourceExt, Service, ALLOWED_NODE_PHASE_ANNOTATION,
    },
};
use anyhow::{Context as _, Result};
use std::collections::BTreeSet;
use tokio::time;

const API_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// The cluster-level reads and writes the phase engine depends on.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of every node currently registered in the cluster.
    async fn list_nodes(&self) -> Result<BTreeSet<String>>;

    async fn list_node_migrations(&self) -> Result<Vec<CNINodeMigration>>;

    /// Creates a node state. An object that already exists is not an error.
    async fn create_node_migration(&self, state: CNINodeMigration) -> Result<()>;

    /// Returns a description of the first webhook in the named
    /// configurations that would reject requests if its backend were down.
    async fn blocking_webhook(&self, name: &str) -> Result<Option<String>>;

    /// Returns a description of the first service-backed webhook in the named
    /// configurations that has no ready backing pod.
    async fn unready_webhook(&self, name: &str) -> Result<Option<String>>;

    /// Opens every local phase up to `phase` for the named node's agent.
    async fn allow_node_phase(&self, name: &str, phase: NodePhase) -> Result<()>;

    async fn patch_migration_status(&self, name: &str, status: &CNIMigrationStatus) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: k8s::Client,
}

struct Webhook {
    config: String,
    name: String,
    failure_policy: Option<String>,
    service: Option<admissionv1::ServiceReference>,
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }

    async fn webhooks(&self, name: &str) -> Result<Vec<Webhook>> {
        let validating = timeout(
            Api::<admissionv1::ValidatingWebhookConfiguration>::all(self.client.clone())
                .get_opt(name),
        )
        .await?;
        let mutating = timeout(
            Api::<admissionv1::MutatingWebhookConfiguration>::all(self.client.clone())
                .get_opt(name),
        )
        .await?;

        let mut webhooks = Vec::new();
        if let Some(config) = validating {
            let config_name = format!("ValidatingWebhookConfiguration/{}", config.name_any());
            webhooks.extend(config.webhooks.into_iter().flatten().map(|wh| Webhook {
                config: config_name.clone(),
                name: wh.name,
                failure_policy: wh.failure_policy,
                service: wh.client_config.service,
            }));
        }
        if let Some(config) = mutating {
            let config_name = format!("MutatingWebhookConfiguration/{}", config.name_any());
            webhooks.extend(config.webhooks.into_iter().flatten().map(|wh| Webhook {
                config: config_name.clone(),
                name: wh.name,
                failure_policy: wh.failure_policy,
                service: wh.client_config.service,
            }));
        }
        Ok(webhooks)
    }

    async fn has_ready_endpoint(&self, svc: &admissionv1::ServiceReference) -> Result<bool> {
        let service = timeout(
            Api::<Service>::namespaced(self.client.clone(), &svc.namespace).get_opt(&svc.name),
        )
        .await?;
        let Some(service) = service else {
            return Ok(false);
        };
        let Some(selector) = service.spec.and_then(|s| s.selector).filter(|s| !s.is_empty())
        else {
            // Endpoints are managed out of band; there is nothing to check.
            return Ok(true);
        };

        let labels = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let pods = timeout(
            Api::<Pod>::namespaced(self.client.clone(), &svc.namespace)
                .list(&ListParams::default().labels(&labels)),
        )
        .await?;
        Ok(pods.items.iter().any(is_serving))
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self) -> Result<BTreeSet<String>> {
        let nodes = timeout(
            Api::<Node>::all(self.client.clone()).list_metadata(&ListParams::default()),
        )
        .await?;
        Ok(nodes.items.iter().map(|n| n.name_any()).collect())
    }

    async fn list_node_migrations(&self) -> Result<Vec<CNINodeMigration>> {
        let states = timeout(
            Api::<CNINodeMigration>::all(self.client.clone()).list(&ListParams::default()),
        )
        .await?;
        Ok(states.items)
    }

    async fn create_node_migration(&self, state: CNINodeMigration) -> Result<()> {
        let name = state.name_any();
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let api = Api::<CNINodeMigration>::all(self.client.clone());
        match time::timeout(API_TIMEOUT, api.create(&params, &state)).await? {
            Ok(_) => {
                tracing::info!(node = %name, "Created CNINodeMigration");
                Ok(())
            }
            Err(error) if k8s::is_conflict(&error) => {
                tracing::debug!(node = %name, "CNINodeMigration already exists");
                Ok(())
            }
            Err(error) => {
                Err(error).with_context(|| format!("failed to create CNINodeMigration {name}"))
            }
        }
    }

    async fn blocking_webhook(&self, name: &str) -> Result<Option<String>> {
        let blocking = self
            .webhooks(name)
            .await?
            .into_iter()
            .find(|wh| wh.failure_policy.as_deref() != Some("Ignore"));
        Ok(blocking.map(|wh| {
            format!(
                "waiting for webhook {} in {} to be removed",
                wh.name, wh.config
            )
        }))
    }

    async fn unready_webhook(&self, name: &str) -> Result<Option<String>> {
        for wh in self.webhooks(name).await? {
            let Some(svc) = wh.service.as_ref() else {
                continue;
            };
            if !self.has_ready_endpoint(svc).await? {
                return Ok(Some(format!(
                    "waiting for a ready pod behind service {}/{} of webhook {}",
                    svc.namespace, svc.name, wh.name
                )));
            }
        }
        Ok(None)
    }

    async fn allow_node_phase(&self, name: &str, phase: NodePhase) -> Result<()> {
        let api = Api::<CNINodeMigration>::all(self.client.clone());
        let patch = Patch::Merge(serde_json::json!({
            "metadata": {
                "annotations": { ALLOWED_NODE_PHASE_ANNOTATION: phase.as_str() },
            },
        }));
        time::timeout(
            API_TIMEOUT,
            api.patch(name, &PatchParams::apply(FIELD_MANAGER), &patch),
        )
        .await?
        .with_context(|| format!("failed to open {phase} on CNINodeMigration {name}"))?;
        tracing::info!(node = %name, %phase, "Opened node phase");
        Ok(())
    }

    async fn patch_migration_status(&self, name: &str, status: &CNIMigrationStatus) -> Result<()> {
        let api = Api::<CNIMigration>::all(self.client.clone());
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        time::timeout(
            API_TIMEOUT,
            api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &patch),
        )
        .await?
        .with_context(|| format!("failed to patch CNIMigration {name} status"))?;
        Ok(())
    }
}

async fn timeout<T>(
    fut: impl std::future::Future<Output = Result<T, k8s::Error>>,
) -> Result<T> {
    Ok(time::timeout(API_TIMEOUT, fut).await??)
}

fn is_serving(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
}
