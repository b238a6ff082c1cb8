//! Toggles network plugin modules through their `ModuleConfig` objects and
//! derives readiness from the DaemonSet each module deploys.

use crate::{
    core::{ModuleToggle, Readiness, FIELD_MANAGER},
    k8s::{self, Api, Cni, DaemonSet, ListParams, Patch, PatchParams, Pod, ResourceExt},
};
use anyhow::{bail, Context as _, Result};
use kube::{
    api::{ApiResource, DynamicObject},
    core::GroupVersionKind,
};
use std::future::Future;
use tokio::time;

const API_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// Init container states that will not resolve without intervention.
const FATAL_WAITING_REASONS: [&str; 5] = [
    "ErrImagePull",
    "ImagePullBackOff",
    "CrashLoopBackOff",
    "CreateContainerConfigError",
    "InvalidImageName",
];

#[derive(Clone)]
pub struct ModuleConfigToggle {
    client: k8s::Client,
    resource: ApiResource,
}

// === impl ModuleConfigToggle ===

impl ModuleConfigToggle {
    pub fn new(client: k8s::Client) -> Self {
        let gvk = GroupVersionKind::gvk("deckhouse.io", "v1alpha1", "ModuleConfig");
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
        }
    }

    fn module_configs(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.resource)
    }

    async fn module_config(&self, cni: Cni) -> Result<DynamicObject> {
        let name = cni.module_name();
        timeout(self.module_configs().get_opt(&name))
            .await?
            .with_context(|| format!("ModuleConfig {name} not found"))
    }

    async fn set_enabled(&self, cni: Cni, enabled: bool) -> Result<()> {
        let config = self.module_config(cni).await?;
        if is_enabled(&config) == Some(enabled) {
            return Ok(());
        }

        let name = config.name_any();
        let patch = serde_json::json!({ "spec": { "enabled": enabled } });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        timeout(self.module_configs().patch(&name, &params, &Patch::Merge(patch))).await?;
        tracing::info!(module = %name, enabled, "Updated ModuleConfig");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ModuleToggle for ModuleConfigToggle {
    async fn is_enabled(&self, cni: Cni) -> Result<bool> {
        let config = self.module_config(cni).await?;
        Ok(is_enabled(&config).unwrap_or(false))
    }

    async fn enable(&self, cni: Cni) -> Result<()> {
        self.set_enabled(cni, true).await
    }

    async fn disable(&self, cni: Cni) -> Result<()> {
        self.set_enabled(cni, false).await
    }

    async fn readiness(&self, cni: Cni) -> Result<Readiness> {
        let ns = cni.namespace();
        let daemonsets = Api::<DaemonSet>::namespaced(self.client.clone(), &ns);
        let Some(ds) = timeout(daemonsets.get_opt(cni.daemonset_name())).await? else {
            return Ok(Readiness::Absent);
        };
        if let Some(readiness) = daemonset_readiness(&ds) {
            return Ok(readiness);
        }

        let selector = ds
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        let pods = Api::<Pod>::namespaced(self.client.clone(), &ns);
        let pods = timeout(pods.list(&ListParams::default().labels(&selector))).await?;
        pods_readiness(&ds, &pods.items)
    }
}

fn is_enabled(config: &DynamicObject) -> Option<bool> {
    config.data.get("spec")?.get("enabled")?.as_bool()
}

/// Decides readiness from the DaemonSet status alone, if it can.
fn daemonset_readiness(ds: &DaemonSet) -> Option<Readiness> {
    let status = ds.status.as_ref();
    let desired = status.map_or(0, |s| s.desired_number_scheduled);
    if desired == 0 {
        return Some(Readiness::Progressing(format!(
            "waiting for {} pods to be scheduled",
            ds.name_any()
        )));
    }
    let ready = status.map_or(0, |s| s.number_ready);
    if ready >= desired {
        return Some(Readiness::Ready);
    }
    None
}

/// Checks that the DaemonSet has a scheduled pod for every desired node and
/// that none of them is stuck in its init containers.
fn pods_readiness(ds: &DaemonSet, pods: &[Pod]) -> Result<Readiness> {
    let name = ds.name_any();
    let desired = ds.status.as_ref().map_or(0, |s| s.desired_number_scheduled);
    let created = i32::try_from(pods.len()).unwrap_or(i32::MAX);
    if created < desired {
        return Ok(Readiness::Progressing(format!(
            "{created}/{desired} {name} pods created"
        )));
    }

    for pod in pods {
        let pod_name = pod.name_any();
        let spec = pod.spec.as_ref();
        if spec.and_then(|s| s.node_name.as_deref()).is_none() {
            return Ok(Readiness::Progressing(format!(
                "pod {pod_name} is not scheduled"
            )));
        }

        let Some(status) = pod.status.as_ref() else {
            return Ok(Readiness::Progressing(format!(
                "pod {pod_name} has no status"
            )));
        };
        let init = status.init_container_statuses.as_deref().unwrap_or_default();
        if init.is_empty() && status.phase.as_deref() == Some("Pending") {
            return Ok(Readiness::Progressing(format!(
                "waiting for pod {pod_name} init containers to start"
            )));
        }
        for container in init {
            let Some(state) = container.state.as_ref() else {
                continue;
            };
            if let Some(reason) = state.waiting.as_ref().and_then(|w| w.reason.as_deref()) {
                if FATAL_WAITING_REASONS.contains(&reason) {
                    bail!(
                        "pod {pod_name} init container {} failed: {reason}",
                        container.name
                    );
                }
            }
            if let Some(terminated) = state.terminated.as_ref() {
                if terminated.exit_code != 0 {
                    bail!(
                        "pod {pod_name} init container {} terminated with exit code {}",
                        container.name,
                        terminated.exit_code
                    );
                }
            }
        }
    }

    Ok(Readiness::RolledOut)
}

async fn timeout<T>(fut: impl Future<Output = Result<T, k8s::Error>>) -> Result<T> {
    Ok(time::timeout(API_TIMEOUT, fut).await??)
}
