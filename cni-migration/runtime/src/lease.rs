use crate::k8s::{self, api::apps::v1::Deployment, ObjectMeta, Resource, ResourceExt};
use anyhow::{Context as _, Result};
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::PatchParams;
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "cni-migration-manager";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Ensures the manager's Lease exists and starts competing for it.
pub async fn init(
    client: k8s::Client,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    // The Lease is owned by the manager Deployment so it is removed with it.
    let api = k8s::Api::<Deployment>::namespaced(client.clone(), ns);
    let deployment = api
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to fetch deployment {ns}/{deployment_name}"))?;
    let owner = deployment
        .controller_owner_ref(&())
        .context("deployment has no name or uid")?;

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // Only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                [(
                    "app.kubernetes.io/component".to_string(),
                    "cni-migration-manager".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(client, ns);
    match api
        .patch(
            LEASE_NAME,
            &PatchParams {
                field_manager: Some(crate::core::FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &kube::api::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(lease = %lease.name_any(), "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}
