use crate::{
    core::{Backoff, ControllerMetrics, ModuleToggle},
    k8s::{watcher, Api, CNIMigration, CNINodeMigration, Client, Node, ResourceExt},
    ClusterApi, Error, Migrator,
};
use chrono::Utc;
use futures::prelude::*;
use kube::runtime::{controller::Action, reflector::ObjectRef, Controller};
use std::sync::Arc;
use tokio::{sync::watch, time::Duration};
use tracing::{info, instrument};

const LEADER_RECHECK: Duration = Duration::from_secs(10);

/// Shared state for the manager's reconcile loop.
pub struct Context<C, T> {
    migrator: Migrator<C, T>,
    hostname: String,
    claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    backoff: Backoff,
    metrics: ControllerMetrics,
}

// === impl Context ===

impl<C, T> Context<C, T> {
    pub fn new(
        migrator: Migrator<C, T>,
        hostname: impl ToString,
        claims: watch::Receiver<Arc<kubert::lease::Claim>>,
        metrics: ControllerMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            migrator,
            hostname: hostname.to_string(),
            claims,
            backoff: Backoff::default(),
            metrics,
        })
    }

    pub(crate) fn is_leader(&self) -> bool {
        let claim = self.claims.borrow();
        claim.holder == self.hostname && claim.expiry > Utc::now()
    }
}

/// Runs the manager until `shutdown` is signaled.
///
/// The controller watches only the named `CNIMigration`. Changes to node
/// states (through their owner reference) and to the node list both requeue
/// it.
pub async fn run<C, T>(client: Client, ctx: Arc<Context<C, T>>, shutdown: drain::Watch)
where
    C: ClusterApi + 'static,
    T: ModuleToggle + 'static,
{
    let name = ctx.migrator.config().migration_name.clone();
    let migrations = Api::<CNIMigration>::all(client.clone());
    let states = Api::<CNINodeMigration>::all(client.clone());
    let nodes = Api::<Node>::all(client);

    let target = name.clone();
    let controller = Controller::new(
        migrations,
        watcher::Config::default().fields(&format!("metadata.name={name}")),
    )
    .owns(states, watcher::Config::default())
    .watches(nodes, watcher::Config::default(), move |_: Node| {
        Some(ObjectRef::<CNIMigration>::new(&target))
    })
    .run(reconcile, error_policy, ctx)
    .for_each(|res| async move {
        match res {
            Ok((obj, action)) => tracing::debug!(migration = %obj.name, ?action, "Reconciled"),
            Err(error) => tracing::debug!(%error, "Reconcile failed"),
        }
    });

    info!(migration = %name, "Starting manager");
    tokio::select! {
        _ = controller => {}
        _ = shutdown.signaled() => {
            info!("Shutting down");
        }
    }
}

#[instrument(skip_all, fields(migration = %migration.name_any()))]
async fn reconcile<C, T>(
    migration: Arc<CNIMigration>,
    ctx: Arc<Context<C, T>>,
) -> Result<Action, Error>
where
    C: ClusterApi,
    T: ModuleToggle,
{
    if !ctx.is_leader() {
        tracing::debug!("Not the lease holder");
        return Ok(Action::requeue(LEADER_RECHECK));
    }

    let res = ctx.migrator.reconcile(&migration).await;
    match res {
        Ok(_) => {
            ctx.backoff.reset(&migration.name_any());
            ctx.metrics.reconciled();
        }
        Err(_) => ctx.metrics.failed(),
    }
    res
}

fn error_policy<C, T>(
    migration: Arc<CNIMigration>,
    error: &Error,
    ctx: Arc<Context<C, T>>,
) -> Action {
    let delay = ctx.backoff.next(&migration.name_any());
    tracing::warn!(%error, ?delay, "Reconcile failed; retrying");
    Action::requeue(delay)
}
