use crate::{
    core::{Backoff, ControllerMetrics},
    k8s::{watcher, Api, CNINodeMigration, Client, Pod, ResourceExt},
    Agent, Cleanup, Error, NodeApi,
};
use futures::prelude::*;
use kube::runtime::{controller::Action, reflector::ObjectRef, Controller};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct Context<N, C> {
    agent: Agent<N, C>,
    backoff: Backoff,
    metrics: ControllerMetrics,
}

// === impl Context ===

impl<N, C> Context<N, C> {
    pub fn new(agent: Agent<N, C>, metrics: ControllerMetrics) -> Arc<Self> {
        Arc::new(Self {
            agent,
            backoff: Backoff::default(),
            metrics,
        })
    }
}

/// Runs the agent until `shutdown` is signaled.
///
/// Both watches are restricted by field selectors to this node, so the
/// agent's caches hold a single node state and the node's own pods.
pub async fn run<N, C>(client: Client, ctx: Arc<Context<N, C>>, shutdown: drain::Watch)
where
    N: NodeApi + 'static,
    C: Cleanup + 'static,
{
    let node = ctx.agent.node().to_string();
    let states = Api::<CNINodeMigration>::all(client.clone());
    let pods = Api::<Pod>::all(client);

    let target = node.clone();
    let controller = Controller::new(
        states,
        watcher::Config::default().fields(&format!("metadata.name={node}")),
    )
    .watches(
        pods,
        watcher::Config::default().fields(&format!("spec.nodeName={node}")),
        move |_: Pod| Some(ObjectRef::<CNINodeMigration>::new(&target)),
    )
    .run(reconcile, error_policy, ctx)
    .for_each(|res| async move {
        match res {
            Ok((obj, action)) => tracing::debug!(node = %obj.name, ?action, "Reconciled"),
            Err(error) => tracing::debug!(%error, "Reconcile failed"),
        }
    });

    info!(%node, "Starting agent");
    tokio::select! {
        _ = controller => {}
        _ = shutdown.signaled() => {
            info!("Shutting down");
        }
    }
}

#[instrument(skip_all, fields(node = %state.name_any()))]
async fn reconcile<N, C>(
    state: Arc<CNINodeMigration>,
    ctx: Arc<Context<N, C>>,
) -> Result<Action, Error>
where
    N: NodeApi,
    C: Cleanup,
{
    let res = ctx.agent.reconcile(&state).await;
    match res {
        Ok(_) => {
            ctx.backoff.reset(&state.name_any());
            ctx.metrics.reconciled();
        }
        Err(_) => ctx.metrics.failed(),
    }
    res
}

fn error_policy<N, C>(
    state: Arc<CNINodeMigration>,
    error: &Error,
    ctx: Arc<Context<N, C>>,
) -> Action {
    let delay = ctx.backoff.next(&state.name_any());
    match error {
        Error::EvictionBlocked { .. } => tracing::info!(%error, ?delay, "Retrying eviction"),
        _ => tracing::warn!(%error, ?delay, "Reconcile failed; retrying"),
    }
    Action::requeue(delay)
}
