use crate::{
    core::Clock,
    k8s::{
        conditions::{self, reasons},
        CNINodeMigration, CNINodeMigrationStatus, NodePhase, ResourceExt, Time,
    },
    pods, Cleanup, Error, Eviction, NodeApi,
};
use kube::runtime::controller::Action;
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);
const EVICTION_TIMEOUT: Duration = Duration::from_secs(30);
const STEP_INTERVAL: Duration = Duration::from_secs(1);

/// The local phase machine for one node.
pub struct Agent<N, C> {
    node: String,
    api: N,
    cleanup: C,
    clock: Arc<dyn Clock>,
}

// === impl Agent ===

impl<N, C> Agent<N, C>
where
    N: NodeApi,
    C: Cleanup,
{
    pub fn new(node: impl ToString, api: N, cleanup: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            node: node.to_string(),
            api,
            cleanup,
            clock,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Executes the current local phase and advances to the next one.
    ///
    /// Host cleanup and pod restarts only run once the manager has opened
    /// them on the node state; until then the node state is left unchanged.
    pub async fn reconcile(&self, state: &CNINodeMigration) -> Result<Action, Error> {
        let name = state.name_any();
        if name != self.node {
            warn!(%name, node = %self.node, "Ignoring node state for another node");
            return Ok(Action::await_change());
        }
        let migration = state
            .migration_name()
            .ok_or_else(|| Error::MissingOwner(name.clone()))?;

        let original = state.status.clone().unwrap_or_default();
        if original.phase != NodePhase::Completed && !state.is_allowed(original.phase) {
            debug!(
                phase = %original.phase,
                allowed = %state.allowed_phase(),
                "Waiting for the manager to open the phase"
            );
            return Ok(Action::await_change());
        }
        let mut status = original.clone();

        let res = match status.phase {
            NodePhase::PodsAnnotating => self.annotate_pods(migration, &mut status).await,
            NodePhase::NodeCleaning => self.clean_node(state, &mut status).await,
            NodePhase::RestartingPods => self.restart_pods(migration, &mut status).await,
            NodePhase::Completed => {
                debug!("Node migration is complete");
                return Ok(Action::await_change());
            }
        };

        if status != original {
            self.api.patch_status(&name, &status).await?;
        }
        res?;

        if status.phase == NodePhase::Completed {
            return Ok(Action::await_change());
        }
        Ok(Action::requeue(STEP_INTERVAL))
    }

    async fn annotate_pods(
        &self,
        migration: &str,
        status: &mut CNINodeMigrationStatus,
    ) -> Result<(), Error> {
        let pods = self.api.list_pods().await?;
        let mut marked = 0;
        for pod in pods.iter().filter(|p| pods::should_annotate(p)) {
            if !pods::is_marked(pod, migration) {
                let ns = pod.namespace().unwrap_or_default();
                self.api.mark_pod(&ns, &pod.name_any(), migration).await?;
            }
            marked += 1;
        }

        info!(pods = marked, "Marked pods for restart");
        self.advance(
            status,
            conditions::PODS_ANNOTATED,
            format!("marked {marked} pods"),
            NodePhase::NodeCleaning,
        );
        Ok(())
    }

    async fn clean_node(
        &self,
        state: &CNINodeMigration,
        status: &mut CNINodeMigrationStatus,
    ) -> Result<(), Error> {
        let outgoing = state
            .outgoing_cni()
            .ok_or_else(|| Error::MissingOutgoingCni(state.name_any()))?;

        let res = match time::timeout(CLEANUP_TIMEOUT, self.cleanup.run(outgoing)).await {
            Ok(res) => res.map_err(|e| format!("{e:#}")),
            Err(_) => Err(format!("cleanup of {outgoing} timed out")),
        };
        match res {
            Ok(report) => {
                self.advance(
                    status,
                    conditions::CLEANUP_DONE,
                    report.to_string(),
                    NodePhase::RestartingPods,
                );
                Ok(())
            }
            Err(message) => {
                conditions::set(
                    &mut status.conditions,
                    conditions::CLEANUP_DONE,
                    false,
                    reasons::CLEANUP_FAILED,
                    message.clone(),
                    &self.now(),
                );
                Err(Error::Cleanup(message))
            }
        }
    }

    async fn restart_pods(
        &self,
        migration: &str,
        status: &mut CNINodeMigrationStatus,
    ) -> Result<(), Error> {
        let pods = self.api.list_pods().await?;
        let mut evicted = 0;
        for pod in pods.iter().filter(|p| pods::should_restart(p, migration)) {
            let ns = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            let eviction = time::timeout(EVICTION_TIMEOUT, self.api.evict_pod(&ns, &name))
                .await
                .map_err(|_| anyhow::anyhow!("eviction of pod {ns}/{name} timed out"))??;
            match eviction {
                Eviction::Evicted => {
                    debug!(pod = %format_args!("{ns}/{name}"), "Evicted pod");
                    evicted += 1;
                }
                Eviction::Gone => {}
                Eviction::Blocked(reason) => {
                    return Err(Error::EvictionBlocked {
                        pod: format!("{ns}/{name}"),
                        reason,
                    });
                }
            }
        }

        info!(pods = evicted, "Restarted pods");
        self.advance(
            status,
            conditions::PODS_RESTARTED,
            format!("evicted {evicted} pods"),
            NodePhase::Completed,
        );
        Ok(())
    }

    fn advance(
        &self,
        status: &mut CNINodeMigrationStatus,
        condition: &str,
        message: String,
        next: NodePhase,
    ) {
        conditions::set(
            &mut status.conditions,
            condition,
            true,
            reasons::SUCCEEDED,
            message,
            &self.now(),
        );
        info!(from = %status.phase, to = %next, "Advancing node phase");
        status.phase = next;
    }

    fn now(&self) -> Time {
        Time(self.clock.now())
    }
}
