use crate::{
    core::{
        quorum::{self, Gate},
        toggle, Clock, FailurePolicy, ModuleToggle, NodeStats,
    },
    k8s::{
        conditions::{self, reasons},
        CNIMigration, CNIMigrationStatus, CNINodeMigration, Cni, MigrationPhase, NodePhase,
        Resource, ResourceExt, Time,
    },
    ClusterApi, Error,
};
use kube::runtime::controller::Action;
use std::{collections::BTreeSet, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, info, warn};

const DETECTION_RETRY: Duration = Duration::from_secs(10);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const PAUSE_INTERVAL: Duration = Duration::from_secs(30);
const STEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct Config {
    pub migration_name: String,
    /// Admission webhook configurations that gate `Preparing` and
    /// `RestartingPods`.
    pub webhooks: Vec<String>,
    pub policy: FailurePolicy,
}

/// The cluster phase engine.
///
/// Each call to [`Migrator::reconcile`] observes the migration, the node
/// list and the node states, executes at most one phase step, and writes the
/// resulting status back if anything changed.
pub struct Migrator<C, T> {
    cluster: C,
    toggle: T,
    config: Config,
    clock: Arc<dyn Clock>,
}

/// The outcome of a single phase step.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Done(String),
    Waiting(String),
}

/// Everything a phase step may look at.
struct Snapshot<'a> {
    migration: &'a CNIMigration,
    current: Cni,
    nodes: &'a BTreeSet<String>,
    states: &'a [CNINodeMigration],
}

// === impl Migrator ===

impl<C, T> Migrator<C, T>
where
    C: ClusterApi,
    T: ModuleToggle,
{
    pub fn new(cluster: C, toggle: T, config: Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            cluster,
            toggle,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn reconcile(&self, migration: &CNIMigration) -> Result<Action, Error> {
        let name = migration.name_any();
        let original = migration.status.clone().unwrap_or_default();
        if original.is_final() {
            debug!(phase = %original.phase, "Migration is final");
            return Ok(Action::await_change());
        }

        let mut status = original.clone();
        let now = Time(self.clock.now());

        let current = match status.current_cni {
            Some(current) => current,
            None => match toggle::detect_current(&self.toggle).await {
                Ok(current) => {
                    info!(%current, "Detected current CNI");
                    conditions::set(
                        &mut status.conditions,
                        conditions::CURRENT_CNI_DETECTION_FAILED,
                        false,
                        reasons::DETECTED,
                        format!("current CNI is {current}"),
                        &now,
                    );
                    status.current_cni = Some(current);
                    current
                }
                Err(error) => {
                    warn!(%error, "Failed to detect current CNI");
                    conditions::set(
                        &mut status.conditions,
                        conditions::CURRENT_CNI_DETECTION_FAILED,
                        true,
                        reasons::DETECTION_FAILED,
                        error.to_string(),
                        &now,
                    );
                    self.patch(&name, &original, &status).await?;
                    return Ok(Action::requeue(DETECTION_RETRY));
                }
            },
        };

        if status.phase_transition_time.is_none() {
            status.phase_transition_time = Some(now.clone());
        }

        let nodes = self.cluster.list_nodes().await?;
        let states = self.cluster.list_node_migrations().await?;
        let snapshot = Snapshot {
            migration,
            current,
            nodes: &nodes,
            states: &states,
        };

        // Failures recorded by earlier reconciles freeze the migration even
        // while it is paused or its step keeps failing.
        if self.freeze_if_exceeded(&snapshot, &mut status, &now) {
            self.patch(&name, &original, &status).await?;
            return Ok(Action::await_change());
        }

        if migration.paused_before() == Some(status.phase.as_str()) {
            info!(phase = %status.phase, "Migration is paused");
            self.patch(&name, &original, &status).await?;
            return Ok(Action::requeue(PAUSE_INTERVAL));
        }

        let phase = status.phase;
        let step = match self.step(&snapshot, &mut status).await {
            Ok(step) => step,
            Err(Error::Step { phase, message }) => {
                warn!(%phase, %message, "Phase step failed");
                conditions::set(
                    &mut status.conditions,
                    phase.condition(),
                    false,
                    reasons::ERROR,
                    message.clone(),
                    &now,
                );
                self.patch(&name, &original, &status).await?;
                return Err(Error::Step { phase, message });
            }
            Err(error) => return Err(error),
        };

        if self.freeze_if_exceeded(&snapshot, &mut status, &now) {
            self.patch(&name, &original, &status).await?;
            return Ok(Action::await_change());
        }

        let action = match step {
            Step::Done(message) => {
                conditions::set(
                    &mut status.conditions,
                    phase.condition(),
                    true,
                    reasons::SUCCEEDED,
                    message,
                    &now,
                );
                match phase.next() {
                    Some(next) => {
                        info!(from = %phase, to = %next, "Advancing phase");
                        status.phase = next;
                        status.phase_transition_time = Some(now);
                        Action::requeue(STEP_INTERVAL)
                    }
                    None => {
                        info!("Migration succeeded");
                        Action::await_change()
                    }
                }
            }
            Step::Waiting(message) => {
                debug!(%phase, %message, "Waiting");
                conditions::set(
                    &mut status.conditions,
                    phase.condition(),
                    false,
                    reasons::IN_PROGRESS,
                    message,
                    &now,
                );
                Action::requeue(PROGRESS_INTERVAL)
            }
        };

        self.patch(&name, &original, &status).await?;
        Ok(action)
    }

    async fn step(
        &self,
        snapshot: &Snapshot<'_>,
        status: &mut CNIMigrationStatus,
    ) -> Result<Step, Error> {
        let phase = status.phase;
        let target = snapshot.migration.spec.target_cni;
        let current = snapshot.current;

        match phase {
            MigrationPhase::Preparing => {
                if target == current {
                    return Err(Error::step(
                        phase,
                        format!("target CNI {target} is the same as current CNI"),
                    ));
                }
                for webhook in &self.config.webhooks {
                    if let Some(blocking) = self.cluster.blocking_webhook(webhook).await? {
                        return Ok(Step::Waiting(blocking));
                    }
                }
                let created = self.register_nodes(snapshot).await?;
                Ok(Step::Done(format!(
                    "created {created} node states for {} nodes",
                    snapshot.nodes.len()
                )))
            }

            MigrationPhase::WaitingForAgents => {
                let created = self.register_nodes(snapshot).await?;
                if created > 0 {
                    return Ok(Step::Waiting(format!(
                        "registered {created} newly joined nodes"
                    )));
                }
                Ok(self.await_quorum(&quorum::PODS_ANNOTATED, snapshot, status))
            }

            MigrationPhase::EnablingTargetCNI => {
                self.toggle
                    .enable(target)
                    .await
                    .map_err(|e| Error::step(phase, format!("failed to enable {target}: {e}")))?;
                let readiness = self.readiness(phase, target).await?;
                if readiness.is_rolled_out() {
                    Ok(Step::Done(format!("{target} is rolled out")))
                } else {
                    Ok(Step::Waiting(format!("{target} is {readiness}")))
                }
            }

            MigrationPhase::DisablingCurrentCNI => {
                self.toggle
                    .disable(current)
                    .await
                    .map_err(|e| Error::step(phase, format!("failed to disable {current}: {e}")))?;
                let readiness = self.readiness(phase, current).await?;
                if readiness.is_absent() {
                    Ok(Step::Done(format!("{current} is removed")))
                } else {
                    Ok(Step::Waiting(format!("{current} is {readiness}")))
                }
            }

            MigrationPhase::CleaningNodes => {
                self.open_node_phase(snapshot, NodePhase::NodeCleaning).await?;
                Ok(self.await_quorum(&quorum::CLEANUP_DONE, snapshot, status))
            }

            MigrationPhase::WaitingTargetCNI => {
                let readiness = self.readiness(phase, target).await?;
                if readiness.is_ready() {
                    Ok(Step::Done(format!("{target} is ready")))
                } else {
                    Ok(Step::Waiting(format!("{target} is {readiness}")))
                }
            }

            MigrationPhase::RestartingPods => {
                self.open_node_phase(snapshot, NodePhase::RestartingPods).await?;
                let step = self.await_quorum(&quorum::PODS_RESTARTED, snapshot, status);
                if let Step::Waiting(_) = step {
                    return Ok(step);
                }
                for webhook in &self.config.webhooks {
                    if let Some(unready) = self.cluster.unready_webhook(webhook).await? {
                        return Ok(Step::Waiting(unready));
                    }
                }
                Ok(step)
            }

            MigrationPhase::Completed => Ok(Step::Done(format!(
                "migrated from {current} to {target}"
            ))),
        }
    }

    /// Recomputes the fleet counters and sets `Succeeded=False` if more nodes
    /// have failed than the policy tolerates. Returns true if the migration
    /// is now frozen.
    fn freeze_if_exceeded(
        &self,
        snapshot: &Snapshot<'_>,
        status: &mut CNIMigrationStatus,
        now: &Time,
    ) -> bool {
        let stats =
            NodeStats::compute(snapshot.migration, snapshot.nodes, snapshot.states, status);
        stats.apply(status);
        if !self.config.policy.is_exceeded(stats.failed, stats.total) {
            return false;
        }

        let message = format!(
            "{} of {} nodes failed, more than the tolerated ratio of {}",
            stats.failed, stats.total, self.config.policy.max_failed_ratio
        );
        warn!(phase = %status.phase, %message, "Freezing migration");
        conditions::set(
            &mut status.conditions,
            conditions::SUCCEEDED,
            false,
            reasons::FAILURE_THRESHOLD_EXCEEDED,
            message,
            now,
        );
        true
    }

    fn await_quorum(
        &self,
        gate: &Gate,
        snapshot: &Snapshot<'_>,
        status: &mut CNIMigrationStatus,
    ) -> Step {
        let progress = quorum::evaluate(
            gate,
            snapshot.migration,
            snapshot.nodes,
            snapshot.states,
            status,
            &self.config.policy,
            self.clock.now(),
        );
        let message = progress.message(gate);
        if progress.is_complete() {
            Step::Done(message)
        } else {
            Step::Waiting(message)
        }
    }

    async fn readiness(&self, phase: MigrationPhase, cni: Cni) -> Result<toggle::Readiness, Error> {
        self.toggle
            .readiness(cni)
            .await
            .map_err(|e| Error::step(phase, format!("failed to probe {cni}: {e}")))
    }

    /// Creates a node state for every live node that has none. Returns the
    /// number of node states created.
    async fn register_nodes(&self, snapshot: &Snapshot<'_>) -> Result<usize, Error> {
        let migration = snapshot.migration;
        let owner = migration
            .controller_owner_ref(&())
            .ok_or_else(|| Error::MissingUid(migration.name_any()))?;

        let mut created = 0;
        for node in snapshot.nodes {
            if let Some(existing) = snapshot.states.iter().find(|s| s.name_any() == *node) {
                if !existing.is_owned_by(migration) {
                    warn!(
                        %node,
                        owner = ?existing.migration_name(),
                        "Node state belongs to another migration; node is excluded"
                    );
                }
                continue;
            }
            let state = CNINodeMigration::for_node(node, owner.clone(), snapshot.current);
            self.cluster.create_node_migration(state).await?;
            created += 1;
        }
        Ok(created)
    }

    /// Lets the agents of every owned node state execute `phase`. Node states
    /// that are already open are not patched again.
    async fn open_node_phase(
        &self,
        snapshot: &Snapshot<'_>,
        phase: NodePhase,
    ) -> Result<(), Error> {
        let closed = snapshot
            .states
            .iter()
            .filter(|s| s.is_owned_by(snapshot.migration) && !s.is_allowed(phase));
        for state in closed {
            self.cluster.allow_node_phase(&state.name_any(), phase).await?;
        }
        Ok(())
    }

    async fn patch(
        &self,
        name: &str,
        original: &CNIMigrationStatus,
        status: &CNIMigrationStatus,
    ) -> Result<(), Error> {
        if original == status {
            return Ok(());
        }
        self.cluster.patch_migration_status(name, status).await?;
        Ok(())
    }
}
