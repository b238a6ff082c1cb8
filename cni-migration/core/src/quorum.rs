//! Evaluates whether the node quorum has reached a condition.
//!
//! The quorum is every live node with a node state owned by the migration
//! that has not already been recorded as failed. A member that does not report
//! the condition before its budget expires is appended to the failed summary
//! and leaves the quorum for the rest of the migration.

use crate::{
    k8s::{conditions, CNIMigration, CNIMigrationStatus, CNINodeMigration, FailedNode, ResourceExt},
    FailurePolicy,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// A condition that every quorum member must report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Gate {
    pub condition: &'static str,
    pub timeout_reason: &'static str,
}

pub const PODS_ANNOTATED: Gate = Gate {
    condition: conditions::PODS_ANNOTATED,
    timeout_reason: "annotation timeout",
};

pub const CLEANUP_DONE: Gate = Gate {
    condition: conditions::CLEANUP_DONE,
    timeout_reason: "cleanup timeout",
};

pub const PODS_RESTARTED: Gate = Gate {
    condition: conditions::PODS_RESTARTED,
    timeout_reason: "restart timeout",
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub members: usize,
    pub ready: usize,
    pub pending: Vec<String>,
    pub expired: Vec<String>,
}

// === impl Progress ===

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn message(&self, gate: &Gate) -> String {
        let mut msg = format!(
            "{}/{} nodes report {}",
            self.ready, self.members, gate.condition
        );
        if !self.pending.is_empty() {
            const SHOWN: usize = 5;
            let shown = self.pending.iter().take(SHOWN).cloned().collect::<Vec<_>>();
            msg.push_str(&format!("; waiting for {}", shown.join(", ")));
            if self.pending.len() > SHOWN {
                msg.push_str(&format!(" and {} more", self.pending.len() - SHOWN));
            }
        }
        msg
    }
}

/// Evaluates `gate` over the quorum, recording members whose budget has
/// expired in `status.failed_summary`.
pub fn evaluate(
    gate: &Gate,
    migration: &CNIMigration,
    nodes: &BTreeSet<String>,
    states: &[CNINodeMigration],
    status: &mut CNIMigrationStatus,
    policy: &FailurePolicy,
    now: DateTime<Utc>,
) -> Progress {
    let phase_started = status.phase_transition_time.as_ref().map(|t| t.0);
    let mut progress = Progress::default();

    for state in states.iter().filter(|s| s.is_owned_by(migration)) {
        let name = state.name_any();
        if !nodes.contains(&name) || status.is_failed(&name) {
            continue;
        }
        progress.members += 1;

        if conditions::is_true(state.conditions(), gate.condition) {
            progress.ready += 1;
            continue;
        }

        let created = state.creation_timestamp().map(|t| t.0);
        let started = match (phase_started, created) {
            (Some(p), Some(c)) => Some(p.max(c)),
            (p, c) => p.or(c),
        };
        if started.is_some_and(|started| policy.is_expired(started, now)) {
            tracing::warn!(node = %name, condition = gate.condition, "Node exhausted its budget");
            status.failed_summary.push(FailedNode {
                node: name.clone(),
                reason: gate.timeout_reason.to_string(),
            });
            progress.expired.push(name);
        } else {
            progress.pending.push(name);
        }
    }

    progress.members -= progress.expired.len();
    progress
}
