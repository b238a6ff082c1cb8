use crate::k8s::{CNIMigration, CNIMigrationStatus, CNINodeMigration, NodePhase, ResourceExt};
use std::collections::BTreeSet;

/// Fleet counters derived from the live set of nodes and node states.
///
/// Counters are never incremented in place: every reconciliation recomputes
/// them from scratch so that they cannot drift.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
}

// === impl NodeStats ===

impl NodeStats {
    pub fn compute(
        migration: &CNIMigration,
        nodes: &BTreeSet<String>,
        states: &[CNINodeMigration],
        status: &CNIMigrationStatus,
    ) -> Self {
        let succeeded = states
            .iter()
            .filter(|s| s.is_owned_by(migration))
            .filter(|s| {
                let name = s.name_any();
                nodes.contains(&name) && !status.is_failed(&name)
            })
            .filter(|s| s.phase() == NodePhase::Completed)
            .count();

        let failed = status
            .failed_summary
            .iter()
            .map(|f| f.node.as_str())
            .collect::<BTreeSet<_>>();

        // Failed nodes that have since left the cluster still count toward
        // the total, so `failed <= total` always holds.
        let departed = failed
            .iter()
            .filter(|node| !nodes.contains(**node))
            .count();

        Self {
            total: count(nodes.len() + departed),
            succeeded: count(succeeded),
            failed: count(failed.len()),
        }
    }

    pub fn apply(&self, status: &mut CNIMigrationStatus) {
        status.nodes_total = self.total;
        status.nodes_succeeded = self.succeeded;
        status.nodes_failed = self.failed;
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
