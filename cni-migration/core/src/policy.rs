use chrono::{DateTime, Utc};
use std::time::Duration;

/// Bounds how long a single node may hold up a node-wait phase and how many
/// nodes may fail before the whole migration is frozen.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FailurePolicy {
    pub node_timeout: Duration,
    pub max_failed_ratio: f64,
}

// === impl FailurePolicy ===

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(15 * 60),
            max_failed_ratio: 0.1,
        }
    }
}

impl FailurePolicy {
    /// Returns true if a node that started waiting at `started` has run out
    /// of budget at `now`.
    pub fn is_expired(&self, started: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - started)
            .to_std()
            .is_ok_and(|elapsed| elapsed > self.node_timeout)
    }

    /// Returns true if `failed` out of `total` nodes is more than the fleet
    /// tolerates.
    pub fn is_exceeded(&self, failed: u32, total: u32) -> bool {
        if failed == 0 || total == 0 {
            return false;
        }
        f64::from(failed) / f64::from(total) > self.max_failed_ratio
    }
}
