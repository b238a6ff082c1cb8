//! Condition types and helpers shared by both migration resources.
//!
//! Conditions are the only channel through which the manager and the node
//! agents observe each other's progress.

use crate::{Condition, Time};

pub const ENVIRONMENT_PREPARED: &str = "EnvironmentPrepared";
pub const CURRENT_CNI_DETECTION_FAILED: &str = "CurrentCNIDetectionFailed";
pub const AGENTS_READY: &str = "AgentsReady";
pub const TARGET_CNI_ENABLED: &str = "TargetCNIEnabled";
pub const CURRENT_CNI_DISABLED: &str = "CurrentCNIDisabled";
pub const NODES_CLEANED: &str = "NodesCleaned";
pub const TARGET_CNI_READY: &str = "TargetCNIReady";
pub const PODS_RESTARTED: &str = "PodsRestarted";
pub const SUCCEEDED: &str = "Succeeded";

pub const PODS_ANNOTATED: &str = "PodsAnnotated";
pub const CLEANUP_DONE: &str = "CleanupDone";

pub mod reasons {
    pub const SUCCEEDED: &str = "Succeeded";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const ERROR: &str = "Error";
    pub const DETECTED: &str = "Detected";
    pub const DETECTION_FAILED: &str = "DetectionFailed";
    pub const FAILURE_THRESHOLD_EXCEEDED: &str = "FailureThresholdExceeded";
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
}

pub fn find<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Returns true if the condition is present with status `True`.
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == "True")
}

/// Returns true if the condition is present with status `False` and the
/// given reason.
pub fn is_false_with(conditions: &[Condition], type_: &str, reason: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == "False" && c.reason == reason)
}

/// Sets a condition, returning true if anything changed.
///
/// The transition time is preserved as long as the status and reason are
/// unchanged, so that progress messages do not reset it.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    now: &Time,
) -> bool {
    let status = if status { "True" } else { "False" };
    let message = message.into();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status == status && existing.reason == reason && existing.message == message {
            return false;
        }
        if existing.status != status || existing.reason != reason {
            existing.last_transition_time = now.clone();
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message;
        return true;
    }

    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: now.clone(),
        observed_generation: None,
    });
    true
}
