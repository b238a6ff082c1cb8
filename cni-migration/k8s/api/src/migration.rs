use crate::{conditions, Cni, Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Describes a cluster-wide switch from the currently active network plugin
/// to `targetCNI`.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "network.deckhouse.io",
    version = "v1alpha1",
    kind = "CNIMigration",
    status = "CNIMigrationStatus",
    shortname = "cnim",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetCNI"}"#,
    printcolumn = r#"{"name":"Current","type":"string","jsonPath":".status.currentCNI"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Failed","type":"integer","jsonPath":".status.nodesFailed"}"#
)]
pub struct CNIMigrationSpec {
    #[serde(rename = "targetCNI")]
    pub target_cni: Cni,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNIMigrationStatus {
    /// Detected once and then frozen for the life of the migration.
    #[serde(
        rename = "currentCNI",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub current_cni: Option<Cni>,

    #[serde(default)]
    pub phase: MigrationPhase,

    /// When `phase` was entered. Node budgets are measured from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_transition_time: Option<Time>,

    #[serde(default)]
    pub nodes_total: u32,

    #[serde(default)]
    pub nodes_succeeded: u32,

    #[serde(default)]
    pub nodes_failed: u32,

    /// Append-only: one entry per node that exhausted its budget.
    #[serde(default)]
    pub failed_summary: Vec<FailedNode>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct FailedNode {
    pub node: String,
    pub reason: String,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub enum MigrationPhase {
    #[default]
    Preparing,
    WaitingForAgents,
    EnablingTargetCNI,
    DisablingCurrentCNI,
    CleaningNodes,
    WaitingTargetCNI,
    RestartingPods,
    Completed,
}

// === impl CNIMigration ===

impl CNIMigration {
    /// Returns the phase named by the pause annotation, if any.
    pub fn paused_before(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()?
            .get(crate::PAUSE_BEFORE_PHASE_ANNOTATION)
            .map(String::as_str)
    }
}

// === impl CNIMigrationStatus ===

impl CNIMigrationStatus {
    pub fn is_failed(&self, node: &str) -> bool {
        self.failed_summary.iter().any(|f| f.node == node)
    }

    /// True once the migration has either succeeded or frozen on too many
    /// node failures. Neither state is left by the controller.
    pub fn is_final(&self) -> bool {
        conditions::is_true(&self.conditions, conditions::SUCCEEDED)
            || conditions::is_false_with(
                &self.conditions,
                conditions::SUCCEEDED,
                conditions::reasons::FAILURE_THRESHOLD_EXCEEDED,
            )
    }
}

// === impl MigrationPhase ===

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "Preparing",
            Self::WaitingForAgents => "WaitingForAgents",
            Self::EnablingTargetCNI => "EnablingTargetCNI",
            Self::DisablingCurrentCNI => "DisablingCurrentCNI",
            Self::CleaningNodes => "CleaningNodes",
            Self::WaitingTargetCNI => "WaitingTargetCNI",
            Self::RestartingPods => "RestartingPods",
            Self::Completed => "Completed",
        }
    }

    /// The condition that is set `True` when this phase's step completes.
    pub fn condition(&self) -> &'static str {
        match self {
            Self::Preparing => conditions::ENVIRONMENT_PREPARED,
            Self::WaitingForAgents => conditions::AGENTS_READY,
            Self::EnablingTargetCNI => conditions::TARGET_CNI_ENABLED,
            Self::DisablingCurrentCNI => conditions::CURRENT_CNI_DISABLED,
            Self::CleaningNodes => conditions::NODES_CLEANED,
            Self::WaitingTargetCNI => conditions::TARGET_CNI_READY,
            Self::RestartingPods => conditions::PODS_RESTARTED,
            Self::Completed => conditions::SUCCEEDED,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Preparing => Some(Self::WaitingForAgents),
            Self::WaitingForAgents => Some(Self::EnablingTargetCNI),
            Self::EnablingTargetCNI => Some(Self::DisablingCurrentCNI),
            Self::DisablingCurrentCNI => Some(Self::CleaningNodes),
            Self::CleaningNodes => Some(Self::WaitingTargetCNI),
            Self::WaitingTargetCNI => Some(Self::RestartingPods),
            Self::RestartingPods => Some(Self::Completed),
            Self::Completed => None,
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
