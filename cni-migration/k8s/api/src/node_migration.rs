use crate::{Cni, Condition, CNIMigration, OwnerReference, ResourceExt};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
#[error("unknown node phase: {0}")]
pub struct UnknownNodePhase(String);

/// Tracks the migration of a single node. The resource is named after the
/// node it describes and its status is written only by that node's agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "network.deckhouse.io",
    version = "v1alpha1",
    kind = "CNINodeMigration",
    status = "CNINodeMigrationStatus",
    shortname = "cninm",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
pub struct CNINodeMigrationSpec {}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNINodeMigrationStatus {
    #[serde(default)]
    pub phase: NodePhase,

    #[serde(default)]
    pub conditions: Vec<Condition>,
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
pub enum NodePhase {
    #[default]
    PodsAnnotating,
    NodeCleaning,
    RestartingPods,
    Completed,
}

// === impl CNINodeMigration ===

impl CNINodeMigration {
    /// Builds the node state for `node`, owned by `migration` so that it is
    /// garbage collected with it.
    pub fn for_node(node: &str, owner: OwnerReference, outgoing: Cni) -> Self {
        let mut state = Self::new(node, CNINodeMigrationSpec {});
        state.metadata.owner_references = Some(vec![owner]);
        state.metadata.annotations = Some(
            [(
                crate::OUTGOING_CNI_ANNOTATION.to_string(),
                outgoing.to_string(),
            )]
            .into_iter()
            .collect(),
        );
        state
    }

    /// The name of the `CNIMigration` that owns this node state.
    pub fn migration_name(&self) -> Option<&str> {
        self.owner_references()
            .iter()
            .find(|o| o.kind == "CNIMigration")
            .map(|o| o.name.as_str())
    }

    pub fn is_owned_by(&self, migration: &CNIMigration) -> bool {
        let Some(uid) = migration.metadata.uid.as_deref() else {
            return false;
        };
        self.owner_references().iter().any(|o| o.uid == uid)
    }

    /// The plugin whose host state the agent removes.
    pub fn outgoing_cni(&self) -> Option<Cni> {
        self.annotations()
            .get(crate::OUTGOING_CNI_ANNOTATION)
            .and_then(|v| v.parse().ok())
    }

    /// The furthest local phase the manager has opened for this node. Node
    /// states without a readable gate may only annotate pods.
    pub fn allowed_phase(&self) -> NodePhase {
        self.annotations()
            .get(crate::ALLOWED_NODE_PHASE_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Returns true if the agent may execute `phase`.
    pub fn is_allowed(&self, phase: NodePhase) -> bool {
        phase <= self.allowed_phase()
    }

    pub fn phase(&self) -> NodePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

// === impl NodePhase ===

impl NodePhase {
    pub const ALL: [NodePhase; 4] = [
        NodePhase::PodsAnnotating,
        NodePhase::NodeCleaning,
        NodePhase::RestartingPods,
        NodePhase::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PodsAnnotating => "PodsAnnotating",
            Self::NodeCleaning => "NodeCleaning",
            Self::RestartingPods => "RestartingPods",
            Self::Completed => "Completed",
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodePhase {
    type Err = UnknownNodePhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s.trim())
            .ok_or_else(|| UnknownNodePhase(s.to_string()))
    }
}
