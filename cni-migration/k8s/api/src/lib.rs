#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cni;
pub mod conditions;
pub mod migration;
pub mod node_migration;

pub use self::{
    cni::Cni,
    migration::{CNIMigration, CNIMigrationSpec, CNIMigrationStatus, FailedNode, MigrationPhase},
    node_migration::{CNINodeMigration, CNINodeMigrationSpec, CNINodeMigrationStatus, NodePhase},
};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::DaemonSet,
        core::v1::{Node, Pod, PodSpec, PodStatus, Service},
    },
    apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference, Time},
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    runtime::watcher,
    Client, Error, Resource,
};

/// The API group shared by both migration resources.
pub const GROUP: &str = "network.deckhouse.io";

/// Marks every pod that the node agent will restart once the target CNI is
/// ready. The value is the name of the owning `CNIMigration`.
pub const MIGRATION_MARKER_ANNOTATION: &str = "network.deckhouse.io/cni-migration";

/// Set by the manager on each `CNINodeMigration` so the agent knows which
/// plugin's host state to remove without reading the parent object.
pub const OUTGOING_CNI_ANNOTATION: &str = "network.deckhouse.io/outgoing-cni";

/// Set by the manager on each `CNINodeMigration` to the furthest local phase
/// the agent may execute. Host cleanup and pod restarts wait on it.
pub const ALLOWED_NODE_PHASE_ANNOTATION: &str = "network.deckhouse.io/allowed-node-phase";

/// Pauses the cluster phase engine before the named phase executes.
pub const PAUSE_BEFORE_PHASE_ANNOTATION: &str =
    "cni-migration.network.deckhouse.io/pause-before-phase";

/// Returns true if the error is an API `NotFound` response.
pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Api(response) if response.code == 404)
}

/// Returns true if the error is an API `AlreadyExists` response.
pub fn is_conflict(error: &Error) -> bool {
    matches!(error, Error::Api(response) if response.code == 409)
}

/// Returns true if the API server refused the request because it would
/// violate a disruption budget (or is otherwise throttled).
pub fn is_too_many_requests(error: &Error) -> bool {
    matches!(error, Error::Api(response) if response.code == 429)
}
