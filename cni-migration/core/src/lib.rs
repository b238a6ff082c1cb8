#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backoff;
mod clock;
mod metrics;
pub mod policy;
pub mod quorum;
mod stats;
pub mod toggle;

pub use self::{
    backoff::Backoff,
    clock::{Clock, SystemClock},
    metrics::ControllerMetrics,
    policy::FailurePolicy,
    stats::NodeStats,
    toggle::{ModuleToggle, Readiness},
};
pub use cni_migration_k8s_api as k8s;

/// Field manager used for every write made by the migration controllers.
pub const FIELD_MANAGER: &str = "cni-migration-controller";
