//! Drives a single node through its part of a network plugin migration.
//!
//! The agent runs on every node and only ever looks at the
//! `CNINodeMigration` named after its node and at the pods scheduled on it.
//! It advances eagerly through its local phases and reports progress solely
//! through the conditions on its own node state.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod agent;
pub mod cleanup;
mod controller;
mod error;
mod node;
pub mod pods;


pub use self::{
    agent::Agent,
    cleanup::{Cleanup, CleanupReport, HostCleanup},
    controller::{run, Context},
    error::Error,
    node::{Eviction, KubeNode, NodeApi},
};
pub use cni_migration_core as core;
pub use cni_migration_k8s_api as k8s;
