//! Drives a cluster through a network plugin migration.
//!
//! A single active manager owns one `CNIMigration`. It fans out one
//! `CNINodeMigration` per node, toggles plugin modules between phases, and
//! advances the cluster phase once the node quorum reports each per-node
//! condition. Node agents are never contacted directly.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster;
mod controller;
mod error;
mod migrator;


pub use self::{
    cluster::{ClusterApi, KubeCluster},
    controller::{run, Context},
    error::Error,
    migrator::{Config, Migrator},
};
pub use cni_migration_core as core;
pub use cni_migration_k8s_api as k8s;
