#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use cni_migration_core as core;
pub use cni_migration_k8s_agent as agent;
pub use cni_migration_k8s_api as k8s;
pub use cni_migration_k8s_manager as manager;

mod args;
mod health;
mod lease;
mod modules;

pub use self::{args::Args, health::HealthFile, modules::ModuleConfigToggle};
