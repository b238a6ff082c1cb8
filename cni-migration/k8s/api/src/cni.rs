use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A network plugin that can be migrated from or to.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum Cni {
    Cilium,
    Flannel,
    SimpleBridge,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported CNI: {0}")]
pub struct UnknownCni(String);

// === impl Cni ===

impl Cni {
    pub const ALL: [Cni; 3] = [Cni::Cilium, Cni::Flannel, Cni::SimpleBridge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cilium => "cilium",
            Self::Flannel => "flannel",
            Self::SimpleBridge => "simple-bridge",
        }
    }

    /// The module that deploys this plugin.
    pub fn module_name(&self) -> String {
        format!("cni-{}", self.as_str())
    }

    /// The namespace the module deploys its workload into.
    pub fn namespace(&self) -> String {
        format!("d8-{}", self.module_name())
    }

    /// The DaemonSet that runs the plugin on every node.
    pub fn daemonset_name(&self) -> &'static str {
        match self {
            Self::Cilium => "agent",
            Self::Flannel => "flannel",
            Self::SimpleBridge => "simple-bridge",
        }
    }
}

impl fmt::Display for Cni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Cni {
    type Err = UnknownCni;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|cni| cni.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCni(s.to_string()))
    }
}
