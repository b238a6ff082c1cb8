//! Removes the host state left behind by the outgoing network plugin.
//!
//! Everything is idempotent: artifacts that are already gone count as
//! removed, so a cleanup interrupted by a restart can simply be run again.

use crate::k8s::Cni;
use anyhow::{bail, Context as _, Result};
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{fs, process::Command};

const CNI_CONFIG_DIR: &str = "etc/cni/net.d";
const CNI_CONFIG_EXTENSIONS: [&str; 3] = ["conf", "conflist", "json"];

#[async_trait::async_trait]
pub trait Cleanup: Send + Sync {
    async fn run(&self, cni: Cni) -> Result<CleanupReport>;
}

/// Deletes host network links.
#[async_trait::async_trait]
pub trait Links: Send + Sync {
    /// Deletes the named link, returning false if it does not exist.
    async fn delete(&self, name: &str) -> Result<bool>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub configs: Vec<PathBuf>,
    pub state_dirs: Vec<PathBuf>,
    pub links: Vec<String>,
}

/// Cleans up a host whose root filesystem is mounted at `root`.
#[derive(Clone, Debug)]
pub struct HostCleanup<L = IpLinks> {
    root: PathBuf,
    links: L,
}

/// Deletes links with `ip link delete`.
#[derive(Copy, Clone, Debug, Default)]
pub struct IpLinks;

/// The artifacts a plugin leaves on a node.
struct Artifacts {
    config_markers: &'static [&'static str],
    state_dirs: &'static [&'static str],
    links: &'static [&'static str],
}

fn artifacts(cni: Cni) -> Artifacts {
    match cni {
        Cni::Flannel => Artifacts {
            config_markers: &["flannel"],
            state_dirs: &["run/flannel", "var/lib/cni/networks/cbr0"],
            links: &["flannel.1", "cni0"],
        },
        Cni::Cilium => Artifacts {
            config_markers: &["cilium"],
            state_dirs: &["var/run/cilium/state", "var/lib/cni/networks/cilium"],
            links: &["cilium_host", "cilium_net", "cilium_vxlan"],
        },
        Cni::SimpleBridge => Artifacts {
            config_markers: &["simple-bridge", "bridge"],
            state_dirs: &["var/lib/cni/networks/simple-bridge"],
            links: &["cni0"],
        },
    }
}

// === impl CleanupReport ===

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removed {} config files, {} state directories and {} links",
            self.configs.len(),
            self.state_dirs.len(),
            self.links.len()
        )
    }
}

// === impl HostCleanup ===

impl HostCleanup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_links(root, IpLinks)
    }
}

impl<L: Links> HostCleanup<L> {
    pub fn with_links(root: impl Into<PathBuf>, links: L) -> Self {
        Self {
            root: root.into(),
            links,
        }
    }

    async fn remove_configs(&self, markers: &[&str]) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(CNI_CONFIG_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read {}", dir.display()))
            }
        };

        let mut removed = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_plugin_config(&path, markers) {
                continue;
            }
            if remove(fs::remove_file(&path).await, &path)? {
                removed.push(path);
            }
        }
        removed.sort();
        Ok(removed)
    }

    async fn remove_state_dirs(&self, dirs: &[&str]) -> Result<Vec<PathBuf>> {
        let mut removed = vec![];
        for dir in dirs {
            let path = self.root.join(dir);
            if remove(fs::remove_dir_all(&path).await, &path)? {
                removed.push(path);
            }
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl<L: Links> Cleanup for HostCleanup<L> {
    async fn run(&self, cni: Cni) -> Result<CleanupReport> {
        let artifacts = artifacts(cni);
        let configs = self.remove_configs(artifacts.config_markers).await?;
        let state_dirs = self.remove_state_dirs(artifacts.state_dirs).await?;

        let mut links = vec![];
        for link in artifacts.links {
            if self.links.delete(link).await? {
                links.push(link.to_string());
            }
        }

        let report = CleanupReport {
            configs,
            state_dirs,
            links,
        };
        tracing::info!(%cni, ?report, "Cleaned up host");
        Ok(report)
    }
}

// === impl IpLinks ===

#[async_trait::async_trait]
impl Links for IpLinks {
    async fn delete(&self, name: &str) -> Result<bool> {
        let output = Command::new("ip")
            .args(["link", "delete", name])
            .output()
            .await
            .context("failed to run ip")?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Cannot find device") {
            return Ok(false);
        }
        bail!("failed to delete link {name}: {}", stderr.trim())
    }
}

fn is_plugin_config(path: &Path, markers: &[&str]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let has_config_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CNI_CONFIG_EXTENSIONS.contains(&ext));
    has_config_ext && markers.iter().any(|m| name.contains(m))
}

/// Maps a removal result, treating a missing path as nothing to do.
fn remove(res: io::Result<()>, path: &Path) -> Result<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error).with_context(|| format!("failed to remove {}", path.display())),
    }
}
