use anyhow::{bail, Context as _, Result};
use std::{
    io,
    path::{Path, PathBuf},
};

/// A liveness marker that exists for as long as the guard is held.
#[derive(Debug)]
pub struct HealthFile {
    path: PathBuf,
}

// === impl HealthFile ===

impl HealthFile {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, b"ok\n")
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Created health file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HealthFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed health file"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(), "Failed to remove health file")
            }
        }
    }
}

/// Succeeds if a running controller has written the health file.
pub fn check(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("health file {} does not exist", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_owns_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/healthy");
        assert!(check(&path).is_err());

        let guard = HealthFile::create(&path).unwrap();
        assert_eq!(guard.path(), path);
        check(&path).unwrap();

        drop(guard);
        assert!(!path.exists());
        assert!(check(&path).is_err());
    }

    #[test]
    fn removed_file_does_not_panic_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("healthy");
        let guard = HealthFile::create(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        drop(guard);
    }

    #[test]
    fn directory_is_not_healthy() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check(dir.path()).is_err());
    }
}
