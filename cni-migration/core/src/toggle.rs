use crate::k8s::Cni;
use anyhow::{bail, Result};
use std::fmt;

/// Turns network plugin modules on and off and reports how far their
/// workloads have rolled out.
///
/// Implementations must be idempotent and must bound every call in time; a
/// readiness probe reports the current state rather than waiting for a
/// better one.
#[async_trait::async_trait]
pub trait ModuleToggle: Send + Sync {
    async fn is_enabled(&self, cni: Cni) -> Result<bool>;

    async fn enable(&self, cni: Cni) -> Result<()>;

    async fn disable(&self, cni: Cni) -> Result<()>;

    async fn readiness(&self, cni: Cni) -> Result<Readiness>;
}

/// The observed state of a plugin's node workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The workload does not exist.
    Absent,
    /// The workload exists but has not reached every node yet.
    Progressing(String),
    /// A pod has been created and scheduled on every desired node.
    RolledOut,
    /// Every desired pod reports ready.
    Ready,
}

// === impl Readiness ===

impl Readiness {
    pub fn is_rolled_out(&self) -> bool {
        matches!(self, Self::RolledOut | Self::Ready)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::Progressing(msg) => write!(f, "progressing: {msg}"),
            Self::RolledOut => f.write_str("rolled out"),
            Self::Ready => f.write_str("ready"),
        }
    }
}

/// Determines which plugin is currently active by asking about every known
/// plugin. Exactly one must be enabled.
pub async fn detect_current<T>(toggle: &T) -> Result<Cni>
where
    T: ModuleToggle + ?Sized,
{
    let mut enabled = Vec::new();
    for cni in Cni::ALL {
        match toggle.is_enabled(cni).await {
            Ok(true) => enabled.push(cni),
            Ok(false) => {}
            Err(error) => {
                tracing::debug!(%cni, %error, "Skipping module that could not be inspected");
            }
        }
    }

    match enabled.as_slice() {
        [] => bail!("could not detect any enabled CNI module"),
        [cni] => Ok(*cni),
        many => {
            let names = many.iter().map(Cni::as_str).collect::<Vec<_>>();
            bail!("multiple CNI modules are enabled: {}", names.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::BTreeMap;

    struct Fixed(BTreeMap<Cni, Result<bool, &'static str>>);

    #[async_trait::async_trait]
    impl ModuleToggle for Fixed {
        async fn is_enabled(&self, cni: Cni) -> Result<bool> {
            match self.0.get(&cni) {
                Some(Ok(enabled)) => Ok(*enabled),
                Some(Err(msg)) => Err(anyhow!(*msg)),
                None => Ok(false),
            }
        }

        async fn enable(&self, _: Cni) -> Result<()> {
            unimplemented!()
        }

        async fn disable(&self, _: Cni) -> Result<()> {
            unimplemented!()
        }

        async fn readiness(&self, _: Cni) -> Result<Readiness> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn detects_single_enabled_module() {
        let toggle = Fixed(maplit::btreemap! {
            Cni::Flannel => Ok(true),
            Cni::Cilium => Err("timed out"),
        });
        assert_eq!(detect_current(&toggle).await.unwrap(), Cni::Flannel);
    }

    #[tokio::test]
    async fn no_enabled_module_is_an_error() {
        let toggle = Fixed(BTreeMap::new());
        let error = detect_current(&toggle).await.unwrap_err();
        assert_eq!(error.to_string(), "could not detect any enabled CNI module");
    }

    #[tokio::test]
    async fn several_enabled_modules_is_an_error() {
        let toggle = Fixed(maplit::btreemap! {
            Cni::Flannel => Ok(true),
            Cni::Cilium => Ok(true),
        });
        let error = detect_current(&toggle).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "multiple CNI modules are enabled: cilium, flannel"
        );
    }

    #[test]
    fn readiness_gates() {
        assert!(Readiness::Ready.is_rolled_out());
        assert!(Readiness::RolledOut.is_rolled_out());
        assert!(!Readiness::RolledOut.is_ready());
        assert!(!Readiness::Progressing("1/3 scheduled".into()).is_rolled_out());
        assert!(Readiness::Absent.is_absent());
    }
}
