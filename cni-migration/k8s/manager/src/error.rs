use crate::k8s::MigrationPhase;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transient failure talking to the API server. Retried with backoff
    /// and never reflected in a condition.
    #[error(transparent)]
    Api(#[from] anyhow::Error),

    /// The current phase's step failed. The phase's condition is set `False`
    /// with reason `Error` before this is returned.
    #[error("{phase}: {message}")]
    Step {
        phase: MigrationPhase,
        message: String,
    },

    #[error("CNIMigration {0} has no uid")]
    MissingUid(String),
}

// === impl Error ===

impl Error {
    pub(crate) fn step(phase: MigrationPhase, error: impl std::fmt::Display) -> Self {
        Self::Step {
            phase,
            message: error.to_string(),
        }
    }
}
