#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] anyhow::Error),

    /// The API server refused to evict a pod, typically because of a
    /// disruption budget. Retried without touching the node state.
    #[error("eviction of pod {pod} is blocked: {reason}")]
    EvictionBlocked { pod: String, reason: String },

    #[error("host cleanup failed: {0}")]
    Cleanup(String),

    #[error("CNINodeMigration {0} is not owned by a CNIMigration")]
    MissingOwner(String),

    #[error("CNINodeMigration {0} does not name the outgoing CNI")]
    MissingOutgoingCni(String),
}
