//! Error types for cluster operations.

/// Errors surfaced by the cluster node API.
///
/// Per-peer failures (handshake rejection, protocol violations, lost
/// connections) never reach this type; they are contained to the peer and
/// resolved by tearing its connection down.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Key absent locally and, where attempted, from every peer within the
    /// timeout.
    #[error("entry not found")]
    NotFound,

    /// Configuration failed validation at start.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The node has not been started yet.
    #[error("node is not started")]
    NotStarted,

    /// Local cache rejected the operation.
    #[error("cache error: {0}")]
    Cache(#[from] bytecache::CacheError),

    /// Listener or socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
