//! Error types for cache operations.

/// Errors surfaced by cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Key is not present in the cache.
    #[error("entry not found")]
    NotFound,

    /// The byte arena cannot grow any further; the write was rejected.
    #[error("shard queue is full")]
    QueueFull,

    /// Queue index does not reference a live entry.
    #[error("index out of bounds")]
    OutOfBounds,

    /// The queue holds no live entries.
    #[error("queue is empty")]
    Empty,

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
