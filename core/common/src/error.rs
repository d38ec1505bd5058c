//! Common error types for minutesync.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for minutesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote is unreachable or a transport-level failure occurred.
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials were rejected by the remote.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Credentials were accepted but the operation is not allowed.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The remote rejected the request as malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The remote asked us to slow down.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// No rate limiter slot freed up within the allowed wait.
    #[error("Rate limit wait exceeded {0:?}")]
    RateLimitTimeout(Duration),

    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A conflict could not be resolved for an item.
    #[error("Conflict resolution failed: {0}")]
    ConflictResolution(String),

    /// Persisted state failed validation. Recovered internally, never surfaced by the store.
    #[error("State corruption: {0}")]
    StateCorruption(String),

    /// A transaction is already open.
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// The sync request queue is at capacity.
    #[error("Sync queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// A sync is already running on this engine.
    #[error("Sync already in progress")]
    SyncInProgress,

    /// The operation was cancelled.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether a failed remote call is worth retrying.
    ///
    /// Authentication, authorization and validation failures will not change on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Io(_) | Error::RateLimited(_) | Error::RateLimitTimeout(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("down".into()).is_transient());
        assert!(Error::RateLimited("429".into()).is_transient());
        assert!(Error::RateLimitTimeout(Duration::from_secs(1)).is_transient());

        assert!(!Error::Authentication("expired".into()).is_transient());
        assert!(!Error::PermissionDenied("nope".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
        assert!(!Error::NotFound("gone".into()).is_transient());
    }

    #[test]
    fn test_queue_full_message() {
        let err = Error::QueueFull { capacity: 10 };
        assert_eq!(err.to_string(), "Sync queue is full (capacity 10)");
    }
}
