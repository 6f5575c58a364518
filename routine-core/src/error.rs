//! Error types for local storage, remote calls and user mutations.

use std::time::Duration;

use thiserror::Error;

/// Result type for local store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for remote backend calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Result type for direct (user-initiated) mutations.
pub type MutationResult<T> = Result<T, MutationError>;

/// Errors raised by the local durable store.
///
/// Callers treat every variant as non-fatal: the operation failed and the
/// stored state is unchanged.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying storage cannot be opened or reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write transaction was aborted before it committed.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// The write would exceed the storage quota.
    #[error("storage quota exceeded ({used} of {limit} records)")]
    QuotaExceeded {
        /// Records that would be stored after the write.
        used: usize,
        /// Maximum records the store accepts.
        limit: usize,
    },

    /// The collection is not declared in the schema.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// The persisted schema is newer than the declared one.
    #[error("persisted schema version {persisted} is newer than declared version {declared}")]
    VersionDowngrade {
        /// Version found on disk.
        persisted: u32,
        /// Version declared by the running code.
        declared: u32,
    },

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the remote data backend.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport failure, including "currently offline".
    #[error("network error: {0}")]
    Network(String),

    /// The call did not finish within its window.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend refused the request (validation and similar).
    #[error("backend rejected request ({status}): {message}")]
    Rejected {
        /// Status code reported by the backend.
        status: u16,
        /// Message reported by the backend.
        message: String,
    },

    /// Missing or expired credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The addressed record does not exist remotely.
    #[error("remote record not found: {0}")]
    NotFound(String),

    /// The backend answered with a payload we cannot read.
    #[error("failed to decode backend response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Returns true if the failure is transient and worth retrying later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// Shorthand used when a remote path is chosen while disconnected.
    #[must_use]
    pub fn offline() -> Self {
        Self::Network("client is offline".to_string())
    }
}

/// Errors surfaced to the UI by a direct mutation.
///
/// When one of these is returned the optimistic local state has not been
/// committed.
#[derive(Debug, Error)]
pub enum MutationError {
    /// Local store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Remote backend failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The record does not exist locally.
    #[error("record {id} not found in {collection}")]
    NotFound {
        /// Collection that was searched.
        collection: String,
        /// Requested record id.
        id: String,
    },

    /// The operation does not apply to the record or collection.
    #[error("invalid operation: {0}")]
    InvalidState(String),
}

impl MutationError {
    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_remote_errors() {
        assert!(RemoteError::offline().is_retryable());
        assert!(RemoteError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RemoteError::NotFound("x".into()).is_retryable());
        assert!(!RemoteError::Rejected {
            status: 422,
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_mutation_error_wraps_sources() {
        let err: MutationError = StorageError::Aborted("quota".into()).into();
        assert!(matches!(err, MutationError::Storage(_)));
        assert_eq!(err.to_string(), "transaction aborted: quota");

        let err = MutationError::not_found("tasks", "t1");
        assert_eq!(err.to_string(), "record t1 not found in tasks");
    }
}
