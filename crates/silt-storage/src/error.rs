//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Optimistic-concurrency clash on a metadata update; retryable.
    #[error("Write conflict on {key}")]
    WriteConflict {
        /// Metadata key that clashed.
        key: String,
    },

    /// The operation was cancelled by a shutdown or explicit token.
    #[error("Storage operation cancelled")]
    Cancelled,

    /// Unknown index referenced in a bookkeeping call.
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Underlying engine failure.
    #[error("Storage engine error: {0}")]
    Engine(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// True for errors the caller is expected to retry locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::WriteConflict { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_conflict_is_retryable() {
        let err = StorageError::WriteConflict {
            key: "index-1".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!StorageError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::IndexNotFound("index-9".to_string());
        assert_eq!(err.to_string(), "Index not found: index-9");
    }
}
