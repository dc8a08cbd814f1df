//! Prefetching error types.

use thiserror::Error;

use silt_storage::StorageError;

/// Errors that can occur while prefetching documents
#[derive(Error, Debug)]
pub enum PrefetchError {
    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Shutdown or explicit token cancellation; propagated unwrapped
    /// and never logged as an error.
    #[error("Prefetch cancelled")]
    Cancelled,

    /// A second behavior was flagged as the process default.
    #[error("A default prefetching behavior is already registered")]
    DefaultAlreadyRegistered,

    /// The behavior was disposed while a caller still held it.
    #[error("Prefetching behavior disposed")]
    Disposed,
}

impl PrefetchError {
    /// True for expected cancellation/disposal races.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PrefetchError::Cancelled | PrefetchError::Disposed)
            || matches!(self, PrefetchError::Storage(StorageError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_classification() {
        assert!(PrefetchError::Cancelled.is_cancellation());
        assert!(PrefetchError::Storage(StorageError::Cancelled).is_cancellation());
        assert!(!PrefetchError::DefaultAlreadyRegistered.is_cancellation());
    }
}
