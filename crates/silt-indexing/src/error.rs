//! Error types for the indexing executer.

use thiserror::Error;

use silt_pool::PoolError;
use silt_prefetch::PrefetchError;
use silt_storage::StorageError;
use silt_types::IndexId;

/// Errors that can occur in the indexing executer
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Prefetching failure
    #[error("Prefetch error: {0}")]
    Prefetch(#[from] PrefetchError),

    /// Worker pool failure
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Shutdown or explicit token cancellation; propagated unwrapped.
    #[error("Indexing cancelled")]
    Cancelled,

    /// Two indexes registered under the same id.
    #[error("Duplicate index id: {0}")]
    DuplicateIndex(IndexId),

    /// An unregistered index was referenced.
    #[error("Unknown index id: {0}")]
    UnknownIndex(IndexId),

    /// Persisted cursor update exhausted its write-conflict retries.
    #[error("Metadata update for {0} failed after {1} attempts")]
    MetadataRetriesExhausted(IndexId, u32),

    /// The dispatch bridge to the worker pool failed.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

impl IndexingError {
    /// True for expected cancellation, which is never logged as an
    /// error.
    pub fn is_cancellation(&self) -> bool {
        match self {
            IndexingError::Cancelled => true,
            IndexingError::Storage(StorageError::Cancelled) => true,
            IndexingError::Prefetch(err) => err.is_cancellation(),
            _ => false,
        }
    }
}
