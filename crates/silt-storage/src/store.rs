//! The storage collaborator interface.
//!
//! Every method executes as a single transactional batch on the
//! underlying engine: all reads and writes inside one call are atomic
//! from the caller's perspective.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use silt_types::{DocumentRecord, Etag, IndexId, IndexPriority};

use crate::error::StorageError;

/// Bounds for a [`DocumentStore::documents_after`] scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Maximum number of documents to return.
    pub max_count: usize,
    /// Maximum total serialized bytes to return.
    pub max_bytes: usize,
    /// Inclusive upper bound on returned etags, when the caller knows
    /// a later range is already being loaded elsewhere.
    pub until: Option<Etag>,
    /// Per-attempt timeout; on expiry the scan returns what it has.
    pub timeout: Duration,
}

impl ScanOptions {
    /// Scan options with the given count cap and no byte/until bounds.
    pub fn with_max_count(max_count: usize) -> Self {
        Self {
            max_count,
            max_bytes: usize::MAX,
            until: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a document scan.
///
/// A timeout is not an error: the scan returns the documents read so
/// far with `timed_out` set, and the caller schedules a follow-up.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Documents strictly after the requested marker, ascending.
    pub docs: Vec<DocumentRecord>,
    /// True when the scan reached the end of the document log.
    pub exhausted: bool,
    /// True when the scan stopped on its per-attempt timeout.
    pub timed_out: bool,
}

/// Transactional access to the durable document log and per-index
/// bookkeeping.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read documents strictly after `etag`, respecting every bound in
    /// `opts`. Must never return partially corrupted records.
    async fn documents_after(
        &self,
        etag: Etag,
        opts: ScanOptions,
        token: &CancellationToken,
    ) -> Result<ScanResult, StorageError>;

    /// Cheap lookup of the next real document marker after `etag`,
    /// without scanning document bodies.
    async fn best_next_etag(&self, etag: Etag) -> Result<Option<Etag>, StorageError>;

    /// The highest marker assigned to any document mutation so far.
    async fn last_document_etag(&self) -> Result<Etag, StorageError>;

    /// Monotone count of document mutations; staleness fingerprint
    /// input.
    async fn touch_count(&self) -> Result<u64, StorageError>;

    /// Persist an index's resume cursor. May fail with
    /// [`StorageError::WriteConflict`]; the caller retries.
    async fn update_last_indexed(
        &self,
        index_id: IndexId,
        etag: Etag,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Read an index's persisted resume cursor, if any.
    async fn last_indexed(
        &self,
        index_id: IndexId,
    ) -> Result<Option<(Etag, DateTime<Utc>)>, StorageError>;

    /// Persist an index's scheduling priority.
    async fn set_index_priority(
        &self,
        index_id: IndexId,
        priority: IndexPriority,
    ) -> Result<(), StorageError>;
}
