//! The index execution collaborator interface.
//!
//! The pipeline treats index computation as opaque: an [`Index`]
//! accepts a filtered batch of documents and returns performance
//! stats, or fails with one of three signals the executer reacts to
//! very differently (corruption and out-of-memory disable the index,
//! generic failures are retried up to a threshold).

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use silt_types::IndexId;

use crate::batch::IndexingBatch;

/// Failure signals an index computation may raise.
#[derive(Error, Debug, Clone)]
pub enum IndexExecutionError {
    /// The index's persisted state is corrupt; disable immediately,
    /// never retry.
    #[error("Index corrupted: {0}")]
    Corruption(String),

    /// Index computation ran out of memory; disable and alert, no
    /// retry.
    #[error("Out of memory while indexing: {0}")]
    OutOfMemory(String),

    /// Generic computation failure; retried on the next round until
    /// the consecutive-failure threshold.
    #[error("Index computation failed: {0}")]
    Failed(String),
}

/// Statistics returned by a successful index computation.
#[derive(Debug, Clone, Default)]
pub struct PerformanceStats {
    /// Documents the computation actually indexed.
    pub items_indexed: usize,
    /// Bytes of document payload processed.
    pub bytes_indexed: usize,
    /// Wall-clock duration of the computation.
    pub duration: Duration,
}

/// Context handed to every index computation.
pub struct IndexingContext {
    /// Cancellation token linked to process shutdown; long
    /// computations should poll it.
    pub token: CancellationToken,
}

/// An opaque index instance.
pub trait Index: Send + Sync {
    /// Stable identifier, also the key of the persisted cursor.
    fn id(&self) -> IndexId;

    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Entity-name restriction: `None` indexes every collection, a set
    /// restricts applicability to documents tagged with those names.
    fn entity_names(&self) -> Option<&HashSet<String>> {
        None
    }

    /// Compute and persist index entries for a filtered batch.
    fn execute(
        &self,
        batch: &IndexingBatch,
        ctx: &IndexingContext,
    ) -> Result<PerformanceStats, IndexExecutionError>;
}

/// True when the document's collection passes the index's entity-name
/// restriction.
pub fn matches_entity_filter(index: &dyn Index, entity_name: Option<&str>) -> bool {
    match index.entity_names() {
        None => true,
        Some(names) => entity_name.is_some_and(|name| names.contains(name)),
    }
}
