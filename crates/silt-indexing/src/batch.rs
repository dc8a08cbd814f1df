//! Per-round, per-index document batches.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use silt_types::{DocumentRecord, Etag, IndexId};

/// One document plus the projection handed to the index computation.
#[derive(Debug, Clone)]
pub struct IndexingWork {
    /// The document record, moved by value out of the prefetch queue.
    pub doc: DocumentRecord,
    /// Precomputed projection: the payload with key and collection
    /// attached, so index computations never re-derive them.
    pub projection: Value,
}

impl IndexingWork {
    /// Build the work item for a document.
    pub fn new(doc: DocumentRecord) -> Self {
        let projection = json!({
            "key": doc.key,
            "collection": doc.entity_name(),
            "payload": doc.payload,
        });
        Self { doc, projection }
    }
}

/// A filtered batch bound for one index, built fresh per round and
/// discarded after the computation consumes it.
#[derive(Debug, Clone)]
pub struct IndexingBatch {
    /// Target index.
    pub index_id: IndexId,
    /// Work items, ascending by etag.
    pub work: Vec<IndexingWork>,
    /// Highest document marker in the round's fetch, advanced to even
    /// by indexes whose filter left nothing.
    pub highest_etag: Etag,
    /// Earliest modification timestamp in the batch.
    pub earliest_modified: Option<DateTime<Utc>>,
}

impl IndexingBatch {
    /// Build a batch from filtered documents.
    pub fn build(index_id: IndexId, docs: Vec<DocumentRecord>, highest_etag: Etag) -> Self {
        let earliest_modified = docs.iter().map(|d| d.last_modified).min();
        let work = docs.into_iter().map(IndexingWork::new).collect();
        Self {
            index_id,
            work,
            highest_etag,
            earliest_modified,
        }
    }

    /// Number of work items.
    pub fn len(&self) -> usize {
        self.work.len()
    }

    /// True when the filter left nothing.
    pub fn is_empty(&self) -> bool {
        self.work.is_empty()
    }

    /// Total payload bytes across the batch.
    pub fn total_bytes(&self) -> usize {
        self.work.iter().map(|w| w.doc.size_bytes).sum()
    }
}
