//! Document records flowing through the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::etag::Etag;

/// Metadata field carrying a document's logical collection name.
pub const COLLECTION_FIELD: &str = "collection";

/// A document as seen by the indexing pipeline.
///
/// Records are owned by whichever prefetch queue currently holds them
/// and move by value into worker batches; there is no shared mutable
/// document state across threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document key, unique within the database.
    pub key: String,

    /// Position marker assigned at the mutation that produced this
    /// version.
    pub etag: Etag,

    /// Opaque document body.
    pub payload: Value,

    /// Opaque document metadata (collection name, flags).
    pub metadata: Value,

    /// Serialized size used for batch byte accounting.
    pub size_bytes: usize,

    /// When this version was written.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,

    /// When set, a later delete of this document must not be replayed
    /// into indexes (the delete was already applied at write time).
    #[serde(default)]
    pub skip_delete_from_index: bool,
}

impl DocumentRecord {
    /// Create a record with size derived from the payload.
    pub fn new(key: impl Into<String>, etag: Etag, payload: Value, metadata: Value) -> Self {
        let key = key.into();
        let size_bytes = payload.to_string().len() + metadata.to_string().len() + key.len();
        Self {
            key,
            etag,
            payload,
            metadata,
            size_bytes,
            last_modified: Utc::now(),
            skip_delete_from_index: false,
        }
    }

    /// The logical collection this document belongs to, if tagged.
    pub fn entity_name(&self) -> Option<&str> {
        self.metadata.get(COLLECTION_FIELD).and_then(Value::as_str)
    }
}
