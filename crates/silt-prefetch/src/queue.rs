//! Etag-sorted prefetch queue.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use silt_types::{DocumentRecord, Etag};

/// Documents loaded ahead of indexing demand, sorted by etag.
///
/// Not internally synchronized; the owning behavior wraps it in a
/// read/write lock and takes the write half only around mutation.
#[derive(Default)]
pub struct PrefetchQueue {
    docs: BTreeMap<Etag, DocumentRecord>,
    bytes: usize,
}

impl PrefetchQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document; a record already queued under the same etag
    /// is a duplicate and the insert is discarded.
    ///
    /// Returns true when the document was queued.
    pub fn insert(&mut self, doc: DocumentRecord) -> bool {
        if self.docs.contains_key(&doc.etag) {
            return false;
        }
        self.bytes += doc.size_bytes;
        self.docs.insert(doc.etag, doc);
        true
    }

    /// Lowest queued etag.
    pub fn first_etag(&self) -> Option<Etag> {
        self.docs.keys().next().copied()
    }

    /// Highest queued etag.
    pub fn last_etag(&self) -> Option<Etag> {
        self.docs.keys().next_back().copied()
    }

    /// O(log n) existence check.
    pub fn contains(&self, etag: Etag) -> bool {
        self.docs.contains_key(&etag)
    }

    /// Remove and return the lowest-etag document.
    pub fn pop_first(&mut self) -> Option<DocumentRecord> {
        let (_, doc) = self.docs.pop_first()?;
        self.bytes -= doc.size_bytes;
        Some(doc)
    }

    /// Remove every document with an etag strictly after `etag`.
    ///
    /// Returns the number of documents removed.
    pub fn remove_after(&mut self, etag: Etag) -> usize {
        // split_off moves every entry with key >= etag out; the
        // boundary entry itself stays queued.
        let mut tail = self.docs.split_off(&etag);
        if let Some(boundary) = tail.remove(&etag) {
            self.docs.insert(etag, boundary);
        }
        for doc in tail.values() {
            self.bytes -= doc.size_bytes;
        }
        tail.len()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.docs.clear();
        self.bytes = 0;
    }

    /// Queued document count.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Running total of queued document sizes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Lowest queued etag strictly after `etag`.
    pub fn first_etag_after(&self, etag: Etag) -> Option<Etag> {
        self.docs
            .range((Excluded(etag), Unbounded))
            .next()
            .map(|(&e, _)| e)
    }
}
