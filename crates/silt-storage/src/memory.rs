//! In-memory document store.
//!
//! Backs the e2e harness and unit tests. Documents live in an
//! etag-ordered map; writes and deletes both consume markers, so the
//! etag sequence has gaps exactly like the durable engine's.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use silt_types::{DocumentRecord, Etag, IndexId, IndexPriority};

use crate::error::StorageError;
use crate::store::{DocumentStore, ScanOptions, ScanResult};

#[derive(Debug, Clone)]
struct IndexMeta {
    last_indexed: Etag,
    at: DateTime<Utc>,
    priority: IndexPriority,
}

#[derive(Default)]
struct Inner {
    docs_by_etag: BTreeMap<Etag, DocumentRecord>,
    etag_by_key: HashMap<String, Etag>,
    last_etag: Etag,
    touch_count: u64,
    index_meta: HashMap<IndexId, IndexMeta>,
}

/// In-memory [`DocumentStore`] implementation.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// Pending write conflicts to inject into metadata updates.
    conflicts_to_inject: AtomicU32,
    /// Artificial latency per scan, for timeout and stall tests.
    scan_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    /// Create an empty store in generation `restarts`.
    pub fn new(restarts: u64) -> Self {
        let inner = Inner {
            last_etag: Etag::new(restarts, 0),
            ..Inner::default()
        };
        Self {
            inner: RwLock::new(inner),
            conflicts_to_inject: AtomicU32::new(0),
            scan_delay: Mutex::new(None),
        }
    }

    /// Write a document version, superseding any prior version of the
    /// same key, and return the stored record.
    ///
    /// The caller is responsible for forwarding the record to the
    /// prefetcher's after-commit hook.
    pub fn put(&self, key: impl Into<String>, payload: Value, metadata: Value) -> DocumentRecord {
        let key = key.into();
        let mut inner = self.inner.write();
        let etag = inner.last_etag.next();
        inner.last_etag = etag;
        inner.touch_count += 1;

        if let Some(old) = inner.etag_by_key.insert(key.clone(), etag) {
            inner.docs_by_etag.remove(&old);
        }

        let doc = DocumentRecord::new(key, etag, payload, metadata);
        inner.docs_by_etag.insert(etag, doc.clone());
        doc
    }

    /// Delete a document. The tombstone consumes a marker of its own;
    /// returns it so the caller can notify deletion trackers.
    pub fn delete(&self, key: &str) -> Option<Etag> {
        let mut inner = self.inner.write();
        let doc_etag = inner.etag_by_key.remove(key)?;
        inner.docs_by_etag.remove(&doc_etag);
        let deletion_etag = inner.last_etag.next();
        inner.last_etag = deletion_etag;
        inner.touch_count += 1;
        debug!(key = key, etag = %deletion_etag, "Document deleted");
        Some(deletion_etag)
    }

    /// Number of live documents.
    pub fn doc_count(&self) -> usize {
        self.inner.read().docs_by_etag.len()
    }

    /// Make the next `n` metadata updates fail with a write conflict.
    pub fn inject_write_conflicts(&self, n: u32) {
        self.conflicts_to_inject.store(n, Ordering::SeqCst);
    }

    /// Delay every scan by `delay`, simulating a slow disk.
    pub fn set_scan_delay(&self, delay: Option<Duration>) {
        *self.scan_delay.lock() = delay;
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn documents_after(
        &self,
        etag: Etag,
        opts: ScanOptions,
        token: &CancellationToken,
    ) -> Result<ScanResult, StorageError> {
        let delay = *self.scan_delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay.min(opts.timeout)) => {}
                _ = token.cancelled() => return Err(StorageError::Cancelled),
            }
            if delay >= opts.timeout {
                // The simulated disk did not answer inside the attempt
                // budget; report an early exit with nothing read.
                return Ok(ScanResult {
                    docs: Vec::new(),
                    exhausted: false,
                    timed_out: true,
                });
            }
        }
        if token.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let inner = self.inner.read();
        let mut docs = Vec::new();
        let mut bytes = 0usize;
        let mut exhausted = true;

        for (&doc_etag, doc) in inner.docs_by_etag.range((Excluded(etag), Unbounded)) {
            if let Some(until) = opts.until {
                if doc_etag > until {
                    break;
                }
            }
            if docs.len() >= opts.max_count || bytes.saturating_add(doc.size_bytes) > opts.max_bytes
            {
                exhausted = false;
                break;
            }
            bytes += doc.size_bytes;
            docs.push(doc.clone());
        }

        Ok(ScanResult {
            docs,
            exhausted,
            timed_out: false,
        })
    }

    async fn best_next_etag(&self, etag: Etag) -> Result<Option<Etag>, StorageError> {
        let inner = self.inner.read();
        Ok(inner
            .docs_by_etag
            .range((Excluded(etag), Unbounded))
            .next()
            .map(|(&e, _)| e))
    }

    async fn last_document_etag(&self) -> Result<Etag, StorageError> {
        Ok(self.inner.read().last_etag)
    }

    async fn touch_count(&self) -> Result<u64, StorageError> {
        Ok(self.inner.read().touch_count)
    }

    async fn update_last_indexed(
        &self,
        index_id: IndexId,
        etag: Etag,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if self.conflicts_to_inject.load(Ordering::SeqCst) > 0 {
            self.conflicts_to_inject.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::WriteConflict {
                key: index_id.to_string(),
            });
        }
        let mut inner = self.inner.write();
        let meta = inner.index_meta.entry(index_id).or_insert(IndexMeta {
            last_indexed: Etag::zero(),
            at,
            priority: IndexPriority::Normal,
        });
        meta.last_indexed = etag;
        meta.at = at;
        Ok(())
    }

    async fn last_indexed(
        &self,
        index_id: IndexId,
    ) -> Result<Option<(Etag, DateTime<Utc>)>, StorageError> {
        let inner = self.inner.read();
        Ok(inner
            .index_meta
            .get(&index_id)
            .map(|m| (m.last_indexed, m.at)))
    }

    async fn set_index_priority(
        &self,
        index_id: IndexId,
        priority: IndexPriority,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let meta = inner.index_meta.entry(index_id).or_insert(IndexMeta {
            last_indexed: Etag::zero(),
            at: now,
            priority: IndexPriority::Normal,
        });
        meta.priority = priority;
        Ok(())
    }
}
