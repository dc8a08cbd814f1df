//! Speculative background document loads.
//!
//! A future batch is a tokio task reading the next run of documents
//! from storage while the current run is being indexed. Batches live
//! in a table keyed by the first etag they cover; they are removed
//! when consumed, cancelled, or aged out after a configured number of
//! indexing rounds without use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use silt_types::{DocumentRecord, Etag};

use crate::error::PrefetchError;
use crate::tuner::MemoryAccounting;

/// Classification of a future batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Ordinary speculative load.
    Normal,
    /// One leg of a stall-induced parallel split.
    Split,
    /// Follow-up covering the remainder of an early-exited load.
    EarlyExit,
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchKind::Normal => write!(f, "normal"),
            BatchKind::Split => write!(f, "split"),
            BatchKind::EarlyExit => write!(f, "early-exit"),
        }
    }
}

/// Result of a completed background load.
#[derive(Debug, Default)]
pub struct CompletedLoad {
    /// Loaded documents, ascending by etag.
    pub docs: Vec<DocumentRecord>,
    /// True when the load stopped on its per-attempt timeout.
    pub timed_out: bool,
    /// True when the load reached the end of the document log.
    pub exhausted: bool,
}

/// One speculative load in flight (or finished, awaiting consumption).
pub struct FutureBatch {
    /// Exclusive lower bound of the covered range.
    after: Etag,
    /// Inclusive upper bound, when known ahead of time.
    until: Option<Etag>,
    kind: BatchKind,
    estimated_docs: usize,
    estimated_bytes: usize,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<Result<CompletedLoad, PrefetchError>>>>,
    age_rounds: AtomicU64,
}

impl FutureBatch {
    /// Create a batch covering documents strictly after `after`.
    ///
    /// The task handle is attached separately with [`set_handle`]
    /// once the load has been spawned.
    ///
    /// [`set_handle`]: FutureBatch::set_handle
    pub fn new(
        after: Etag,
        until: Option<Etag>,
        kind: BatchKind,
        estimated_docs: usize,
        estimated_bytes: usize,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            after,
            until,
            kind,
            estimated_docs,
            estimated_bytes,
            token,
            handle: Mutex::new(None),
            age_rounds: AtomicU64::new(0),
        })
    }

    /// Attach the spawned load task.
    pub fn set_handle(&self, handle: JoinHandle<Result<CompletedLoad, PrefetchError>>) {
        *self.handle.lock() = Some(handle);
    }

    /// First etag this batch may contain.
    pub fn first_covered(&self) -> Etag {
        self.after.next()
    }

    /// Exclusive lower bound of the covered range.
    pub fn after(&self) -> Etag {
        self.after
    }

    /// Inclusive upper bound, when bounded.
    pub fn until(&self) -> Option<Etag> {
        self.until
    }

    /// Batch classification.
    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Expected document count, for admission control.
    pub fn estimated_docs(&self) -> usize {
        self.estimated_docs
    }

    /// Expected byte size, for memory accounting.
    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    /// The batch's own cancellation token, linked to shutdown.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True when `etag` falls inside this batch's declared coverage.
    pub fn covers(&self, etag: Etag) -> bool {
        if etag == self.first_covered() {
            return true;
        }
        match self.until {
            Some(until) => etag > self.after && etag <= until,
            None => false,
        }
    }

    /// True once the background load has run to completion (or died).
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel the background load.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Bump and return the batch's age in rounds.
    pub fn bump_age(&self) -> u64 {
        self.age_rounds.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Await the load's completion.
    ///
    /// A faulted or cancelled task yields `None`; cancellation and
    /// disposal races are expected and logged at debug level only.
    pub async fn join(&self) -> Option<CompletedLoad> {
        let handle = self.handle.lock().take()?;
        match handle.await {
            Ok(Ok(load)) => Some(load),
            Ok(Err(err)) if err.is_cancellation() => {
                debug!(after = %self.after, "Future batch cancelled");
                None
            }
            Ok(Err(err)) => {
                warn!(after = %self.after, error = %err, "Future batch failed; range will be reloaded synchronously");
                None
            }
            Err(join_err) if join_err.is_cancelled() => {
                debug!(after = %self.after, "Future batch task aborted");
                None
            }
            Err(join_err) => {
                warn!(after = %self.after, error = %join_err, "Future batch task panicked");
                None
            }
        }
    }
}

/// Table of in-flight future batches, keyed by first covered etag.
pub struct FutureBatchTable {
    inner: Mutex<BTreeMap<Etag, Arc<FutureBatch>>>,
    accounting: Arc<MemoryAccounting>,
}

impl FutureBatchTable {
    /// Create an empty table reporting into `accounting`.
    pub fn new(accounting: Arc<MemoryAccounting>) -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            accounting,
        }
    }

    /// Register a batch. Refused (false) when another batch already
    /// starts at the same etag.
    pub fn insert(&self, batch: Arc<FutureBatch>) -> bool {
        let mut inner = self.inner.lock();
        let key = batch.first_covered();
        if inner.contains_key(&key) {
            return false;
        }
        self.accounting
            .adjust_future_bytes(batch.estimated_bytes() as isize);
        inner.insert(key, batch);
        true
    }

    /// Find a batch whose declared coverage includes `etag`.
    pub fn matching(&self, etag: Etag) -> Option<Arc<FutureBatch>> {
        let inner = self.inner.lock();
        inner
            .values()
            .find(|batch| batch.covers(etag))
            .cloned()
    }

    /// Remove and return the batch starting at `first_covered`.
    pub fn take(&self, first_covered: Etag) -> Option<Arc<FutureBatch>> {
        let batch = self.inner.lock().remove(&first_covered)?;
        self.accounting
            .adjust_future_bytes(-(batch.estimated_bytes() as isize));
        Some(batch)
    }

    /// True when any batch would overlap the range `(after, until]`.
    pub fn overlaps(&self, after: Etag, until: Option<Etag>) -> bool {
        let inner = self.inner.lock();
        inner.values().any(|batch| {
            let b_start = batch.first_covered();
            let start = after.next();
            match (until, batch.until()) {
                (Some(until), Some(b_until)) => start <= b_until && b_start <= until,
                (Some(until), None) => b_start >= start && b_start <= until,
                (None, Some(b_until)) => b_until >= start,
                (None, None) => true,
            }
        })
    }

    /// Lowest first-covered etag of any registered batch.
    pub fn min_first_covered(&self) -> Option<Etag> {
        self.inner.lock().keys().next().copied()
    }

    /// Number of registered batches.
    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Sum of estimated document counts.
    pub fn estimated_docs_total(&self) -> usize {
        self.inner.lock().values().map(|b| b.estimated_docs()).sum()
    }

    /// Cancel and drain every batch. The caller awaits the returned
    /// batches to guarantee the loads have stopped.
    pub fn cancel_all(&self) -> Vec<Arc<FutureBatch>> {
        let mut inner = self.inner.lock();
        let drained: Vec<_> = std::mem::take(&mut *inner).into_values().collect();
        for batch in &drained {
            self.accounting
                .adjust_future_bytes(-(batch.estimated_bytes() as isize));
            batch.cancel();
        }
        drained
    }

    /// Age every batch by one round; batches past `max_age` are
    /// cancelled, removed, and returned for awaiting.
    pub fn age_all(&self, max_age: u64) -> Vec<Arc<FutureBatch>> {
        let mut inner = self.inner.lock();
        let mut aged = Vec::new();
        inner.retain(|_, batch| {
            if batch.bump_age() > max_age {
                batch.cancel();
                aged.push(batch.clone());
                false
            } else {
                true
            }
        });
        for batch in &aged {
            self.accounting
                .adjust_future_bytes(-(batch.estimated_bytes() as isize));
            debug!(after = %batch.after(), kind = %batch.kind(), "Future batch aged out");
        }
        aged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FutureBatchTable {
        FutureBatchTable::new(Arc::new(MemoryAccounting::new()))
    }

    fn batch(after: Etag, until: Option<Etag>) -> Arc<FutureBatch> {
        FutureBatch::new(after, until, BatchKind::Normal, 10, 1000, CancellationToken::new())
    }

    #[test]
    fn test_covers_start_and_bounded_range() {
        let b = batch(Etag::new(1, 4), Some(Etag::new(1, 20)));
        assert!(b.covers(Etag::new(1, 5)));
        assert!(b.covers(Etag::new(1, 20)));
        assert!(!b.covers(Etag::new(1, 4)));
        assert!(!b.covers(Etag::new(1, 21)));

        let unbounded = batch(Etag::new(1, 4), None);
        assert!(unbounded.covers(Etag::new(1, 5)));
        assert!(!unbounded.covers(Etag::new(1, 6))); // extent unknown
    }

    #[test]
    fn test_insert_rejects_same_start() {
        let table = table();
        assert!(table.insert(batch(Etag::new(1, 4), None)));
        assert!(!table.insert(batch(Etag::new(1, 4), Some(Etag::new(1, 9)))));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_matching_and_take() {
        let table = table();
        table.insert(batch(Etag::new(1, 4), Some(Etag::new(1, 10))));

        let found = table.matching(Etag::new(1, 7)).unwrap();
        assert_eq!(found.first_covered(), Etag::new(1, 5));

        assert!(table.take(Etag::new(1, 5)).is_some());
        assert!(table.matching(Etag::new(1, 7)).is_none());
    }

    #[test]
    fn test_accounting_follows_table() {
        let accounting = Arc::new(MemoryAccounting::new());
        let table = FutureBatchTable::new(accounting.clone());
        table.insert(batch(Etag::new(1, 4), None));
        assert_eq!(accounting.future_batch_bytes(), 1000);

        table.cancel_all();
        assert_eq!(accounting.future_batch_bytes(), 0);
    }

    #[test]
    fn test_age_all_removes_old_batches() {
        let table = table();
        let b = batch(Etag::new(1, 4), None);
        table.insert(b.clone());

        assert!(table.age_all(2).is_empty());
        assert!(table.age_all(2).is_empty());
        let aged = table.age_all(2);
        assert_eq!(aged.len(), 1);
        assert!(b.token().is_cancelled());
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_overlap_detection() {
        let table = table();
        table.insert(batch(Etag::new(1, 10), Some(Etag::new(1, 20))));

        assert!(table.overlaps(Etag::new(1, 15), Some(Etag::new(1, 25))));
        assert!(table.overlaps(Etag::new(1, 5), None));
        assert!(!table.overlaps(Etag::new(1, 20), Some(Etag::new(1, 30))));
    }

    #[tokio::test]
    async fn test_join_surfaces_completed_load() {
        let b = batch(Etag::new(1, 4), None);
        b.set_handle(tokio::spawn(async {
            Ok(CompletedLoad {
                docs: Vec::new(),
                timed_out: false,
                exhausted: true,
            })
        }));

        let load = b.join().await.unwrap();
        assert!(load.exhausted);
        // A second join has nothing left to wait on.
        assert!(b.join().await.is_none());
    }

    #[tokio::test]
    async fn test_join_suppresses_cancellation() {
        let b = batch(Etag::new(1, 4), None);
        b.set_handle(tokio::spawn(async { Err(PrefetchError::Cancelled) }));
        assert!(b.join().await.is_none());
    }
}
