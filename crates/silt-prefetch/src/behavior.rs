//! Per-consumer prefetching façade.
//!
//! A behavior owns one prefetch queue, one future-batch table, one
//! batch-size tuner, and the map of recently deleted documents used to
//! suppress stale reads. Batch retrieval prefers queued and
//! background-loaded data over synchronous disk reads and keeps the
//! process-wide memory budget in view at every step.
//!
//! # Coverage window
//!
//! Etag sequences are sparse (deletions consume markers too), so "the
//! queue's next marker equals cursor+1" is too strict a test. The
//! behavior instead tracks the contiguous range `(after, until]` its
//! queue contents are known-complete for; serving across an etag gap
//! is legal exactly when the gap lies inside that window, because the
//! window guarantees the gap holds no documents.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use silt_storage::{DocumentStore, ScanOptions, ScanResult, StorageError};
use silt_types::{DocumentRecord, Etag, PrefetchConfig};

use crate::error::PrefetchError;
use crate::future_batch::{BatchKind, CompletedLoad, FutureBatch, FutureBatchTable};
use crate::queue::PrefetchQueue;
use crate::tuner::{BatchSizeTuner, InFlightBatch, MemoryAccounting};

/// A served batch of documents plus its registered-size guard.
///
/// Dropping the batch unregisters its bytes from the shared in-flight
/// table on every exit path, unwinding included.
pub struct DocumentBatch {
    docs: Vec<DocumentRecord>,
    _in_flight: InFlightBatch,
}

impl std::fmt::Debug for DocumentBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBatch")
            .field("docs", &self.docs.len())
            .finish()
    }
}

impl DocumentBatch {
    /// The served documents, ascending by etag.
    pub fn docs(&self) -> &[DocumentRecord] {
        &self.docs
    }

    /// Move the documents out; the size registration stays alive until
    /// the batch itself is dropped.
    pub fn take_docs(&mut self) -> Vec<DocumentRecord> {
        std::mem::take(&mut self.docs)
    }

    /// Highest etag in the batch.
    pub fn highest_etag(&self) -> Option<Etag> {
        self.docs.last().map(|d| d.etag)
    }

    /// Number of served documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True when nothing was served.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Coverage {
    /// Exclusive lower bound of the known-complete range.
    after: Etag,
    /// Inclusive upper bound.
    until: Etag,
}

#[derive(Default)]
struct IngestState {
    consumed_since_last_commit: u64,
    over_commits: u32,
    collecting_disabled: bool,
}

struct LoadSample {
    duration: Duration,
    docs: usize,
    largest_doc_bytes: usize,
}

/// Rolling window of recent disk-load observations.
#[derive(Default)]
struct LatencyTracker {
    samples: VecDeque<LoadSample>,
}

impl LatencyTracker {
    const WINDOW: usize = 16;

    fn record(&mut self, duration: Duration, docs: usize, largest_doc_bytes: usize) {
        if self.samples.len() >= Self::WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(LoadSample {
            duration,
            docs,
            largest_doc_bytes,
        });
    }

    /// Documents expected to fit into `timeout`, bounded by how many
    /// of the largest observed documents fit into `max_bytes`.
    fn estimate_docs_in(&self, timeout: Duration, max_bytes: usize, fallback: usize) -> usize {
        let total_docs: usize = self.samples.iter().map(|s| s.docs).sum();
        let total_secs: f64 = self.samples.iter().map(|s| s.duration.as_secs_f64()).sum();
        if total_docs == 0 || total_secs <= 0.0 {
            return fallback;
        }
        let rate = total_docs as f64 / total_secs;
        let by_time = (rate * timeout.as_secs_f64()).floor() as usize;

        let largest = self
            .samples
            .iter()
            .map(|s| s.largest_doc_bytes)
            .max()
            .unwrap_or(1)
            .max(1);
        let by_bytes = max_bytes / largest;

        by_time.min(by_bytes).max(1)
    }

    fn average_doc_bytes(&self) -> usize {
        let total_docs: usize = self.samples.iter().map(|s| s.docs).sum();
        if total_docs == 0 {
            return 1024;
        }
        let total_bytes: usize = self
            .samples
            .iter()
            .map(|s| s.largest_doc_bytes * s.docs)
            .sum();
        (total_bytes / total_docs).max(1)
    }
}

/// The per-consumer prefetching façade.
pub struct PrefetchingBehavior {
    description: String,
    is_default: bool,
    config: PrefetchConfig,
    store: Arc<dyn DocumentStore>,
    tuner: Arc<BatchSizeTuner>,
    accounting: Arc<MemoryAccounting>,
    queue: RwLock<PrefetchQueue>,
    coverage: Mutex<Option<Coverage>>,
    futures: FutureBatchTable,
    deleted: Mutex<HashMap<String, Vec<Etag>>>,
    most_recent_etag: Mutex<Etag>,
    ingest: Mutex<IngestState>,
    load_latency: Mutex<LatencyTracker>,
    io_stalls: AtomicU32,
    shutdown: CancellationToken,
    last_used_round: AtomicU64,
    disposed: AtomicBool,
}

impl std::fmt::Debug for PrefetchingBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchingBehavior")
            .field("description", &self.description)
            .field("is_default", &self.is_default)
            .finish_non_exhaustive()
    }
}

impl PrefetchingBehavior {
    /// Create a behavior.
    ///
    /// `shutdown` should be a child of the prefetcher's token so
    /// process shutdown cancels every outstanding future batch.
    pub fn new(
        description: impl Into<String>,
        is_default: bool,
        config: PrefetchConfig,
        store: Arc<dyn DocumentStore>,
        tuner: Arc<BatchSizeTuner>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let accounting = tuner.accounting().clone();
        Arc::new(Self {
            description: description.into(),
            is_default,
            config,
            store,
            tuner,
            accounting: accounting.clone(),
            queue: RwLock::new(PrefetchQueue::new()),
            coverage: Mutex::new(None),
            futures: FutureBatchTable::new(accounting),
            deleted: Mutex::new(HashMap::new()),
            most_recent_etag: Mutex::new(Etag::zero()),
            ingest: Mutex::new(IngestState::default()),
            load_latency: Mutex::new(LatencyTracker::default()),
            io_stalls: AtomicU32::new(0),
            shutdown,
            last_used_round: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    /// Human-readable consumer description, for logging and summaries.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// True for the process-wide default behavior.
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Highest marker this behavior has seen, via consumption or
    /// commit ingestion. Monotonically non-decreasing.
    pub fn most_recent_etag(&self) -> Etag {
        *self.most_recent_etag.lock()
    }

    /// The behavior's batch size tuner.
    pub fn tuner(&self) -> &Arc<BatchSizeTuner> {
        &self.tuner
    }

    /// Queued document count.
    pub fn queued_docs(&self) -> usize {
        self.queue.read().len()
    }

    /// Queued document bytes.
    pub fn queued_bytes(&self) -> usize {
        self.queue.read().bytes()
    }

    /// In-flight future batch count.
    pub fn future_batch_count(&self) -> usize {
        self.futures.count()
    }

    /// Estimated documents across in-flight future batches.
    pub fn future_docs_estimate(&self) -> usize {
        self.futures.estimated_docs_total()
    }

    /// True once [`dispose`](Self::dispose) ran.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Mark the behavior used in the given indexing round.
    pub fn mark_used(&self, round: u64) {
        self.last_used_round.store(round, Ordering::SeqCst);
    }

    /// Round this behavior was last leased in.
    pub fn last_used_round(&self) -> u64 {
        self.last_used_round.load(Ordering::SeqCst)
    }

    /// True when queued data or a future batch can serve the marker
    /// after `etag` without touching storage.
    pub fn can_use_from_existing_data(&self, etag: Etag) -> bool {
        {
            let coverage = self.coverage.lock();
            let queue = self.queue.read();
            if let (Some(cov), Some(first)) = (*coverage, queue.first_etag_after(etag)) {
                if cov.after <= etag && first <= cov.until {
                    return true;
                }
            }
        }
        self.futures.matching(etag.next()).is_some()
    }

    /// True only for the default behavior, and only when it has
    /// already read at least as far as `etag`.
    pub fn can_use_default(&self, etag: Etag) -> bool {
        self.is_default && self.most_recent_etag() >= etag
    }

    /// Return up to the tuner's current batch size of documents
    /// strictly after `etag`.
    ///
    /// With `allow_waiting`, the call may block on a running future
    /// batch, but only while it has zero results in hand; once
    /// anything is available it returns and lets disk loading continue
    /// in the background.
    pub async fn document_batch_from(
        &self,
        etag: Etag,
        allow_waiting: bool,
    ) -> Result<DocumentBatch, PrefetchError> {
        if self.is_disposed() {
            return Err(PrefetchError::Disposed);
        }

        let started = Instant::now();
        let duration_limit = self.config.prefetch_duration_limit();
        let target = self.tuner.number_of_items_per_batch();
        let max_bytes = self.tuner.max_fetch_bytes();

        let mut docs: Vec<DocumentRecord> = Vec::new();
        let mut bytes = 0usize;
        let mut cursor = etag;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(PrefetchError::Cancelled);
            }
            if docs.len() >= target || bytes >= max_bytes {
                break;
            }
            if !docs.is_empty()
                && (started.elapsed() >= duration_limit || self.memory_over_budget())
            {
                break;
            }

            // Already queued data first.
            let taken = self.take_from_queue(cursor, target - docs.len());
            if let Some(last) = taken.last() {
                cursor = last.etag;
                bytes += taken.iter().map(|d| d.size_bytes).sum::<usize>();
                docs.extend(taken);
                continue;
            }

            let next = cursor.next();

            // A future batch covering the cursor.
            if let Some(batch) = self.futures.matching(next) {
                if batch.is_finished() || (allow_waiting && docs.is_empty()) {
                    self.consume_future_batch(batch).await;
                    continue;
                }
                // Running and we already have results: hand them out
                // and let the load finish in the background.
                break;
            }

            // Synchronous load, bounded below the next future batch so
            // the same range is never fetched twice.
            let until = self
                .futures
                .min_first_covered()
                .and_then(|first| (first > next).then(|| first.decremented_by(1)));
            let scan = self
                .load_from_storage(cursor, target - docs.len(), max_bytes - bytes, until)
                .await?;

            if scan.docs.is_empty() {
                if !scan.timed_out {
                    if let Some(first) = self.futures.min_first_covered() {
                        if first > next {
                            // The gap up to the next future batch is
                            // verified empty; jump to it.
                            cursor = first.decremented_by(1);
                            continue;
                        }
                    }
                }
                break;
            }

            bytes += scan.docs.iter().map(|d| d.size_bytes).sum::<usize>();
            cursor = scan.docs.last().map(|d| d.etag).unwrap_or(cursor);
            docs.extend(scan.docs);
        }

        dedup_latest_wins(&mut docs);

        if let Some(last) = docs.last() {
            self.note_consumed(last.etag, docs.len() as u64);
            self.maybe_schedule_future_batch(cursor);
        }

        let total_bytes = docs.iter().map(|d| d.size_bytes).sum();
        let guard = self.accounting.register_batch(total_bytes);
        debug!(
            behavior = %self.description,
            from = %etag,
            count = docs.len(),
            bytes = total_bytes,
            "Served document batch"
        );
        Ok(DocumentBatch {
            docs,
            _in_flight: guard,
        })
    }

    /// Opportunistically ingest freshly committed documents.
    ///
    /// Only the default behavior collects commits. When the ingest
    /// rate has exceeded the configured ratio of the consumption rate
    /// for more than the configured number of consecutive commits,
    /// collection is disabled and queue entries beyond the oldest
    /// unconsumed marker are dropped, bounding memory under
    /// write-heavy/index-idle load.
    pub fn after_commit(&self, docs: &[DocumentRecord]) {
        if !self.is_default || docs.is_empty() || self.is_disposed() {
            return;
        }

        let mut ingest = self.ingest.lock();
        let consumed = std::mem::take(&mut ingest.consumed_since_last_commit);
        let ingested = docs.len() as u64;
        if ingested as f64 > self.config.ingest_overload_ratio * consumed.max(1) as f64 {
            ingest.over_commits += 1;
        } else {
            ingest.over_commits = 0;
        }

        if ingest.over_commits > self.config.ingest_overload_commits {
            if !ingest.collecting_disabled {
                ingest.collecting_disabled = true;
                warn!(
                    behavior = %self.description,
                    over_commits = ingest.over_commits,
                    "Ingest outpacing consumption; after-commit collection disabled"
                );
            }
            let mut coverage = self.coverage.lock();
            let mut queue = self.queue.write();
            let before = queue.bytes();
            if let Some(first) = queue.first_etag() {
                let dropped = queue.remove_after(first);
                if let Some(cov) = coverage.as_mut() {
                    cov.until = first;
                }
                self.accounting
                    .adjust_queued_bytes(queue.bytes() as isize - before as isize);
                debug!(dropped = dropped, "Purged queue entries past oldest unconsumed marker");
            }
            return;
        }
        if ingest.collecting_disabled {
            return;
        }
        drop(ingest);

        let last = docs.last().map(|d| d.etag).unwrap_or_default();
        let first = docs.first().map(|d| d.etag).unwrap_or_default();
        {
            let mut coverage = self.coverage.lock();
            let mut queue = self.queue.write();
            let before = queue.bytes();
            for doc in docs {
                queue.insert(doc.clone());
            }
            // Commits arrive in etag order and the default behavior
            // sees every one, so the window extends across
            // tombstone-only gaps.
            if let Some(cov) = coverage.as_mut() {
                cov.until = cov.until.max(last);
            } else {
                *coverage = Some(Coverage {
                    after: first.decremented_by(1),
                    until: last,
                });
            }
            self.accounting
                .adjust_queued_bytes(queue.bytes() as isize - before as isize);
        }

        let mut most_recent = self.most_recent_etag.lock();
        if last > *most_recent {
            *most_recent = last;
        }
    }

    /// Record a document deletion for stale-read suppression.
    pub fn after_document_deleted(&self, key: &str, deletion_etag: Etag) {
        self.deleted
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(deletion_etag);
    }

    /// Prune deletion tracking for entries fully superseded by
    /// `last_indexed`. Idempotent.
    pub fn cleanup_documents(&self, last_indexed: Etag) {
        let mut deleted = self.deleted.lock();
        deleted.retain(|_, etags| {
            etags.retain(|e| *e > last_indexed);
            !etags.is_empty()
        });
    }

    /// False when the document's key has a tracked deletion at or
    /// after the document's own marker: the version queued here was
    /// deleted before it could be indexed.
    pub fn filter_document(&self, doc: &DocumentRecord) -> bool {
        match self.deleted.lock().get(&doc.key) {
            Some(etags) => !etags.iter().any(|e| *e >= doc.etag),
            None => true,
        }
    }

    /// Emergency memory-pressure hook: cancel every in-flight future
    /// batch and empty the queue.
    pub async fn clear_queue_and_future_batches(&self) {
        for batch in self.futures.cancel_all() {
            batch.join().await;
        }
        {
            let mut coverage = self.coverage.lock();
            let mut queue = self.queue.write();
            let before = queue.bytes();
            queue.clear();
            *coverage = None;
            self.accounting.adjust_queued_bytes(-(before as isize));
        }
        info!(behavior = %self.description, "Prefetch queue and future batches cleared");
    }

    /// Age future batches by one round, dropping any past the
    /// configured age limit.
    pub async fn age_future_batches(&self) {
        for batch in self.futures.age_all(self.config.future_batch_max_age_rounds) {
            batch.join().await;
        }
    }

    /// Cancel outstanding work and release everything. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        for batch in self.futures.cancel_all() {
            batch.join().await;
        }
        {
            let mut coverage = self.coverage.lock();
            let mut queue = self.queue.write();
            let before = queue.bytes();
            queue.clear();
            *coverage = None;
            self.accounting.adjust_queued_bytes(-(before as isize));
        }
        debug!(behavior = %self.description, "Prefetching behavior disposed");
    }

    fn memory_over_budget(&self) -> bool {
        self.accounting.total_tracked_bytes() > self.config.memory_budget_bytes
    }

    /// Drain queued documents after `cursor`, inside the coverage
    /// window. Entries at or below the cursor were superseded and are
    /// discarded as duplicates.
    fn take_from_queue(&self, cursor: Etag, max: usize) -> Vec<DocumentRecord> {
        let coverage = self.coverage.lock();
        let Some(cov) = *coverage else {
            return Vec::new();
        };
        if cov.after > cursor {
            // The range between the cursor and the window is unknown;
            // serving from the queue could skip documents.
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut queue = self.queue.write();
        let before = queue.bytes();
        while out.len() < max {
            match queue.first_etag() {
                Some(first) if first <= cursor => {
                    queue.pop_first();
                }
                Some(first) if first <= cov.until => {
                    if let Some(doc) = queue.pop_first() {
                        out.push(doc);
                    }
                }
                _ => break,
            }
        }
        self.accounting
            .adjust_queued_bytes(queue.bytes() as isize - before as isize);
        out
    }

    /// Merge a completed load into the queue and coverage window.
    fn enqueue_loaded(&self, after: Etag, docs: Vec<DocumentRecord>, covered_to: Etag) {
        let mut coverage = self.coverage.lock();
        let mut queue = self.queue.write();
        let before = queue.bytes();
        let contiguous = matches!(coverage.as_ref(), Some(cov) if after <= cov.until);
        if contiguous {
            for doc in docs {
                queue.insert(doc);
            }
            if let Some(cov) = coverage.as_mut() {
                cov.until = cov.until.max(covered_to);
            }
        } else if coverage.is_none() || queue.is_empty() {
            for doc in docs {
                queue.insert(doc);
            }
            *coverage = Some(Coverage {
                after,
                until: covered_to,
            });
        } else {
            // Non-contiguous with live queued data; the range will be
            // reloaded synchronously when the consumer gets there.
            debug!(after = %after, "Dropping non-contiguous load");
        }
        self.accounting
            .adjust_queued_bytes(queue.bytes() as isize - before as isize);
    }

    async fn consume_future_batch(&self, batch: Arc<FutureBatch>) {
        let Some(batch) = self.futures.take(batch.first_covered()) else {
            return; // raced with age-out or disposal
        };
        let Some(load) = batch.join().await else {
            return; // faulted or cancelled; never retried automatically
        };

        if load.timed_out {
            self.io_stalls.fetch_add(1, Ordering::SeqCst);
        }

        let covered_to = if load.exhausted {
            batch
                .until()
                .or_else(|| load.docs.last().map(|d| d.etag))
                .unwrap_or(batch.after())
        } else {
            load.docs.last().map(|d| d.etag).unwrap_or(batch.after())
        };

        let count = load.docs.len();
        if covered_to > batch.after() {
            self.enqueue_loaded(batch.after(), load.docs, covered_to);
        }

        if count == 0 {
            // Completed empty: never schedule another batch off it.
            debug!(after = %batch.after(), kind = %batch.kind(), "Future batch completed empty");
            return;
        }

        // Early exit: chain a follow-up for the remainder, preserving
        // marker contiguity.
        let finished_short = load.timed_out || !load.exhausted;
        if finished_short {
            let resume = covered_to;
            debug_assert!(
                resume > batch.after(),
                "early-exit chain must advance past the batch start"
            );
            if self.futures.overlaps(resume, batch.until()) {
                // Gap-free chaining is the invariant; an overlapping
                // follow-up would double-cover the range, so the chain
                // is dropped and the synchronous path re-covers it.
                error!(
                    resume = %resume,
                    "Early-exit follow-up would overlap an existing batch; dropping chain"
                );
            } else if batch.until().map_or(true, |u| resume < u) {
                self.schedule_future_batch(resume, batch.until(), BatchKind::EarlyExit);
            }
        }
    }

    async fn load_from_storage(
        &self,
        after: Etag,
        max_count: usize,
        max_bytes: usize,
        until: Option<Etag>,
    ) -> Result<ScanResult, PrefetchError> {
        let opts = ScanOptions {
            max_count: max_count.max(1),
            max_bytes: max_bytes.max(1),
            until,
            timeout: self.tuner.disk_fetch_timeout(),
        };
        let started = Instant::now();
        let scan = self
            .store
            .documents_after(after, opts, &self.shutdown)
            .await
            .map_err(|err| match err {
                StorageError::Cancelled => PrefetchError::Cancelled,
                other => PrefetchError::from(other),
            })?;

        if scan.timed_out {
            self.io_stalls.fetch_add(1, Ordering::SeqCst);
        }
        if !scan.docs.is_empty() {
            let largest = scan.docs.iter().map(|d| d.size_bytes).max().unwrap_or(1);
            self.load_latency
                .lock()
                .record(started.elapsed(), scan.docs.len(), largest);
        }
        Ok(scan)
    }

    fn note_consumed(&self, last: Etag, count: u64) {
        {
            let mut most_recent = self.most_recent_etag.lock();
            if last > *most_recent {
                *most_recent = last;
            }
        }
        let mut ingest = self.ingest.lock();
        ingest.consumed_since_last_commit += count;
        if ingest.collecting_disabled && self.queue.read().is_empty() {
            ingest.collecting_disabled = false;
            ingest.over_commits = 0;
            info!(
                behavior = %self.description,
                "Consumer caught up; after-commit collection re-enabled"
            );
        }
    }

    /// True when the overload guard has switched commit collection off.
    pub fn collecting_disabled(&self) -> bool {
        self.ingest.lock().collecting_disabled
    }

    /// Schedule the next speculative load from `from`, subject to the
    /// concurrent-batch cap and the global memory budget. Under
    /// repeated I/O stalls the anticipated range is split into
    /// parallel sub-fetches.
    fn maybe_schedule_future_batch(&self, from: Etag) {
        if self.is_disposed() || self.shutdown.is_cancelled() {
            return;
        }
        if self.futures.count() >= self.config.max_future_batches {
            return;
        }
        if self.memory_over_budget() {
            return;
        }
        if self.futures.matching(from.next()).is_some() {
            return;
        }
        if self.queue.read().first_etag_after(from).is_some() {
            return; // queued data already covers what comes next
        }

        if self.io_stalls.load(Ordering::SeqCst) >= self.config.io_stall_split_threshold {
            let splits = (num_cpus::get() / 2).max(2);
            let per_split = self.estimate_docs_in_timeout().max(1) as u64;
            let mut after = from;
            for _ in 0..splits {
                if self.futures.count() >= self.config.max_future_batches {
                    break;
                }
                let until = after.incremented_by(per_split);
                self.schedule_future_batch(after, Some(until), BatchKind::Split);
                after = until;
            }
        } else {
            self.schedule_future_batch(from, None, BatchKind::Normal);
        }
    }

    fn schedule_future_batch(&self, after: Etag, until: Option<Etag>, kind: BatchKind) {
        let estimated_docs = self
            .estimate_docs_in_timeout()
            .min(self.tuner.number_of_items_per_batch())
            .max(1);
        let estimated_bytes = estimated_docs * self.load_latency.lock().average_doc_bytes();
        let token = self.shutdown.child_token();
        let batch = FutureBatch::new(
            after,
            until,
            kind,
            estimated_docs,
            estimated_bytes,
            token.clone(),
        );
        if !self.futures.insert(batch.clone()) {
            debug!(after = %after, "Future batch already scheduled for this range");
            return;
        }

        let store = self.store.clone();
        let opts = ScanOptions {
            max_count: estimated_docs,
            max_bytes: self.tuner.max_fetch_bytes(),
            until,
            timeout: self.tuner.disk_fetch_timeout(),
        };
        let handle = tokio::spawn(async move {
            let scan = store
                .documents_after(after, opts, &token)
                .await
                .map_err(|err| match err {
                    StorageError::Cancelled => PrefetchError::Cancelled,
                    other => PrefetchError::from(other),
                })?;
            Ok(CompletedLoad {
                docs: scan.docs,
                timed_out: scan.timed_out,
                exhausted: scan.exhausted,
            })
        });
        batch.set_handle(handle);
        debug!(after = %after, kind = %kind, docs = estimated_docs, "Scheduled future batch");
    }

    fn estimate_docs_in_timeout(&self) -> usize {
        self.load_latency.lock().estimate_docs_in(
            self.tuner.disk_fetch_timeout(),
            self.tuner.max_fetch_bytes(),
            self.tuner.number_of_items_per_batch(),
        )
    }
}

/// Scanning backward, drop any earlier occurrence of a key already
/// seen later: a document updated twice within the window is indexed
/// once, at its latest marker.
fn dedup_latest_wins(docs: &mut Vec<DocumentRecord>) {
    if docs.len() < 2 {
        return;
    }
    let mut seen: HashSet<String> = HashSet::with_capacity(docs.len());
    let mut keep = vec![false; docs.len()];
    for (i, doc) in docs.iter().enumerate().rev() {
        if seen.insert(doc.key.clone()) {
            keep[i] = true;
        }
    }
    let mut keep_iter = keep.into_iter();
    docs.retain(|_| keep_iter.next().unwrap_or(false));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use silt_storage::MemoryStore;
    use silt_types::TunerConfig;

    fn behavior_over(store: Arc<MemoryStore>, is_default: bool) -> Arc<PrefetchingBehavior> {
        let accounting = Arc::new(MemoryAccounting::new());
        let config = PrefetchConfig::default();
        let tuner = Arc::new(BatchSizeTuner::new(
            TunerConfig {
                initial_batch_size: 64,
                min_batch_size: 8,
                max_batch_size: 1024,
                ..TunerConfig::default()
            },
            accounting,
            config.memory_budget_bytes,
        ));
        PrefetchingBehavior::new(
            if is_default { "default" } else { "group" },
            is_default,
            config,
            store,
            tuner,
            CancellationToken::new(),
        )
    }

    fn put_docs(store: &MemoryStore, n: usize) -> Vec<DocumentRecord> {
        (0..n)
            .map(|i| {
                store.put(
                    format!("docs/{i}"),
                    json!({"n": i}),
                    json!({"collection": "Docs"}),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batch_never_returns_marker_at_or_below_request() {
        let store = Arc::new(MemoryStore::new(1));
        let docs = put_docs(&store, 10);
        let behavior = behavior_over(store, false);

        let from = docs[4].etag;
        let batch = behavior.document_batch_from(from, true).await.unwrap();
        assert!(!batch.is_empty());
        for doc in batch.docs() {
            assert!(doc.etag > from);
        }
    }

    #[tokio::test]
    async fn test_empty_everything_falls_through_to_disk() {
        let store = Arc::new(MemoryStore::new(1));
        let docs = put_docs(&store, 3);
        let behavior = behavior_over(store, false);

        // Nothing queued, no future batches: a synchronous load serves.
        let batch = behavior
            .document_batch_from(Etag::zero(), true)
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.highest_etag(), Some(docs[2].etag));
    }

    #[tokio::test]
    async fn test_queue_drain_scenario() {
        // Queue holds markers 5,6,7; consumer at 4 asks for 10.
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), true);

        let _skipped = put_docs(&store, 4);
        let committed = put_docs(&store, 3); // etags 5,6,7
        behavior.after_commit(&committed);
        assert_eq!(behavior.queued_docs(), 3);

        let from = Etag::new(1, 4);
        let batch = behavior.document_batch_from(from, false).await.unwrap();
        let etags: Vec<_> = batch.docs().iter().map(|d| d.etag.changes).collect();
        assert_eq!(etags, vec![5, 6, 7]);
        assert_eq!(behavior.queued_docs(), 0);
    }

    #[tokio::test]
    async fn test_commit_round_trip_served_exactly_once() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), true);

        let doc = store.put("users/1", json!({"v": 1}), json!({}));
        behavior.after_commit(std::slice::from_ref(&doc));

        let batch = behavior
            .document_batch_from(Etag::zero(), false)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.docs()[0].key, "users/1");

        // A second request past the served marker finds nothing new.
        let next = behavior
            .document_batch_from(doc.etag, false)
            .await
            .unwrap();
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn test_dedup_same_key_latest_marker_wins() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), true);

        // Two versions of the same key reach the queue before either
        // is consumed; only the later survives.
        let v1 = store.put("users/1", json!({"v": 1}), json!({}));
        behavior.after_commit(std::slice::from_ref(&v1));
        let v2 = store.put("users/1", json!({"v": 2}), json!({}));
        behavior.after_commit(std::slice::from_ref(&v2));
        assert_eq!(behavior.queued_docs(), 2);

        let batch = behavior
            .document_batch_from(Etag::zero(), false)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.docs()[0].etag, v2.etag);
        assert_eq!(batch.docs()[0].payload["v"], 2);
    }

    #[tokio::test]
    async fn test_serving_across_tombstone_gap_inside_coverage() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), true);

        let a = store.put("users/1", json!({}), json!({}));
        behavior.after_commit(std::slice::from_ref(&a));
        store.delete("users/1"); // consumes a marker, no document
        let b = store.put("users/2", json!({}), json!({}));
        behavior.after_commit(std::slice::from_ref(&b));

        let batch = behavior
            .document_batch_from(a.etag, false)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.docs()[0].etag, b.etag);
    }

    #[tokio::test]
    async fn test_overload_disables_collection_and_purges_queue() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), true);

        // Ingest far faster than consumption for four consecutive
        // commits (nothing is consumed at all).
        for round in 0..4 {
            let docs = put_docs(&store, 4);
            behavior.after_commit(&docs);
            if round < 3 {
                assert!(!behavior.collecting_disabled());
            }
        }

        assert!(behavior.collecting_disabled());
        // Entries past the oldest unconsumed marker were dropped.
        assert_eq!(behavior.queued_docs(), 1);

        // Further commits are not collected while disabled.
        let more = put_docs(&store, 2);
        behavior.after_commit(&more);
        assert_eq!(behavior.queued_docs(), 1);
    }

    #[tokio::test]
    async fn test_collection_reenabled_after_catch_up() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), true);

        for _ in 0..4 {
            let docs = put_docs(&store, 4);
            behavior.after_commit(&docs);
        }
        assert!(behavior.collecting_disabled());

        // Draining everything re-enables collection.
        let mut cursor = Etag::zero();
        loop {
            let batch = behavior.document_batch_from(cursor, false).await.unwrap();
            match batch.highest_etag() {
                Some(etag) => cursor = etag,
                None => break,
            }
        }
        assert!(!behavior.collecting_disabled());
    }

    #[tokio::test]
    async fn test_filter_document_suppresses_tracked_deletions() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), true);

        let doc = store.put("users/1", json!({}), json!({}));
        behavior.after_document_deleted("users/1", doc.etag.next());

        assert!(!behavior.filter_document(&doc));

        // A version written after the deletion passes.
        let newer = store.put("users/1", json!({}), json!({}));
        let newer = DocumentRecord {
            etag: newer.etag.incremented_by(5),
            ..newer
        };
        assert!(behavior.filter_document(&newer));
    }

    #[tokio::test]
    async fn test_cleanup_documents_is_idempotent() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store, true);

        behavior.after_document_deleted("a", Etag::new(1, 5));
        behavior.after_document_deleted("b", Etag::new(1, 9));

        behavior.cleanup_documents(Etag::new(1, 6));
        let doc_a = DocumentRecord::new("a", Etag::new(1, 3), json!({}), json!({}));
        assert!(behavior.filter_document(&doc_a)); // tracking pruned

        let doc_b = DocumentRecord::new("b", Etag::new(1, 8), json!({}), json!({}));
        assert!(!behavior.filter_document(&doc_b));

        // Second cleanup with the same marker changes nothing.
        behavior.cleanup_documents(Etag::new(1, 6));
        assert!(behavior.filter_document(&doc_a));
        assert!(!behavior.filter_document(&doc_b));
    }

    #[tokio::test]
    async fn test_can_use_from_existing_data() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), true);

        let docs = put_docs(&store, 3);
        behavior.after_commit(&docs);

        assert!(behavior.can_use_from_existing_data(Etag::zero()));
        assert!(behavior.can_use_from_existing_data(docs[1].etag));
        assert!(!behavior.can_use_from_existing_data(docs[2].etag));
    }

    #[tokio::test]
    async fn test_can_use_default_requires_flag_and_coverage() {
        let store = Arc::new(MemoryStore::new(1));
        let default = behavior_over(store.clone(), true);
        let plain = behavior_over(store.clone(), false);

        let docs = put_docs(&store, 3);
        default.after_commit(&docs);

        assert!(default.can_use_default(docs[2].etag));
        assert!(!default.can_use_default(docs[2].etag.next()));
        assert!(!plain.can_use_default(Etag::zero()));
    }

    #[tokio::test]
    async fn test_consumption_schedules_future_batch() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), false);
        put_docs(&store, 5);

        let batch = behavior
            .document_batch_from(Etag::zero(), true)
            .await
            .unwrap();
        assert_eq!(batch.len(), 5);
        assert!(behavior.future_batch_count() <= 5);

        // Let any speculative load settle, then write more and serve
        // them through the same behavior.
        tokio::task::yield_now().await;
        let more = put_docs(&store, 3);
        let next = behavior
            .document_batch_from(batch.highest_etag().unwrap(), true)
            .await
            .unwrap();
        assert_eq!(next.len(), 3);
        assert_eq!(next.highest_etag(), Some(more[2].etag));
    }

    #[tokio::test]
    async fn test_clear_queue_and_future_batches() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store.clone(), true);

        let docs = put_docs(&store, 4);
        behavior.after_commit(&docs);
        assert_eq!(behavior.queued_docs(), 4);

        behavior.clear_queue_and_future_batches().await;
        assert_eq!(behavior.queued_docs(), 0);
        assert_eq!(behavior.future_batch_count(), 0);
        assert_eq!(behavior.tuner().accounting().queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_disposed_behavior_refuses_service() {
        let store = Arc::new(MemoryStore::new(1));
        let behavior = behavior_over(store, true);
        behavior.dispose().await;

        let err = behavior
            .document_batch_from(Etag::zero(), false)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_dedup_latest_wins_backward_scan() {
        let mk = |key: &str, changes: u64| {
            DocumentRecord::new(key, Etag::new(1, changes), json!({}), json!({}))
        };
        let mut docs = vec![mk("a", 1), mk("b", 2), mk("a", 3), mk("c", 4), mk("b", 5)];
        dedup_latest_wins(&mut docs);

        let keys: Vec<_> = docs.iter().map(|d| (d.key.as_str(), d.etag.changes)).collect();
        assert_eq!(keys, vec![("a", 3), ("c", 4), ("b", 5)]);
    }
}
