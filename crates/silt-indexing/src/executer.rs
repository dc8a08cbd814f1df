//! The indexing executer.
//!
//! Runs the per-round state machine: group stale indexes by their
//! resume marker, lease a prefetching behavior per group, filter the
//! fetched documents per index, dispatch index computation to the
//! worker pool, and persist each index's cursor on success. Groups
//! are processed in descending order of last query time so actively
//! queried indexes catch up first.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use silt_pool::WorkerPool;
use silt_prefetch::{Prefetcher, PrefetchingBehavior};
use silt_storage::{DocumentStore, ScanOptions, StorageError};
use silt_types::{DocumentRecord, Etag, ExecuterConfig, IndexId, IndexPriority};

use crate::batch::IndexingBatch;
use crate::error::IndexingError;
use crate::index::{
    matches_entity_filter, Index, IndexExecutionError, IndexingContext, PerformanceStats,
};
use crate::registry::IndexRegistry;
use crate::staleness;
use crate::state::{AlertKind, AlertLog, IndexStateSnapshot};

/// Outcome of a single indexing round.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundSummary {
    /// Round counter.
    pub round: u64,
    /// True when the staleness fingerprint short-circuited the round.
    pub idle: bool,
    /// Index groups processed.
    pub groups: usize,
    /// Indexes that received a non-empty batch.
    pub indexes_dispatched: usize,
    /// Documents fetched across all groups.
    pub docs_fetched: usize,
}

/// Owned state for the "at most one precomputed batch per process"
/// invariant, exempting test indexes.
#[derive(Default)]
pub struct PrecomputedBatchState {
    running: Arc<Mutex<Option<IndexId>>>,
}

impl PrecomputedBatchState {
    /// Create idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the precomputed-batch slot for `index_id`.
    ///
    /// Test indexes bypass the exclusivity and always get a guard.
    pub fn try_begin(&self, index_id: IndexId, is_test_index: bool) -> Option<PrecomputedBatchGuard> {
        if is_test_index {
            return Some(PrecomputedBatchGuard { slot: None });
        }
        let mut running = self.running.lock();
        if running.is_some() {
            return None;
        }
        *running = Some(index_id);
        Some(PrecomputedBatchGuard {
            slot: Some(self.running.clone()),
        })
    }

    /// The index currently holding the slot, if any.
    pub fn running_for(&self) -> Option<IndexId> {
        *self.running.lock()
    }
}

/// RAII claim on the precomputed-batch slot.
pub struct PrecomputedBatchGuard {
    slot: Option<Arc<Mutex<Option<IndexId>>>>,
}

impl Drop for PrecomputedBatchGuard {
    fn drop(&mut self) {
        if let Some(slot) = &self.slot {
            *slot.lock() = None;
        }
    }
}

struct IndexState {
    index: Arc<dyn Index>,
    last_indexed_etag: Etag,
    last_indexed_at: DateTime<Utc>,
    last_query_time: Option<DateTime<Utc>>,
    priority: IndexPriority,
    consecutive_failures: u32,
    docs_indexed_total: u64,
}

struct DispatchItem {
    index: Arc<dyn Index>,
    batch: IndexingBatch,
}

struct DispatchResult {
    index_id: IndexId,
    highest_etag: Etag,
    items: usize,
    result: Result<PerformanceStats, IndexExecutionError>,
}

/// The per-round scheduler driving the whole pipeline.
pub struct IndexingExecuter {
    self_weak: Weak<IndexingExecuter>,
    store: Arc<dyn DocumentStore>,
    prefetcher: Arc<Prefetcher>,
    pool: Arc<WorkerPool>,
    registry: IndexRegistry,
    config: ExecuterConfig,
    states: Mutex<HashMap<IndexId, IndexState>>,
    alerts: Arc<AlertLog>,
    precomputed: Arc<PrecomputedBatchState>,
    work_signal: Notify,
    shutdown: CancellationToken,
    round: AtomicU64,
    last_fingerprint: Mutex<Option<u64>>,
}

impl IndexingExecuter {
    /// Create an executer over the given collaborators.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        prefetcher: Arc<Prefetcher>,
        pool: Arc<WorkerPool>,
        registry: IndexRegistry,
        config: ExecuterConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            store,
            prefetcher,
            pool,
            registry,
            config,
            states: Mutex::new(HashMap::new()),
            alerts: Arc::new(AlertLog::new()),
            precomputed: Arc::new(PrecomputedBatchState::new()),
            work_signal: Notify::new(),
            shutdown,
            round: AtomicU64::new(0),
            last_fingerprint: Mutex::new(None),
        })
    }

    /// Load every registered index's persisted cursor.
    pub async fn initialize(&self) -> Result<(), IndexingError> {
        let mut loaded = HashMap::new();
        for index in self.registry.iter() {
            let id = index.id();
            let (etag, at) = self
                .store
                .last_indexed(id)
                .await?
                .unwrap_or((Etag::zero(), Utc::now()));
            loaded.insert(
                id,
                IndexState {
                    index: index.clone(),
                    last_indexed_etag: etag,
                    last_indexed_at: at,
                    last_query_time: None,
                    priority: IndexPriority::Normal,
                    consecutive_failures: 0,
                    docs_indexed_total: 0,
                },
            );
            debug!(index = %id, cursor = %etag, "Index state loaded");
        }
        *self.states.lock() = loaded;
        Ok(())
    }

    /// The alert log, queryable by operators.
    pub fn alerts(&self) -> &Arc<AlertLog> {
        &self.alerts
    }

    /// Completed round count.
    pub fn rounds(&self) -> u64 {
        self.round.load(Ordering::SeqCst)
    }

    /// Commit-path hook: hand freshly committed documents to the
    /// default prefetching behavior and wake the round loop.
    pub fn note_commit(&self, docs: &[DocumentRecord]) {
        self.prefetcher.after_commit(docs);
        self.work_signal.notify_one();
    }

    /// Delete-path hook: record the deletion in every behavior's
    /// suppression map and wake the round loop.
    pub fn note_delete(&self, key: &str, deletion_etag: Etag) {
        self.prefetcher.after_delete(key, deletion_etag);
        self.work_signal.notify_one();
    }

    /// Query-path hook: feeds the group ordering policy.
    pub fn note_query(&self, index_id: IndexId) {
        if let Some(state) = self.states.lock().get_mut(&index_id) {
            state.last_query_time = Some(Utc::now());
        }
    }

    /// Observable state of every index.
    pub fn snapshot(&self) -> Vec<IndexStateSnapshot> {
        let states = self.states.lock();
        let mut out: Vec<_> = states
            .values()
            .map(|s| IndexStateSnapshot {
                index_id: s.index.id(),
                name: s.index.name().to_string(),
                last_indexed_etag: s.last_indexed_etag,
                last_indexed_at: s.last_indexed_at,
                last_query_time: s.last_query_time,
                priority: s.priority,
                consecutive_failures: s.consecutive_failures,
                docs_indexed_total: s.docs_indexed_total,
            })
            .collect();
        out.sort_by_key(|s| s.index_id);
        out
    }

    /// Run rounds until shutdown, sleeping between idle rounds and
    /// waking immediately on commit notifications.
    pub async fn run(self: Arc<Self>) {
        info!("Indexing executer started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.execute_round().await {
                Ok(summary) if summary.idle => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.work_signal.notified() => {}
                        _ = tokio::time::sleep(self.config.idle_round_delay()) => {}
                    }
                }
                Ok(_) => {}
                Err(err) if err.is_cancellation() => break,
                Err(err) => {
                    warn!(error = %err, "Indexing round failed");
                    tokio::time::sleep(self.config.idle_round_delay()).await;
                }
            }
        }
        info!("Indexing executer stopped");
    }

    /// Execute one full round of the state machine.
    pub async fn execute_round(&self) -> Result<RoundSummary, IndexingError> {
        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        let mut summary = RoundSummary {
            round,
            ..RoundSummary::default()
        };

        let last_document = self.store.last_document_etag().await?;
        let touch_count = self.store.touch_count().await?;

        // Nothing moved since the last round: skip grouping and
        // prefetching entirely. Pending retries keep the round live
        // even with unchanged cursors.
        let (fp, has_pending_retries) = {
            let states = self.states.lock();
            let mut cursors: Vec<_> = states
                .values()
                .map(|s| (s.index.id(), s.last_indexed_etag))
                .collect();
            cursors.sort_by_key(|(id, _)| *id);
            let fp = staleness::fingerprint(last_document, touch_count, cursors.into_iter());
            let retries = states
                .values()
                .any(|s| s.priority != IndexPriority::Disabled && s.consecutive_failures > 0);
            (fp, retries)
        };
        {
            let mut last_fp = self.last_fingerprint.lock();
            if *last_fp == Some(fp) && !has_pending_retries {
                summary.idle = true;
                return Ok(summary);
            }
            *last_fp = Some(fp);
        }

        // GroupByMarker: stale, eligible indexes sharing a cursor
        // fetch together.
        let mut groups: Vec<(Etag, Vec<Arc<dyn Index>>, Option<DateTime<Utc>>)> = {
            let states = self.states.lock();
            let mut by_etag: BTreeMap<Etag, (Vec<Arc<dyn Index>>, Option<DateTime<Utc>>)> =
                BTreeMap::new();
            for state in states.values() {
                if state.priority == IndexPriority::Disabled {
                    continue;
                }
                if !staleness::is_stale(state.last_indexed_etag, last_document) {
                    continue;
                }
                let entry = by_etag.entry(state.last_indexed_etag).or_default();
                entry.0.push(state.index.clone());
                entry.1 = entry.1.max(state.last_query_time);
            }
            by_etag
                .into_iter()
                .map(|(etag, (indexes, last_query))| (etag, indexes, last_query))
                .collect()
        };
        if groups.is_empty() {
            summary.idle = true;
            return Ok(summary);
        }
        groups.sort_by(|a, b| b.2.cmp(&a.2));
        summary.groups = groups.len();

        for (group_etag, indexes, _) in groups {
            if self.shutdown.is_cancelled() {
                return Err(IndexingError::Cancelled);
            }
            let dispatched = self.process_group(round, group_etag, indexes).await?;
            summary.indexes_dispatched += dispatched.0;
            summary.docs_fetched += dispatched.1;
        }

        self.prefetcher.cycle_maintenance(round).await;
        Ok(summary)
    }

    /// Prefetch, filter, dispatch, and commit for one index group.
    async fn process_group(
        &self,
        round: u64,
        group_etag: Etag,
        indexes: Vec<Arc<dyn Index>>,
    ) -> Result<(usize, usize), IndexingError> {
        // Cheap nothing-new probe: trailing mutations can be
        // tombstones, leaving no document past the cursor to fetch.
        if self.store.best_next_etag(group_etag).await?.is_none() {
            return Ok((0, 0));
        }

        let behavior = self.prefetcher.behavior_for(group_etag)?;
        behavior.mark_used(round);

        let fetch_started = Instant::now();
        let mut batch = behavior.document_batch_from(group_etag, true).await?;
        let docs = batch.take_docs();
        let Some(highest) = docs.last().map(|d| d.etag) else {
            return Ok((0, 0));
        };
        let fetched = docs.len();
        let total_bytes: usize = docs.iter().map(|d| d.size_bytes).sum();

        // Filter: per index, drop documents at or below its own
        // cursor, outside its entity restriction, or deleted since
        // they were queued.
        let mut items = Vec::new();
        let mut zero_survivors = Vec::new();
        {
            let states = self.states.lock();
            for index in &indexes {
                let cursor = states
                    .get(&index.id())
                    .map(|s| s.last_indexed_etag)
                    .unwrap_or(group_etag);
                let filtered: Vec<DocumentRecord> = docs
                    .iter()
                    .filter(|d| d.etag > cursor)
                    .filter(|d| matches_entity_filter(index.as_ref(), d.entity_name()))
                    .filter(|d| behavior.filter_document(d))
                    .cloned()
                    .collect();
                if filtered.is_empty() {
                    zero_survivors.push(index.id());
                } else {
                    items.push(DispatchItem {
                        index: index.clone(),
                        batch: IndexingBatch::build(index.id(), filtered, highest),
                    });
                }
            }
        }
        let dispatched = items.len();

        // Dispatch: parallel index computation on the worker pool,
        // with partial resumption so one slow index cannot stall the
        // round.
        if !items.is_empty() {
            let pool = self.pool.clone();
            let token = self.shutdown.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                pool.execute_batch(
                    items,
                    move |item: DispatchItem| {
                        let started = Instant::now();
                        let ctx = IndexingContext {
                            token: token.clone(),
                        };
                        let mut result = item.index.execute(&item.batch, &ctx);
                        if let Ok(stats) = result.as_mut() {
                            stats.duration = started.elapsed();
                        }
                        DispatchResult {
                            index_id: item.index.id(),
                            highest_etag: item.batch.highest_etag,
                            items: item.batch.len(),
                            result,
                        }
                    },
                    true,
                )
            })
            .await
            .map_err(|err| IndexingError::Dispatch(err.to_string()))??;

            for (_, result) in outcome.completed {
                self.apply_result(result, &behavior).await;
            }
            if let Some(pending) = outcome.pending {
                self.spawn_straggler_drain(pending, behavior.clone());
            }
        }

        // Indexes whose filter left nothing still advance to the
        // group's highest marker so they never re-scan this window.
        for index_id in zero_survivors {
            match self.advance_cursor(index_id, highest).await {
                Ok(()) => {}
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => warn!(index = %index_id, error = %err, "Cursor advance failed"),
            }
        }

        behavior
            .tuner()
            .auto_throttle(fetched, total_bytes, fetch_started.elapsed());
        Ok((dispatched, fetched))
    }

    /// Commit one index's computation outcome.
    async fn apply_result(
        &self,
        result: DispatchResult,
        behavior: &Arc<PrefetchingBehavior>,
    ) {
        let index_id = result.index_id;
        match result.result {
            Ok(stats) => {
                match self.advance_cursor(index_id, result.highest_etag).await {
                    Ok(()) => {
                        behavior.cleanup_documents(result.highest_etag);
                        let mut states = self.states.lock();
                        if let Some(state) = states.get_mut(&index_id) {
                            state.consecutive_failures = 0;
                            state.docs_indexed_total += stats.items_indexed as u64;
                        }
                        debug!(
                            index = %index_id,
                            items = result.items,
                            cursor = %result.highest_etag,
                            duration_ms = stats.duration.as_millis() as u64,
                            "Index advanced"
                        );
                    }
                    Err(err) if err.is_cancellation() => {}
                    Err(err) => {
                        warn!(index = %index_id, error = %err, "Cursor commit failed")
                    }
                }
            }
            Err(IndexExecutionError::OutOfMemory(message)) => {
                self.disable_index(index_id, AlertKind::OutOfMemory, &message)
                    .await;
            }
            Err(IndexExecutionError::Corruption(message)) => {
                self.disable_index(index_id, AlertKind::Corruption, &message)
                    .await;
            }
            Err(IndexExecutionError::Failed(message)) => {
                let failures = {
                    let mut states = self.states.lock();
                    match states.get_mut(&index_id) {
                        Some(state) => {
                            state.consecutive_failures += 1;
                            state.consecutive_failures
                        }
                        None => return,
                    }
                };
                if failures >= self.config.max_consecutive_failures {
                    self.disable_index(index_id, AlertKind::RepeatedFailures, &message)
                        .await;
                } else {
                    warn!(
                        index = %index_id,
                        failures = failures,
                        error = message,
                        "Index computation failed; retrying next round"
                    );
                }
            }
        }
    }

    /// Persist an index cursor, retrying optimistic-concurrency
    /// clashes with a fixed backoff.
    async fn advance_cursor(&self, index_id: IndexId, etag: Etag) -> Result<(), IndexingError> {
        let now = Utc::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.update_last_indexed(index_id, etag, now).await {
                Ok(()) => break,
                Err(err @ StorageError::WriteConflict { .. }) => {
                    if attempt >= self.config.metadata_write_retries {
                        warn!(
                            index = %index_id,
                            attempts = attempt,
                            error = %err,
                            "Cursor update exhausted write-conflict retries"
                        );
                        return Err(IndexingError::MetadataRetriesExhausted(index_id, attempt));
                    }
                    tokio::time::sleep(self.config.metadata_retry_backoff()).await;
                }
                Err(StorageError::Cancelled) => return Err(IndexingError::Cancelled),
                Err(other) => return Err(other.into()),
            }
        }

        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&index_id) {
            if etag > state.last_indexed_etag {
                state.last_indexed_etag = etag;
                state.last_indexed_at = now;
            }
        }
        Ok(())
    }

    async fn disable_index(&self, index_id: IndexId, kind: AlertKind, message: &str) {
        {
            let mut states = self.states.lock();
            if let Some(state) = states.get_mut(&index_id) {
                state.priority = IndexPriority::Disabled;
            }
        }
        self.alerts.raise(index_id, kind, message);
        if let Err(err) = self
            .store
            .set_index_priority(index_id, IndexPriority::Disabled)
            .await
        {
            warn!(index = %index_id, error = %err, "Failed to persist disabled priority");
        }
        warn!(index = %index_id, kind = %kind, message = message, "Index disabled");
    }

    fn spawn_straggler_drain(
        &self,
        pending: Receiver<(usize, DispatchResult)>,
        behavior: Arc<PrefetchingBehavior>,
    ) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let late = tokio::task::spawn_blocking(move || pending.into_iter().collect::<Vec<_>>())
                .await
                .unwrap_or_default();
            for (_, result) in late {
                this.apply_result(result, &behavior).await;
            }
        });
    }

    /// Seed a newly registered index from a one-shot precomputed
    /// batch, scanning only documents (bounded by the fetch byte cap)
    /// and advancing the index straight to the current marker.
    ///
    /// Returns false when the slot is taken, the data set is too large
    /// or slow to precompute, or the computation failed; the normal
    /// round loop indexes the data instead.
    pub async fn precompute_for_new_index(
        &self,
        index_id: IndexId,
        is_test_index: bool,
    ) -> Result<bool, IndexingError> {
        let index = self
            .registry
            .get(index_id)
            .ok_or(IndexingError::UnknownIndex(index_id))?
            .clone();
        let Some(_guard) = self.precomputed.try_begin(index_id, is_test_index) else {
            return Ok(false);
        };

        let last_document = self.store.last_document_etag().await?;
        let max_bytes = self.prefetcher.tuner().max_fetch_bytes();
        let mut cursor = Etag::zero();
        let mut collected = Vec::new();
        let mut bytes = 0usize;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(IndexingError::Cancelled);
            }
            let scan = self
                .store
                .documents_after(
                    cursor,
                    ScanOptions {
                        max_count: 4096,
                        max_bytes,
                        until: Some(last_document),
                        timeout: self.prefetcher.tuner().disk_fetch_timeout(),
                    },
                    &self.shutdown,
                )
                .await?;
            if scan.timed_out {
                return Ok(false);
            }
            let Some(last) = scan.docs.last() else {
                break;
            };
            cursor = last.etag;
            for doc in scan.docs {
                if matches_entity_filter(index.as_ref(), doc.entity_name()) {
                    bytes += doc.size_bytes;
                    if bytes > max_bytes {
                        return Ok(false);
                    }
                    collected.push(doc);
                }
            }
            if scan.exhausted {
                break;
            }
        }

        let items = collected.len();
        let batch = IndexingBatch::build(index_id, collected, last_document);
        let token = self.shutdown.clone();
        let computing = index.clone();
        let result = tokio::task::spawn_blocking(move || {
            let ctx = IndexingContext { token };
            computing.execute(&batch, &ctx)
        })
        .await
        .map_err(|err| IndexingError::Dispatch(err.to_string()))?;

        match result {
            Ok(_) => {
                self.advance_cursor(index_id, last_document).await?;
                info!(index = %index_id, items = items, "Precomputed batch seeded index");
                Ok(true)
            }
            Err(err) => {
                warn!(index = %index_id, error = %err, "Precomputed batch failed; falling back to normal rounds");
                Ok(false)
            }
        }
    }
}
