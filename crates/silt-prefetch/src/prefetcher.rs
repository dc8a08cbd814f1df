//! Prefetcher multiplexer.
//!
//! Owns every prefetching behavior in the process: one distinguished
//! default behavior fed by the commit path, plus one behavior per
//! index group with a distinct starting marker. Routes consumers to a
//! compatible behavior, aggregates cross-behavior accounting for
//! admission control, and disposes behaviors that fall out of use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use silt_storage::DocumentStore;
use silt_types::{DocumentRecord, Etag, PrefetchConfig, TunerConfig};

use crate::behavior::PrefetchingBehavior;
use crate::error::PrefetchError;
use crate::tuner::{BatchSizeTuner, MemoryAccounting};

/// Aggregated view across all behaviors, feeding the admission-control
/// checks inside each behavior's batch loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefetcherSummary {
    /// Registered behaviors.
    pub behaviors: usize,
    /// Documents queued across all behaviors.
    pub queued_docs: usize,
    /// Bytes queued across all behaviors.
    pub queued_bytes: usize,
    /// Future batches in flight across all behaviors.
    pub future_batches: usize,
    /// Estimated documents across in-flight future batches.
    pub future_docs_estimate: usize,
    /// Bytes registered by handed-out batches.
    pub in_flight_bytes: usize,
}

/// Owner and router of all prefetching behaviors.
pub struct Prefetcher {
    store: Arc<dyn DocumentStore>,
    prefetch_config: PrefetchConfig,
    accounting: Arc<MemoryAccounting>,
    tuner: Arc<BatchSizeTuner>,
    behaviors: Mutex<Vec<Arc<PrefetchingBehavior>>>,
    shutdown: CancellationToken,
    next_group: AtomicU64,
}

impl Prefetcher {
    /// Create a prefetcher with a shared tuner and accounting table.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        prefetch_config: PrefetchConfig,
        tuner_config: TunerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let accounting = Arc::new(MemoryAccounting::new());
        let tuner = Arc::new(BatchSizeTuner::new(
            tuner_config,
            accounting.clone(),
            prefetch_config.memory_budget_bytes,
        ));
        Self {
            store,
            prefetch_config,
            accounting,
            tuner,
            behaviors: Mutex::new(Vec::new()),
            shutdown,
            next_group: AtomicU64::new(0),
        }
    }

    /// The shared batch size tuner.
    pub fn tuner(&self) -> &Arc<BatchSizeTuner> {
        &self.tuner
    }

    /// Allocate and register a behavior.
    ///
    /// At most one behavior may be flagged default at a time.
    pub fn create_behavior(
        &self,
        description: impl Into<String>,
        is_default: bool,
    ) -> Result<Arc<PrefetchingBehavior>, PrefetchError> {
        let mut behaviors = self.behaviors.lock();
        if is_default && behaviors.iter().any(|b| b.is_default()) {
            return Err(PrefetchError::DefaultAlreadyRegistered);
        }
        let behavior = PrefetchingBehavior::new(
            description,
            is_default,
            self.prefetch_config.clone(),
            self.store.clone(),
            self.tuner.clone(),
            self.shutdown.child_token(),
        );
        behaviors.push(behavior.clone());
        debug!(
            behavior = behavior.description(),
            default = is_default,
            "Prefetching behavior registered"
        );
        Ok(behavior)
    }

    /// Unregister and dispose a behavior, cancelling its outstanding
    /// future batches.
    pub async fn remove_behavior(&self, behavior: &Arc<PrefetchingBehavior>) {
        {
            let mut behaviors = self.behaviors.lock();
            behaviors.retain(|b| !Arc::ptr_eq(b, behavior));
        }
        behavior.dispose().await;
    }

    /// The default behavior, when registered.
    pub fn default_behavior(&self) -> Option<Arc<PrefetchingBehavior>> {
        self.behaviors.lock().iter().find(|b| b.is_default()).cloned()
    }

    /// Route a consumer at `etag` to a compatible behavior.
    ///
    /// Reuses a behavior that already covers the marker, falls back to
    /// the default when it has read far enough ahead, and otherwise
    /// allocates a fresh behavior for the group.
    pub fn behavior_for(&self, etag: Etag) -> Result<Arc<PrefetchingBehavior>, PrefetchError> {
        {
            let behaviors = self.behaviors.lock();
            if let Some(existing) = behaviors
                .iter()
                .find(|b| !b.is_default() && b.can_use_from_existing_data(etag))
            {
                return Ok(existing.clone());
            }
            if let Some(default) = behaviors.iter().find(|b| b.is_default()) {
                if default.can_use_default(etag) || default.can_use_from_existing_data(etag) {
                    return Ok(default.clone());
                }
            }
        }
        let group = self.next_group.fetch_add(1, Ordering::SeqCst);
        self.create_behavior(format!("group-{group}@{etag}"), false)
    }

    /// Forward freshly committed documents to the default behavior.
    pub fn after_commit(&self, docs: &[DocumentRecord]) {
        if let Some(default) = self.default_behavior() {
            default.after_commit(docs);
        }
    }

    /// Record a deletion in every behavior's suppression map.
    pub fn after_delete(&self, key: &str, deletion_etag: Etag) {
        for behavior in self.behaviors.lock().iter() {
            behavior.after_document_deleted(key, deletion_etag);
        }
    }

    /// Process-wide low-memory signal: drop every queue and cancel
    /// every future batch.
    pub async fn handle_low_memory(&self) {
        info!("Low memory signal: clearing all prefetch state");
        for behavior in self.snapshot() {
            behavior.clear_queue_and_future_batches().await;
        }
    }

    /// Per-round upkeep: age out unused future batches and dispose
    /// behaviors idle past the configured round count.
    pub async fn cycle_maintenance(&self, round: u64) {
        for behavior in self.snapshot() {
            behavior.age_future_batches().await;
        }

        let idle_limit = self.prefetch_config.behavior_idle_rounds;
        let idle: Vec<_> = {
            let behaviors = self.behaviors.lock();
            behaviors
                .iter()
                .filter(|b| {
                    !b.is_default() && round.saturating_sub(b.last_used_round()) > idle_limit
                })
                .cloned()
                .collect()
        };
        for behavior in idle {
            debug!(behavior = behavior.description(), "Disposing idle behavior");
            self.remove_behavior(&behavior).await;
        }
    }

    /// Aggregate queue/future-batch/in-flight sizes across behaviors.
    pub fn summary(&self) -> PrefetcherSummary {
        let behaviors = self.behaviors.lock();
        let mut summary = PrefetcherSummary {
            behaviors: behaviors.len(),
            in_flight_bytes: self.accounting.in_flight_bytes(),
            ..PrefetcherSummary::default()
        };
        for behavior in behaviors.iter() {
            summary.queued_docs += behavior.queued_docs();
            summary.queued_bytes += behavior.queued_bytes();
            summary.future_batches += behavior.future_batch_count();
            summary.future_docs_estimate += behavior.future_docs_estimate();
        }
        summary
    }

    /// Cancel everything and dispose every behavior.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<_> = std::mem::take(&mut *self.behaviors.lock());
        for behavior in drained {
            behavior.dispose().await;
        }
        info!("Prefetcher shut down");
    }

    fn snapshot(&self) -> Vec<Arc<PrefetchingBehavior>> {
        self.behaviors.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use silt_storage::MemoryStore;

    fn prefetcher(store: Arc<MemoryStore>) -> Prefetcher {
        Prefetcher::new(
            store,
            PrefetchConfig::default(),
            TunerConfig::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_single_default_invariant() {
        let store = Arc::new(MemoryStore::new(1));
        let prefetcher = prefetcher(store);

        prefetcher.create_behavior("default", true).unwrap();
        let err = prefetcher.create_behavior("second-default", true).unwrap_err();
        assert!(matches!(err, PrefetchError::DefaultAlreadyRegistered));

        // Non-default behaviors are unrestricted.
        prefetcher.create_behavior("group", false).unwrap();
        assert_eq!(prefetcher.summary().behaviors, 2);
    }

    #[tokio::test]
    async fn test_behavior_for_prefers_existing_coverage() {
        let store = Arc::new(MemoryStore::new(1));
        let prefetcher = prefetcher(store.clone());
        let default = prefetcher.create_behavior("default", true).unwrap();

        let docs: Vec<_> = (0..3)
            .map(|i| store.put(format!("d/{i}"), json!({}), json!({})))
            .collect();
        default.after_commit(&docs);

        // Default covers this marker; no new behavior allocated.
        let routed = prefetcher.behavior_for(docs[0].etag).unwrap();
        assert!(routed.is_default());
        assert_eq!(prefetcher.summary().behaviors, 1);

        // A marker past everything known forces a fresh group behavior.
        let routed = prefetcher.behavior_for(docs[2].etag.incremented_by(100)).unwrap();
        assert!(!routed.is_default());
        assert_eq!(prefetcher.summary().behaviors, 2);
    }

    #[tokio::test]
    async fn test_remove_behavior_disposes() {
        let store = Arc::new(MemoryStore::new(1));
        let prefetcher = prefetcher(store);
        let behavior = prefetcher.create_behavior("group", false).unwrap();

        prefetcher.remove_behavior(&behavior).await;
        assert!(behavior.is_disposed());
        assert_eq!(prefetcher.summary().behaviors, 0);
    }

    #[tokio::test]
    async fn test_after_commit_reaches_only_default() {
        let store = Arc::new(MemoryStore::new(1));
        let prefetcher = prefetcher(store.clone());
        let default = prefetcher.create_behavior("default", true).unwrap();
        let group = prefetcher.create_behavior("group", false).unwrap();

        let doc = store.put("d/1", json!({}), json!({}));
        prefetcher.after_commit(std::slice::from_ref(&doc));

        assert_eq!(default.queued_docs(), 1);
        assert_eq!(group.queued_docs(), 0);
    }

    #[tokio::test]
    async fn test_after_delete_reaches_every_behavior() {
        let store = Arc::new(MemoryStore::new(1));
        let prefetcher = prefetcher(store);
        let default = prefetcher.create_behavior("default", true).unwrap();
        let group = prefetcher.create_behavior("group", false).unwrap();

        let doc = silt_types::DocumentRecord::new("d/1", Etag::new(1, 1), json!({}), json!({}));
        prefetcher.after_delete("d/1", Etag::new(1, 2));

        assert!(!default.filter_document(&doc));
        assert!(!group.filter_document(&doc));
    }

    #[tokio::test]
    async fn test_cycle_maintenance_disposes_idle_groups() {
        let store = Arc::new(MemoryStore::new(1));
        let prefetcher = prefetcher(store);
        let default = prefetcher.create_behavior("default", true).unwrap();
        let group = prefetcher.create_behavior("group", false).unwrap();
        group.mark_used(1);

        let idle_limit = PrefetchConfig::default().behavior_idle_rounds;
        prefetcher.cycle_maintenance(idle_limit + 5).await;

        assert!(group.is_disposed());
        assert!(!default.is_disposed()); // the default is never disposed
        assert_eq!(prefetcher.summary().behaviors, 1);
    }

    #[tokio::test]
    async fn test_low_memory_clears_everything() {
        let store = Arc::new(MemoryStore::new(1));
        let prefetcher = prefetcher(store.clone());
        let default = prefetcher.create_behavior("default", true).unwrap();

        let docs: Vec<_> = (0..4)
            .map(|i| store.put(format!("d/{i}"), json!({}), json!({})))
            .collect();
        default.after_commit(&docs);
        assert!(prefetcher.summary().queued_docs > 0);

        prefetcher.handle_low_memory().await;
        assert_eq!(prefetcher.summary().queued_docs, 0);
        assert_eq!(prefetcher.summary().future_batches, 0);
    }

    #[tokio::test]
    async fn test_shutdown_disposes_all() {
        let store = Arc::new(MemoryStore::new(1));
        let prefetcher = prefetcher(store);
        let default = prefetcher.create_behavior("default", true).unwrap();
        let group = prefetcher.create_behavior("group", false).unwrap();

        prefetcher.shutdown().await;
        assert!(default.is_disposed());
        assert!(group.is_disposed());
        assert_eq!(prefetcher.summary().behaviors, 0);
    }
}
