//! Batch size auto-tuning and cross-behavior memory accounting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use silt_types::TunerConfig;

/// Shared memory bookkeeping across every prefetching behavior.
///
/// The in-flight table is keyed by an opaque batch id so concurrent
/// consumers never contend on a coarse lock; queue and future-batch
/// estimates are plain atomics updated by their owners.
#[derive(Default)]
pub struct MemoryAccounting {
    in_flight: Arc<DashMap<u64, usize>>,
    next_batch_id: AtomicU64,
    queued_bytes: AtomicUsize,
    future_batch_bytes: AtomicUsize,
}

impl MemoryAccounting {
    /// Create empty accounting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handed-out batch; the returned guard unregisters it
    /// on drop, on every exit path.
    pub fn register_batch(&self, bytes: usize) -> InFlightBatch {
        let id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        self.in_flight.insert(id, bytes);
        InFlightBatch {
            table: self.in_flight.clone(),
            id,
            bytes,
        }
    }

    /// Bytes currently held by handed-out batches.
    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight.iter().map(|entry| *entry.value()).sum()
    }

    /// Number of handed-out batches.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Adjust the queued-document byte total by a signed delta.
    pub fn adjust_queued_bytes(&self, delta: isize) {
        if delta >= 0 {
            self.queued_bytes.fetch_add(delta as usize, Ordering::SeqCst);
        } else {
            self.queued_bytes
                .fetch_sub(delta.unsigned_abs(), Ordering::SeqCst);
        }
    }

    /// Adjust the estimated future-batch byte total by a signed delta.
    pub fn adjust_future_bytes(&self, delta: isize) {
        if delta >= 0 {
            self.future_batch_bytes
                .fetch_add(delta as usize, Ordering::SeqCst);
        } else {
            self.future_batch_bytes
                .fetch_sub(delta.unsigned_abs(), Ordering::SeqCst);
        }
    }

    /// Bytes queued across all behaviors.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::SeqCst)
    }

    /// Estimated bytes of in-flight future batches.
    pub fn future_batch_bytes(&self) -> usize {
        self.future_batch_bytes.load(Ordering::SeqCst)
    }

    /// Everything the prefetching layer is currently holding or about
    /// to hold, process-wide.
    pub fn total_tracked_bytes(&self) -> usize {
        self.in_flight_bytes() + self.queued_bytes() + self.future_batch_bytes()
    }
}

/// RAII registration of a handed-out document batch.
///
/// Dropping the guard unregisters the batch from the shared table, so
/// release is guaranteed even when the consumer unwinds.
pub struct InFlightBatch {
    table: Arc<DashMap<u64, usize>>,
    id: u64,
    bytes: usize,
}

impl InFlightBatch {
    /// Registered size of this batch.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for InFlightBatch {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Feedback controller for the number of documents fetched per round.
pub struct BatchSizeTuner {
    config: TunerConfig,
    accounting: Arc<MemoryAccounting>,
    memory_budget_bytes: usize,
    batch_size: AtomicUsize,
}

impl BatchSizeTuner {
    /// Create a tuner starting at the configured initial batch size.
    pub fn new(
        config: TunerConfig,
        accounting: Arc<MemoryAccounting>,
        memory_budget_bytes: usize,
    ) -> Self {
        let initial = config
            .initial_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        Self {
            config,
            accounting,
            memory_budget_bytes,
            batch_size: AtomicUsize::new(initial),
        }
    }

    /// Current target document count per batch.
    pub fn number_of_items_per_batch(&self) -> usize {
        self.batch_size.load(Ordering::SeqCst)
    }

    /// Byte cap for a single storage fetch.
    pub fn max_fetch_bytes(&self) -> usize {
        self.config.max_fetch_bytes
    }

    /// Per-attempt disk fetch timeout.
    pub fn disk_fetch_timeout(&self) -> Duration {
        self.config.disk_fetch_timeout()
    }

    /// The shared accounting this tuner consults for memory headroom.
    pub fn accounting(&self) -> &Arc<MemoryAccounting> {
        &self.accounting
    }

    /// Adjust the batch size from an observed indexing round.
    ///
    /// Grows when indexing a full batch finished well under its time
    /// budget with memory to spare; shrinks when the round overran the
    /// budget or memory pressure was hit. Bounded by the configured
    /// min/max in both directions.
    pub fn auto_throttle(&self, items: usize, total_bytes: usize, indexing_duration: Duration) {
        let current = self.batch_size.load(Ordering::SeqCst);
        let budget = self.config.indexing_time_budget();
        let memory_pressure =
            self.accounting.total_tracked_bytes() + total_bytes > self.memory_budget_bytes;

        let target = if indexing_duration > budget || memory_pressure {
            (current / 2).max(self.config.min_batch_size)
        } else if items >= current && indexing_duration * 2 < budget {
            (current * 2).min(self.config.max_batch_size)
        } else {
            current
        };

        if target != current {
            self.batch_size.store(target, Ordering::SeqCst);
            debug!(
                from = current,
                to = target,
                items = items,
                bytes = total_bytes,
                duration_ms = indexing_duration.as_millis() as u64,
                "Batch size throttled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuner_with(config: TunerConfig) -> BatchSizeTuner {
        BatchSizeTuner::new(config, Arc::new(MemoryAccounting::new()), 1024 * 1024)
    }

    #[test]
    fn test_register_batch_releases_on_drop() {
        let accounting = Arc::new(MemoryAccounting::new());
        {
            let _guard = accounting.register_batch(512);
            let _other = accounting.register_batch(256);
            assert_eq!(accounting.in_flight_bytes(), 768);
            assert_eq!(accounting.in_flight_count(), 2);
        }
        assert_eq!(accounting.in_flight_bytes(), 0);
    }

    #[test]
    fn test_queued_byte_adjustment() {
        let accounting = MemoryAccounting::new();
        accounting.adjust_queued_bytes(100);
        accounting.adjust_queued_bytes(-40);
        assert_eq!(accounting.queued_bytes(), 60);
    }

    #[test]
    fn test_grow_on_fast_full_batch() {
        let tuner = tuner_with(TunerConfig {
            initial_batch_size: 128,
            min_batch_size: 64,
            max_batch_size: 512,
            indexing_time_budget_ms: 1000,
            ..TunerConfig::default()
        });

        tuner.auto_throttle(128, 1000, Duration::from_millis(100));
        assert_eq!(tuner.number_of_items_per_batch(), 256);
    }

    #[test]
    fn test_shrink_on_slow_round() {
        let tuner = tuner_with(TunerConfig {
            initial_batch_size: 256,
            min_batch_size: 64,
            max_batch_size: 512,
            indexing_time_budget_ms: 100,
            ..TunerConfig::default()
        });

        tuner.auto_throttle(256, 1000, Duration::from_millis(500));
        assert_eq!(tuner.number_of_items_per_batch(), 128);
    }

    #[test]
    fn test_bounds_are_respected() {
        let config = TunerConfig {
            initial_batch_size: 64,
            min_batch_size: 64,
            max_batch_size: 128,
            indexing_time_budget_ms: 1000,
            ..TunerConfig::default()
        };
        let tuner = tuner_with(config);

        // Shrinking below min stays at min.
        tuner.auto_throttle(64, 1000, Duration::from_secs(10));
        assert_eq!(tuner.number_of_items_per_batch(), 64);

        // Growing above max stays at max.
        tuner.auto_throttle(64, 10, Duration::from_millis(1));
        tuner.auto_throttle(128, 10, Duration::from_millis(1));
        assert_eq!(tuner.number_of_items_per_batch(), 128);
    }

    #[test]
    fn test_memory_pressure_shrinks_even_when_fast() {
        let accounting = Arc::new(MemoryAccounting::new());
        accounting.adjust_queued_bytes(900);
        let tuner = BatchSizeTuner::new(
            TunerConfig {
                initial_batch_size: 256,
                min_batch_size: 64,
                max_batch_size: 512,
                indexing_time_budget_ms: 1000,
                ..TunerConfig::default()
            },
            accounting,
            1000,
        );

        tuner.auto_throttle(256, 500, Duration::from_millis(10));
        assert_eq!(tuner.number_of_items_per_batch(), 128);
    }

    #[test]
    fn test_partial_batch_does_not_grow() {
        let tuner = tuner_with(TunerConfig {
            initial_batch_size: 128,
            min_batch_size: 64,
            max_batch_size: 512,
            indexing_time_budget_ms: 1000,
            ..TunerConfig::default()
        });

        // Fewer items than the target means demand, not capacity, was
        // the limit; the target stays put.
        tuner.auto_throttle(10, 100, Duration::from_millis(5));
        assert_eq!(tuner.number_of_items_per_batch(), 128);
    }
}
