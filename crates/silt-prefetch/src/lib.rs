//! # silt-prefetch
//!
//! Speculative document loading for the Silt indexing pipeline.
//!
//! A [`PrefetchingBehavior`] serves document batches to one logical
//! consumer, preferring already-queued or background-loaded data over
//! synchronous disk reads. The [`Prefetcher`] multiplexes behaviors
//! across index groups, keeps cross-behavior memory accounting honest,
//! and disposes behaviors that fall out of use.

pub mod behavior;
pub mod error;
pub mod future_batch;
pub mod prefetcher;
pub mod queue;
pub mod tuner;

pub use behavior::{DocumentBatch, PrefetchingBehavior};
pub use error::PrefetchError;
pub use future_batch::{BatchKind, FutureBatch, FutureBatchTable};
pub use prefetcher::{Prefetcher, PrefetcherSummary};
pub use queue::PrefetchQueue;
pub use tuner::{BatchSizeTuner, InFlightBatch, MemoryAccounting};
