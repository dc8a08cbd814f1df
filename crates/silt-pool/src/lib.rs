//! # silt-pool
//!
//! Fixed-size worker pool for indexing and filtering work.
//!
//! The pool runs a fixed set of OS threads plus a handful of
//! designated "unstoppable" threads that survive CPU-pressure
//! throttling. Batch dispatch supports partial resumption: a call may
//! return once a majority of items completed, leaving stragglers to
//! finish asynchronously so one huge document cannot stall a whole
//! indexing round.

pub mod error;
pub mod hint;
pub mod latch;
pub mod pool;

pub use error::PoolError;
pub use hint::{NoopSchedulingHint, SchedulingHint};
pub use latch::CountdownLatch;
pub use pool::{BatchOutcome, CpuPressure, PoolStats, WorkerPool};
