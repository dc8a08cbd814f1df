//! Worker pool error types.

use thiserror::Error;

/// Errors that can occur in the worker pool
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool has been shut down and accepts no more work.
    #[error("Worker pool is shut down")]
    ShutDown,
}
