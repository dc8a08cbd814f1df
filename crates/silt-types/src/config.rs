//! Configuration for the indexing pipeline.
//!
//! Layered loading: defaults -> optional TOML file -> `SILT_*` env
//! vars. Overload-protection heuristics are tunables with conservative
//! defaults, not load-bearing constants.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Prefetching behavior tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Cap on concurrently in-flight future batches per behavior
    /// (default: 5).
    #[serde(default = "default_max_future_batches")]
    pub max_future_batches: usize,

    /// Rounds a future batch may sit unconsumed before it is cancelled
    /// and dropped (default: 64).
    #[serde(default = "default_future_batch_max_age_rounds")]
    pub future_batch_max_age_rounds: u64,

    /// Ingest-to-consumption rate ratio above which after-commit
    /// collection is considered overloaded (default: 1.5).
    #[serde(default = "default_ingest_overload_ratio")]
    pub ingest_overload_ratio: f64,

    /// Consecutive overloaded commits before after-commit collection
    /// is disabled and the queue is purged (default: 3).
    #[serde(default = "default_ingest_overload_commits")]
    pub ingest_overload_commits: u32,

    /// Wall-clock limit for a single batch retrieval loop (default:
    /// 500ms).
    #[serde(default = "default_prefetch_duration_limit_ms")]
    pub prefetch_duration_limit_ms: u64,

    /// Process-wide budget for queued documents, future batches, and
    /// in-flight batches across all behaviors (default: 256 MiB).
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: usize,

    /// Disk-load timeouts observed before an anticipated batch is
    /// split into parallel sub-fetches (default: 5).
    #[serde(default = "default_io_stall_split_threshold")]
    pub io_stall_split_threshold: u32,

    /// Rounds a non-default behavior may sit unused before disposal
    /// (default: 16).
    #[serde(default = "default_behavior_idle_rounds")]
    pub behavior_idle_rounds: u64,
}

fn default_max_future_batches() -> usize {
    5
}

fn default_future_batch_max_age_rounds() -> u64 {
    64
}

fn default_ingest_overload_ratio() -> f64 {
    1.5
}

fn default_ingest_overload_commits() -> u32 {
    3
}

fn default_prefetch_duration_limit_ms() -> u64 {
    500
}

fn default_memory_budget_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_io_stall_split_threshold() -> u32 {
    5
}

fn default_behavior_idle_rounds() -> u64 {
    16
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_future_batches: default_max_future_batches(),
            future_batch_max_age_rounds: default_future_batch_max_age_rounds(),
            ingest_overload_ratio: default_ingest_overload_ratio(),
            ingest_overload_commits: default_ingest_overload_commits(),
            prefetch_duration_limit_ms: default_prefetch_duration_limit_ms(),
            memory_budget_bytes: default_memory_budget_bytes(),
            io_stall_split_threshold: default_io_stall_split_threshold(),
            behavior_idle_rounds: default_behavior_idle_rounds(),
        }
    }
}

impl PrefetchConfig {
    /// Wall-clock limit as a [`Duration`].
    pub fn prefetch_duration_limit(&self) -> Duration {
        Duration::from_millis(self.prefetch_duration_limit_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_future_batches == 0 {
            return Err("max_future_batches must be > 0".to_string());
        }
        if self.ingest_overload_ratio <= 1.0 {
            return Err(format!(
                "ingest_overload_ratio must be > 1.0, got {}",
                self.ingest_overload_ratio
            ));
        }
        if self.memory_budget_bytes == 0 {
            return Err("memory_budget_bytes must be > 0".to_string());
        }
        Ok(())
    }
}

/// Batch size auto-tuner tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Starting document count per batch (default: 512).
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,

    /// Lower bound the tuner may shrink to (default: 64).
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Upper bound the tuner may grow to (default: 16384).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Byte cap for a single storage fetch (default: 64 MiB).
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: usize,

    /// Per-attempt disk fetch timeout (default: 5s).
    #[serde(default = "default_disk_fetch_timeout_ms")]
    pub disk_fetch_timeout_ms: u64,

    /// Time budget an indexing round is tuned against (default: 2s).
    #[serde(default = "default_indexing_time_budget_ms")]
    pub indexing_time_budget_ms: u64,
}

fn default_initial_batch_size() -> usize {
    512
}

fn default_min_batch_size() -> usize {
    64
}

fn default_max_batch_size() -> usize {
    16384
}

fn default_max_fetch_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_disk_fetch_timeout_ms() -> u64 {
    5000
}

fn default_indexing_time_budget_ms() -> u64 {
    2000
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: default_initial_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            max_fetch_bytes: default_max_fetch_bytes(),
            disk_fetch_timeout_ms: default_disk_fetch_timeout_ms(),
            indexing_time_budget_ms: default_indexing_time_budget_ms(),
        }
    }
}

impl TunerConfig {
    /// Disk fetch timeout as a [`Duration`].
    pub fn disk_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.disk_fetch_timeout_ms)
    }

    /// Indexing time budget as a [`Duration`].
    pub fn indexing_time_budget(&self) -> Duration {
        Duration::from_millis(self.indexing_time_budget_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_batch_size == 0 {
            return Err("min_batch_size must be > 0".to_string());
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(format!(
                "min_batch_size {} exceeds max_batch_size {}",
                self.min_batch_size, self.max_batch_size
            ));
        }
        if !(self.min_batch_size..=self.max_batch_size).contains(&self.initial_batch_size) {
            return Err(format!(
                "initial_batch_size {} outside [{}, {}]",
                self.initial_batch_size, self.min_batch_size, self.max_batch_size
            ));
        }
        Ok(())
    }
}

/// Indexing executer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuterConfig {
    /// Retries for an optimistic-concurrency metadata write
    /// (default: 10).
    #[serde(default = "default_metadata_write_retries")]
    pub metadata_write_retries: u32,

    /// Fixed backoff between metadata write retries (default: 50ms).
    #[serde(default = "default_metadata_retry_backoff_ms")]
    pub metadata_retry_backoff_ms: u64,

    /// Consecutive generic failures before an index is abandoned with
    /// an alert (default: 3).
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Idle sleep between rounds when no commit wakes the loop
    /// (default: 1000ms).
    #[serde(default = "default_idle_round_delay_ms")]
    pub idle_round_delay_ms: u64,
}

fn default_metadata_write_retries() -> u32 {
    10
}

fn default_metadata_retry_backoff_ms() -> u64 {
    50
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_idle_round_delay_ms() -> u64 {
    1000
}

impl Default for ExecuterConfig {
    fn default() -> Self {
        Self {
            metadata_write_retries: default_metadata_write_retries(),
            metadata_retry_backoff_ms: default_metadata_retry_backoff_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            idle_round_delay_ms: default_idle_round_delay_ms(),
        }
    }
}

impl ExecuterConfig {
    /// Retry backoff as a [`Duration`].
    pub fn metadata_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.metadata_retry_backoff_ms)
    }

    /// Idle delay as a [`Duration`].
    pub fn idle_round_delay(&self) -> Duration {
        Duration::from_millis(self.idle_round_delay_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.metadata_write_retries == 0 {
            return Err("metadata_write_retries must be > 0".to_string());
        }
        if self.max_consecutive_failures == 0 {
            return Err("max_consecutive_failures must be > 0".to_string());
        }
        Ok(())
    }
}

/// Worker pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker thread count; 0 means one per core (default: 0).
    #[serde(default)]
    pub workers: usize,

    /// Threads that are never throttled away under CPU pressure
    /// (default: 2).
    #[serde(default = "default_unstoppable_workers")]
    pub unstoppable_workers: usize,

    /// Fraction of items that must be done before a
    /// partial-resumption call may return (default: 0.5).
    #[serde(default = "default_partial_completion_ratio")]
    pub partial_completion_ratio: f64,

    /// Fraction of workers that must be free before a
    /// partial-resumption call may return (default: 0.5).
    #[serde(default = "default_free_thread_ratio")]
    pub free_thread_ratio: f64,
}

fn default_unstoppable_workers() -> usize {
    2
}

fn default_partial_completion_ratio() -> f64 {
    0.5
}

fn default_free_thread_ratio() -> f64 {
    0.5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            unstoppable_workers: default_unstoppable_workers(),
            partial_completion_ratio: default_partial_completion_ratio(),
            free_thread_ratio: default_free_thread_ratio(),
        }
    }
}

impl PoolConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.partial_completion_ratio) {
            return Err(format!(
                "partial_completion_ratio must be 0.0-1.0, got {}",
                self.partial_completion_ratio
            ));
        }
        if !(0.0..=1.0).contains(&self.free_thread_ratio) {
            return Err(format!(
                "free_thread_ratio must be 0.0-1.0, got {}",
                self.free_thread_ratio
            ));
        }
        Ok(())
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Prefetching behavior tunables.
    #[serde(default)]
    pub prefetch: PrefetchConfig,

    /// Batch size auto-tuner tunables.
    #[serde(default)]
    pub tuner: TunerConfig,

    /// Indexing executer tunables.
    #[serde(default)]
    pub executer: ExecuterConfig,

    /// Worker pool tunables.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl PipelineConfig {
    /// Load configuration: defaults -> optional file -> `SILT_*` env.
    ///
    /// Env vars use `__` as the section separator, e.g.
    /// `SILT_PREFETCH__MAX_FUTURE_BATCHES=8`.
    pub fn load(path: Option<&Path>) -> Result<Self, TypesError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let settings = builder
            .add_source(Environment::with_prefix("SILT").separator("__"))
            .build()?;

        let config: PipelineConfig = settings.try_deserialize()?;
        config.validate().map_err(TypesError::Validation)?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.prefetch.validate()?;
        self.tuner.validate()?;
        self.executer.validate()?;
        self.pool.validate()?;
        Ok(())
    }
}
