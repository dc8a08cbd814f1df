//! Per-index runtime state and queryable alerts.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use silt_types::{Etag, IndexId, IndexPriority};

/// Kinds of index-level alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Index computation ran out of memory; the index was disabled.
    OutOfMemory,
    /// Corrupted index state; the index was disabled immediately.
    Corruption,
    /// The consecutive-failure threshold was crossed; the index was
    /// abandoned.
    RepeatedFailures,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::OutOfMemory => write!(f, "out-of-memory"),
            AlertKind::Corruption => write!(f, "corruption"),
            AlertKind::RepeatedFailures => write!(f, "repeated-failures"),
        }
    }
}

/// A queryable index-level alert.
#[derive(Debug, Clone)]
pub struct Alert {
    /// The index the alert concerns.
    pub index_id: IndexId,
    /// Alert classification.
    pub kind: AlertKind,
    /// Failure detail.
    pub message: String,
    /// When the alert was raised.
    pub at: DateTime<Utc>,
}

/// Accumulates alerts; persistent per-index errors surface here, never
/// as a crash of the pipeline.
#[derive(Default)]
pub struct AlertLog {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an alert.
    pub fn raise(&self, index_id: IndexId, kind: AlertKind, message: impl Into<String>) {
        self.alerts.lock().push(Alert {
            index_id,
            kind,
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Snapshot of every alert raised so far.
    pub fn snapshot(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    /// Alerts raised for one index.
    pub fn for_index(&self, index_id: IndexId) -> Vec<Alert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.index_id == index_id)
            .cloned()
            .collect()
    }

    /// Total alert count.
    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    /// True when no alert has been raised.
    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }
}

/// Observable snapshot of one index's runtime state.
#[derive(Debug, Clone)]
pub struct IndexStateSnapshot {
    /// Index id.
    pub index_id: IndexId,
    /// Index name.
    pub name: String,
    /// Persisted resume cursor.
    pub last_indexed_etag: Etag,
    /// When the cursor last advanced.
    pub last_indexed_at: DateTime<Utc>,
    /// Last time a query touched this index, when known.
    pub last_query_time: Option<DateTime<Utc>>,
    /// Scheduling priority.
    pub priority: IndexPriority,
    /// Consecutive generic failures so far.
    pub consecutive_failures: u32,
    /// Total documents indexed since startup.
    pub docs_indexed_total: u64,
}
