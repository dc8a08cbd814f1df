//! Index identifiers and priorities.

use serde::{Deserialize, Serialize};

/// Identifier of a registered index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexId(pub u32);

impl std::fmt::Display for IndexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "index-{}", self.0)
    }
}

/// Scheduling priority of an index, persisted alongside its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexPriority {
    /// Indexed every round.
    #[default]
    Normal,
    /// Indexed only when no normal-priority work is pending.
    Idle,
    /// Excluded from rounds until re-enabled by an operator.
    Disabled,
}

impl std::fmt::Display for IndexPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexPriority::Normal => write!(f, "normal"),
            IndexPriority::Idle => write!(f, "idle"),
            IndexPriority::Disabled => write!(f, "disabled"),
        }
    }
}
