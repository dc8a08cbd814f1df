//! Explicit index registry.
//!
//! The pipeline never discovers work dynamically: every index and
//! transformer is handed to the builder up front, and duplicate ids
//! are rejected before the executer ever runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use silt_types::IndexId;

use crate::error::IndexingError;
use crate::index::Index;

/// Builder collecting index definitions before the pipeline starts.
#[derive(Default)]
pub struct IndexRegistryBuilder {
    indexes: Vec<Arc<dyn Index>>,
}

impl IndexRegistryBuilder {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an index definition.
    pub fn register(mut self, index: Arc<dyn Index>) -> Self {
        self.indexes.push(index);
        self
    }

    /// Finalize the registry, rejecting duplicate ids.
    pub fn build(self) -> Result<IndexRegistry, IndexingError> {
        let mut indexes = BTreeMap::new();
        for index in self.indexes {
            let id = index.id();
            if indexes.insert(id, index).is_some() {
                return Err(IndexingError::DuplicateIndex(id));
            }
        }
        Ok(IndexRegistry { indexes })
    }
}

/// Immutable set of registered indexes.
pub struct IndexRegistry {
    indexes: BTreeMap<IndexId, Arc<dyn Index>>,
}

impl IndexRegistry {
    /// Look up an index by id.
    pub fn get(&self, id: IndexId) -> Option<&Arc<dyn Index>> {
        self.indexes.get(&id)
    }

    /// Iterate over every registered index, ascending by id.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Index>> {
        self.indexes.values()
    }

    /// Number of registered indexes.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}
