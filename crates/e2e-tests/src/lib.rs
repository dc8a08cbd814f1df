//! End-to-end test infrastructure for the Silt indexing pipeline.
//!
//! Provides a shared PipelineHarness wiring the in-memory store,
//! prefetcher, worker pool, and indexing executer together, plus a
//! collecting index implementation for asserting exactly which
//! documents each index saw.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use silt_indexing::{
    Index, IndexExecutionError, IndexRegistryBuilder, IndexingBatch, IndexingContext,
    IndexingExecuter, PerformanceStats,
};
use silt_pool::{NoopSchedulingHint, WorkerPool};
use silt_prefetch::Prefetcher;
use silt_storage::{DocumentStore, MemoryStore};
use silt_types::{DocumentRecord, IndexId, PipelineConfig, PoolConfig};

/// Failure an index should raise on its next execution.
#[derive(Clone)]
pub enum InjectedFailure {
    /// Out-of-memory signal.
    OutOfMemory,
    /// Corruption signal.
    Corruption,
    /// Generic failure, raised `n` times.
    Failed(u32),
}

/// Test index that records every document key it indexes.
pub struct CollectingIndex {
    id: IndexId,
    name: String,
    entities: Option<HashSet<String>>,
    seen_keys: Mutex<Vec<String>>,
    failure: Mutex<Option<InjectedFailure>>,
}

impl CollectingIndex {
    /// Index over every collection.
    pub fn new(id: u32, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: IndexId(id),
            name: name.into(),
            entities: None,
            seen_keys: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        })
    }

    /// Index restricted to the given collections.
    pub fn for_entities(id: u32, name: impl Into<String>, entities: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            id: IndexId(id),
            name: name.into(),
            entities: Some(entities.iter().map(|s| s.to_string()).collect()),
            seen_keys: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        })
    }

    /// Inject a failure for upcoming executions.
    pub fn inject(&self, failure: InjectedFailure) {
        *self.failure.lock() = Some(failure);
    }

    /// Every key indexed so far, in indexing order.
    pub fn seen_keys(&self) -> Vec<String> {
        self.seen_keys.lock().clone()
    }

    /// Number of documents indexed so far.
    pub fn seen_count(&self) -> usize {
        self.seen_keys.lock().len()
    }
}

impl Index for CollectingIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn entity_names(&self) -> Option<&HashSet<String>> {
        self.entities.as_ref()
    }

    fn execute(
        &self,
        batch: &IndexingBatch,
        _ctx: &IndexingContext,
    ) -> Result<PerformanceStats, IndexExecutionError> {
        let mut failure = self.failure.lock();
        match failure.take() {
            Some(InjectedFailure::OutOfMemory) => {
                return Err(IndexExecutionError::OutOfMemory("injected".into()));
            }
            Some(InjectedFailure::Corruption) => {
                return Err(IndexExecutionError::Corruption("injected".into()));
            }
            Some(InjectedFailure::Failed(n)) => {
                if n > 1 {
                    *failure = Some(InjectedFailure::Failed(n - 1));
                }
                return Err(IndexExecutionError::Failed("injected".into()));
            }
            None => {}
        }
        drop(failure);

        let mut seen = self.seen_keys.lock();
        for work in &batch.work {
            seen.push(work.doc.key.clone());
        }
        Ok(PerformanceStats {
            items_indexed: batch.len(),
            bytes_indexed: batch.total_bytes(),
            duration: std::time::Duration::ZERO,
        })
    }
}

/// Shared harness wiring the full pipeline over an in-memory store.
pub struct PipelineHarness {
    /// The in-memory document store.
    pub store: Arc<MemoryStore>,
    /// The prefetcher multiplexer.
    pub prefetcher: Arc<Prefetcher>,
    /// The indexing executer.
    pub executer: Arc<IndexingExecuter>,
    /// The worker pool (kept alive for the harness lifetime).
    pub pool: Arc<WorkerPool>,
    /// Process-wide shutdown token.
    pub shutdown: CancellationToken,
}

impl PipelineHarness {
    /// Wire a harness around the given indexes with default config.
    pub async fn new(indexes: Vec<Arc<CollectingIndex>>) -> Self {
        Self::with_config(indexes, PipelineConfig::default()).await
    }

    /// Wire a harness with explicit configuration.
    pub async fn with_config(
        indexes: Vec<Arc<CollectingIndex>>,
        mut config: PipelineConfig,
    ) -> Self {
        // Keep retry backoff snappy under test.
        config.executer.metadata_retry_backoff_ms = 1;

        let store = Arc::new(MemoryStore::new(1));
        let shutdown = CancellationToken::new();

        let prefetcher = Arc::new(Prefetcher::new(
            store.clone(),
            config.prefetch.clone(),
            config.tuner.clone(),
            shutdown.child_token(),
        ));
        prefetcher
            .create_behavior("default", true)
            .expect("default behavior");

        let pool = Arc::new(WorkerPool::new(
            PoolConfig {
                workers: 4,
                unstoppable_workers: 1,
                ..config.pool.clone()
            },
            Box::new(NoopSchedulingHint),
        ));

        let mut builder = IndexRegistryBuilder::new();
        for index in indexes {
            builder = builder.register(index);
        }
        let executer = IndexingExecuter::new(
            store.clone(),
            prefetcher.clone(),
            pool.clone(),
            builder.build().expect("registry"),
            config.executer.clone(),
            shutdown.child_token(),
        );
        executer.initialize().await.expect("initialize");

        Self {
            store,
            prefetcher,
            executer,
            pool,
            shutdown,
        }
    }

    /// Write a document and notify the commit path, as the server's
    /// write pipeline would.
    pub fn write(&self, key: &str, collection: &str, body: serde_json::Value) -> DocumentRecord {
        let doc = self
            .store
            .put(key, body, json!({"collection": collection}));
        self.executer.note_commit(std::slice::from_ref(&doc));
        doc
    }

    /// Write a batch of documents as one commit.
    pub fn write_many(&self, collection: &str, keys: &[&str]) -> Vec<DocumentRecord> {
        let docs: Vec<DocumentRecord> = keys
            .iter()
            .map(|key| {
                self.store
                    .put(*key, json!({"k": *key}), json!({"collection": collection}))
            })
            .collect();
        self.executer.note_commit(&docs);
        docs
    }

    /// Delete a document and notify the pipeline.
    pub fn delete(&self, key: &str) {
        if let Some(deletion_etag) = self.store.delete(key) {
            self.executer.note_delete(key, deletion_etag);
        }
    }

    /// Run rounds until the pipeline reports idle (bounded).
    pub async fn run_until_idle(&self) {
        for _ in 0..32 {
            let summary = self.executer.execute_round().await.expect("round");
            if summary.idle {
                return;
            }
        }
        panic!("pipeline did not reach idle within 32 rounds");
    }

    /// The store's current last document marker.
    pub async fn last_etag(&self) -> silt_types::Etag {
        self.store.last_document_etag().await.expect("last etag")
    }
}
