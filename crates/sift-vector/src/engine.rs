//! Engine facade: wires the store, coordinator, pipeline and query engine
//! from a [`SiftConfig`].

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use sift_core::config::{SiftConfig, StorageBackend};
use sift_core::error::Result;
use sift_core::types::{DocId, Generation, IncomingDocument, QueryRequest, ScoredDocument};
use sift_storage::{Database, DocumentRepository};

use crate::coordinator::IndexCoordinator;
use crate::embedding::DynEmbeddingService;
use crate::index::{IndexStats, IvfIndex};
use crate::pipeline::{BatchReport, IngestionPipeline};
use crate::search::QueryEngine;
use crate::store::{EmbeddingStore, StoreBackend};

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub documents: usize,
    pub dimension: usize,
    pub durable: bool,
    pub store_generation: Generation,
    pub served_generation: Generation,
    pub rebuilding: bool,
    /// `None` until an index has been built.
    pub index: Option<IndexStats>,
}

pub struct SiftEngine {
    config: SiftConfig,
    store: Arc<EmbeddingStore>,
    coordinator: Arc<IndexCoordinator>,
    pipeline: IngestionPipeline,
    query: QueryEngine,
}

impl SiftEngine {
    /// Open the engine on the configured storage backend.
    ///
    /// With `index.build_on_startup`, the persisted index is restored (or a
    /// fresh one built) before this returns.
    pub fn open(config: SiftConfig) -> Result<Self> {
        config.validate()?;
        let dimension = config.index.embedding_dim;

        let (store, persist_path) = match config.storage.backend {
            StorageBackend::Sqlite => {
                let db = Arc::new(Database::new(&config.database_path())?);
                let backend: Arc<dyn StoreBackend> = Arc::new(DocumentRepository::new(db));
                let store = EmbeddingStore::open(dimension, config.storage.shards, backend)?;
                (store, Some(config.index_path()))
            }
            // A persisted index would outlive the records it points at.
            StorageBackend::Memory => (
                EmbeddingStore::in_memory(dimension, config.storage.shards),
                None,
            ),
        };
        let store = Arc::new(store.with_retry_after(config.storage.retry_after_ms));

        let coordinator =
            IndexCoordinator::new(Arc::clone(&store), config.index.clone(), persist_path);
        let pipeline = IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            config.storage.operation_timeout_ms,
        );
        let query = QueryEngine::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            config.query.clone(),
        );

        if config.index.build_on_startup {
            coordinator.load_or_build()?;
        }
        info!(
            backend = ?config.storage.backend,
            documents = store.len(),
            generation = store.generation(),
            "Engine ready"
        );

        Ok(Self {
            config,
            store,
            coordinator,
            pipeline,
            query,
        })
    }

    /// Open with the memory backend regardless of `storage.backend`.
    pub fn in_memory(mut config: SiftConfig) -> Result<Self> {
        config.storage.backend = StorageBackend::Memory;
        Self::open(config)
    }

    /// Attach an embedding service for text ingestion and text queries.
    pub fn with_embedder(mut self, embedder: Arc<dyn DynEmbeddingService>) -> Self {
        self.pipeline = self.pipeline.with_embedder(Arc::clone(&embedder));
        self.query = self.query.with_embedder(embedder);
        self
    }

    pub fn config(&self) -> &SiftConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<IndexCoordinator> {
        &self.coordinator
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.query
    }

    pub fn ingest(&self, docs: Vec<IncomingDocument>) -> BatchReport {
        self.pipeline.ingest_batch(docs)
    }

    pub fn delete(&self, id: &DocId) -> Result<Option<Generation>> {
        self.pipeline.delete(id)
    }

    pub fn query(&self, request: &QueryRequest) -> Result<Vec<ScoredDocument>> {
        self.query.query(request)
    }

    /// Rebuild the index from the store and wait until it is served.
    pub async fn rebuild(&self) -> Result<Arc<IvfIndex>> {
        self.coordinator.rebuild().await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            documents: self.store.len(),
            dimension: self.store.dimension(),
            durable: self.store.is_durable(),
            store_generation: self.store.generation(),
            served_generation: self.coordinator.served_generation(),
            rebuilding: self.coordinator.is_rebuilding(),
            index: self.coordinator.stats(),
        }
    }
}

impl std::fmt::Debug for SiftEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiftEngine")
            .field("store", &self.store)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
