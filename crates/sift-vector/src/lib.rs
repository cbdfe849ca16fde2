//! sift vector crate - embedding store, partitioned index, ingestion and search.
//!
//! Provides a sharded Embedding Store over an optional SQLite backend, an
//! inverted-file (IVF) index trained with spherical k-means, a coordinator
//! that swaps rebuilt indexes in atomically, the ingestion pipeline, the
//! two-phase query engine, and JSONL import/export.

pub mod coordinator;
pub mod distance;
pub mod embedding;
pub mod engine;
pub mod index;
pub mod kmeans;
mod locks;
pub mod persist;
pub mod pipeline;
pub mod search;
pub mod store;
pub mod transfer;

pub use coordinator::IndexCoordinator;
pub use embedding::{DynEmbeddingService, EmbeddingService, MockEmbedding};
pub use engine::{EngineStats, SiftEngine};
pub use index::{IndexHit, IndexStats, IvfIndex};
pub use pipeline::{BatchReport, BatchSummary, IngestResult, IngestionPipeline};
pub use search::QueryEngine;
pub use store::{EmbeddingStore, PutChange, PutOutcome, StoreSnapshot};
pub use transfer::{export_jsonl, import_jsonl, ImportReport};
