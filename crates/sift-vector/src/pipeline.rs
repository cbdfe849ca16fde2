//! sift ingestion pipeline.
//!
//! Admits batches of (identifier, embedding, metadata) triples. Each item is
//! validated and written to the Embedding Store on its own; a rejected item
//! is reported and the rest of the batch carries on. The writes that changed
//! the store are then applied to the live index in one step.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use sift_core::deadline::Deadline;
use sift_core::error::{Result, SiftError};
use sift_core::types::{DocId, DocumentMetadata, Generation, IncomingDocument};

use crate::coordinator::IndexCoordinator;
use crate::embedding::DynEmbeddingService;
use crate::store::{EmbeddingStore, PutChange, PutOutcome};

/// Outcome of one item in a batch.
#[derive(Debug)]
pub struct IngestResult {
    pub id: DocId,
    pub outcome: Result<PutChange>,
}

impl IngestResult {
    pub fn is_accepted(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Per-item results of a batch plus the generation to wait for.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<IngestResult>,
    /// Highest generation written by this batch; `None` when nothing changed.
    pub generation: Option<Generation>,
}

/// Serializable roll-up of a [`BatchReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub accepted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
    pub errors: Vec<RejectedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedItem {
    pub id: String,
    pub error: String,
    pub retryable: bool,
}

impl BatchReport {
    pub fn accepted(&self) -> usize {
        self.results.iter().filter(|r| r.is_accepted()).count()
    }

    pub fn rejected(&self) -> usize {
        self.results.len() - self.accepted()
    }

    fn count(&self, change: PutChange) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Ok(c) if c == change))
            .count()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            accepted: self.accepted(),
            inserted: self.count(PutChange::Inserted),
            updated: self.count(PutChange::Updated),
            unchanged: self.count(PutChange::Unchanged),
            rejected: self.rejected(),
            generation: self.generation,
            errors: self
                .results
                .iter()
                .filter_map(|r| match &r.outcome {
                    Err(e) => Some(RejectedItem {
                        id: r.id.to_string(),
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                    }),
                    Ok(_) => None,
                })
                .collect(),
        }
    }
}

/// The main sift ingestion pipeline.
///
/// Processes incoming documents through:
/// 1. Validation against the deployment dimension
/// 2. An atomic per-identifier store write
/// 3. Incremental insertion into the live index
pub struct IngestionPipeline {
    store: Arc<EmbeddingStore>,
    coordinator: Arc<IndexCoordinator>,
    operation_timeout_ms: u64,
    embedder: Option<Arc<dyn DynEmbeddingService>>,
}

impl IngestionPipeline {
    /// `operation_timeout_ms` bounds each store write and index update
    /// (0 disables the deadline).
    pub fn new(
        store: Arc<EmbeddingStore>,
        coordinator: Arc<IndexCoordinator>,
        operation_timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            coordinator,
            operation_timeout_ms,
            embedder: None,
        }
    }

    /// Attach the service used by [`IngestionPipeline::ingest_text`].
    pub fn with_embedder(mut self, embedder: Arc<dyn DynEmbeddingService>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    fn deadline(&self) -> Deadline {
        Deadline::from_millis(self.operation_timeout_ms)
    }

    /// Ingest a batch. Never fails as a whole: per-item errors are in the
    /// report, and a batch that timed out part way can be sent again.
    pub fn ingest_batch(&self, docs: Vec<IncomingDocument>) -> BatchReport {
        let mut report = BatchReport {
            results: Vec::with_capacity(docs.len()),
            generation: None,
        };
        let mut changed = Vec::new();

        for doc in docs {
            let id = doc.id.clone();
            let outcome = self
                .store
                .put(doc.id, doc.embedding, doc.metadata, self.deadline());
            let outcome = match outcome {
                Ok(put) => {
                    if put.is_changed() {
                        report.generation = report.generation.max(Some(put.generation()));
                        changed.push(put.record);
                    }
                    Ok(put.change)
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Rejected document");
                    Err(e)
                }
            };
            report.results.push(IngestResult { id, outcome });
        }

        self.apply_to_index(&changed, &[]);

        info!(
            accepted = report.accepted(),
            changed = changed.len(),
            rejected = report.rejected(),
            generation = ?report.generation,
            "Batch ingested"
        );
        report
    }

    /// Ingest a single document, failing on a rejected item.
    pub fn ingest_one(&self, doc: IncomingDocument) -> Result<PutOutcome> {
        let put = self
            .store
            .put(doc.id, doc.embedding, doc.metadata, self.deadline())?;
        if put.is_changed() {
            self.apply_to_index(std::slice::from_ref(&put.record), &[]);
        }
        debug!(id = %put.record.id, change = ?put.change, "Document ingested");
        Ok(put)
    }

    /// Delete a document. Returns the delete's generation, or `None` when
    /// the identifier was not stored.
    pub fn delete(&self, id: &DocId) -> Result<Option<Generation>> {
        let generation = self.store.delete(id, self.deadline())?;
        match generation {
            Some(g) => {
                self.apply_to_index(&[], &[(id.clone(), g)]);
                info!(id = %id, generation = g, "Document deleted");
            }
            None => debug!(id = %id, "Delete of unknown document"),
        }
        Ok(generation)
    }

    /// Embed `text` with the attached service and ingest the result.
    pub async fn ingest_text(
        &self,
        id: DocId,
        text: &str,
        metadata: DocumentMetadata,
    ) -> Result<PutOutcome> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| SiftError::Config("no embedding service configured".into()))?;
        if embedder.dimensions() != self.store.dimension() {
            return Err(SiftError::Config(format!(
                "embedding service produces {} dimensions, store expects {}",
                embedder.dimensions(),
                self.store.dimension()
            )));
        }
        let embedding = embedder.embed_boxed(text).await?;
        self.ingest_one(IncomingDocument::new(id, embedding, metadata))
    }

    /// Index failures never undo a store write; the next build picks the
    /// write up instead.
    fn apply_to_index(
        &self,
        records: &[Arc<sift_core::types::DocumentRecord>],
        deletes: &[(DocId, Generation)],
    ) {
        if let Err(e) = self.coordinator.apply(records, deletes, self.deadline()) {
            warn!(error = %e, "Incremental index update failed; a rebuild will pick it up");
        }
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<IndexCoordinator> {
        &self.coordinator
    }
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("operation_timeout_ms", &self.operation_timeout_ms)
            .field("embedder", &self.embedder.is_some())
            .finish()
    }
}
