//! Query engine: approximate retrieval followed by exact re-ranking.
//!
//! The live index proposes `k * overshoot_factor` candidates. Each candidate
//! is re-fetched from the Embedding Store and scored exactly, so the final
//! ranking only depends on whether the true neighbours made it into the
//! candidate set. Candidates deleted since the index was built no longer
//! resolve and are dropped.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use sift_core::config::QueryConfig;
use sift_core::deadline::Deadline;
use sift_core::error::{Result, SiftError};
use sift_core::types::{DocumentRecord, QueryRequest, ScoredDocument, SearchMode};

use crate::coordinator::IndexCoordinator;
use crate::distance::cosine_similarity;
use crate::embedding::DynEmbeddingService;
use crate::store::EmbeddingStore;

/// Deadline checks during an exact scan happen every this many records.
const SCAN_CHECK_INTERVAL: usize = 1024;

pub struct QueryEngine {
    store: Arc<EmbeddingStore>,
    coordinator: Arc<IndexCoordinator>,
    config: QueryConfig,
    embedder: Option<Arc<dyn DynEmbeddingService>>,
}

impl QueryEngine {
    pub fn new(
        store: Arc<EmbeddingStore>,
        coordinator: Arc<IndexCoordinator>,
        config: QueryConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            config,
            embedder: None,
        }
    }

    /// Attach the service used by [`QueryEngine::search_text`].
    pub fn with_embedder(mut self, embedder: Arc<dyn DynEmbeddingService>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Run a query request.
    pub fn query(&self, request: &QueryRequest) -> Result<Vec<ScoredDocument>> {
        self.run(&request.embedding, request.k, request.mode)
    }

    /// Top `k` in the configured default mode.
    pub fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredDocument>> {
        self.run(embedding, k, None)
    }

    /// Top `k` by brute force over the whole store.
    pub fn exact_search(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredDocument>> {
        self.run(embedding, k, Some(SearchMode::Exact))
    }

    /// Embed `text` with the attached service, then search.
    pub async fn search_text(&self, text: &str, k: usize) -> Result<Vec<ScoredDocument>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| SiftError::Config("no embedding service configured".into()))?;
        let embedding = embedder.embed_boxed(text).await?;
        self.search(&embedding, k)
    }

    /// The mode a request will actually run in.
    pub fn resolve_mode(&self, requested: Option<SearchMode>) -> SearchMode {
        match requested.unwrap_or(self.config.default_mode) {
            SearchMode::Auto => {
                let threshold = self.config.brute_force_threshold;
                if threshold > 0 && self.store.len() <= threshold {
                    SearchMode::Exact
                } else {
                    SearchMode::Approximate
                }
            }
            mode => mode,
        }
    }

    fn run(
        &self,
        embedding: &[f32],
        k: usize,
        mode: Option<SearchMode>,
    ) -> Result<Vec<ScoredDocument>> {
        self.store.validate(embedding)?;
        let k = k.min(self.config.max_k);
        if k == 0 {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let deadline = Deadline::from_millis(self.config.timeout_ms);
        let mode = self.resolve_mode(mode);
        let ranked = match mode {
            SearchMode::Exact => self.exact(embedding, k, deadline)?,
            _ => self.approximate(embedding, k, deadline)?,
        };

        debug!(
            ?mode,
            k,
            results = ranked.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Query served"
        );
        Ok(ranked
            .into_iter()
            .map(|(score, record)| ScoredDocument {
                id: record.id.clone(),
                score,
                metadata: record.metadata.clone(),
            })
            .collect())
    }

    fn approximate(
        &self,
        embedding: &[f32],
        k: usize,
        deadline: Deadline,
    ) -> Result<Vec<(f64, Arc<DocumentRecord>)>> {
        let Some(index) = self.coordinator.current() else {
            debug!("No index has been built; returning no results");
            return Ok(Vec::new());
        };

        let wanted = k.saturating_mul(self.config.overshoot_factor).max(k);
        let hits = index.search(embedding, wanted, self.config.nprobe, deadline)?;

        let mut scored = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(record) = self.store.get(&hit.id, deadline)? else {
                continue;
            };
            scored.push((cosine_similarity(embedding, &record.embedding), record));
        }
        Ok(top_k(scored, k))
    }

    fn exact(
        &self,
        embedding: &[f32],
        k: usize,
        deadline: Deadline,
    ) -> Result<Vec<(f64, Arc<DocumentRecord>)>> {
        let snapshot = self.store.snapshot();
        let mut scored = Vec::with_capacity(snapshot.len());
        for (i, record) in snapshot.iter().enumerate() {
            if i % SCAN_CHECK_INTERVAL == 0 {
                deadline.check("query.exact")?;
            }
            scored.push((
                cosine_similarity(embedding, &record.embedding),
                Arc::clone(record),
            ));
        }
        Ok(top_k(scored, k))
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("config", &self.config)
            .field("embedder", &self.embedder.is_some())
            .finish()
    }
}

/// Score descending, identifier ascending.
fn by_rank(a: &(f64, Arc<DocumentRecord>), b: &(f64, Arc<DocumentRecord>)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id))
}

fn top_k(mut scored: Vec<(f64, Arc<DocumentRecord>)>, k: usize) -> Vec<(f64, Arc<DocumentRecord>)> {
    if scored.len() > k {
        scored.select_nth_unstable_by(k - 1, by_rank);
        scored.truncate(k);
    }
    scored.sort_by(by_rank);
    scored
}
