//! End-to-end tests for the sift engine.
//!
//! Covers the three-document scenario, deletion, recall of the two-phase
//! query path against a brute-force oracle, determinism, and concurrent
//! readers racing writers and rebuilds.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sift_core::config::SiftConfig;
use sift_core::deadline::Deadline;
use sift_core::types::{DocId, DocumentMetadata, IncomingDocument, QueryRequest, SearchMode};
use sift_vector::SiftEngine;

// =============================================================================
// Helpers
// =============================================================================

fn config(dimension: usize) -> SiftConfig {
    let mut config = SiftConfig::default();
    config.index.embedding_dim = dimension;
    config.index.build_on_startup = false;
    config.index.persist = false;
    config.storage.operation_timeout_ms = 0;
    config.query.timeout_ms = 0;
    config
}

fn doc(id: &str, embedding: Vec<f32>) -> IncomingDocument {
    IncomingDocument::new(
        DocId::new(id).unwrap(),
        embedding,
        DocumentMetadata::titled(format!("title {}", id)),
    )
}

fn ids(results: &[sift_core::types::ScoredDocument]) -> Vec<String> {
    results.iter().map(|r| r.id.to_string()).collect()
}

/// Small deterministic generator so corpora are identical across runs.
struct Lcg(u64);

impl Lcg {
    fn next_f32(&mut self) -> f32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((self.0 >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }

    fn vector(&mut self, dimension: usize) -> Vec<f32> {
        (0..dimension).map(|_| self.next_f32()).collect()
    }
}

/// `clusters` random centres with `per_cluster` noisy points around each.
fn clustered_corpus(
    seed: u64,
    dimension: usize,
    clusters: usize,
    per_cluster: usize,
) -> (Vec<IncomingDocument>, Vec<Vec<f32>>) {
    let mut rng = Lcg(seed);
    let centres: Vec<Vec<f32>> = (0..clusters).map(|_| rng.vector(dimension)).collect();
    let mut docs = Vec::with_capacity(clusters * per_cluster);
    for (c, centre) in centres.iter().enumerate() {
        for p in 0..per_cluster {
            let embedding = centre
                .iter()
                .map(|x| x + 0.35 * rng.next_f32())
                .collect();
            docs.push(doc(&format!("c{:03}-p{:03}", c, p), embedding));
        }
    }
    (docs, centres)
}

const ABC: [(&str, [f32; 4]); 3] = [
    ("A", [1.0, 0.0, 0.0, 0.0]),
    ("B", [0.0, 1.0, 0.0, 0.0]),
    ("C", [0.9, 0.1, 0.0, 0.0]),
];

fn abc_engine() -> SiftEngine {
    let engine = SiftEngine::in_memory(config(4)).unwrap();
    let report = engine.ingest(ABC.iter().map(|(id, v)| doc(id, v.to_vec())).collect());
    assert_eq!(report.accepted(), 3);
    engine.coordinator().rebuild_now().unwrap();
    engine
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_three_document_scenario() {
    let engine = abc_engine();
    let results = engine
        .query(&QueryRequest::new(vec![1.0, 0.0, 0.0, 0.0], 2))
        .unwrap();

    assert_eq!(ids(&results), vec!["A", "C"]);
    assert!((results[0].score - 1.0).abs() < 1e-9);
    assert!((results[1].score - 0.9938837).abs() < 1e-6);
    assert_eq!(results[0].metadata.title, "title A");
}

#[test]
fn test_deletion_scenario() {
    let engine = abc_engine();
    let q = QueryRequest::new(vec![1.0, 0.0, 0.0, 0.0], 2);

    let generation = engine.delete(&DocId::new("A").unwrap()).unwrap().unwrap();
    assert_eq!(generation, 4);

    // Before any rebuild the stale candidate is dropped.
    let results = engine.query(&q).unwrap();
    assert_eq!(results[0].id.as_str(), "C");
    assert!(results.iter().all(|r| r.id.as_str() != "A"));

    engine.coordinator().rebuild_now().unwrap();
    assert!(engine.coordinator().served_generation() >= generation);
    for k in 1..=3 {
        let results = engine
            .query(&QueryRequest::new(vec![1.0, 0.0, 0.0, 0.0], k))
            .unwrap();
        assert_eq!(results[0].id.as_str(), "C");
        assert!(results.iter().all(|r| r.id.as_str() != "A"));
    }
    let exact = engine
        .query(&QueryRequest::new(vec![1.0, 0.0, 0.0, 0.0], 3).with_mode(SearchMode::Exact))
        .unwrap();
    assert_eq!(ids(&exact), vec!["C", "B"]);
}

#[test]
fn test_update_replaces_embedding() {
    let engine = abc_engine();
    engine.ingest(vec![doc("B", vec![1.0, 0.0, 0.0, 0.0])]);

    let results = engine
        .query(&QueryRequest::new(vec![1.0, 0.0, 0.0, 0.0], 2))
        .unwrap();
    // A and B tie at 1.0; the identifier breaks the tie.
    assert_eq!(ids(&results), vec!["A", "B"]);
    assert!((results[1].score - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_acknowledged_write_is_searchable() {
    let engine = SiftEngine::in_memory(config(4)).unwrap();
    let report = engine.ingest(ABC.iter().map(|(id, v)| doc(id, v.to_vec())).collect());
    let generation = report.generation.unwrap();

    engine
        .coordinator()
        .wait_for_generation(generation, Duration::from_secs(10))
        .await
        .unwrap();
    let results = engine
        .query(&QueryRequest::new(vec![0.0, 1.0, 0.0, 0.0], 1))
        .unwrap();
    assert_eq!(ids(&results), vec!["B"]);
}

#[tokio::test]
async fn test_first_write_after_startup_build_is_searchable_once_acknowledged() {
    let mut config = config(4);
    config.index.build_on_startup = true;
    let engine = SiftEngine::in_memory(config).unwrap();
    // The startup build on an empty store serves an index with no partitions.
    assert!(engine.coordinator().current().unwrap().is_empty());

    let report = engine.ingest(vec![doc("A", vec![1.0, 0.0, 0.0, 0.0])]);
    let generation = report.generation.unwrap();
    engine
        .coordinator()
        .wait_for_generation(generation, Duration::from_secs(10))
        .await
        .unwrap();

    let results = engine
        .query(&QueryRequest::new(vec![1.0, 0.0, 0.0, 0.0], 1))
        .unwrap();
    assert_eq!(ids(&results), vec!["A"]);
}

#[test]
fn test_query_before_any_index_is_empty() {
    let engine = SiftEngine::in_memory(config(4)).unwrap();
    let results = engine
        .query(&QueryRequest::new(vec![1.0, 0.0, 0.0, 0.0], 5))
        .unwrap();
    assert!(results.is_empty());
}

// =============================================================================
// Recall
// =============================================================================

#[test]
fn test_recall_against_exact_oracle() {
    const DIM: usize = 32;
    const K: usize = 10;

    let mut config = config(DIM);
    config.query.nprobe = 10;
    config.index.drift_budget = 1_000_000;
    let engine = SiftEngine::in_memory(config).unwrap();

    let (docs, centres) = clustered_corpus(7, DIM, 40, 50);
    let report = engine.ingest(docs);
    assert_eq!(report.accepted(), 2_000);
    let index = engine.coordinator().rebuild_now().unwrap();
    assert_eq!(index.partition_count(), 45);

    let mut rng = Lcg(99);
    let mut found = 0usize;
    let mut wanted = 0usize;
    for centre in centres.iter().cycle().take(100) {
        let query: Vec<f32> = centre.iter().map(|x| x + 0.2 * rng.next_f32()).collect();
        let approx = engine.query_engine().search(&query, K).unwrap();
        let exact = engine.query_engine().exact_search(&query, K).unwrap();

        let truth: HashSet<_> = exact.iter().map(|r| r.id.clone()).collect();
        found += approx.iter().filter(|r| truth.contains(&r.id)).count();
        wanted += truth.len();

        // Whatever the approximate path returns is scored exactly.
        for r in &approx {
            let record = engine
                .store()
                .get(&r.id, Deadline::none())
                .unwrap()
                .unwrap();
            let score = sift_vector::distance::cosine_similarity(&query, &record.embedding);
            assert_eq!(r.score, score);
        }
    }

    let recall = found as f64 / wanted as f64;
    assert!(recall >= 0.95, "recall {} below 0.95", recall);
}

// =============================================================================
// Determinism
// =============================================================================

#[test]
fn test_identical_corpora_build_identical_indexes() {
    let build = || {
        let engine = SiftEngine::in_memory(config(16)).unwrap();
        let (docs, _) = clustered_corpus(3, 16, 8, 25);
        engine.ingest(docs);
        engine.coordinator().rebuild_now().unwrap();
        engine
    };
    let first = build();
    let second = build();

    let a = first.coordinator().current().unwrap().to_persisted();
    let b = second.coordinator().current().unwrap().to_persisted();
    assert_eq!(a, b);

    let mut rng = Lcg(11);
    for _ in 0..20 {
        let query = rng.vector(16);
        let r1 = first.query_engine().search(&query, 7).unwrap();
        let r2 = second.query_engine().search(&query, 7).unwrap();
        assert_eq!(r1, r2);
        for _ in 0..3 {
            assert_eq!(first.query_engine().search(&query, 7).unwrap(), r1);
        }
    }
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_readers_never_see_a_torn_index() {
    const DIM: usize = 8;
    let mut config = config(DIM);
    config.index.drift_budget = 50;
    let engine = SiftEngine::in_memory(config).unwrap();

    let (docs, _) = clustered_corpus(5, DIM, 6, 20);
    let ids_in_corpus: Vec<DocId> = docs.iter().map(|d| d.id.clone()).collect();
    engine.ingest(docs);
    engine.coordinator().rebuild_now().unwrap();

    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        // Writer: rewrites embeddings and deletes a few documents.
        s.spawn(|| {
            let mut rng = Lcg(17);
            for round in 0..30 {
                let batch = ids_in_corpus
                    .iter()
                    .step_by(3)
                    .map(|id| IncomingDocument::new(id.clone(), rng.vector(DIM), DocumentMetadata::default()))
                    .collect();
                let report = engine.ingest(batch);
                assert_eq!(report.rejected(), 0);
                let victim = &ids_in_corpus[round % ids_in_corpus.len()];
                engine.delete(victim).unwrap();
            }
            stop.store(true, Ordering::SeqCst);
        });

        // Rebuilder: swaps fresh indexes in underneath the readers.
        s.spawn(|| {
            while !stop.load(Ordering::SeqCst) {
                engine.coordinator().rebuild_now().unwrap();
            }
        });

        for seed in 0..3u64 {
            let engine = &engine;
            let stop = &stop;
            s.spawn(move || {
                let mut rng = Lcg(100 + seed);
                while !stop.load(Ordering::SeqCst) {
                    let query = rng.vector(DIM);

                    let index = engine.coordinator().current().unwrap();
                    let hits = index.search(&query, 10, 4, Deadline::none()).unwrap();
                    let generation = index.generation();
                    let mut seen = HashSet::new();
                    for hit in &hits {
                        assert!(
                            hit.generation <= generation,
                            "hit from generation {} in index at {}",
                            hit.generation,
                            generation
                        );
                        assert!(seen.insert(hit.id.clone()), "duplicate {}", hit.id);
                    }

                    let results = engine.query_engine().search(&query, 10).unwrap();
                    assert!(results.len() <= 10);
                    for pair in results.windows(2) {
                        assert!(
                            pair[0].score > pair[1].score
                                || (pair[0].score == pair[1].score && pair[0].id < pair[1].id)
                        );
                    }
                }
            });
        }
    });

    // Once quiet, a final rebuild serves the store's generation.
    let index = engine.coordinator().rebuild_now().unwrap();
    assert_eq!(index.generation(), engine.store().generation());
    assert_eq!(index.stats().documents, engine.store().len());
}

#[test]
fn test_concurrent_ingest_of_disjoint_documents() {
    let engine = Arc::new(SiftEngine::in_memory(config(4)).unwrap());
    std::thread::scope(|s| {
        for t in 0..4 {
            let engine = Arc::clone(&engine);
            s.spawn(move || {
                let docs = (0..50)
                    .map(|i| doc(&format!("t{}-{:02}", t, i), vec![1.0, t as f32, i as f32, 0.5]))
                    .collect();
                assert_eq!(engine.ingest(docs).accepted(), 50);
            });
        }
    });
    assert_eq!(engine.store().len(), 200);
    assert_eq!(engine.store().generation(), 200);
}
