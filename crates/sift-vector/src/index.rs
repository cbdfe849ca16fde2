//! Clustered inverted-file (IVF) index over the Embedding Store.
//!
//! Documents are grouped into partitions around unit-length centroids. A
//! query ranks the centroids, scans the members of the `nprobe` closest
//! partitions and returns the best candidates by cosine similarity.
//!
//! Members hold weak references to the store's records. When the store
//! replaces or deletes a record its old `Arc` is dropped and the member simply
//! stops resolving, so a stale index can never resurrect a deleted document
//! once no snapshot keeps it alive. Centroids are fixed for the lifetime of an
//! index; incremental inserts only touch the one partition they land in.

use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use sift_core::config::IndexConfig;
use sift_core::deadline::Deadline;
use sift_core::error::{Result, SiftError, ValidationError};
use sift_core::types::{DocId, DocumentRecord, Generation};

use crate::distance::{dot, l2_norm, normalized};
use crate::kmeans;
use crate::locks::{read_until, write_until};
use crate::persist::{PersistedIndex, FORMAT_VERSION};
use crate::store::StoreSnapshot;

/// A candidate returned by [`IvfIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: DocId,
    /// Cosine similarity against the record the index currently points at.
    pub score: f64,
    /// Generation of that record.
    pub generation: Generation,
}

/// When an index should be rebuilt from scratch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftPolicy {
    pub imbalance_threshold: f64,
    pub drift_budget: usize,
}

impl From<&IndexConfig> for DriftPolicy {
    fn from(config: &IndexConfig) -> Self {
        Self {
            imbalance_threshold: config.imbalance_threshold,
            drift_budget: config.drift_budget,
        }
    }
}

/// Point-in-time description of an index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub generation: Generation,
    /// Members that still resolve and are not tombstoned.
    pub documents: usize,
    pub partitions: usize,
    pub partition_sizes: Vec<usize>,
    pub imbalance: f64,
    pub pending_mutations: usize,
    pub tombstones: usize,
    pub drifted: bool,
    /// False once a write reached the index generation without reaching
    /// the index.
    pub complete: bool,
}

#[derive(Debug, Clone)]
struct Member {
    id: DocId,
    record: Weak<DocumentRecord>,
    inv_norm: f64,
}

impl Member {
    fn of(record: &Arc<DocumentRecord>) -> Option<Self> {
        let norm = l2_norm(&record.embedding);
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        Some(Self {
            id: record.id.clone(),
            record: Arc::downgrade(record),
            inv_norm: 1.0 / norm,
        })
    }

    fn is_live(&self) -> bool {
        self.record.strong_count() > 0
    }
}

/// Partitioned approximate nearest-neighbour index.
#[derive(Debug)]
pub struct IvfIndex {
    dimension: usize,
    generation: AtomicU64,
    centroids: Vec<Vec<f32>>,
    partitions: Vec<RwLock<Vec<Member>>>,
    /// Identifier to the generation of its delete. Hides members whose
    /// record is not newer than the delete.
    tombstones: RwLock<HashMap<DocId, Generation>>,
    pending: AtomicUsize,
    /// Set when a write could not be placed. The generation then no longer
    /// proves the index holds every write up to it.
    incomplete: AtomicBool,
    policy: DriftPolicy,
}

impl IvfIndex {
    /// An index with no partitions. Searches return nothing.
    pub fn empty(dimension: usize, generation: Generation, policy: DriftPolicy) -> Self {
        Self::from_parts(dimension, generation, Vec::new(), Vec::new(), HashMap::new(), policy)
    }

    fn from_parts(
        dimension: usize,
        generation: Generation,
        centroids: Vec<Vec<f32>>,
        partitions: Vec<Vec<Member>>,
        tombstones: HashMap<DocId, Generation>,
        policy: DriftPolicy,
    ) -> Self {
        Self {
            dimension,
            generation: AtomicU64::new(generation),
            centroids,
            partitions: partitions.into_iter().map(RwLock::new).collect(),
            tombstones: RwLock::new(tombstones),
            pending: AtomicUsize::new(0),
            incomplete: AtomicBool::new(false),
            policy,
        }
    }

    /// Partition `records` from scratch.
    ///
    /// `records` should come from one consistent store snapshot, in
    /// identifier order, so that identical inputs build identical indexes.
    pub fn build(
        records: &[Arc<DocumentRecord>],
        generation: Generation,
        config: &IndexConfig,
    ) -> Self {
        let started = Instant::now();
        let mut members = Vec::with_capacity(records.len());
        let mut units = Vec::with_capacity(records.len());
        for record in records {
            if record.embedding.len() != config.embedding_dim {
                warn!(
                    id = %record.id,
                    dimension = record.embedding.len(),
                    "Skipping record with wrong dimension during index build"
                );
                continue;
            }
            if let (Some(member), Some(unit)) = (Member::of(record), normalized(&record.embedding)) {
                members.push(member);
                units.push(unit);
            }
        }

        let k = kmeans::partition_count(units.len(), config.min_partitions, config.max_partitions);
        let clustering = kmeans::train(&units, k, config.kmeans_iterations);

        let mut partitions: Vec<Vec<Member>> = vec![Vec::new(); clustering.centroids.len()];
        for (member, p) in members.into_iter().zip(clustering.assignments) {
            partitions[p].push(member);
        }

        let index = Self::from_parts(
            config.embedding_dim,
            generation,
            clustering.centroids,
            partitions,
            HashMap::new(),
            DriftPolicy::from(config),
        );
        info!(
            documents = units.len(),
            partitions = index.partition_count(),
            generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Vector index built"
        );
        index
    }

    /// Rebuild an index from its persisted form against the current store.
    ///
    /// Members whose record is gone or was rewritten after the persisted
    /// generation are dropped; every record the persisted form does not
    /// account for is then assigned to its nearest partition.
    pub fn restore(
        persisted: PersistedIndex,
        snapshot: &StoreSnapshot,
        config: &IndexConfig,
    ) -> Result<Self> {
        if persisted.version != FORMAT_VERSION {
            return Err(SiftError::IndexUnavailable(format!(
                "unsupported index format version {}",
                persisted.version
            )));
        }
        if persisted.dimension != config.embedding_dim {
            return Err(SiftError::IndexUnavailable(format!(
                "persisted index has dimension {}, configured dimension is {}",
                persisted.dimension, config.embedding_dim
            )));
        }
        if persisted.generation > snapshot.generation() {
            return Err(SiftError::IndexUnavailable(format!(
                "persisted index generation {} is ahead of the store ({})",
                persisted.generation,
                snapshot.generation()
            )));
        }
        if persisted.partitions.len() != persisted.centroids.len()
            || persisted.centroids.iter().any(|c| c.len() != persisted.dimension)
        {
            return Err(SiftError::IndexUnavailable(
                "persisted centroids and partitions do not line up".into(),
            ));
        }

        let by_id: HashMap<&DocId, &Arc<DocumentRecord>> =
            snapshot.iter().map(|r| (&r.id, r)).collect();

        let mut placed: HashSet<DocId> = HashSet::new();
        let mut partitions = Vec::with_capacity(persisted.partitions.len());
        for ids in &persisted.partitions {
            let mut members = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(record) = by_id.get(id) else { continue };
                if record.generation > persisted.generation {
                    continue;
                }
                if let Some(member) = Member::of(record) {
                    placed.insert(id.clone());
                    members.push(member);
                }
            }
            partitions.push(members);
        }
        let tombstones: HashMap<DocId, Generation> = persisted
            .tombstones
            .into_iter()
            .filter(|id| placed.contains(id))
            .map(|id| (id, persisted.generation))
            .collect();

        let replay: Vec<&Arc<DocumentRecord>> = snapshot
            .iter()
            .filter(|r| !placed.contains(&r.id) || r.generation > persisted.generation)
            .collect();
        if persisted.centroids.is_empty() && !replay.is_empty() {
            return Err(SiftError::IndexUnavailable(
                "persisted index has no partitions for stored documents".into(),
            ));
        }

        let index = Self::from_parts(
            persisted.dimension,
            snapshot.generation(),
            persisted.centroids,
            partitions,
            tombstones,
            DriftPolicy::from(config),
        );
        for record in &replay {
            index.insert(record, Deadline::none())?;
        }
        info!(
            restored = placed.len(),
            replayed = replay.len(),
            generation = index.generation(),
            "Vector index restored"
        );
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Store generation this index reflects.
    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::SeqCst)
    }

    /// Raise the index generation after applying writes up to `generation`.
    pub fn advance_generation(&self, generation: Generation) {
        self.generation.fetch_max(generation, Ordering::SeqCst);
    }

    pub fn partition_count(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// Whether every write up to [`IvfIndex::generation`] is in the index.
    pub fn is_complete(&self) -> bool {
        !self.incomplete.load(Ordering::SeqCst)
    }

    /// Record that a write up to the current generation never made it in.
    pub fn mark_incomplete(&self) {
        self.incomplete.store(true, Ordering::SeqCst);
    }

    /// Mutations applied since the index was built.
    pub fn pending_mutations(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Assign a record to its nearest existing partition.
    ///
    /// Any previous member with the same identifier in that partition is
    /// replaced and an older tombstone for the identifier is cleared. Returns
    /// `false` if the index has no partitions to assign to; the mutation still
    /// counts towards drift and marks the index incomplete so a rebuild picks
    /// it up.
    pub fn insert(&self, record: &Arc<DocumentRecord>, deadline: Deadline) -> Result<bool> {
        if record.embedding.len() != self.dimension {
            return Err(ValidationError::DimensionMismatch {
                expected: self.dimension,
                actual: record.embedding.len(),
            }
            .into());
        }
        let (Some(member), Some(unit)) = (Member::of(record), normalized(&record.embedding)) else {
            return Err(ValidationError::EmptyVector.into());
        };

        {
            let mut tombstones = write_until(&self.tombstones, deadline, "index.insert")?;
            if tombstones.get(&record.id).is_some_and(|g| *g < record.generation) {
                tombstones.remove(&record.id);
            }
        }
        self.pending.fetch_add(1, Ordering::SeqCst);

        let Some((p, _)) = kmeans::nearest(&unit, &self.centroids) else {
            debug!(id = %record.id, "Index has no partitions; insert deferred to rebuild");
            self.mark_incomplete();
            return Ok(false);
        };
        let mut partition = write_until(&self.partitions[p], deadline, "index.insert")?;
        partition.retain(|m| m.id != record.id);
        partition.push(member);
        Ok(true)
    }

    /// Tombstone an identifier deleted at `generation`. Members are
    /// physically dropped on the next build.
    pub fn remove(&self, id: &DocId, generation: Generation, deadline: Deadline) -> Result<()> {
        write_until(&self.tombstones, deadline, "index.remove")?
            .entry(id.clone())
            .and_modify(|g| *g = (*g).max(generation))
            .or_insert(generation);
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Approximate top-`k` by cosine similarity, probing `nprobe` partitions.
    ///
    /// Ordered by score descending, then identifier ascending. An index with
    /// no partitions returns an empty list.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        nprobe: usize,
        deadline: Deadline,
    ) -> Result<Vec<IndexHit>> {
        if k == 0 || self.centroids.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(ValidationError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            }
            .into());
        }
        let query = normalized(query).ok_or(ValidationError::EmptyVector)?;

        let probes = self.probe_order(&query, nprobe);
        let tombstones = read_until(&self.tombstones, deadline, "index.search")?;

        let mut best: HashMap<DocId, IndexHit> = HashMap::new();
        for p in probes {
            deadline.check("index.search")?;
            let members = read_until(&self.partitions[p], deadline, "index.search")?;
            for member in members.iter() {
                let Some(record) = member.record.upgrade() else {
                    continue;
                };
                if tombstones
                    .get(&member.id)
                    .is_some_and(|g| record.generation <= *g)
                {
                    continue;
                }
                let hit = IndexHit {
                    id: member.id.clone(),
                    score: (dot(&query, &record.embedding) * member.inv_norm).clamp(-1.0, 1.0),
                    generation: record.generation,
                };
                match best.entry(member.id.clone()) {
                    Entry::Occupied(mut e) => {
                        if hit.generation > e.get().generation {
                            e.insert(hit);
                        }
                    }
                    Entry::Vacant(e) => {
                        e.insert(hit);
                    }
                }
            }
        }

        let mut hits: Vec<IndexHit> = best.into_values().collect();
        hits.sort_by(rank);
        hits.truncate(k);
        Ok(hits)
    }

    /// Partition indexes ordered by centroid similarity, best first.
    fn probe_order(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let mut order: Vec<(usize, f64)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, dot(query, c)))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        order.truncate(nprobe.max(1));
        order.into_iter().map(|(i, _)| i).collect()
    }

    /// Members per partition that still resolve. A moved or deleted record
    /// leaves a dead member behind until the next build.
    fn partition_sizes(&self) -> Vec<usize> {
        self.partitions
            .iter()
            .map(|p| p.read().iter().filter(|m| m.is_live()).count())
            .collect()
    }

    /// Largest partition over mean partition size; 0.0 for an empty index.
    pub fn imbalance(&self) -> f64 {
        imbalance_of(&self.partition_sizes())
    }

    /// Whether accumulated mutations or skew call for a full rebuild.
    pub fn is_drifted(&self) -> bool {
        let pending = self.pending_mutations();
        if pending == 0 {
            return false;
        }
        !self.is_complete()
            || self.centroids.is_empty()
            || pending >= self.policy.drift_budget
            || self.imbalance() > self.policy.imbalance_threshold
    }

    pub fn stats(&self) -> IndexStats {
        let tombstones = self.tombstones.read();
        let mut documents = 0;
        for partition in &self.partitions {
            documents += partition
                .read()
                .iter()
                .filter(|m| {
                    m.record.upgrade().is_some_and(|r| {
                        tombstones.get(&m.id).map_or(true, |g| r.generation > *g)
                    })
                })
                .count();
        }
        let tombstone_count = tombstones.len();
        drop(tombstones);

        let partition_sizes = self.partition_sizes();
        IndexStats {
            generation: self.generation(),
            documents,
            partitions: self.partition_count(),
            imbalance: imbalance_of(&partition_sizes),
            partition_sizes,
            pending_mutations: self.pending_mutations(),
            tombstones: tombstone_count,
            drifted: self.is_drifted(),
            complete: self.is_complete(),
        }
    }

    /// Centroids plus the identifiers of live members, for writing to disk.
    pub fn to_persisted(&self) -> PersistedIndex {
        let tombstones = self.tombstones.read();
        let partitions = self
            .partitions
            .iter()
            .map(|p| {
                p.read()
                    .iter()
                    .filter(|m| m.is_live())
                    .map(|m| m.id.clone())
                    .collect()
            })
            .collect();
        let mut tombstones: Vec<DocId> = tombstones.keys().cloned().collect();
        tombstones.sort();

        PersistedIndex {
            version: FORMAT_VERSION,
            generation: self.generation(),
            dimension: self.dimension,
            centroids: self.centroids.clone(),
            partitions,
            tombstones,
        }
    }
}

fn imbalance_of(sizes: &[usize]) -> f64 {
    let total: usize = sizes.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let largest = sizes.iter().copied().max().unwrap_or(0);
    largest as f64 / (total as f64 / sizes.len() as f64)
}

fn rank(a: &IndexHit, b: &IndexHit) -> CmpOrdering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.id.cmp(&b.id))
}
