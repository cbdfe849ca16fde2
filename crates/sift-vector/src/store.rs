//! Embedding Store: the system of record for embeddings and metadata.
//!
//! Records live in a sharded in-memory map of `Arc<DocumentRecord>`. A write
//! replaces the whole `Arc` under one shard's write lock, so readers see
//! either the old record or the new one, never a mix. When a durable backend
//! is attached, the row is persisted before the in-memory swap; a backend
//! failure leaves the store unchanged.
//!
//! Every write takes the next store generation, which doubles as the
//! watermark the index coordinator uses to find writes that landed after a
//! snapshot.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use sift_core::deadline::Deadline;
use sift_core::error::{Result, SiftError, ValidationError, DEFAULT_RETRY_AFTER_MS};
use sift_core::types::{DocId, DocumentMetadata, DocumentRecord, Generation};
use sift_storage::DocumentRepository;

use crate::distance::validate_embedding;
use crate::locks::{read_until, write_until};

/// Durable medium behind the Embedding Store.
pub trait StoreBackend: Send + Sync + fmt::Debug {
    /// Every persisted record plus the persisted generation.
    fn load(&self) -> Result<(Vec<DocumentRecord>, Generation)>;

    fn persist(&self, record: &DocumentRecord, deadline: Deadline) -> Result<()>;

    /// Remove a record; returns whether it existed.
    fn remove(&self, id: &DocId, generation: Generation, deadline: Deadline) -> Result<bool>;
}

impl StoreBackend for DocumentRepository {
    fn load(&self) -> Result<(Vec<DocumentRecord>, Generation)> {
        Ok((self.load_all()?, self.generation()?))
    }

    fn persist(&self, record: &DocumentRecord, deadline: Deadline) -> Result<()> {
        self.upsert(record, deadline)
    }

    fn remove(&self, id: &DocId, generation: Generation, deadline: Deadline) -> Result<bool> {
        self.delete(id, generation, deadline)
    }
}

/// What a put did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PutChange {
    Inserted,
    Updated,
    /// Same embedding and metadata were already stored; nothing was written.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub record: Arc<DocumentRecord>,
    pub change: PutChange,
}

impl PutOutcome {
    pub fn generation(&self) -> Generation {
        self.record.generation
    }

    pub fn is_changed(&self) -> bool {
        self.change != PutChange::Unchanged
    }
}

type Shard = RwLock<HashMap<DocId, Arc<DocumentRecord>>>;

/// Point-in-time view of the store, sorted by identifier.
///
/// Holding a snapshot keeps its records alive; iterate it as many times as
/// needed.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    generation: Generation,
    records: Vec<Arc<DocumentRecord>>,
}

impl StoreSnapshot {
    /// Every write stamped at or below this generation is in the snapshot.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Arc<DocumentRecord>] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<DocumentRecord>> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a StoreSnapshot {
    type Item = &'a Arc<DocumentRecord>;
    type IntoIter = std::slice::Iter<'a, Arc<DocumentRecord>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Records written after some generation.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub records: Vec<Arc<DocumentRecord>>,
    /// Pass this to the next `changes_since` call.
    pub generation: Generation,
}

/// Sharded, optionally durable map from identifier to embedding record.
///
/// Every successful write takes the next generation while it holds the
/// shard lock for its identifier, so generations of one identifier only grow
/// and a reserved generation is always visible once that lock is released.
pub struct EmbeddingStore {
    dimension: usize,
    shards: Vec<Shard>,
    generation: AtomicU64,
    len: AtomicUsize,
    backend: Option<Arc<dyn StoreBackend>>,
    retry_after_ms: u64,
}

impl EmbeddingStore {
    /// An empty, memory-only store.
    pub fn in_memory(dimension: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            dimension,
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            generation: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            backend: None,
            retry_after_ms: DEFAULT_RETRY_AFTER_MS,
        }
    }

    /// Retry hint attached to backend failures.
    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = ms;
        self
    }

    /// Open a store over a durable backend, loading every persisted record.
    ///
    /// Fails with `Config` if a persisted record has a different dimension
    /// than the one this deployment is configured for.
    pub fn open(dimension: usize, shards: usize, backend: Arc<dyn StoreBackend>) -> Result<Self> {
        let (records, persisted_generation) = backend.load()?;
        let mut store = Self::in_memory(dimension, shards);

        let mut generation = persisted_generation;
        let mut count = 0;
        for record in records {
            if record.embedding.len() != dimension {
                return Err(SiftError::Config(format!(
                    "stored document {} has dimension {}, configured dimension is {}",
                    record.id,
                    record.embedding.len(),
                    dimension
                )));
            }
            generation = generation.max(record.generation);
            let shard = store.shard_index(&record.id);
            if store.shards[shard]
                .get_mut()
                .insert(record.id.clone(), Arc::new(record))
                .is_none()
            {
                count += 1;
            }
        }
        store.len = AtomicUsize::new(count);
        store.generation = AtomicU64::new(generation);
        store.backend = Some(backend);

        info!(documents = count, generation, dimension, "Embedding store loaded");
        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Highest generation handed out so far.
    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_some()
    }

    /// Check an embedding against this store's dimension.
    pub fn validate(&self, embedding: &[f32]) -> std::result::Result<f64, ValidationError> {
        validate_embedding(embedding, self.dimension)
    }

    /// Insert or replace one document (last write wins).
    ///
    /// Writing the same embedding and metadata that are already stored is a
    /// no-op reported as [`PutChange::Unchanged`] and does not advance the
    /// generation.
    pub fn put(
        &self,
        id: DocId,
        embedding: Vec<f32>,
        metadata: DocumentMetadata,
        deadline: Deadline,
    ) -> Result<PutOutcome> {
        self.validate(&embedding)?;
        deadline.check("store.put")?;

        let shard = &self.shards[self.shard_index(&id)];
        let mut guard = write_until(shard, deadline, "store.put")?;

        let previous = guard.get(&id);
        if let Some(existing) = previous {
            if existing.embedding == embedding && existing.metadata == metadata {
                return Ok(PutOutcome {
                    record: Arc::clone(existing),
                    change: PutChange::Unchanged,
                });
            }
        }
        let change = if previous.is_some() {
            PutChange::Updated
        } else {
            PutChange::Inserted
        };

        let generation = self.reserve_generation();
        let record = Arc::new(DocumentRecord {
            id: id.clone(),
            embedding,
            metadata,
            generation,
        });

        if let Some(backend) = &self.backend {
            backend
                .persist(&record, deadline)
                .map_err(|e| e.with_retry_after(self.retry_after_ms))?;
        }

        guard.insert(id, Arc::clone(&record));
        if change == PutChange::Inserted {
            self.len.fetch_add(1, Ordering::SeqCst);
        }

        debug!(id = %record.id, generation, ?change, "Document stored");
        Ok(PutOutcome { record, change })
    }

    /// Look up a document. A missing identifier is `Ok(None)`.
    pub fn get(&self, id: &DocId, deadline: Deadline) -> Result<Option<Arc<DocumentRecord>>> {
        deadline.check("store.get")?;
        let shard = read_until(&self.shards[self.shard_index(id)], deadline, "store.get")?;
        Ok(shard.get(id).cloned())
    }

    /// Delete a document.
    ///
    /// Returns the generation of the delete, or `None` if the identifier was
    /// not stored.
    pub fn delete(&self, id: &DocId, deadline: Deadline) -> Result<Option<Generation>> {
        deadline.check("store.delete")?;
        let shard = &self.shards[self.shard_index(id)];
        let mut guard = write_until(shard, deadline, "store.delete")?;

        if !guard.contains_key(id) {
            return Ok(None);
        }
        let generation = self.reserve_generation();
        if let Some(backend) = &self.backend {
            backend
                .remove(id, generation, deadline)
                .map_err(|e| e.with_retry_after(self.retry_after_ms))?;
        }
        guard.remove(id);
        self.len.fetch_sub(1, Ordering::SeqCst);

        debug!(id = %id, generation, "Document deleted");
        Ok(Some(generation))
    }

    /// Consistent snapshot of every record.
    ///
    /// All shard read locks are held together while the `Arc`s are cloned, so
    /// no write is in flight and the snapshot holds exactly the writes stamped
    /// up to its generation. Writers wait only for the pointer copies, not for
    /// whatever the caller does with the snapshot afterwards.
    pub fn snapshot(&self) -> StoreSnapshot {
        let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
        let generation = self.generation();
        let mut records: Vec<Arc<DocumentRecord>> = guards
            .iter()
            .flat_map(|g| g.values().cloned())
            .collect();
        drop(guards);

        records.sort_by(|a, b| a.id.cmp(&b.id));
        StoreSnapshot {
            generation,
            records,
        }
    }

    /// Alias for [`EmbeddingStore::snapshot`]: a finite, restartable scan.
    pub fn scan(&self) -> StoreSnapshot {
        self.snapshot()
    }

    /// Records currently stored whose generation is above `generation`.
    ///
    /// Shards are read one at a time. The returned generation is read before
    /// the scan starts, so a write racing with the scan may be reported again
    /// by the next call but is never skipped.
    pub fn changes_since(&self, generation: Generation) -> ChangeSet {
        let next = self.generation();
        let mut records = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            records.extend(
                guard
                    .values()
                    .filter(|r| r.generation > generation)
                    .cloned(),
            );
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        ChangeSet {
            records,
            generation: next,
        }
    }

    fn shard_index(&self, id: &DocId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn reserve_generation(&self) -> Generation {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl fmt::Debug for EmbeddingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingStore")
            .field("dimension", &self.dimension)
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .field("generation", &self.generation())
            .field("durable", &self.is_durable())
            .finish()
    }
}
