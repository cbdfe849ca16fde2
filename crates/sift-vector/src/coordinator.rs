//! Consistency coordinator: owns the live index pointer and decides when a
//! newly built index is served.
//!
//! Queries take the live index with a single atomic load and keep using that
//! `Arc` until they finish, so a swap can never tear a result set between two
//! indexes. Builds run from a consistent store snapshot, catch up on the
//! writes that landed while they ran, and are published only if they are at
//! least as new as the index already being served.
//!
//! The served generation only moves when the index holds every write up to
//! it. A write that could not be placed leaves the index marked incomplete,
//! and acknowledgments wait for the rebuild that replaces it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sift_core::config::IndexConfig;
use sift_core::deadline::Deadline;
use sift_core::error::{Result, SiftError};
use sift_core::types::{DocId, DocumentRecord, Generation};

use crate::index::{IndexStats, IvfIndex};
use crate::locks::write_until;
use crate::persist::PersistedIndex;
use crate::store::EmbeddingStore;

pub struct IndexCoordinator {
    store: Arc<EmbeddingStore>,
    config: IndexConfig,
    persist_path: Option<PathBuf>,
    live: ArcSwapOption<IvfIndex>,
    served: watch::Sender<Generation>,
    build_lock: Mutex<()>,
    /// Serialises incremental applies with each other and with a swap.
    swap_lock: RwLock<()>,
    building: AtomicBool,
    rerun: AtomicBool,
}

impl IndexCoordinator {
    /// A coordinator with no index yet. `persist_path` is where built
    /// indexes are written when `config.persist` is set.
    pub fn new(
        store: Arc<EmbeddingStore>,
        config: IndexConfig,
        persist_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let (served, _) = watch::channel(0);
        Arc::new(Self {
            store,
            config,
            persist_path,
            live: ArcSwapOption::empty(),
            served,
            build_lock: Mutex::new(()),
            swap_lock: RwLock::new(()),
            building: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The index currently served to queries, if one has been built.
    pub fn current(&self) -> Option<Arc<IvfIndex>> {
        self.live.load_full()
    }

    /// Highest store generation the served index has acknowledged.
    pub fn served_generation(&self) -> Generation {
        *self.served.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Generation> {
        self.served.subscribe()
    }

    /// Wait until the served index reflects `generation`.
    pub async fn wait_for_generation(
        &self,
        generation: Generation,
        timeout: Duration,
    ) -> Result<Generation> {
        let mut rx = self.served.subscribe();
        let served = match tokio::time::timeout(timeout, rx.wait_for(|g| *g >= generation)).await {
            Ok(Ok(served)) => Ok(*served),
            Ok(Err(_)) => Err(SiftError::IndexUnavailable("coordinator closed".into())),
            Err(_) => Err(SiftError::timeout("index.wait_for_generation")),
        };
        served
    }

    pub fn stats(&self) -> Option<IndexStats> {
        self.current().map(|index| index.stats())
    }

    pub fn is_rebuilding(&self) -> bool {
        self.building.load(Ordering::SeqCst)
    }

    /// Serve the persisted index if it is usable, otherwise build one.
    pub fn load_or_build(&self) -> Result<Arc<IvfIndex>> {
        if let Some(index) = self.try_restore() {
            return Ok(index);
        }
        self.rebuild_now()
    }

    fn try_restore(&self) -> Option<Arc<IvfIndex>> {
        if !self.config.persist {
            return None;
        }
        let path = self.persist_path.as_deref()?;
        if !path.exists() {
            return None;
        }

        let _guard = self.build_lock.lock();
        let restored = PersistedIndex::load(path).and_then(|persisted| {
            let snapshot = self.store.snapshot();
            let index = IvfIndex::restore(persisted, &snapshot, &self.config)?;
            let since = snapshot.generation();
            drop(snapshot);
            Ok((Arc::new(index), since))
        });

        match restored {
            Ok((index, since)) => match self.install(&index, since) {
                Ok(()) if index.is_complete() => Some(index),
                Ok(()) => None,
                Err(e) => {
                    warn!(error = %e, "Restored index could not be installed; rebuilding");
                    None
                }
            },
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Persisted index unusable; rebuilding"
                );
                None
            }
        }
    }

    /// Build an index from the current store contents and serve it.
    ///
    /// Blocks the calling thread; concurrent calls are serialised. A build
    /// from an empty store that writes reach before the swap has nowhere to
    /// place them, so the build is repeated from a fresh snapshot.
    pub fn rebuild_now(&self) -> Result<Arc<IvfIndex>> {
        let _guard = self.build_lock.lock();
        let started = Instant::now();

        loop {
            let snapshot = self.store.snapshot();
            debug!(
                documents = snapshot.len(),
                generation = snapshot.generation(),
                "Index rebuild started"
            );
            let index = Arc::new(IvfIndex::build(
                snapshot.records(),
                snapshot.generation(),
                &self.config,
            ));
            let since = snapshot.generation();
            // Dropping the snapshot lets members of since-deleted records die.
            drop(snapshot);

            self.install(&index, since)?;
            if !index.is_complete() {
                debug!("Writes arrived during a build with no partitions; building again");
                continue;
            }
            info!(
                generation = index.generation(),
                partitions = index.partition_count(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Index published"
            );
            self.persist(&index);
            return Ok(index);
        }
    }

    /// Catch `index` up from `since` and publish it.
    ///
    /// The final catch-up and the swap happen with incremental applies held
    /// off, so no write can land only in the outgoing index.
    fn install(&self, index: &Arc<IvfIndex>, since: Generation) -> Result<()> {
        let since = self.catch_up(index, since)?;
        let _swap = self.swap_lock.write();
        // Deletes since the snapshot leave no record behind, so the
        // generation is raised to the store's even when nothing was replayed.
        let caught_up = self.catch_up(index, since)?;
        index.advance_generation(caught_up);
        if !self.publish(Arc::clone(index)) {
            return Err(SiftError::IndexUnavailable(
                "a newer index is already being served".into(),
            ));
        }
        Ok(())
    }

    fn catch_up(&self, index: &IvfIndex, since: Generation) -> Result<Generation> {
        let changes = self.store.changes_since(since);
        if let Some(max) = changes.records.iter().map(|r| r.generation).max() {
            index.advance_generation(max);
        }
        for record in &changes.records {
            index.insert(record, Deadline::none())?;
        }
        if !changes.records.is_empty() {
            debug!(records = changes.records.len(), "Index caught up with store");
        }
        Ok(changes.generation)
    }

    fn publish(&self, index: Arc<IvfIndex>) -> bool {
        let current = self.live.load();
        if let Some(live) = &*current {
            if live.generation() > index.generation() {
                warn!(
                    live = live.generation(),
                    candidate = index.generation(),
                    "Refusing to replace a newer index"
                );
                return false;
            }
        }
        drop(current);
        let generation = index.generation();
        let complete = index.is_complete();
        self.live.store(Some(index));
        if complete {
            self.notify(generation);
        }
        true
    }

    fn notify(&self, generation: Generation) {
        self.served.send_if_modified(|served| {
            if generation > *served {
                *served = generation;
                true
            } else {
                false
            }
        });
    }

    fn persist(&self, index: &IvfIndex) {
        if !self.config.persist {
            return;
        }
        if let Some(path) = &self.persist_path {
            if let Err(e) = index.to_persisted().save(path) {
                warn!(path = %path.display(), error = %e, "Failed to persist index");
            }
        }
    }

    /// Rebuild on the blocking pool and wait for the result.
    pub async fn rebuild(self: &Arc<Self>) -> Result<Arc<IvfIndex>> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.rebuild_now())
            .await
            .map_err(|e| SiftError::Task(e.to_string()))?
    }

    /// Start a background rebuild unless one is already running, in which
    /// case another pass is queued behind it.
    ///
    /// Uses the tokio blocking pool when called inside a runtime and a
    /// dedicated thread otherwise.
    pub fn schedule_rebuild(self: &Arc<Self>) {
        if self.building.swap(true, Ordering::SeqCst) {
            self.rerun.store(true, Ordering::SeqCst);
            debug!("Rebuild already running; queued another pass");
            return;
        }
        info!("Background index rebuild scheduled");

        let this = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || this.run_scheduled());
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("sift-index-build".into())
                    .spawn(move || this.run_scheduled());
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to start index build thread");
                    self.building.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    fn run_scheduled(&self) {
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            if let Err(e) = self.rebuild_now() {
                warn!(error = %e, "Background index rebuild failed");
            }
            if self.rerun.load(Ordering::SeqCst) {
                continue;
            }
            self.building.store(false, Ordering::SeqCst);
            // A request may have queued between the check and the release.
            if !self.rerun.load(Ordering::SeqCst) || self.building.swap(true, Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Apply writes that already landed in the store to the live index.
    ///
    /// The index generation is raised before the records go in, so anything
    /// a search finds is covered by the generation it reads afterwards.
    /// Waiters are notified only if every write reached the index. Schedules
    /// a rebuild when the index has drifted, when there is no index yet, or
    /// when the apply fails; the failed writes are then acknowledged by that
    /// rebuild.
    pub fn apply(
        self: &Arc<Self>,
        records: &[Arc<DocumentRecord>],
        deletes: &[(DocId, Generation)],
        deadline: Deadline,
    ) -> Result<()> {
        if records.is_empty() && deletes.is_empty() {
            return Ok(());
        }
        match self.apply_to_live(records, deletes, deadline) {
            Ok(Some(index)) if index.is_drifted() => {
                info!(
                    pending = index.pending_mutations(),
                    imbalance = index.imbalance(),
                    complete = index.is_complete(),
                    "Index drifted; scheduling rebuild"
                );
                self.schedule_rebuild();
                Ok(())
            }
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                self.schedule_rebuild();
                Ok(())
            }
            Err(e) => {
                // Later applies must not acknowledge past the missing writes.
                if let Some(index) = self.current() {
                    index.mark_incomplete();
                }
                self.schedule_rebuild();
                Err(e)
            }
        }
    }

    /// Returns the index the writes went into, or `None` if nothing is served.
    fn apply_to_live(
        &self,
        records: &[Arc<DocumentRecord>],
        deletes: &[(DocId, Generation)],
        deadline: Deadline,
    ) -> Result<Option<Arc<IvfIndex>>> {
        let _swap = write_until(&self.swap_lock, deadline, "index.apply")?;
        let Some(index) = self.current() else {
            return Ok(None);
        };

        let newest = records
            .iter()
            .map(|r| r.generation)
            .chain(deletes.iter().map(|(_, g)| *g))
            .max();
        if let Some(generation) = newest {
            index.advance_generation(generation);
        }
        for record in records {
            if let Err(e) = index.insert(record, deadline) {
                index.mark_incomplete();
                return Err(e);
            }
        }
        for (id, generation) in deletes {
            if let Err(e) = index.remove(id, *generation, deadline) {
                index.mark_incomplete();
                return Err(e);
            }
        }

        if index.is_complete() {
            self.notify(index.generation());
        } else {
            debug!(
                generation = index.generation(),
                "Index is missing writes; acknowledgment waits for a rebuild"
            );
        }
        Ok(Some(index))
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }
}

impl std::fmt::Debug for IndexCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCoordinator")
            .field("served_generation", &self.served_generation())
            .field("rebuilding", &self.is_rebuilding())
            .field("persist_path", &self.persist_path)
            .finish()
    }
}
