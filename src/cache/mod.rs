//! Deduplicating load/generate cache for section sources
//!
//! Each section maps to one cell that is either absent, loading, or cached.
//! Concurrent readers of a loading cell share a single load future, so a
//! burst of requests for the same section costs one file read (or one
//! generator batch) total. Cached cells hold weak references; a section
//! stays resident only while somebody outside the cache holds it, except
//! for dirty sections which stay pinned until flushed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use crate::config::{LodConfig, WriteMode};
use crate::error::{LodError, LodResult};
use crate::generation::{AlwaysValid, GenerationQueue, TaskResult};
use crate::persistence::envelope::quarantine;
use crate::persistence::{
    read_envelope, resolve_section_file, write_envelope, LoaderRegistry, FULL_SOURCE_DATATYPE,
};
use crate::section::SectionPos;
use crate::source::{ColumnPatch, LodSource};

/// Shared handle to one resident section source.
pub type SharedSource = Arc<RwLock<LodSource>>;

type LoadFuture = Shared<BoxFuture<'static, Option<SharedSource>>>;

enum CellState {
    /// A load is in flight; joiners await the shared future.
    Loading(LoadFuture),
    /// Loaded earlier; upgrades while any strong handle survives.
    Cached(Weak<RwLock<LodSource>>),
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    generated: AtomicU64,
}

/// Counter snapshot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub generated: u64,
}

/// The load/generate cache over one storage root.
pub struct LodCache {
    root: PathBuf,
    registry: Arc<LoaderRegistry>,
    queue: Arc<GenerationQueue>,
    write_mode: WriteMode,
    cells: DashMap<SectionPos, CellState>,
    /// Sections with unpersisted changes, pinned by strong reference so
    /// they cannot be evicted before [`LodCache::flush`] writes them.
    dirty: DashMap<SectionPos, SharedSource>,
    stats: Counters,
}

enum ReadAction {
    Hit(SharedSource),
    Join(LoadFuture),
    Lead(oneshot::Sender<Option<SharedSource>>, LoadFuture),
}

impl LodCache {
    pub fn new(
        root: PathBuf,
        registry: Arc<LoaderRegistry>,
        queue: Arc<GenerationQueue>,
        config: &LodConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            root,
            registry,
            queue,
            write_mode: config.write_mode,
            cells: DashMap::new(),
            dirty: DashMap::new(),
            stats: Counters::default(),
        })
    }

    /// Fetch the source for `pos`, loading it from disk or generating it on
    /// a miss. Returns `None` only when both loading and generation failed.
    ///
    /// Concurrent callers for the same section coalesce onto one load.
    pub async fn get_or_load(
        self: &Arc<Self>,
        pos: SectionPos,
        data_detail: u8,
    ) -> Option<SharedSource> {
        let action = self.claim_cell(pos);
        match action {
            ReadAction::Hit(source) => Some(source),
            ReadAction::Join(shared) => shared.await,
            ReadAction::Lead(tx, shared) => {
                self.spawn_load(pos, data_detail, tx);
                shared.await
            }
        }
    }

    /// Run the load on a detached task so the cell always settles, even if
    /// every waiting caller is dropped mid-load.
    fn spawn_load(
        self: &Arc<Self>,
        pos: SectionPos,
        data_detail: u8,
        tx: oneshot::Sender<Option<SharedSource>>,
    ) {
        let cache = self.clone();
        self.queue.fabric().io_handle().spawn(async move {
            let result = cache.load_or_generate(pos, data_detail).await;
            match &result {
                Some(source) => {
                    cache
                        .cells
                        .insert(pos, CellState::Cached(Arc::downgrade(source)));
                }
                None => {
                    cache.cells.remove(&pos);
                }
            }
            // joiners may all have given up already
            let _ = tx.send(result);
        });
    }

    /// Decide this caller's role for the cell. The entry lock is held only
    /// for the decision, never across an await.
    fn claim_cell(&self, pos: SectionPos) -> ReadAction {
        match self.cells.entry(pos) {
            Entry::Occupied(mut entry) => {
                let resident = match entry.get() {
                    CellState::Cached(weak) => weak.upgrade(),
                    CellState::Loading(shared) => match shared.peek() {
                        None => return ReadAction::Join(shared.clone()),
                        // settled without a cell update (loader task lost
                        // at runtime shutdown); treat like an expired cell
                        Some(result) => result.clone(),
                    },
                };
                match resident {
                    Some(source) => {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        ReadAction::Hit(source)
                    }
                    None => {
                        // expired while uncontended, this caller reloads
                        let (tx, shared) = new_load_cell();
                        entry.insert(CellState::Loading(shared.clone()));
                        ReadAction::Lead(tx, shared)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let (tx, shared) = new_load_cell();
                entry.insert(CellState::Loading(shared.clone()));
                ReadAction::Lead(tx, shared)
            }
        }
    }

    /// Source for `pos` if it is resident right now. Never loads.
    pub fn peek(&self, pos: SectionPos) -> Option<SharedSource> {
        match self.cells.get(&pos)?.value() {
            CellState::Cached(weak) => weak.upgrade(),
            CellState::Loading(_) => None,
        }
    }

    async fn load_or_generate(self: &Arc<Self>, pos: SectionPos, data_detail: u8) -> Option<SharedSource> {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        match self.read_from_disk(pos).await {
            Ok(Some(source)) => {
                self.stats.loads.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::new(RwLock::new(source)));
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("failed to load section {}: {}", pos, e);
                return None;
            }
        }

        self.generate(pos, data_detail).await
    }

    /// File lookup and envelope read on a blocking thread. Corrupt files
    /// are quarantined and reported as absent so generation takes over.
    async fn read_from_disk(&self, pos: SectionPos) -> LodResult<Option<LodSource>> {
        let root = self.root.clone();
        let registry = self.registry.clone();
        let result = tokio::task::spawn_blocking(move || -> LodResult<Option<LodSource>> {
            let path = match resolve_section_file(&root, pos)? {
                Some(path) => path,
                None => return Ok(None),
            };
            match read_envelope(&path, pos, &registry) {
                Ok(source) => Ok(Some(source)),
                Err(e @ (LodError::Corrupted { .. } | LodError::ChecksumMismatch { .. })) => {
                    log::warn!("section {} unreadable, regenerating: {}", pos, e);
                    quarantine(&path);
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await;
        result.map_err(|e| LodError::ThreadPool(format!("disk read task panicked: {}", e)))?
    }

    async fn generate(self: &Arc<Self>, pos: SectionPos, data_detail: u8) -> Option<SharedSource> {
        let source = Arc::new(RwLock::new(LodSource::empty(pos, data_detail)));
        let sink = source.clone();
        let completion = self.queue.submit(
            pos,
            data_detail,
            Arc::new(AlwaysValid),
            Box::new(move |chunk| sink.write().apply_chunk(chunk.pos, &chunk.patch)),
        );

        match completion.await {
            Ok(TaskResult::Success(_)) => {
                self.stats.generated.fetch_add(1, Ordering::Relaxed);
                self.dirty.insert(pos, source.clone());
                Some(source)
            }
            Ok(TaskResult::Fail) => {
                log::error!("generation failed for section {}", pos);
                None
            }
            Err(_) => {
                log::error!("generation queue dropped request for section {}", pos);
                None
            }
        }
    }

    /// Apply a direct edit to `pos`. A resident section is patched in
    /// memory and its envelope rewritten immediately, so a cold read after
    /// a crash reconstructs the edit; an absent section is read-modified-
    /// written on disk without pulling it into the cache.
    pub async fn apply_patch(self: &Arc<Self>, pos: SectionPos, patch: ColumnPatch) -> LodResult<()> {
        if let Some(source) = self.peek(pos) {
            source.write().apply_patch(&patch);
            if let Err(e) = self.save(source.clone()).await {
                // pin so flush can retry the write later
                self.dirty.insert(pos, source);
                return Err(e);
            }
            return Ok(());
        }
        self.persist_patch(pos, patch).await
    }

    /// Read-modify-write the persisted copy of `pos`. Missing files start
    /// from an empty source, so edits to never-generated sections survive.
    async fn persist_patch(&self, pos: SectionPos, patch: ColumnPatch) -> LodResult<()> {
        let root = self.root.clone();
        let registry = self.registry.clone();
        let mode = self.write_mode;
        let result = tokio::task::spawn_blocking(move || -> LodResult<()> {
            let mut source = match resolve_section_file(&root, pos)? {
                Some(path) => read_envelope(&path, pos, &registry)?,
                None => LodSource::empty(pos, patch.data_detail),
            };
            source.apply_patch(&patch);
            let loader = registry.latest(FULL_SOURCE_DATATYPE).ok_or(LodError::NoLoader {
                datatype: FULL_SOURCE_DATATYPE,
                version: 0,
            })?;
            write_envelope(&root, mode, &source, loader.as_ref())
        })
        .await;
        result.map_err(|e| LodError::ThreadPool(format!("patch write task panicked: {}", e)))?
    }

    /// Serialize a source's current state into its envelope on a blocking
    /// thread.
    async fn save(&self, source: SharedSource) -> LodResult<()> {
        let root = self.root.clone();
        let registry = self.registry.clone();
        let mode = self.write_mode;
        let result = tokio::task::spawn_blocking(move || -> LodResult<()> {
            let loader = registry.latest(FULL_SOURCE_DATATYPE).ok_or(LodError::NoLoader {
                datatype: FULL_SOURCE_DATATYPE,
                version: 0,
            })?;
            let guard = source.read();
            write_envelope(&root, mode, &guard, loader.as_ref())
        })
        .await;
        result.map_err(|e| LodError::ThreadPool(format!("save task panicked: {}", e)))?
    }

    /// Write every dirty section to disk and release its pin. Returns how
    /// many sections were written; the first write error aborts the pass,
    /// leaving the remaining sections pinned for a retry.
    pub async fn flush(&self) -> LodResult<usize> {
        let pending: Vec<(SectionPos, SharedSource)> = self
            .dirty
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut written = 0;
        for (pos, source) in pending {
            self.save(source).await?;
            self.dirty.remove(&pos);
            written += 1;
        }
        if written > 0 {
            log::debug!("flushed {} dirty sections", written);
        }
        Ok(written)
    }

    /// Drop cache bookkeeping for cells whose sources were released.
    /// Loading and dirty cells are untouched.
    pub fn purge_dead(&self) -> usize {
        let before = self.cells.len();
        self.cells.retain(|_, state| match state {
            CellState::Cached(weak) => weak.strong_count() > 0,
            CellState::Loading(_) => true,
        });
        before - self.cells.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            loads: self.stats.loads.load(Ordering::Relaxed),
            generated: self.stats.generated.load(Ordering::Relaxed),
        }
    }
}

/// A fresh loading cell: the leader keeps the sender, joiners clone the
/// shared future. A dropped sender resolves joiners to `None`.
fn new_load_cell() -> (oneshot::Sender<Option<SharedSource>>, LoadFuture) {
    let (tx, rx) = oneshot::channel();
    let shared = rx.map(|result| result.ok().flatten()).boxed().shared();
    (tx, shared)
}
