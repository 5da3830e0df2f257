//! Chunk store.
//!
//! Owns every chunk keyed by coordinate. The map is split into shards, each
//! behind its own lock, and each chunk carries its own status and content
//! locks; nothing here takes a world-wide lock. Lock order is always shard
//! before chunk status.
//!
//! Loads never block: [`ChunkStore::load`] inserts a `Loading` chunk and hands
//! the persistence lookup and generation to the IO pool. Unloads save on the
//! pool and remove the chunk only if nobody revived it in the meantime.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use crate::core::error::WorldError;
use crate::core::types::{BlockId, BlockPos, ChunkCoord, Tick};
use crate::terrain::chunk::{Chunk, ChunkContent, ChunkState, RetryPolicy};
use crate::terrain::chunk_storage::ChunkPersistence;
use crate::terrain::generation::WorldGenerator;
use crate::threading::ThreadPool;

type Shard = RwLock<HashMap<ChunkCoord, Arc<Chunk>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStoreSettings {
    pub shards: usize,
    pub retry: RetryPolicy,
    pub unload_grace_ticks: u64,
}

impl Default for ChunkStoreSettings {
    fn default() -> Self {
        ChunkStoreSettings {
            shards: 16,
            retry: RetryPolicy { max_attempts: 3, backoff_ticks: 20 },
            unload_grace_ticks: 100,
        }
    }
}

/// What a reconcile pass did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub requested: usize,
    pub retried: usize,
    pub unloaded: usize,
    /// Failed chunks dropped because nothing wanted them any more.
    pub evicted: usize,
}

// Everything a background load needs, cloned into the job
#[derive(Clone)]
struct LoadContext {
    generator: Arc<dyn WorldGenerator>,
    persistence: Arc<dyn ChunkPersistence>,
    policy: RetryPolicy,
    current_tick: Arc<AtomicU64>,
    generation_requests: Arc<AtomicU64>,
}

impl LoadContext {
    fn run(&self, chunk: &Chunk) {
        let coord = chunk.coord();
        match self.persistence.load_persisted(coord) {
            Ok(Some(content)) => {
                debug!("Chunk {} restored from persistence", coord);
                chunk.finish_load(content);
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("Chunk {} persistence lookup failed, generating instead: {}", coord, e),
        }

        self.generation_requests.fetch_add(1, Ordering::AcqRel);
        match self.generator.generate(coord) {
            Ok(content) => chunk.finish_load(content),
            Err(e) => {
                let now = self.current_tick.load(Ordering::Acquire);
                chunk.fail_load(now, self.policy, &e.to_string());
            }
        }
    }
}

pub struct ChunkStore {
    shards: Arc<Vec<Shard>>,
    loader: LoadContext,
    pool: Arc<ThreadPool>,
    unload_grace_ticks: u64,
}

impl ChunkStore {
    pub fn new(
        generator: Arc<dyn WorldGenerator>,
        persistence: Arc<dyn ChunkPersistence>,
        pool: Arc<ThreadPool>,
        settings: ChunkStoreSettings,
    ) -> Self {
        let shard_count = settings.shards.max(1);
        let shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();
        info!(
            "ChunkStore: {} shards, retry max {} with {} tick backoff, unload grace {} ticks",
            shard_count, settings.retry.max_attempts, settings.retry.backoff_ticks, settings.unload_grace_ticks
        );

        ChunkStore {
            shards: Arc::new(shards),
            loader: LoadContext {
                generator,
                persistence,
                policy: settings.retry,
                current_tick: Arc::new(AtomicU64::new(0)),
                generation_requests: Arc::new(AtomicU64::new(0)),
            },
            pool,
            unload_grace_ticks: settings.unload_grace_ticks,
        }
    }

    fn shard_index(shard_count: usize, coord: ChunkCoord) -> usize {
        let mixed = (coord.x as i64).wrapping_mul(73_856_093) ^ (coord.z as i64).wrapping_mul(19_349_663);
        mixed.rem_euclid(shard_count as i64) as usize
    }

    fn shard(&self, coord: ChunkCoord) -> &Shard {
        &self.shards[Self::shard_index(self.shards.len(), coord)]
    }

    fn read_shard(&self, coord: ChunkCoord) -> RwLockReadGuard<'_, HashMap<ChunkCoord, Arc<Chunk>>> {
        self.shard(coord).read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(&self, coord: ChunkCoord) -> RwLockWriteGuard<'_, HashMap<ChunkCoord, Arc<Chunk>>> {
        self.shard(coord).write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tick used to schedule retries of failed generation.
    pub fn advance_to(&self, tick: Tick) {
        self.loader.current_tick.store(tick, Ordering::Release);
    }

    pub fn current_tick(&self) -> Tick {
        self.loader.current_tick.load(Ordering::Acquire)
    }

    /// Returns the chunk for `coord`, starting a background load if it is not in the store.
    ///
    /// Concurrent callers for the same coordinate all receive the same instance
    /// and only one of them schedules the load. A chunk that was on its way out
    /// is kept instead.
    pub fn load(&self, coord: ChunkCoord) -> Arc<Chunk> {
        if let Some(chunk) = self.read_shard(coord).get(&coord) {
            Self::cancel_unload(chunk);
            return Arc::clone(chunk);
        }

        let (chunk, inserted) = {
            let mut shard = self.write_shard(coord);
            match shard.get(&coord) {
                Some(existing) => {
                    Self::cancel_unload(existing);
                    (Arc::clone(existing), false)
                }
                None => {
                    let chunk = Arc::new(Chunk::new(coord, self.current_tick()));
                    shard.insert(coord, Arc::clone(&chunk));
                    (chunk, true)
                }
            }
        };

        if inserted {
            debug!("Chunk {} requested", coord);
            self.schedule_load(Arc::clone(&chunk));
        }
        chunk
    }

    fn cancel_unload(chunk: &Chunk) {
        let mut status = chunk.status_lock();
        if status.state == ChunkState::Unloading {
            status.state = ChunkState::Loaded;
            debug!("Chunk {} unload cancelled", chunk.coord());
        }
    }

    fn schedule_load(&self, chunk: Arc<Chunk>) {
        let loader = self.loader.clone();
        self.pool.execute(move || loader.run(&chunk));
    }

    /// Starts unloading a loaded chunk. Returns `false` if it was not in state `Loaded`.
    pub fn unload(&self, coord: ChunkCoord) -> bool {
        let Some(chunk) = self.get(coord) else {
            return false;
        };
        {
            let mut status = chunk.status_lock();
            if status.state != ChunkState::Loaded {
                return false;
            }
            status.state = ChunkState::Unloading;
        }

        let shards = Arc::clone(&self.shards);
        let persistence = Arc::clone(&self.loader.persistence);
        self.pool.execute(move || {
            if let Some(content) = chunk.snapshot() {
                if let Err(e) = persistence.save(coord, &content) {
                    warn!("Chunk {} could not be saved on unload: {}", coord, e);
                }
            }

            let shard = &shards[Self::shard_index(shards.len(), coord)];
            let mut map = shard.write().unwrap_or_else(PoisonError::into_inner);
            let same_chunk = map.get(&coord).is_some_and(|c| Arc::ptr_eq(c, &chunk));
            let mut status = chunk.status_lock();
            if same_chunk && status.state == ChunkState::Unloading {
                status.state = ChunkState::Unloaded;
                map.remove(&coord);
                debug!("Chunk {} unloaded", coord);
            }
        });
        true
    }

    pub fn get(&self, coord: ChunkCoord) -> Option<Arc<Chunk>> {
        self.read_shard(coord).get(&coord).cloned()
    }

    pub fn state(&self, coord: ChunkCoord) -> ChunkState {
        self.get(coord).map_or(ChunkState::Unloaded, |c| c.state())
    }

    /// Maps a non-loaded chunk to the error callers report for it.
    pub fn availability(&self, coord: ChunkCoord) -> Result<Arc<Chunk>, WorldError> {
        match self.get(coord) {
            Some(chunk) => match chunk.status() {
                status if status.state == ChunkState::Loaded => Ok(chunk),
                status if status.state == ChunkState::Unavailable => {
                    Err(WorldError::PermanentFailure { coord, attempts: status.attempts })
                }
                _ => Err(WorldError::TransientUnavailable { coord }),
            },
            None => Err(WorldError::TransientUnavailable { coord }),
        }
    }

    /// Sets one block in a loaded chunk and returns the block it replaced.
    pub fn edit(&self, pos: BlockPos, block: BlockId) -> Result<BlockId, WorldError> {
        let chunk = self.availability(pos.chunk())?;
        let (x, y, z) = pos.local();
        chunk
            .with_content_mut(|content| {
                let previous = content.block(x, y, z)?;
                content.set_block(x, y, z, block);
                Some(previous)
            })
            .flatten()
            .ok_or(WorldError::TransientUnavailable { coord: pos.chunk() })
    }

    pub fn read(&self, pos: BlockPos) -> Option<BlockId> {
        let chunk = self.get(pos.chunk())?;
        let (x, y, z) = pos.local();
        chunk.with_content(|content| content.block(x, y, z)).flatten()
    }

    /// Brings the store in line with the current reference counts.
    ///
    /// Referenced chunks are loaded (or retried once their backoff has passed).
    /// Loaded chunks that have gone unreferenced for the grace period are unloaded.
    pub fn reconcile(&self, references: &BTreeMap<ChunkCoord, usize>, tick: Tick) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for &coord in references.keys() {
            let existed = self.get(coord);
            let chunk = match existed {
                Some(chunk) => {
                    Self::cancel_unload(&chunk);
                    if chunk.begin_retry(tick) {
                        debug!("Chunk {} retrying generation", coord);
                        self.schedule_load(Arc::clone(&chunk));
                        summary.retried += 1;
                    }
                    chunk
                }
                None => {
                    summary.requested += 1;
                    self.load(coord)
                }
            };
            chunk.set_references(references[&coord], tick);
        }

        let mut idle = Vec::new();
        let mut abandoned = Vec::new();
        for shard in self.shards.iter() {
            let map = shard.read().unwrap_or_else(PoisonError::into_inner);
            for (coord, chunk) in map.iter() {
                if references.contains_key(coord) {
                    continue;
                }
                chunk.set_references(0, tick);
                if tick.saturating_sub(chunk.last_referenced()) < self.unload_grace_ticks {
                    continue;
                }
                match chunk.state() {
                    ChunkState::Loaded => idle.push(*coord),
                    ChunkState::Failed => abandoned.push(*coord),
                    _ => {}
                }
            }
        }

        for coord in idle {
            if self.unload(coord) {
                summary.unloaded += 1;
            }
        }
        for coord in abandoned {
            if self.evict_failed(coord) {
                summary.evicted += 1;
            }
        }
        summary
    }

    // Failed chunks have no content to save, so they are dropped in place
    fn evict_failed(&self, coord: ChunkCoord) -> bool {
        let mut map = self.write_shard(coord);
        let Some(chunk) = map.get(&coord) else {
            return false;
        };
        {
            let mut status = chunk.status_lock();
            if status.state != ChunkState::Failed {
                return false;
            }
            status.state = ChunkState::Unloaded;
        }
        map.remove(&coord);
        debug!("Failed chunk {} evicted", coord);
        true
    }

    pub fn loaded_coords(&self) -> Vec<ChunkCoord> {
        let mut coords: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| {
                let map = shard.read().unwrap_or_else(PoisonError::into_inner);
                map.values()
                    .filter(|c| c.is_loaded())
                    .map(|c| c.coord())
                    .collect::<Vec<_>>()
            })
            .collect();
        coords.sort_unstable();
        coords
    }

    /// Saves every loaded chunk on the calling thread. Returns how many were written.
    pub fn flush_all(&self) -> usize {
        let mut saved = 0;
        for shard in self.shards.iter() {
            let chunks: Vec<Arc<Chunk>> = shard
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            for chunk in chunks {
                let Some(content) = chunk.snapshot() else { continue };
                match self.loader.persistence.save(chunk.coord(), &content) {
                    Ok(()) => saved += 1,
                    Err(e) => warn!("Chunk {} could not be saved on flush: {}", chunk.coord(), e),
                }
            }
        }
        info!("ChunkStore: flushed {} chunks", saved);
        saved
    }

    /// Number of calls made to the world generator since the store was created.
    pub fn generation_requests(&self) -> u64 {
        self.loader.generation_requests.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Installs content directly, bypassing generation. Used to seed worlds.
    pub fn insert_loaded(&self, coord: ChunkCoord, content: ChunkContent) -> Arc<Chunk> {
        let chunk = Arc::new(Chunk::new(coord, self.current_tick()));
        chunk.finish_load(content);
        self.write_shard(coord).insert(coord, Arc::clone(&chunk));
        chunk
    }
}

impl fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStore")
            .field("shards", &self.shards.len())
            .field("chunks", &self.len())
            .field("unload_grace_ticks", &self.unload_grace_ticks)
            .finish()
    }
}
