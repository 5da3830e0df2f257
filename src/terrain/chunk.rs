use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::core::types::{AIR, BlockId, CHUNK_HEIGHT, CHUNK_SIZE, ChunkCoord, Tick};

const COLUMN_AREA: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize;
const GRID_LEN: usize = COLUMN_AREA * CHUNK_HEIGHT as usize;

// Dense block grid for one chunk column, y-major
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChunkContent {
    blocks: Vec<BlockId>,
}

impl ChunkContent {
    pub fn empty() -> Self {
        ChunkContent { blocks: vec![AIR; GRID_LEN] }
    }

    fn slot(x: usize, y: usize, z: usize) -> Option<usize> {
        let size = CHUNK_SIZE as usize;
        if x >= size || z >= size || y >= CHUNK_HEIGHT as usize {
            return None;
        }
        Some(y * COLUMN_AREA + z * size + x)
    }

    pub fn block(&self, x: usize, y: usize, z: usize) -> Option<BlockId> {
        Self::slot(x, y, z).map(|i| self.blocks[i])
    }

    // Returns false when the local position is outside the grid
    pub fn set_block(&mut self, x: usize, y: usize, z: usize, block: BlockId) -> bool {
        match Self::slot(x, y, z) {
            Some(i) => {
                self.blocks[i] = block;
                true
            }
            None => false,
        }
    }

    // Fills y in [0, height) of one column
    pub fn fill_column(&mut self, x: usize, z: usize, height: usize, block: BlockId) {
        for y in 0..height.min(CHUNK_HEIGHT as usize) {
            self.set_block(x, y, z, block);
        }
    }

    /// Height of the topmost non-air block plus one, or 0 for an empty column.
    pub fn surface_height(&self, x: usize, z: usize) -> usize {
        (0..CHUNK_HEIGHT as usize)
            .rev()
            .find(|&y| self.block(x, y, z).is_some_and(|b| b != AIR))
            .map_or(0, |y| y + 1)
    }

    pub fn non_air_count(&self) -> usize {
        self.blocks.iter().filter(|b| **b != AIR).count()
    }
}

impl Default for ChunkContent {
    fn default() -> Self {
        Self::empty()
    }
}

/// Lifecycle state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    // Generation failed; waiting for the next retry
    Failed,
    // Retries exhausted. Never loads again during this process
    Unavailable,
}

/// Retry schedule for failed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ticks: u64,
}

impl RetryPolicy {
    // Delay before the attempt that follows `failed_attempts` failures
    pub fn delay_after(&self, failed_attempts: u32) -> u64 {
        let exponent = failed_attempts.saturating_sub(1).min(32);
        self.backoff_ticks.saturating_mul(1u64 << exponent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStatus {
    pub state: ChunkState,
    pub attempts: u32,
    pub retry_at: Tick,
}

/// A chunk owned by the chunk store.
///
/// Status and content sit behind separate per-chunk locks: readers of a loaded
/// chunk's content proceed concurrently, and a block edit holds only this
/// chunk's write lock.
#[derive(Debug)]
pub struct Chunk {
    coord: ChunkCoord,
    status: Mutex<ChunkStatus>,
    content: RwLock<Option<ChunkContent>>,
    references: AtomicUsize,
    last_referenced: AtomicU64,
}

impl Chunk {
    pub(crate) fn new(coord: ChunkCoord, tick: Tick) -> Self {
        Chunk {
            coord,
            status: Mutex::new(ChunkStatus { state: ChunkState::Loading, attempts: 0, retry_at: 0 }),
            content: RwLock::new(None),
            references: AtomicUsize::new(0),
            last_referenced: AtomicU64::new(tick),
        }
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub(crate) fn status_lock(&self) -> MutexGuard<'_, ChunkStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ChunkStatus {
        *self.status_lock()
    }

    pub fn state(&self) -> ChunkState {
        self.status_lock().state
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ChunkState::Loaded
    }

    /// Entities and observers that had this chunk in range at the last reconcile.
    pub fn reference_count(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    pub fn last_referenced(&self) -> Tick {
        self.last_referenced.load(Ordering::Acquire)
    }

    pub(crate) fn set_references(&self, count: usize, tick: Tick) {
        self.references.store(count, Ordering::Release);
        if count > 0 {
            self.last_referenced.store(tick, Ordering::Release);
        }
    }

    /// Runs `f` against the content if the chunk is loaded.
    pub fn with_content<R>(&self, f: impl FnOnce(&ChunkContent) -> R) -> Option<R> {
        let guard = self.content.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f)
    }

    pub(crate) fn with_content_mut<R>(&self, f: impl FnOnce(&mut ChunkContent) -> R) -> Option<R> {
        let mut guard = self.content.write().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().map(f)
    }

    pub(crate) fn snapshot(&self) -> Option<ChunkContent> {
        self.with_content(Clone::clone)
    }

    pub(crate) fn finish_load(&self, content: ChunkContent) {
        *self.content.write().unwrap_or_else(PoisonError::into_inner) = Some(content);
        let mut status = self.status_lock();
        status.state = ChunkState::Loaded;
        debug!("Chunk {} loaded after {} failed attempt(s)", self.coord, status.attempts);
    }

    pub(crate) fn fail_load(&self, now: Tick, policy: RetryPolicy, reason: &str) {
        let mut status = self.status_lock();
        status.attempts += 1;
        if status.attempts >= policy.max_attempts {
            status.state = ChunkState::Unavailable;
            error!(
                "Chunk {} unavailable after {} attempts: {}",
                self.coord, status.attempts, reason
            );
        } else {
            status.state = ChunkState::Failed;
            status.retry_at = now.saturating_add(policy.delay_after(status.attempts));
            warn!(
                "Chunk {} generation failed (attempt {}/{}), retry at tick {}: {}",
                self.coord, status.attempts, policy.max_attempts, status.retry_at, reason
            );
        }
    }

    /// Moves a failed chunk back to `Loading` if its backoff has elapsed.
    pub(crate) fn begin_retry(&self, now: Tick) -> bool {
        let mut status = self.status_lock();
        if status.state == ChunkState::Failed && status.retry_at <= now {
            status.state = ChunkState::Loading;
            true
        } else {
            false
        }
    }
}
