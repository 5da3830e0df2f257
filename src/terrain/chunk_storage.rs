use std::collections::HashMap;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::ChunkCoord;
use crate::terrain::chunk::ChunkContent;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("chunk storage io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("chunk {coord} could not be encoded: {reason}")]
    Encode { coord: ChunkCoord, reason: String },

    #[error("chunk file {path} is corrupt: {reason}")]
    Decode { path: PathBuf, reason: String },
}

/// Where unloaded chunks go and where loads look before generating.
pub trait ChunkPersistence: Send + Sync {
    fn save(&self, coord: ChunkCoord, content: &ChunkContent) -> Result<(), StorageError>;

    // Ok(None) means nothing was stored for the coordinate
    fn load_persisted(&self, coord: ChunkCoord) -> Result<Option<ChunkContent>, StorageError>;
}

// On-disk record for a saved chunk
#[derive(Serialize, Deserialize)]
struct ChunkRecord {
    coord: ChunkCoord,
    content: ChunkContent,
}

/// Keeps saved chunks in memory. Useful for tests and for worlds that are never written out.
#[derive(Debug, Default)]
pub struct MemoryChunkStorage {
    chunks: Mutex<HashMap<ChunkCoord, ChunkContent>>,
}

impl MemoryChunkStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&coord)
    }
}

impl ChunkPersistence for MemoryChunkStorage {
    fn save(&self, coord: ChunkCoord, content: &ChunkContent) -> Result<(), StorageError> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(coord, content.clone());
        Ok(())
    }

    fn load_persisted(&self, coord: ChunkCoord) -> Result<Option<ChunkContent>, StorageError> {
        Ok(self
            .chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&coord)
            .cloned())
    }
}

// FileChunkStorage writes one bincode file per chunk and keeps recently used chunks cached
pub struct FileChunkStorage {
    save_dir: PathBuf,
    cache: Mutex<LruCache<ChunkCoord, ChunkContent>>,
}

impl FileChunkStorage {
    pub fn new(save_dir: impl AsRef<Path>, cache_size: usize) -> Result<Self, StorageError> {
        let save_dir = save_dir.as_ref().to_path_buf();
        fs::create_dir_all(&save_dir).map_err(|source| StorageError::Io {
            path: save_dir.clone(),
            source,
        })?;
        debug!("FileChunkStorage: save directory ready at {}", save_dir.display());

        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Ok(FileChunkStorage {
            save_dir,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn chunk_path(&self, coord: ChunkCoord) -> PathBuf {
        self.save_dir.join(format!("chunk_{}_{}.bin", coord.x, coord.z))
    }

    pub fn chunk_exists(&self, coord: ChunkCoord) -> bool {
        if self.cache.lock().unwrap_or_else(PoisonError::into_inner).contains(&coord) {
            return true;
        }
        self.chunk_path(coord).exists()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl ChunkPersistence for FileChunkStorage {
    fn save(&self, coord: ChunkCoord, content: &ChunkContent) -> Result<(), StorageError> {
        let path = self.chunk_path(coord);
        let record = ChunkRecord { coord, content: content.clone() };
        let bytes = bincode::serialize(&record).map_err(|e| StorageError::Encode {
            coord,
            reason: e.to_string(),
        })?;
        fs::write(&path, bytes).map_err(|source| StorageError::Io { path, source })?;

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(coord, record.content);
        Ok(())
    }

    fn load_persisted(&self, coord: ChunkCoord) -> Result<Option<ChunkContent>, StorageError> {
        if let Some(content) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&coord) {
            return Ok(Some(content.clone()));
        }

        let path = self.chunk_path(coord);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        let record: ChunkRecord = bincode::deserialize(&bytes).map_err(|e| StorageError::Decode {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if record.coord != coord {
            warn!(
                "FileChunkStorage: {} holds chunk {} but was read for {}",
                path.display(),
                record.coord,
                coord
            );
            return Err(StorageError::Decode {
                path,
                reason: format!("stored coordinate {} does not match", record.coord),
            });
        }

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(coord, record.content.clone());
        Ok(Some(record.content))
    }
}
