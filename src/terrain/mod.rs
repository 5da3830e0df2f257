// Chunk data, the chunk store and its external collaborators
pub mod chunk;
pub mod chunk_manager;
pub mod chunk_storage;
pub mod generation;

// Re-export main types for easier access
pub use chunk::{Chunk, ChunkContent, ChunkState};
pub use chunk_manager::ChunkStore;
pub use chunk_storage::{ChunkPersistence, FileChunkStorage, MemoryChunkStorage};
pub use generation::{FlatGenerator, NoiseGenerator, WorldGenerator};
