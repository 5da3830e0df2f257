//! World generators.
//!
//! A generator turns a chunk coordinate into block content. It runs on the
//! chunk store's IO pool, never on the tick thread, and may fail: failures are
//! retried by the store with exponential backoff.

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{BlockId, CHUNK_HEIGHT, CHUNK_SIZE, ChunkCoord};
use crate::terrain::chunk::ChunkContent;

pub const STONE: BlockId = 1;
pub const DIRT: BlockId = 2;
pub const GRASS: BlockId = 3;
pub const ORE: BlockId = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("generator failed for chunk {coord}: {reason}")]
    Failed { coord: ChunkCoord, reason: String },
}

impl GenerationError {
    pub fn failed(coord: ChunkCoord, reason: impl Into<String>) -> Self {
        GenerationError::Failed { coord, reason: reason.into() }
    }
}

pub trait WorldGenerator: Send + Sync {
    fn generate(&self, coord: ChunkCoord) -> Result<ChunkContent, GenerationError>;
}

impl<F> WorldGenerator for F
where
    F: Fn(ChunkCoord) -> Result<ChunkContent, GenerationError> + Send + Sync,
{
    fn generate(&self, coord: ChunkCoord) -> Result<ChunkContent, GenerationError> {
        self(coord)
    }
}

// Every column stone up to `height`, capped with one grass block
#[derive(Debug, Clone, Copy)]
pub struct FlatGenerator {
    pub height: usize,
}

impl Default for FlatGenerator {
    fn default() -> Self {
        FlatGenerator { height: 8 }
    }
}

impl WorldGenerator for FlatGenerator {
    fn generate(&self, _coord: ChunkCoord) -> Result<ChunkContent, GenerationError> {
        let mut content = ChunkContent::empty();
        let height = self.height.clamp(1, CHUNK_HEIGHT as usize);
        for x in 0..CHUNK_SIZE as usize {
            for z in 0..CHUNK_SIZE as usize {
                content.fill_column(x, z, height - 1, STONE);
                content.set_block(x, height - 1, z, GRASS);
            }
        }
        Ok(content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseSettings {
    pub seed: u32,
    pub frequency: f64,
    pub octaves: usize,
    pub lacunarity: f64,
    pub persistence: f64,
    pub base_height: f64,
    pub amplitude: f64,
    // Ore blocks scattered per chunk below the dirt layer
    pub ore_per_chunk: u32,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        NoiseSettings {
            seed: 12345,
            frequency: 0.01,
            octaves: 4,
            lacunarity: 2.0,
            persistence: 0.5,
            base_height: 24.0,
            amplitude: 12.0,
            ore_per_chunk: 6,
        }
    }
}

/// Fractal heightmap terrain. Output is a pure function of the settings and the coordinate.
pub struct NoiseGenerator {
    settings: NoiseSettings,
    heightmap: Fbm<Perlin>,
}

impl NoiseGenerator {
    pub fn new(settings: NoiseSettings) -> Self {
        let heightmap = Fbm::<Perlin>::new(settings.seed)
            .set_frequency(settings.frequency)
            .set_octaves(settings.octaves)
            .set_lacunarity(settings.lacunarity)
            .set_persistence(settings.persistence);
        NoiseGenerator { settings, heightmap }
    }

    pub fn settings(&self) -> &NoiseSettings {
        &self.settings
    }

    fn column_height(&self, world_x: f64, world_z: f64) -> usize {
        let sample = self.heightmap.get([world_x, world_z]);
        let height = self.settings.base_height + sample * self.settings.amplitude;
        height.round().clamp(1.0, (CHUNK_HEIGHT - 1) as f64) as usize
    }

    fn chunk_rng(&self, coord: ChunkCoord) -> ChaCha8Rng {
        let mixed = (self.settings.seed as u64)
            ^ ((coord.x as u32 as u64) << 32)
            ^ (coord.z as u32 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ChaCha8Rng::seed_from_u64(mixed)
    }
}

impl WorldGenerator for NoiseGenerator {
    fn generate(&self, coord: ChunkCoord) -> Result<ChunkContent, GenerationError> {
        let origin = coord.origin();
        let mut content = ChunkContent::empty();

        for x in 0..CHUNK_SIZE as usize {
            for z in 0..CHUNK_SIZE as usize {
                let height = self.column_height(origin.x + x as f64, origin.z + z as f64);
                content.fill_column(x, z, height.saturating_sub(3), STONE);
                for y in height.saturating_sub(3)..height - 1 {
                    content.set_block(x, y, z, DIRT);
                }
                content.set_block(x, height - 1, z, GRASS);
            }
        }

        let mut rng = self.chunk_rng(coord);
        for _ in 0..self.settings.ore_per_chunk {
            let x = rng.random_range(0..CHUNK_SIZE as usize);
            let z = rng.random_range(0..CHUNK_SIZE as usize);
            let ceiling = content.surface_height(x, z).saturating_sub(3);
            if ceiling > 1 {
                let y = rng.random_range(1..ceiling);
                content.set_block(x, y, z, ORE);
            }
        }
        Ok(content)
    }
}
