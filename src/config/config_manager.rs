// src/config/config_manager.rs

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::visibility::ViewDistance;
use crate::terrain::chunk::RetryPolicy;
use crate::terrain::chunk_manager::ChunkStoreSettings;

// --- Section Definitions ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TickConfig {
    pub ticks_per_second: u32,
    // Wall-clock budget per tick. None means one tick interval
    pub budget_ms: Option<u64>,
    pub diffing_enabled: bool,
}

impl Default for TickConfig {
    fn default() -> Self {
        TickConfig {
            ticks_per_second: 20,
            budget_ms: None,
            diffing_enabled: true,
        }
    }
}

impl TickConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.ticks_per_second.max(1)
    }

    pub fn budget(&self) -> Duration {
        self.budget_ms.map(Duration::from_millis).unwrap_or_else(|| self.interval())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ViewConfig {
    pub chunk_view_distance: u32,
    pub entity_view_distance: u32,
    // Chunks kept loaded around every entity
    pub entity_load_radius: u32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        ViewConfig {
            chunk_view_distance: 8,
            entity_view_distance: 5,
            entity_load_radius: 1,
        }
    }
}

impl ViewConfig {
    pub fn default_view(&self) -> ViewDistance {
        ViewDistance::new(self.chunk_view_distance, self.entity_view_distance)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ChunkConfig {
    pub unload_grace_ticks: u64,
    pub generation_max_attempts: u32,
    pub retry_backoff_ticks: u64,
    // 0 = one worker per CPU
    pub io_threads: usize,
    pub store_shards: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            unload_grace_ticks: 100,
            generation_max_attempts: 3,
            retry_backoff_ticks: 20,
            io_threads: 0,
            store_shards: 16,
        }
    }
}

impl ChunkConfig {
    pub fn store_settings(&self) -> ChunkStoreSettings {
        ChunkStoreSettings {
            shards: self.store_shards,
            retry: RetryPolicy {
                max_attempts: self.generation_max_attempts,
                backoff_ticks: self.retry_backoff_ticks,
            },
            unload_grace_ticks: self.unload_grace_ticks,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EntityConfig {
    pub id_capacity: u64,
    pub max_move_distance: f64,
}

impl Default for EntityConfig {
    fn default() -> Self {
        EntityConfig {
            id_capacity: u64::MAX,
            max_move_distance: 16.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    // Workers delivering batches to the event sink, apart from the chunk IO pool. 0 = one per CPU
    pub threads: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig { threads: 2 }
    }
}

// --- Main SimulationConfig Struct ---
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SimulationConfig {
    #[serde(default)]
    pub tick: TickConfig,
    #[serde(default)]
    pub view: ViewConfig,
    #[serde(default)]
    pub chunks: ChunkConfig,
    #[serde(default)]
    pub entities: EntityConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.tick.ticks_per_second == 0 {
            return Err(ConfigurationError::InvalidTickRate);
        }
        if self.tick.budget_ms == Some(0) {
            return Err(ConfigurationError::InvalidBudget);
        }
        if self.view.entity_view_distance > self.view.chunk_view_distance {
            return Err(ConfigurationError::EntityViewExceedsChunkView {
                entity: self.view.entity_view_distance,
                chunk: self.view.chunk_view_distance,
            });
        }
        if self.chunks.generation_max_attempts == 0 {
            return Err(ConfigurationError::InvalidRetryCount);
        }
        if self.chunks.store_shards == 0 {
            return Err(ConfigurationError::InvalidShardCount);
        }
        if self.entities.id_capacity == 0 {
            return Err(ConfigurationError::InvalidIdCapacity);
        }
        if !(self.entities.max_move_distance > 0.0) {
            return Err(ConfigurationError::InvalidMoveDistance(self.entities.max_move_distance));
        }
        Ok(())
    }
}

// Configuration Manager: owns the current config and the path it came from
#[derive(Debug)]
pub struct ConfigurationManager {
    current_config: SimulationConfig,
    config_path: Option<PathBuf>,
}

impl ConfigurationManager {
    pub fn with_config(config: SimulationConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            current_config: config,
            config_path,
        }
    }

    // Load configuration from a TOML file. Missing sections and keys take their defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path_ref = path.as_ref();
        debug!("Loading config from: {:?}", path_ref);
        let config_str = fs::read_to_string(path_ref)?;

        let config: SimulationConfig = toml::from_str(&config_str).map_err(|e| {
            warn!("Failed to parse TOML config {:?}: {}", path_ref, e);
            ConfigurationError::Parse(e)
        })?;
        config.validate()?;

        info!("Loaded simulation config from {:?}", path_ref);
        Ok(Self {
            current_config: config,
            config_path: Some(path_ref.to_path_buf()),
        })
    }

    // Save configuration to the path it was loaded from (or set_config_path)
    pub fn save_to_file(&self) -> Result<(), ConfigurationError> {
        let Some(path) = &self.config_path else {
            return Err(ConfigurationError::NoConfigPath);
        };
        debug!("Saving config to: {:?}", path);
        let toml_string = toml::to_string_pretty(&self.current_config)?;
        fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn set_config_path<P: AsRef<Path>>(&mut self, path: P) {
        self.config_path = Some(path.as_ref().to_path_buf());
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    // Replaces the whole config; rejected configs leave the current one untouched
    pub fn update_config(&mut self, updates: SimulationConfig) -> Result<(), ConfigurationError> {
        updates.validate()?;
        self.current_config = updates;
        Ok(())
    }

    pub fn get_config(&self) -> &SimulationConfig {
        &self.current_config
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.current_config.validate()
    }
}

impl Default for ConfigurationManager {
    fn default() -> Self {
        Self {
            current_config: SimulationConfig::default(),
            config_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read or write config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("no config path set")]
    NoConfigPath,

    #[error("ticks_per_second must be at least 1")]
    InvalidTickRate,

    #[error("budget_ms must be at least 1")]
    InvalidBudget,

    #[error("entity view distance {entity} exceeds chunk view distance {chunk}")]
    EntityViewExceedsChunkView { entity: u32, chunk: u32 },

    #[error("generation_max_attempts must be at least 1")]
    InvalidRetryCount,

    #[error("store_shards must be at least 1")]
    InvalidShardCount,

    #[error("id_capacity must be at least 1")]
    InvalidIdCapacity,

    #[error("max_move_distance must be positive, got {0}")]
    InvalidMoveDistance(f64),

    #[error("could not build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
