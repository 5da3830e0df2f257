//! Simulation core of a voxel-world multiplayer server.
//!
//! A fixed-rate [`TickScheduler`] drains queued commands, applies them to the
//! entity registry and spatial index, keeps the chunk store loaded around
//! entities and observers, and hands every attached observer an ordered batch
//! of the visibility changes it needs.

pub mod config;
pub mod core;
pub mod networking;
pub mod terrain;
pub mod threading;

pub use crate::config::config_manager::{ConfigurationError, ConfigurationManager, SimulationConfig};
pub use crate::core::commands::{Command, CommandIntake, CommandSource};
pub use crate::core::error::{InvalidCommand, WorldError, WorldResult};
pub use crate::core::scheduler::{TickPhase, TickReport, TickScheduler};
pub use crate::core::types::{BlockPos, ChunkCoord, EntityId, ObserverId, Tick, Vec3};
pub use crate::core::visibility::{Anchor, ViewDistance};
pub use crate::networking::event_sink::{EventBatch, EventSink, WorldEvent};
pub use crate::terrain::chunk::{ChunkContent, ChunkState};
pub use crate::terrain::chunk_storage::ChunkPersistence;
pub use crate::terrain::generation::WorldGenerator;
