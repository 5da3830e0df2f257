//! Error taxonomy for the simulation core.
//!
//! Nothing here is fatal to the process. Apply-phase errors reject one command
//! and leave the rest of the tick untouched; chunk failures only make the
//! affected coordinate unavailable.

use std::time::Duration;

use thiserror::Error;

use crate::core::types::{BlockPos, ChunkCoord, EntityId, ObserverId, Tick};

/// Returned when the entity identifier space is exhausted.
///
/// The capacity is fixed at startup from configuration, so hitting this means
/// the deployment was sized too small rather than a transient runtime fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("entity id space exhausted (capacity {capacity})")]
pub struct CapacityError {
    pub capacity: u64,
}

/// A malformed or stale mutation. Dropped with a diagnostic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidCommand {
    #[error("entity {0} does not exist")]
    UnknownEntity(EntityId),

    #[error("entity {0} already exists")]
    DuplicateEntity(EntityId),

    #[error("entity id {0} was never allocated")]
    UnallocatedEntity(EntityId),

    #[error("observer {0} is not attached")]
    UnknownObserver(ObserverId),

    #[error("observer {0} is already attached")]
    DuplicateObserver(ObserverId),

    #[error("position of entity {0} is not finite")]
    NonFinitePosition(EntityId),

    #[error("move of entity {entity} spans {distance:.2} blocks (limit {limit:.2})")]
    MoveTooFar {
        entity: EntityId,
        distance: f64,
        limit: f64,
    },

    #[error("block position {0} is outside the chunk height")]
    BlockOutOfBounds(BlockPos),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorldError {
    /// The chunk is still loading. Callers retry on a later tick; never shown to players.
    #[error("chunk {coord} is not loaded yet")]
    TransientUnavailable { coord: ChunkCoord },

    /// Generation exhausted its retries. Movement and spawns into the chunk are rejected.
    #[error("chunk {coord} is unavailable after {attempts} generation attempts")]
    PermanentFailure { coord: ChunkCoord, attempts: u32 },

    #[error("invalid command: {0}")]
    InvalidCommand(#[from] InvalidCommand),

    /// A tick exceeded its wall-clock budget. Reported, never fatal.
    #[error("tick {tick} took {elapsed:?} (budget {budget:?})")]
    Overrun {
        tick: Tick,
        elapsed: Duration,
        budget: Duration,
    },

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("command intake is closed")]
    IntakeClosed,
}

impl WorldError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorldError::TransientUnavailable { .. })
    }
}

pub type WorldResult<T> = Result<T, WorldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_command_converts_and_displays() {
        let err: WorldError = InvalidCommand::UnknownEntity(EntityId(7)).into();
        assert_eq!(err.to_string(), "invalid command: entity #7 does not exist");
        assert!(!err.is_transient());
    }

    #[test]
    fn permanent_failure_names_coordinate() {
        let err = WorldError::PermanentFailure { coord: ChunkCoord::new(2, -3), attempts: 3 };
        assert_eq!(err.to_string(), "chunk [2, -3] is unavailable after 3 generation attempts");
    }
}
