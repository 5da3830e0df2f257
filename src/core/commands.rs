//! Pending commands and the thread-safe intake that queues them.
//!
//! Sessions submit from any thread; the scheduler drains the queue once per
//! tick at Ingest. Order is preserved per submitting thread.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::core::entity::{ComponentKind, ComponentValue, EntityIdAllocator};
use crate::core::error::{WorldError, WorldResult};
use crate::core::types::{BlockId, BlockPos, EntityId, ObserverId, Vec3};
use crate::core::visibility::{Anchor, ViewDistance};

/// An intent to mutate the world, applied at the next tick's apply phase.
pub enum Command {
    Spawn {
        entity: EntityId,
        position: Vec3,
        velocity: Vec3,
        owner: Option<ObserverId>,
    },
    Despawn {
        entity: EntityId,
    },
    /// Walks to a nearby position. Rejected beyond the configured move distance.
    Move {
        entity: EntityId,
        position: Vec3,
    },
    Teleport {
        entity: EntityId,
        position: Vec3,
    },
    SetVelocity {
        entity: EntityId,
        velocity: Vec3,
    },
    InsertComponent {
        entity: EntityId,
        kind: ComponentKind,
        value: ComponentValue,
    },
    RemoveComponent {
        entity: EntityId,
        kind: ComponentKind,
    },
    SetBlock {
        position: BlockPos,
        block: BlockId,
    },
    Attach {
        observer: ObserverId,
        anchor: Anchor,
        view: ViewDistance,
    },
    Detach {
        observer: ObserverId,
    },
    SetViewDistance {
        observer: ObserverId,
        view: ViewDistance,
    },
}

impl Command {
    pub fn insert_component<T: Any + Send + Sync>(entity: EntityId, value: T) -> Self {
        Command::InsertComponent { entity, kind: TypeId::of::<T>(), value: Box::new(value) }
    }

    pub fn remove_component<T: Any>(entity: EntityId) -> Self {
        Command::RemoveComponent { entity, kind: TypeId::of::<T>() }
    }

    /// The entity this command mutates, if any.
    pub fn target_entity(&self) -> Option<EntityId> {
        match self {
            Command::Spawn { entity, .. }
            | Command::Despawn { entity }
            | Command::Move { entity, .. }
            | Command::Teleport { entity, .. }
            | Command::SetVelocity { entity, .. }
            | Command::InsertComponent { entity, .. }
            | Command::RemoveComponent { entity, .. } => Some(*entity),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Spawn { .. } => "spawn",
            Command::Despawn { .. } => "despawn",
            Command::Move { .. } => "move",
            Command::Teleport { .. } => "teleport",
            Command::SetVelocity { .. } => "set_velocity",
            Command::InsertComponent { .. } => "insert_component",
            Command::RemoveComponent { .. } => "remove_component",
            Command::SetBlock { .. } => "set_block",
            Command::Attach { .. } => "attach",
            Command::Detach { .. } => "detach",
            Command::SetViewDistance { .. } => "set_view_distance",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Spawn { entity, position, velocity, owner } => f
                .debug_struct("Spawn")
                .field("entity", entity)
                .field("position", position)
                .field("velocity", velocity)
                .field("owner", owner)
                .finish(),
            Command::Move { entity, position } | Command::Teleport { entity, position } => f
                .debug_struct(if matches!(self, Command::Move { .. }) { "Move" } else { "Teleport" })
                .field("entity", entity)
                .field("position", position)
                .finish(),
            Command::SetBlock { position, block } => f
                .debug_struct("SetBlock")
                .field("position", position)
                .field("block", block)
                .finish(),
            Command::Attach { observer, anchor, view } => f
                .debug_struct("Attach")
                .field("observer", observer)
                .field("anchor", anchor)
                .field("view", view)
                .finish(),
            other => match other.target_entity() {
                Some(entity) => write!(f, "{}({})", other.name(), entity),
                None => write!(f, "{}", other.name()),
            },
        }
    }
}

/// Who submitted a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandSource {
    Session(ObserverId),
    System,
}

#[derive(Debug)]
pub struct PendingCommand {
    pub source: CommandSource,
    pub command: Command,
}

/// Cloneable submission handle. Safe to use from any thread.
#[derive(Clone)]
pub struct CommandIntake {
    sender: Sender<PendingCommand>,
    ids: Arc<EntityIdAllocator>,
}

impl CommandIntake {
    pub fn submit(&self, source: CommandSource, command: Command) -> WorldResult<()> {
        self.sender
            .send(PendingCommand { source, command })
            .map_err(|_| WorldError::IntakeClosed)
    }

    /// Reserves an id and queues its spawn. Session spawns are owned by the session.
    pub fn spawn(&self, source: CommandSource, position: Vec3, velocity: Vec3) -> WorldResult<EntityId> {
        let entity = self.ids.allocate()?;
        let owner = match source {
            CommandSource::Session(observer) => Some(observer),
            CommandSource::System => None,
        };
        self.submit(source, Command::Spawn { entity, position, velocity, owner })?;
        Ok(entity)
    }

    pub fn attach(&self, observer: ObserverId, anchor: Anchor, view: ViewDistance) -> WorldResult<()> {
        self.submit(CommandSource::Session(observer), Command::Attach { observer, anchor, view })
    }

    pub fn detach(&self, observer: ObserverId) -> WorldResult<()> {
        self.submit(CommandSource::Session(observer), Command::Detach { observer })
    }

    /// Commands submitted but not yet drained.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

impl fmt::Debug for CommandIntake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandIntake").field("pending", &self.pending()).finish()
    }
}

/// Receiving end owned by the scheduler.
#[derive(Debug)]
pub struct CommandQueue {
    receiver: Receiver<PendingCommand>,
}

impl CommandQueue {
    /// Takes what was queued when the call began; later submissions wait for the next drain.
    pub fn drain(&self) -> Vec<PendingCommand> {
        let queued = self.receiver.len();
        let mut drained = Vec::with_capacity(queued);
        for _ in 0..queued {
            match self.receiver.try_recv() {
                Ok(pending) => drained.push(pending),
                Err(_) => break,
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

pub fn command_channel(ids: Arc<EntityIdAllocator>) -> (CommandIntake, CommandQueue) {
    let (sender, receiver) = channel::unbounded();
    (CommandIntake { sender, ids }, CommandQueue { receiver })
}
