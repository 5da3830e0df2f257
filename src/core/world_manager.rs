//! The mutable world and its apply phase.
//!
//! `World` ties the entity registry, spatial index, chunk store and
//! visibility tracker together. Only the scheduler drives it: commands go
//! through [`World::apply`], motion through [`World::integrate`], and the
//! per-observer diff through [`World::diff`]. Registry and index are always
//! updated together so they never disagree about where an entity is.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, trace};

use crate::core::commands::{Command, PendingCommand};
use crate::core::entity::{EntityIdAllocator, EntityRegistry, Mutation};
use crate::core::error::{InvalidCommand, WorldError, WorldResult};
use crate::core::spatial_index::SpatialIndex;
use crate::core::types::{ChunkCoord, EntityId, ObserverId, Tick, Vec3};
use crate::core::visibility::{Anchor, DiffContext, VisibilityTracker, VisibleSet, compute_visible};
use crate::networking::event_sink::EventBatch;
use crate::terrain::chunk::ChunkState;
use crate::terrain::chunk_manager::ChunkStore;
use crate::threading::ThreadPool;

#[derive(Debug, Clone, PartialEq)]
pub struct WorldSettings {
    pub ticks_per_second: u32,
    pub entity_load_radius: u32,
    pub max_move_distance: f64,
    pub diffing_enabled: bool,
}

impl Default for WorldSettings {
    fn default() -> Self {
        WorldSettings {
            ticks_per_second: 20,
            entity_load_radius: 1,
            max_move_distance: 16.0,
            diffing_enabled: true,
        }
    }
}

/// Result of applying one command.
#[derive(Debug)]
pub enum ApplyOutcome {
    Applied,
    /// The command needs a chunk that is still loading. Retry it next tick.
    Held(PendingCommand, ChunkCoord),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrateSummary {
    pub moved: usize,
    /// Entities waiting at a boundary for the chunk ahead to load.
    pub held_at: Vec<ChunkCoord>,
    pub stopped: usize,
}

pub struct World {
    registry: EntityRegistry,
    index: Arc<SpatialIndex>,
    chunks: Arc<ChunkStore>,
    tracker: VisibilityTracker,
    dirty_chunks: BTreeSet<ChunkCoord>,
    detached: Vec<ObserverId>,
    settings: WorldSettings,
}

impl World {
    pub fn new(chunks: Arc<ChunkStore>, ids: Arc<EntityIdAllocator>, settings: WorldSettings) -> Self {
        World {
            registry: EntityRegistry::new(ids),
            index: Arc::new(SpatialIndex::new()),
            chunks,
            tracker: VisibilityTracker::new(),
            dirty_chunks: BTreeSet::new(),
            detached: Vec::new(),
            settings,
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn index(&self) -> &Arc<SpatialIndex> {
        &self.index
    }

    pub fn chunks(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    pub fn tracker(&self) -> &VisibilityTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    pub fn set_diffing_enabled(&mut self, enabled: bool) {
        self.settings.diffing_enabled = enabled;
    }

    /// `Ok(None)` when `coord` is loaded, `Ok(Some(coord))` when it is on its way.
    /// Requests the load as a side effect.
    fn check_entry(&self, coord: ChunkCoord) -> WorldResult<Option<ChunkCoord>> {
        if self.chunks.state(coord) != ChunkState::Loaded {
            self.chunks.load(coord);
        }
        match self.chunks.availability(coord) {
            Ok(_) => Ok(None),
            Err(WorldError::TransientUnavailable { coord }) => Ok(Some(coord)),
            Err(e) => Err(e),
        }
    }

    fn validate(&self, command: &Command) -> Result<(), InvalidCommand> {
        match command {
            Command::Spawn { entity, position, velocity, .. } => {
                if !position.is_finite() || !velocity.is_finite() {
                    return Err(InvalidCommand::NonFinitePosition(*entity));
                }
                if self.registry.contains(*entity) {
                    return Err(InvalidCommand::DuplicateEntity(*entity));
                }
            }
            Command::Move { entity, position } => {
                let current = self
                    .registry
                    .get(*entity)
                    .ok_or(InvalidCommand::UnknownEntity(*entity))?
                    .position();
                if !position.is_finite() {
                    return Err(InvalidCommand::NonFinitePosition(*entity));
                }
                let distance = current.distance(*position);
                if distance > self.settings.max_move_distance {
                    return Err(InvalidCommand::MoveTooFar {
                        entity: *entity,
                        distance,
                        limit: self.settings.max_move_distance,
                    });
                }
            }
            Command::Teleport { entity, position } => {
                if !self.registry.contains(*entity) {
                    return Err(InvalidCommand::UnknownEntity(*entity));
                }
                if !position.is_finite() {
                    return Err(InvalidCommand::NonFinitePosition(*entity));
                }
            }
            Command::SetBlock { position, .. } if !position.in_height_bounds() => {
                return Err(InvalidCommand::BlockOutOfBounds(*position));
            }
            Command::Attach { anchor: Anchor::Entity(entity), .. } if !self.registry.contains(*entity) => {
                return Err(InvalidCommand::UnknownEntity(*entity));
            }
            _ => {}
        }
        Ok(())
    }

    /// Chunk the command has to wait for, if any.
    fn entry_blocker(&self, command: &Command) -> WorldResult<Option<ChunkCoord>> {
        let target = match command {
            Command::Spawn { position, .. }
            | Command::Move { position, .. }
            | Command::Teleport { position, .. } => ChunkCoord::containing(*position),
            Command::SetBlock { position, .. } => position.chunk(),
            _ => return Ok(None),
        };
        self.check_entry(target)
    }

    /// Applies one command. Errors reject only this command.
    pub fn apply(&mut self, pending: PendingCommand, tick: Tick) -> WorldResult<ApplyOutcome> {
        self.validate(&pending.command)?;
        if let Some(coord) = self.entry_blocker(&pending.command)? {
            trace!("{:?} held for chunk {}", pending.command, coord);
            return Ok(ApplyOutcome::Held(pending, coord));
        }

        match pending.command {
            Command::Spawn { entity, position, velocity, owner } => {
                self.registry.spawn(entity, position, velocity, owner, tick)?;
                self.index.insert(entity, position);
            }
            Command::Despawn { entity } => self.despawn(entity)?,
            Command::Move { entity, position } | Command::Teleport { entity, position } => {
                self.set_position(entity, position)?;
            }
            Command::SetVelocity { entity, velocity } => {
                self.registry.apply_mutation(entity, Mutation::Velocity(velocity))?;
            }
            Command::InsertComponent { entity, kind, value } => {
                self.registry.apply_mutation(entity, Mutation::InsertComponent(kind, value))?;
            }
            Command::RemoveComponent { entity, kind } => {
                self.registry.apply_mutation(entity, Mutation::RemoveComponent(kind))?;
            }
            Command::SetBlock { position, block } => {
                let previous = self.chunks.edit(position, block)?;
                if previous != block {
                    self.dirty_chunks.insert(position.chunk());
                }
            }
            Command::Attach { observer, anchor, view } => {
                let position = match anchor {
                    Anchor::Entity(entity) => self
                        .registry
                        .get(entity)
                        .map(|e| e.position())
                        .ok_or(InvalidCommand::UnknownEntity(entity))?,
                    Anchor::Fixed(position) => position,
                };
                self.tracker.attach(observer, anchor, view, position, tick)?;
            }
            Command::Detach { observer } => {
                self.tracker.detach(observer)?;
                for entity in self.registry.owned_by(observer) {
                    self.despawn(entity)?;
                }
                self.detached.push(observer);
            }
            Command::SetViewDistance { observer, view } => {
                self.tracker.set_view(observer, view)?;
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    fn despawn(&mut self, entity: EntityId) -> Result<(), InvalidCommand> {
        self.registry.despawn(entity).ok_or(InvalidCommand::UnknownEntity(entity))?;
        self.index.remove(entity);
        Ok(())
    }

    fn set_position(&mut self, entity: EntityId, position: Vec3) -> Result<(), InvalidCommand> {
        self.registry.apply_mutation(entity, Mutation::Position(position))?;
        if let Some(crossing) = self.index.move_entity(entity, position) {
            trace!("Entity {} crossed {} -> {}", entity, crossing.from, crossing.to);
        }
        Ok(())
    }

    /// Advances every moving entity by `velocity * dt`.
    ///
    /// An entity whose next step enters a chunk that is not loaded yet stays
    /// where it is; one heading into an unavailable chunk loses its velocity.
    pub fn integrate(&mut self, dt: f64) -> IntegrateSummary {
        let mut summary = IntegrateSummary::default();
        for (entity, position, velocity) in self.registry.moving() {
            let target = position + velocity * dt;
            if !target.is_finite() {
                continue;
            }
            let from = ChunkCoord::containing(position);
            let to = ChunkCoord::containing(target);
            if from != to {
                match self.check_entry(to) {
                    Ok(None) => {}
                    Ok(Some(coord)) => {
                        summary.held_at.push(coord);
                        continue;
                    }
                    Err(e) => {
                        debug!("Entity {} stopped at chunk boundary: {}", entity, e);
                        // Zero velocity is always finite, so this cannot fail
                        let _ = self.registry.apply_mutation(entity, Mutation::Velocity(Vec3::ZERO));
                        summary.stopped += 1;
                        continue;
                    }
                }
            }
            if self.set_position(entity, target).is_ok() {
                summary.moved += 1;
            }
        }
        summary
    }

    /// Moves entity-anchored observers onto their anchors.
    pub fn refresh_observers(&mut self) {
        self.tracker.refresh_positions(&self.registry);
    }

    /// Interest per chunk: entities within the load radius, observers within
    /// their chunk view distance, and commands waiting on the chunk.
    pub fn chunk_references(&self, held: &[ChunkCoord]) -> BTreeMap<ChunkCoord, usize> {
        let mut references = BTreeMap::new();
        for (chunk, count) in self.index.populations() {
            for coord in chunk.within(self.settings.entity_load_radius) {
                *references.entry(coord).or_insert(0) += count;
            }
        }
        for observer in self.tracker.iter() {
            for coord in observer.center_chunk().within(observer.view().chunks) {
                *references.entry(coord).or_insert(0) += 1;
            }
        }
        for coord in held {
            *references.entry(*coord).or_insert(0) += 1;
        }
        references
    }

    pub fn diff(&mut self, tick: Tick, pool: &ThreadPool) -> Vec<EventBatch> {
        self.tracker.refresh_positions(&self.registry);
        let ctx = DiffContext {
            registry: &self.registry,
            index: &self.index,
            chunks: &self.chunks,
            dirty_chunks: &self.dirty_chunks,
            tick,
            diffing_enabled: self.settings.diffing_enabled,
        };
        self.tracker.diff_all(&ctx, pool)
    }

    /// What `observer` should know given the current state. Compare with its known set.
    pub fn true_visible(&self, observer: ObserverId, tick: Tick) -> Option<VisibleSet> {
        let observer = self.tracker.get(observer)?;
        let ctx = DiffContext {
            registry: &self.registry,
            index: &self.index,
            chunks: &self.chunks,
            dirty_chunks: &self.dirty_chunks,
            tick,
            diffing_enabled: self.settings.diffing_enabled,
        };
        Some(compute_visible(observer, &ctx))
    }

    pub fn end_tick(&mut self) {
        self.registry.end_tick();
        self.dirty_chunks.clear();
    }

    pub fn take_detached(&mut self) -> Vec<ObserverId> {
        std::mem::take(&mut self.detached)
    }
}
