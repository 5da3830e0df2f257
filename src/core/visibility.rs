//! Visibility tracker.
//!
//! Every attached observer owns a known set: the entities and chunks it has
//! been told about. Once per tick the tracker recomputes each observer's true
//! visible set from the spatial index and chunk store, turns the difference
//! into an ordered event batch and replaces the known set with the visible
//! set. Observers are diffed in parallel; each one is touched by exactly one
//! worker, so the per-observer `&mut` is the only exclusion needed.
//!
//! Batch order is fixed:
//! chunk shows, entity spawns, entity updates, chunk updates, entity
//! despawns, chunk hides. Within each group ids and coordinates ascend.
//! Only final state is compared, so an entity that entered and left range
//! during the same tick produces no events at all.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::core::entity::EntityRegistry;
use crate::core::error::InvalidCommand;
use crate::core::spatial_index::SpatialIndex;
use crate::core::types::{ChunkCoord, EntityId, ObserverId, Tick, Vec3};
use crate::networking::event_sink::{EventBatch, WorldEvent};
use crate::terrain::chunk::ChunkState;
use crate::terrain::chunk_manager::ChunkStore;
use crate::threading::ThreadPool;

/// How far an observer sees, in chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDistance {
    pub chunks: u32,
    pub entities: u32,
}

impl ViewDistance {
    pub const fn new(chunks: u32, entities: u32) -> Self {
        ViewDistance { chunks, entities }
    }

    // Entity range can never exceed chunk range
    pub fn clamped(self) -> Self {
        ViewDistance { chunks: self.chunks, entities: self.entities.min(self.chunks) }
    }
}

impl Default for ViewDistance {
    fn default() -> Self {
        ViewDistance { chunks: 8, entities: 5 }
    }
}

/// What an observer's view is centred on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anchor {
    /// Follows an entity, usually the session's own avatar. The entity itself is never reported.
    Entity(EntityId),
    Fixed(Vec3),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibleSet {
    pub entities: BTreeSet<EntityId>,
    pub chunks: BTreeSet<ChunkCoord>,
}

#[derive(Debug)]
pub struct Observer {
    id: ObserverId,
    anchor: Anchor,
    view: ViewDistance,
    position: Vec3,
    attached_at: Tick,
    known: VisibleSet,
}

impl Observer {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    pub fn view(&self) -> ViewDistance {
        self.view
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn center_chunk(&self) -> ChunkCoord {
        ChunkCoord::containing(self.position)
    }

    pub fn attached_at(&self) -> Tick {
        self.attached_at
    }

    pub fn known(&self) -> &VisibleSet {
        &self.known
    }

    fn anchor_entity(&self) -> Option<EntityId> {
        match self.anchor {
            Anchor::Entity(id) => Some(id),
            Anchor::Fixed(_) => None,
        }
    }
}

/// Read-only world state the diff runs against.
pub struct DiffContext<'a> {
    pub registry: &'a EntityRegistry,
    pub index: &'a SpatialIndex,
    pub chunks: &'a ChunkStore,
    // Chunks whose content was edited this tick
    pub dirty_chunks: &'a BTreeSet<ChunkCoord>,
    pub tick: Tick,
    pub diffing_enabled: bool,
}

/// The set an observer should know right now.
pub fn compute_visible(observer: &Observer, ctx: &DiffContext<'_>) -> VisibleSet {
    let center = observer.center_chunk();
    let own = observer.anchor_entity();

    let entities = ctx
        .index
        .query_chunk_range(center, observer.view.entities)
        .into_iter()
        .filter(|id| Some(*id) != own && ctx.registry.contains(*id))
        .collect();
    let chunks = center
        .within(observer.view.chunks)
        .filter(|coord| ctx.chunks.state(*coord) == ChunkState::Loaded)
        .collect();

    VisibleSet { entities, chunks }
}

fn diff_observer(observer: &mut Observer, ctx: &DiffContext<'_>) -> EventBatch {
    let visible = compute_visible(observer, ctx);
    let known = &observer.known;
    let mut events = Vec::new();

    for coord in visible.chunks.difference(&known.chunks) {
        events.push(WorldEvent::ChunkShow { coord: *coord });
    }
    for id in visible.entities.difference(&known.entities) {
        if let Some(entity) = ctx.registry.get(*id) {
            events.push(WorldEvent::Spawn {
                entity: *id,
                uuid: entity.uuid(),
                position: entity.position(),
                velocity: entity.velocity(),
            });
        }
    }
    for id in visible.entities.intersection(&known.entities) {
        if ctx.diffing_enabled && !ctx.registry.changed(*id) {
            continue;
        }
        if let Some(entity) = ctx.registry.get(*id) {
            events.push(WorldEvent::Update {
                entity: *id,
                position: entity.position(),
                velocity: entity.velocity(),
            });
        }
    }
    for coord in ctx.dirty_chunks {
        if visible.chunks.contains(coord) && known.chunks.contains(coord) {
            events.push(WorldEvent::ChunkUpdate { coord: *coord });
        }
    }
    for id in known.entities.difference(&visible.entities) {
        events.push(WorldEvent::Despawn { entity: *id });
    }
    for coord in known.chunks.difference(&visible.chunks) {
        events.push(WorldEvent::ChunkHide { coord: *coord });
    }

    trace!(
        "Observer {} tick {}: {} entities, {} chunks, {} events",
        observer.id,
        ctx.tick,
        visible.entities.len(),
        visible.chunks.len(),
        events.len()
    );
    observer.known = visible;
    EventBatch { observer: observer.id, tick: ctx.tick, events }
}

#[derive(Debug, Default)]
pub struct VisibilityTracker {
    observers: BTreeMap<ObserverId, Observer>,
}

impl VisibilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer with an empty known set. It sees its surroundings on the next diff.
    pub fn attach(
        &mut self,
        id: ObserverId,
        anchor: Anchor,
        view: ViewDistance,
        position: Vec3,
        tick: Tick,
    ) -> Result<(), InvalidCommand> {
        if self.observers.contains_key(&id) {
            return Err(InvalidCommand::DuplicateObserver(id));
        }
        debug!("Observer {} attached at {} ({:?})", id, position, view);
        self.observers.insert(
            id,
            Observer {
                id,
                anchor,
                view: view.clamped(),
                position,
                attached_at: tick,
                known: VisibleSet::default(),
            },
        );
        Ok(())
    }

    /// Drops the observer and its known set. No events are produced.
    pub fn detach(&mut self, id: ObserverId) -> Result<Observer, InvalidCommand> {
        let observer = self.observers.remove(&id).ok_or(InvalidCommand::UnknownObserver(id))?;
        debug!("Observer {} detached", id);
        Ok(observer)
    }

    pub fn set_view(&mut self, id: ObserverId, view: ViewDistance) -> Result<(), InvalidCommand> {
        let observer = self.observers.get_mut(&id).ok_or(InvalidCommand::UnknownObserver(id))?;
        observer.view = view.clamped();
        Ok(())
    }

    /// Moves entity-anchored observers to their anchor's current position.
    /// An observer whose anchor entity is gone stays where it last was.
    pub fn refresh_positions(&mut self, registry: &EntityRegistry) {
        for observer in self.observers.values_mut() {
            match observer.anchor {
                Anchor::Entity(id) => {
                    if let Some(entity) = registry.get(id) {
                        observer.position = entity.position();
                    }
                }
                Anchor::Fixed(position) => observer.position = position,
            }
        }
    }

    /// Diffs every observer and returns one batch per observer, in observer id order.
    pub fn diff_all(&mut self, ctx: &DiffContext<'_>, pool: &ThreadPool) -> Vec<EventBatch> {
        let mut observers: Vec<&mut Observer> = self.observers.values_mut().collect();
        pool.par_execute_mut(&mut observers, |observer| diff_observer(observer, ctx))
    }

    /// Observers whose known set holds `coord`.
    pub fn viewers_of(&self, coord: ChunkCoord) -> Vec<ObserverId> {
        self.observers
            .values()
            .filter(|o| o.known.chunks.contains(&coord))
            .map(|o| o.id)
            .collect()
    }

    /// Observers whose known set holds `entity`.
    pub fn watchers_of(&self, entity: EntityId) -> Vec<ObserverId> {
        self.observers
            .values()
            .filter(|o| o.known.entities.contains(&entity))
            .map(|o| o.id)
            .collect()
    }

    pub fn get(&self, id: ObserverId) -> Option<&Observer> {
        self.observers.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observer> {
        self.observers.values()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::entity::{EntityIdAllocator, Mutation};
    use crate::terrain::chunk_manager::ChunkStoreSettings;
    use crate::terrain::chunk_storage::MemoryChunkStorage;
    use crate::terrain::generation::FlatGenerator;

    struct Fixture {
        registry: EntityRegistry,
        index: SpatialIndex,
        chunks: ChunkStore,
        dirty: BTreeSet<ChunkCoord>,
        tracker: VisibilityTracker,
        pool: ThreadPool,
    }

    impl Fixture {
        fn new() -> Self {
            let chunks = ChunkStore::new(
                Arc::new(FlatGenerator::default()),
                Arc::new(MemoryChunkStorage::new()),
                Arc::new(ThreadPool::inline()),
                ChunkStoreSettings::default(),
            );
            for coord in ChunkCoord::new(0, 0).within(3) {
                chunks.load(coord);
            }
            Fixture {
                registry: EntityRegistry::new(Arc::new(EntityIdAllocator::new(u64::MAX))),
                index: SpatialIndex::new(),
                chunks,
                dirty: BTreeSet::new(),
                tracker: VisibilityTracker::new(),
                pool: ThreadPool::inline(),
            }
        }

        fn spawn(&mut self, position: Vec3) -> EntityId {
            let id = self.registry.create().unwrap();
            self.registry.spawn(id, position, Vec3::ZERO, None, 0).unwrap();
            self.index.insert(id, position);
            id
        }

        fn teleport(&mut self, id: EntityId, position: Vec3) {
            self.registry.apply_mutation(id, Mutation::Position(position)).unwrap();
            self.index.move_entity(id, position);
        }

        fn diff(&mut self, tick: Tick) -> Vec<EventBatch> {
            self.tracker.refresh_positions(&self.registry);
            let ctx = DiffContext {
                registry: &self.registry,
                index: &self.index,
                chunks: &self.chunks,
                dirty_chunks: &self.dirty,
                tick,
                diffing_enabled: true,
            };
            let batches = self.tracker.diff_all(&ctx, &self.pool);
            self.registry.end_tick();
            self.dirty.clear();
            batches
        }
    }

    fn entity_events(batch: &EventBatch) -> Vec<&WorldEvent> {
        batch.events.iter().filter(|e| e.entity().is_some()).collect()
    }

    #[test]
    fn first_diff_shows_chunks_before_spawns() {
        let mut fx = Fixture::new();
        let id = fx.spawn(Vec3::new(3.0, 0.0, 3.0));
        let observer = ObserverId::new();
        fx.tracker
            .attach(observer, Anchor::Fixed(Vec3::ZERO), ViewDistance::new(1, 1), Vec3::ZERO, 0)
            .unwrap();

        let batches = fx.diff(1);
        let events = &batches[0].events;
        assert_eq!(events.len(), 10);
        assert!(events[..9].iter().all(|e| matches!(e, WorldEvent::ChunkShow { .. })));
        assert!(matches!(events[9], WorldEvent::Spawn { entity, .. } if entity == id));
        assert_eq!(fx.tracker.viewers_of(ChunkCoord::new(1, 1)), vec![observer]);
    }

    #[test]
    fn unchanged_entities_produce_no_updates() {
        let mut fx = Fixture::new();
        let id = fx.spawn(Vec3::new(3.0, 0.0, 3.0));
        let observer = ObserverId::new();
        fx.tracker
            .attach(observer, Anchor::Fixed(Vec3::ZERO), ViewDistance::new(1, 1), Vec3::ZERO, 0)
            .unwrap();
        fx.diff(1);

        assert!(fx.diff(2)[0].events.is_empty());

        fx.teleport(id, Vec3::new(4.0, 0.0, 3.0));
        let batches = fx.diff(3);
        assert!(matches!(entity_events(&batches[0]).as_slice(), [WorldEvent::Update { .. }]));
    }

    #[test]
    fn leaving_range_despawns_and_round_trip_is_silent() {
        let mut fx = Fixture::new();
        let id = fx.spawn(Vec3::new(3.0, 0.0, 3.0));
        let observer = ObserverId::new();
        fx.tracker
            .attach(observer, Anchor::Fixed(Vec3::ZERO), ViewDistance::new(1, 1), Vec3::ZERO, 0)
            .unwrap();
        fx.diff(1);

        fx.teleport(id, Vec3::new(40.0, 0.0, 3.0));
        fx.teleport(id, Vec3::new(3.0, 0.0, 3.0));
        assert!(fx.diff(2)[0].events.is_empty());

        fx.teleport(id, Vec3::new(40.0, 0.0, 3.0));
        let batches = fx.diff(3);
        assert_eq!(batches[0].events, vec![WorldEvent::Despawn { entity: id }]);
        assert!(fx.tracker.get(observer).unwrap().known().entities.is_empty());
    }

    #[test]
    fn anchored_observer_does_not_see_itself() {
        let mut fx = Fixture::new();
        let avatar = fx.spawn(Vec3::new(8.0, 0.0, 8.0));
        let other = fx.spawn(Vec3::new(9.0, 0.0, 9.0));
        let observer = ObserverId::new();
        fx.tracker
            .attach(observer, Anchor::Entity(avatar), ViewDistance::new(1, 1), Vec3::ZERO, 0)
            .unwrap();
        fx.diff(1);

        let known = &fx.tracker.get(observer).unwrap().known().entities;
        assert!(!known.contains(&avatar));
        assert!(known.contains(&other));
        assert_eq!(fx.tracker.watchers_of(other), vec![observer]);
    }

    #[test]
    fn chunk_edits_reach_observers_that_know_the_chunk() {
        let mut fx = Fixture::new();
        let observer = ObserverId::new();
        fx.tracker
            .attach(observer, Anchor::Fixed(Vec3::ZERO), ViewDistance::new(1, 0), Vec3::ZERO, 0)
            .unwrap();
        fx.diff(1);

        fx.dirty.insert(ChunkCoord::new(0, 1));
        fx.dirty.insert(ChunkCoord::new(3, 3));
        let batches = fx.diff(2);
        assert_eq!(batches[0].events, vec![WorldEvent::ChunkUpdate { coord: ChunkCoord::new(0, 1) }]);
    }

    #[test]
    fn entity_range_is_clamped_to_chunk_range() {
        let mut tracker = VisibilityTracker::new();
        let observer = ObserverId::new();
        tracker
            .attach(observer, Anchor::Fixed(Vec3::ZERO), ViewDistance::new(2, 6), Vec3::ZERO, 0)
            .unwrap();
        assert_eq!(tracker.get(observer).unwrap().view(), ViewDistance::new(2, 2));
        assert_eq!(
            tracker.attach(observer, Anchor::Fixed(Vec3::ZERO), ViewDistance::default(), Vec3::ZERO, 0),
            Err(InvalidCommand::DuplicateObserver(observer))
        );
    }
}
