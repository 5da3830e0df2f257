//! Entity registry.
//!
//! Owns every entity's identity, kinematic state and component data. Other
//! parts of the core refer to entities by [`EntityId`] only. Mutation happens
//! exclusively inside the scheduler's apply phase; everything else reads the
//! state left by the most recently completed apply.
//!
//! ## Change detection
//! The first mutation an entity receives in a tick records a baseline of its
//! state. An entity counts as changed when its current state differs from
//! that baseline, so a teleport away and back within one tick is not a
//! change. Baselines are dropped by [`EntityRegistry::end_tick`].

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::core::error::{CapacityError, InvalidCommand};
use crate::core::types::{EntityId, ObserverId, Tick, Vec3};

/// Key of a component slot. Component kinds are open-ended: any `'static` type.
pub type ComponentKind = TypeId;

/// Type-erased component value.
pub type ComponentValue = Box<dyn Any + Send + Sync>;

/// Hands out entity identifiers. Shared between the registry and command intake
/// so sessions can reserve an id for a spawn before the tick applies it.
#[derive(Debug)]
pub struct EntityIdAllocator {
    next: AtomicU64,
    capacity: u64,
}

impl EntityIdAllocator {
    /// `capacity` is the largest identifier that may ever be issued.
    pub fn new(capacity: u64) -> Self {
        EntityIdAllocator { next: AtomicU64::new(1), capacity }
    }

    pub fn allocate(&self) -> Result<EntityId, CapacityError> {
        let capacity = self.capacity;
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n <= capacity { n.checked_add(1) } else { None }
            })
            .map(EntityId)
            .map_err(|_| CapacityError { capacity })
    }

    pub fn is_allocated(&self, id: EntityId) -> bool {
        id.0 >= 1 && id.0 < self.next.load(Ordering::Acquire)
    }

    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Acquire) - 1
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct EntityState {
    position: Vec3,
    velocity: Vec3,
    revision: u64,
}

pub struct Entity {
    id: EntityId,
    uuid: Uuid,
    position: Vec3,
    velocity: Vec3,
    owner: Option<ObserverId>,
    spawned_at: Tick,
    components: HashMap<ComponentKind, ComponentValue>,
    // Bumped on every component insert or removal
    revision: u64,
}

impl Entity {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    /// Session whose detach destroys this entity.
    pub fn owner(&self) -> Option<ObserverId> {
        self.owner
    }

    pub fn spawned_at(&self) -> Tick {
        self.spawned_at
    }

    pub fn component<T: Any>(&self) -> Option<&T> {
        self.components
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn has_component<T: Any>(&self) -> bool {
        self.components.contains_key(&TypeId::of::<T>())
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    fn state(&self) -> EntityState {
        EntityState {
            position: self.position,
            velocity: self.velocity,
            revision: self.revision,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("position", &self.position)
            .field("velocity", &self.velocity)
            .field("owner", &self.owner)
            .field("components", &self.components.len())
            .finish()
    }
}

/// A single change to an existing entity.
pub enum Mutation {
    Position(Vec3),
    Velocity(Vec3),
    InsertComponent(ComponentKind, ComponentValue),
    RemoveComponent(ComponentKind),
}

impl Mutation {
    pub fn insert<T: Any + Send + Sync>(value: T) -> Self {
        Mutation::InsertComponent(TypeId::of::<T>(), Box::new(value))
    }

    pub fn remove<T: Any>() -> Self {
        Mutation::RemoveComponent(TypeId::of::<T>())
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Position(p) => f.debug_tuple("Position").field(p).finish(),
            Mutation::Velocity(v) => f.debug_tuple("Velocity").field(v).finish(),
            Mutation::InsertComponent(kind, _) => f.debug_tuple("InsertComponent").field(kind).finish(),
            Mutation::RemoveComponent(kind) => f.debug_tuple("RemoveComponent").field(kind).finish(),
        }
    }
}

pub struct EntityRegistry {
    ids: Arc<EntityIdAllocator>,
    entities: BTreeMap<EntityId, Entity>,
    by_uuid: HashMap<Uuid, EntityId>,
    baselines: HashMap<EntityId, EntityState>,
}

impl EntityRegistry {
    pub fn new(ids: Arc<EntityIdAllocator>) -> Self {
        EntityRegistry {
            ids,
            entities: BTreeMap::new(),
            by_uuid: HashMap::new(),
            baselines: HashMap::new(),
        }
    }

    pub fn allocator(&self) -> &Arc<EntityIdAllocator> {
        &self.ids
    }

    /// Allocates a fresh identifier. The entity itself materialises when its spawn applies.
    pub fn create(&self) -> Result<EntityId, CapacityError> {
        self.ids.allocate()
    }

    pub fn spawn(
        &mut self,
        id: EntityId,
        position: Vec3,
        velocity: Vec3,
        owner: Option<ObserverId>,
        tick: Tick,
    ) -> Result<&Entity, InvalidCommand> {
        if !self.ids.is_allocated(id) {
            return Err(InvalidCommand::UnallocatedEntity(id));
        }
        if self.entities.contains_key(&id) {
            return Err(InvalidCommand::DuplicateEntity(id));
        }
        if !position.is_finite() || !velocity.is_finite() {
            return Err(InvalidCommand::NonFinitePosition(id));
        }

        let uuid = Uuid::new_v4();
        self.by_uuid.insert(uuid, id);
        let entity = self.entities.entry(id).or_insert(Entity {
            id,
            uuid,
            position,
            velocity,
            owner,
            spawned_at: tick,
            components: HashMap::new(),
            revision: 0,
        });
        Ok(&*entity)
    }

    pub fn despawn(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        self.by_uuid.remove(&entity.uuid);
        self.baselines.remove(&id);
        Some(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn by_uuid(&self, uuid: Uuid) -> Option<&Entity> {
        self.by_uuid.get(&uuid).and_then(|id| self.entities.get(id))
    }

    pub fn apply_mutation(&mut self, id: EntityId, mutation: Mutation) -> Result<(), InvalidCommand> {
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(InvalidCommand::UnknownEntity(id))?;

        match &mutation {
            Mutation::Position(p) | Mutation::Velocity(p) if !p.is_finite() => {
                return Err(InvalidCommand::NonFinitePosition(id));
            }
            _ => {}
        }

        self.baselines.entry(id).or_insert_with(|| entity.state());
        match mutation {
            Mutation::Position(position) => entity.position = position,
            Mutation::Velocity(velocity) => entity.velocity = velocity,
            Mutation::InsertComponent(kind, value) => {
                entity.components.insert(kind, value);
                entity.revision += 1;
            }
            Mutation::RemoveComponent(kind) => {
                if entity.components.remove(&kind).is_some() {
                    entity.revision += 1;
                }
            }
        }
        Ok(())
    }

    /// Whether the entity's state differs from what it was when this tick started.
    pub fn changed(&self, id: EntityId) -> bool {
        match (self.baselines.get(&id), self.entities.get(&id)) {
            (Some(baseline), Some(entity)) => *baseline != entity.state(),
            _ => false,
        }
    }

    pub fn changed_entities(&self) -> Vec<EntityId> {
        let mut changed: Vec<_> = self
            .baselines
            .keys()
            .copied()
            .filter(|id| self.changed(*id))
            .collect();
        changed.sort_unstable();
        changed
    }

    pub fn end_tick(&mut self) {
        self.baselines.clear();
    }

    /// Entities with non-zero velocity, in id order.
    pub fn moving(&self) -> Vec<(EntityId, Vec3, Vec3)> {
        self.entities
            .values()
            .filter(|e| !e.velocity.is_zero())
            .map(|e| (e.id, e.position, e.velocity))
            .collect()
    }

    pub fn owned_by(&self, observer: ObserverId) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| e.owner == Some(observer))
            .map(|e| e.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
