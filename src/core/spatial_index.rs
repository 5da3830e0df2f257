//! Chunk-partitioned spatial index.
//!
//! Entities are bucketed by the chunk that owns their position. Range queries
//! walk rings of chunks outward from the query centre and collect each
//! covered bucket, so cost scales with the covered area rather than with the
//! total entity count.
//!
//! All mutation and every query take the index lock for the full operation.
//! A chunk-boundary move is therefore atomic with respect to queries: no query
//! can see an entity in both buckets or in neither. Queries copy their result
//! out before returning, so they never hold the lock while callers work.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::types::{CHUNK_SIZE, ChunkCoord, EntityId, Vec3};

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    chunk: ChunkCoord,
    position: Vec3,
}

#[derive(Debug, Default)]
struct IndexInner {
    buckets: HashMap<ChunkCoord, Vec<EntityId>>,
    entries: HashMap<EntityId, IndexEntry>,
}

impl IndexInner {
    fn detach(&mut self, id: EntityId, chunk: ChunkCoord) {
        if let Some(bucket) = self.buckets.get_mut(&chunk) {
            if let Some(slot) = bucket.iter().position(|e| *e == id) {
                bucket.remove(slot);
            }
            if bucket.is_empty() {
                self.buckets.remove(&chunk);
            }
        }
    }

    fn bucket(&self, chunk: ChunkCoord) -> &[EntityId] {
        self.buckets.get(&chunk).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Describes a chunk-boundary crossing produced by [`SpatialIndex::move_entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCrossing {
    pub from: ChunkCoord,
    pub to: ChunkCoord,
}

#[derive(Debug, Default)]
pub struct SpatialIndex {
    inner: RwLock<IndexInner>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` if the entity is already indexed.
    pub fn insert(&self, id: EntityId, position: Vec3) -> bool {
        let mut inner = self.write();
        if inner.entries.contains_key(&id) {
            return false;
        }
        let chunk = ChunkCoord::containing(position);
        inner.entries.insert(id, IndexEntry { chunk, position });
        inner.buckets.entry(chunk).or_default().push(id);
        true
    }

    pub fn remove(&self, id: EntityId) -> Option<ChunkCoord> {
        let mut inner = self.write();
        let entry = inner.entries.remove(&id)?;
        inner.detach(id, entry.chunk);
        Some(entry.chunk)
    }

    /// Records a new position. Returns the crossing when the owning chunk changed.
    pub fn move_entity(&self, id: EntityId, position: Vec3) -> Option<ChunkCrossing> {
        let mut inner = self.write();
        let entry = inner.entries.get_mut(&id)?;
        let from = entry.chunk;
        let to = ChunkCoord::containing(position);
        entry.position = position;
        entry.chunk = to;
        if from == to {
            return None;
        }

        inner.detach(id, from);
        inner.buckets.entry(to).or_default().push(id);
        Some(ChunkCrossing { from, to })
    }

    pub fn chunk_of(&self, id: EntityId) -> Option<ChunkCoord> {
        self.read().entries.get(&id).map(|e| e.chunk)
    }

    pub fn position_of(&self, id: EntityId) -> Option<Vec3> {
        self.read().entries.get(&id).map(|e| e.position)
    }

    pub fn entities_in_chunk(&self, chunk: ChunkCoord) -> Vec<EntityId> {
        self.read().bucket(chunk).to_vec()
    }

    /// Entities within Euclidean `radius` of `center`.
    ///
    /// Rings expand from the centre chunk until they cover the radius. Result
    /// order follows ring order then bucket order: not meaningful, but stable
    /// for a given index state.
    pub fn query(&self, center: Vec3, radius: f64) -> Vec<EntityId> {
        if !(radius >= 0.0) {
            return Vec::new();
        }
        let inner = self.read();
        let origin = ChunkCoord::containing(center);
        let chunk_range = (radius / CHUNK_SIZE as f64).ceil() as u32;
        let squared = radius * radius;

        let mut found = Vec::new();
        for chunk in origin.within(chunk_range) {
            for id in inner.bucket(chunk) {
                let inside = inner
                    .entries
                    .get(id)
                    .is_some_and(|e| e.position.distance_squared(center) <= squared);
                if inside {
                    found.push(*id);
                }
            }
        }
        found
    }

    /// Entities whose owning chunk lies within `range` chunks of `center`.
    pub fn query_chunk_range(&self, center: ChunkCoord, range: u32) -> Vec<EntityId> {
        let inner = self.read();
        if range == 0 {
            return inner.bucket(center).to_vec();
        }
        let mut found = Vec::new();
        for chunk in center.within(range) {
            found.extend_from_slice(inner.bucket(chunk));
        }
        found
    }

    /// Occupied chunks and how many entities each holds.
    pub fn populations(&self) -> Vec<(ChunkCoord, usize)> {
        let inner = self.read();
        let mut populations: Vec<_> = inner.buckets.iter().map(|(c, b)| (*c, b.len())).collect();
        populations.sort_unstable();
        populations
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_across_boundary_updates_buckets() {
        let index = SpatialIndex::new();
        assert!(index.insert(EntityId(1), Vec3::new(15.0, 0.0, 0.0)));
        assert!(!index.insert(EntityId(1), Vec3::ZERO));

        let crossing = index.move_entity(EntityId(1), Vec3::new(17.0, 0.0, 0.0));
        assert_eq!(
            crossing,
            Some(ChunkCrossing { from: ChunkCoord::new(0, 0), to: ChunkCoord::new(1, 0) })
        );
        assert!(index.entities_in_chunk(ChunkCoord::new(0, 0)).is_empty());
        assert_eq!(index.entities_in_chunk(ChunkCoord::new(1, 0)), vec![EntityId(1)]);

        assert_eq!(index.move_entity(EntityId(1), Vec3::new(18.0, 3.0, 1.0)), None);
        assert_eq!(index.position_of(EntityId(1)), Some(Vec3::new(18.0, 3.0, 1.0)));
    }

    #[test]
    fn euclidean_query_filters_by_distance() {
        let index = SpatialIndex::new();
        index.insert(EntityId(1), Vec3::new(0.0, 0.0, 0.0));
        index.insert(EntityId(2), Vec3::new(10.0, 0.0, 0.0));
        index.insert(EntityId(3), Vec3::new(30.0, 0.0, 30.0));
        index.insert(EntityId(4), Vec3::new(-20.0, 0.0, 0.0));

        let mut hits = index.query(Vec3::ZERO, 20.0);
        hits.sort();
        assert_eq!(hits, vec![EntityId(1), EntityId(2), EntityId(4)]);
        assert!(index.query(Vec3::ZERO, f64::NAN).is_empty());
    }

    #[test]
    fn chunk_range_query_is_square() {
        let index = SpatialIndex::new();
        index.insert(EntityId(1), Vec3::new(20.0, 0.0, 20.0)); // [1, 1]
        index.insert(EntityId(2), Vec3::new(40.0, 0.0, 0.0)); // [2, 0]

        assert_eq!(index.query_chunk_range(ChunkCoord::new(0, 0), 1), vec![EntityId(1)]);
        assert_eq!(index.query_chunk_range(ChunkCoord::new(0, 0), 2).len(), 2);
        assert_eq!(index.query_chunk_range(ChunkCoord::new(2, 0), 0), vec![EntityId(2)]);
    }

    #[test]
    fn query_order_is_repeatable() {
        let index = SpatialIndex::new();
        for i in 0..50 {
            index.insert(EntityId(i), Vec3::new((i * 7 % 60) as f64, 0.0, (i * 13 % 60) as f64));
        }
        let first = index.query(Vec3::new(30.0, 0.0, 30.0), 40.0);
        let second = index.query(Vec3::new(30.0, 0.0, 30.0), 40.0);
        assert_eq!(first, second);
    }

    #[test]
    fn remove_clears_empty_buckets() {
        let index = SpatialIndex::new();
        index.insert(EntityId(1), Vec3::ZERO);
        assert_eq!(index.remove(EntityId(1)), Some(ChunkCoord::new(0, 0)));
        assert!(index.populations().is_empty());
        assert!(index.is_empty());
    }
}
