use std::fmt;
use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Horizontal edge length of a chunk in blocks
pub const CHUNK_SIZE: i32 = 16;
// Vertical extent of a chunk's block grid
pub const CHUNK_HEIGHT: i32 = 64;

/// Simulation tick counter.
pub type Tick = u64;

/// Numeric block identifier stored in a chunk grid. `0` is air.
pub type BlockId = u16;

pub const AIR: BlockId = 0;

/// Identifies a chunk column by its integer coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub const fn new(x: i32, z: i32) -> Self {
        ChunkCoord { x, z }
    }

    /// The chunk owning a continuous world position.
    pub fn containing(position: Vec3) -> Self {
        ChunkCoord {
            x: (position.x / CHUNK_SIZE as f64).floor() as i32,
            z: (position.z / CHUNK_SIZE as f64).floor() as i32,
        }
    }

    pub fn offset(self, dx: i32, dz: i32) -> Self {
        ChunkCoord { x: self.x + dx, z: self.z + dz }
    }

    /// Chebyshev distance in chunks; matches the square view areas used for visibility.
    pub fn distance(self, other: ChunkCoord) -> u32 {
        (self.x - other.x).unsigned_abs().max((self.z - other.z).unsigned_abs())
    }

    /// World position of the chunk's minimum corner at y = 0.
    pub fn origin(self) -> Vec3 {
        Vec3::new((self.x * CHUNK_SIZE) as f64, 0.0, (self.z * CHUNK_SIZE) as f64)
    }

    /// Chunks at exactly `radius` from `self`, walked clockwise from the north-west corner.
    pub fn ring(self, radius: u32) -> Vec<ChunkCoord> {
        let r = radius as i32;
        if r == 0 {
            return vec![self];
        }

        let mut ring = Vec::with_capacity(8 * radius as usize);
        for dx in -r..=r {
            ring.push(self.offset(dx, -r));
        }
        for dz in (-r + 1)..r {
            ring.push(self.offset(r, dz));
        }
        for dx in (-r..=r).rev() {
            ring.push(self.offset(dx, r));
        }
        for dz in ((-r + 1)..r).rev() {
            ring.push(self.offset(-r, dz));
        }
        ring
    }

    /// Every chunk within `radius`, nearest rings first.
    pub fn within(self, radius: u32) -> impl Iterator<Item = ChunkCoord> {
        (0..=radius).flat_map(move |r| self.ring(r))
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Number of chunks in a square view of the given radius.
pub const fn chunk_count(radius: u32) -> usize {
    let side = 2 * radius as usize + 1;
    side * side
}

/// Continuous world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Vec3 { x, y, z }
    }

    pub fn distance_squared(self, other: Vec3) -> f64 {
        let d = self - other;
        d.x * d.x + d.y * d.y + d.z * d.z
    }

    pub fn distance(self, other: Vec3) -> f64 {
        self.distance_squared(other).sqrt()
    }

    pub fn is_zero(self) -> bool {
        self == Vec3::ZERO
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Integer block position in world space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        BlockPos { x, y, z }
    }

    pub fn chunk(self) -> ChunkCoord {
        ChunkCoord::new(self.x.div_euclid(CHUNK_SIZE), self.z.div_euclid(CHUNK_SIZE))
    }

    // Position relative to the owning chunk's origin
    pub fn local(self) -> (usize, usize, usize) {
        (
            self.x.rem_euclid(CHUNK_SIZE) as usize,
            self.y as usize,
            self.z.rem_euclid(CHUNK_SIZE) as usize,
        )
    }

    pub fn in_height_bounds(self) -> bool {
        (0..CHUNK_HEIGHT).contains(&self.y)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Process-unique entity identifier. Never reused, even after despawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies an attached client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub Uuid);

impl ObserverId {
    pub fn new() -> Self {
        ObserverId(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn containing_floors_negative_positions() {
        assert_eq!(ChunkCoord::containing(Vec3::new(-0.5, 10.0, 15.9)), ChunkCoord::new(-1, 0));
        assert_eq!(ChunkCoord::containing(Vec3::new(16.0, 0.0, -16.0)), ChunkCoord::new(1, -1));
    }

    #[test]
    fn rings_cover_square_without_duplicates() {
        let center = ChunkCoord::new(3, -2);
        let all: Vec<_> = center.within(4).collect();
        let unique: HashSet<_> = all.iter().copied().collect();

        assert_eq!(all.len(), chunk_count(4));
        assert_eq!(unique.len(), all.len());
        assert!(all.iter().all(|c| c.distance(center) <= 4));
        assert_eq!(all[0], center);
    }

    #[test]
    fn ring_has_eight_r_members() {
        for r in 1..6 {
            let ring = ChunkCoord::new(0, 0).ring(r);
            assert_eq!(ring.len(), 8 * r as usize);
            assert!(ring.iter().all(|c| c.distance(ChunkCoord::new(0, 0)) == r));
        }
    }

    #[test]
    fn block_pos_local_coordinates() {
        let pos = BlockPos::new(-1, 5, 17);
        assert_eq!(pos.chunk(), ChunkCoord::new(-1, 1));
        assert_eq!(pos.local(), (15, 5, 1));
        assert!(!BlockPos::new(0, CHUNK_HEIGHT, 0).in_height_bounds());
    }
}
