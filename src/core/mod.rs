pub mod types;
pub mod error;
pub mod entity;
pub mod spatial_index;
pub mod commands;
pub mod visibility;
pub mod world_manager;
pub mod scheduler;

pub use entity::{EntityRegistry, Mutation};
pub use spatial_index::SpatialIndex;
pub use visibility::VisibilityTracker;
pub use world_manager::World;
pub use scheduler::TickScheduler;
