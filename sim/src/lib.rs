//! RTS Navigation Core - Simulation Library
//!
//! Movement and navigation for a real-time strategy simulation: a uniform-grid
//! spatial hash for neighbor queries, a grid A* pathfinder with line-of-sight
//! smoothing and a TTL path cache, and formations that assign slots and flock
//! their members toward a shared target.
//! Uses `bevy_ecs` for the entity-component-system architecture.

pub mod api;
pub mod components;
pub mod config;
pub mod error;
pub mod formation;
pub mod logging;
pub mod pathfinder;
pub mod spatial;
pub mod systems;
pub mod walkability;
pub mod world;

pub use api::SimWorld;
pub use components::*;
pub use config::{FormationConfig, PathfindingConfig, SimConfig, SpatialConfig};
pub use error::{ConfigError, OrderError, PathError};
pub use formation::{Formation, FormationId, FormationPattern, FormationRegistry, FormationState};
pub use pathfinder::{Path, Pathfinder, PathfinderStats};
pub use spatial::{SpatialEntry, SpatialGrid, SpatialHit};
pub use systems::*;
pub use walkability::{Footprint, WalkabilityGrid};
pub use world::{FormationSnapshot, Snapshot, UnitSnapshot};
