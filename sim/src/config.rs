//! Simulation configuration.
//!
//! Every field has a default, so a JSON config only needs the keys it
//! overrides:
//!
//! ```json
//! { "world_size": 800.0, "pathfinding": { "max_expansions": 8000 } }
//! ```

use crate::error::ConfigError;
use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration, inserted as a resource into the simulation world.
#[derive(Resource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Fixed timestep in seconds (e.g., 1/30 = 0.0333 for 30 Hz).
    pub fixed_timestep: f32,
    /// Edge length of the square world. World spans [-size/2, size/2] on x and z.
    pub world_size: f32,
    pub spatial: SpatialConfig,
    pub pathfinding: PathfindingConfig,
    pub formation: FormationConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            fixed_timestep: 1.0 / 30.0,
            world_size: 500.0,
            spatial: SpatialConfig::default(),
            pathfinding: PathfindingConfig::default(),
            formation: FormationConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn half_world_size(&self) -> f32 {
        self.world_size * 0.5
    }
}

/// Spatial hash settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Cell size in world units.
    pub cell_size: f32,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self { cell_size: 20.0 }
    }
}

/// Walkability grid and A* settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathfindingConfig {
    /// World units per walkability cell.
    pub grid_size: f32,
    /// Node expansions before a search gives up.
    pub max_expansions: usize,
    /// Seconds a cached path stays valid.
    pub cache_ttl: f64,
    /// Ring radius, in cells, searched for a walkable stand-in for a blocked goal.
    pub goal_search_radius: u32,
    /// Mark the outermost ring of cells as permanently blocked.
    pub block_map_edges: bool,
    /// Extra radius added to every obstacle footprint.
    pub obstacle_clearance: f32,
    /// Distance at which a waypoint counts as reached.
    pub waypoint_arrival_radius: f32,
}

impl Default for PathfindingConfig {
    fn default() -> Self {
        Self {
            grid_size: 10.0,
            max_expansions: 5000,
            cache_ttl: 0.5,
            goal_search_radius: 10,
            block_map_edges: true,
            obstacle_clearance: 0.0,
            waypoint_arrival_radius: 2.0,
        }
    }
}

/// Formation layout and flocking weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormationConfig {
    pub default_spacing: f32,
    /// A member within this distance of its slot counts as arrived.
    pub arrival_tolerance: f32,
    /// Neighbor radius for flocking queries.
    pub separation_radius: f32,
    pub separation_weight: f32,
    pub cohesion_weight: f32,
    pub alignment_weight: f32,
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            default_spacing: 25.0,
            arrival_tolerance: 3.0,
            separation_radius: 12.0,
            separation_weight: 1.5,
            cohesion_weight: 0.1,
            alignment_weight: 0.2,
        }
    }
}
