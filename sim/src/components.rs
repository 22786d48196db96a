//! ECS Components for the movement core.
//!
//! Components are pure data containers attached to entities.
//! All movement logic lives in systems and in the spatial, pathfinding and
//! formation resources that query these components.

use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ============================================================================
// SPATIAL COMPONENTS
// ============================================================================

/// Position on the ground plane (x = east/west, z = north/south).
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, z: f32) -> Self {
        Self { x, z }
    }

    pub fn distance_to(&self, other: &Position) -> f32 {
        self.distance_sq_to(other).sqrt()
    }

    #[inline]
    pub fn distance_sq_to(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        dx * dx + dz * dz
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.z.is_finite()
    }
}

/// Planar velocity vector in world units per second.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub vx: f32,
    pub vz: f32,
}

impl Velocity {
    pub fn new(vx: f32, vz: f32) -> Self {
        Self { vx, vz }
    }

    pub fn magnitude(&self) -> f32 {
        (self.vx * self.vx + self.vz * self.vz).sqrt()
    }
}

/// Collision radius of an agent.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BodyRadius(pub f32);

impl Default for BodyRadius {
    fn default() -> Self {
        Self(2.0)
    }
}

/// Maximum movement speed in world units per second.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MoveSpeed(pub f32);

impl Default for MoveSpeed {
    fn default() -> Self {
        Self(10.0)
    }
}

// ============================================================================
// IDENTITY COMPONENTS
// ============================================================================

/// Unique identifier for an agent, stable across ticks.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId(pub u32);

/// Team/side identifier.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Team(pub u8);

/// Unit type tag. Heavier, slower types sort first when a formation is built.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Heavy,
    Artillery,
    Striker,
    Interceptor,
    Scout,
    Worker,
}

impl UnitKind {
    /// Lower values lead the formation.
    pub fn priority(&self) -> u8 {
        match self {
            UnitKind::Heavy => 0,
            UnitKind::Artillery => 1,
            UnitKind::Striker => 2,
            UnitKind::Interceptor => 3,
            UnitKind::Scout => 4,
            UnitKind::Worker => 5,
        }
    }

    /// Untagged agents sort after every known type.
    pub fn priority_of(kind: Option<UnitKind>) -> u8 {
        kind.map(|k| k.priority()).unwrap_or(u8::MAX)
    }
}

// ============================================================================
// HEALTH
// ============================================================================

/// Health of an agent or obstacle. Zero means dead/destroyed.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Health {
    pub current: f32,
    pub max: f32,
}

impl Health {
    pub fn new(max: f32) -> Self {
        Self { current: max, max }
    }

    pub fn is_alive(&self) -> bool {
        self.current > 0.0
    }

    pub fn damage(&mut self, amount: f32) {
        self.current = (self.current - amount).max(0.0);
    }

    pub fn kill(&mut self) {
        self.current = 0.0;
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new(100.0)
    }
}

// ============================================================================
// MOTION COMPONENTS
// ============================================================================

/// Steering accumulator written by flocking and consumed by the path follower.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SteeringForce {
    pub fx: f32,
    pub fz: f32,
}

impl SteeringForce {
    pub fn add(&mut self, fx: f32, fz: f32) {
        self.fx += fx;
        self.fz += fz;
    }

    pub fn clear(&mut self) {
        self.fx = 0.0;
        self.fz = 0.0;
    }
}

/// Remaining waypoints of the agent's current path. Consumed front to back.
#[derive(Component, Debug, Clone, Default)]
pub struct PathFollower {
    pub waypoints: VecDeque<Position>,
}

impl PathFollower {
    pub fn new(waypoints: Vec<Position>) -> Self {
        Self {
            waypoints: waypoints.into(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn next_waypoint(&self) -> Option<Position> {
        self.waypoints.front().copied()
    }
}

// ============================================================================
// OBSTACLE COMPONENTS
// ============================================================================

/// What kind of world object an obstacle is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ObstacleKind {
    /// A building. Only completed structures block movement.
    Structure { complete: bool },
    /// A resource deposit. Blocks until fully harvested.
    ResourceNode { remaining: u32 },
}

/// A world object that blocks movement inside its footprint radius.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Obstacle {
    pub radius: f32,
    pub kind: ObstacleKind,
}

impl Obstacle {
    pub fn structure(radius: f32, complete: bool) -> Self {
        Self {
            radius,
            kind: ObstacleKind::Structure { complete },
        }
    }

    pub fn resource_node(radius: f32, remaining: u32) -> Self {
        Self {
            radius,
            kind: ObstacleKind::ResourceNode { remaining },
        }
    }

    /// Whether this obstacle currently occupies the walkability grid.
    pub fn is_blocking(&self) -> bool {
        match self.kind {
            ObstacleKind::Structure { complete } => complete,
            ObstacleKind::ResourceNode { remaining } => remaining > 0,
        }
    }
}

/// Identifier for obstacles, separate from agent ids.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObstacleId(pub u32);

// ============================================================================
// BUNDLE HELPERS
// ============================================================================

/// Bundle for spawning a complete mobile agent.
#[derive(Bundle, Default)]
pub struct UnitBundle {
    pub unit_id: UnitId,
    pub team: Team,
    pub position: Position,
    pub velocity: Velocity,
    pub health: Health,
    pub radius: BodyRadius,
    pub speed: MoveSpeed,
    pub steering: SteeringForce,
}

impl UnitBundle {
    pub fn new(id: u32, team: u8, x: f32, z: f32) -> Self {
        Self {
            unit_id: UnitId(id),
            team: Team(team),
            position: Position::new(x, z),
            ..Default::default()
        }
    }
}

/// Bundle for spawning a blocking world object.
#[derive(Bundle)]
pub struct ObstacleBundle {
    pub id: ObstacleId,
    pub position: Position,
    pub obstacle: Obstacle,
    pub health: Health,
}

impl ObstacleBundle {
    pub fn new(id: u32, x: f32, z: f32, obstacle: Obstacle) -> Self {
        Self {
            id: ObstacleId(id),
            position: Position::new(x, z),
            obstacle,
            health: Health::new(500.0),
        }
    }
}
