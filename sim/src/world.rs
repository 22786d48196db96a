//! Snapshot types.
//!
//! The `Snapshot` struct provides a serializable view of the simulation state
//! for a renderer or debug client. It is a view, not a save format: caches
//! and the walkability grid are rebuilt from live entities, never restored.

use crate::components::*;
use crate::formation::{FormationPattern, FormationRegistry, FormationState};
use crate::pathfinder::Pathfinder;
use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

/// Snapshot of a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub id: u32,
    pub team: u8,
    pub kind: Option<UnitKind>,
    pub x: f32,
    pub z: f32,
    pub vx: f32,
    pub vz: f32,
    pub alive: bool,
    pub formation: Option<u32>,
    /// Waypoints still ahead of the agent.
    pub waypoints: usize,
}

/// Snapshot of a formation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormationSnapshot {
    pub id: u32,
    pub pattern: FormationPattern,
    pub state: FormationState,
    pub leader: Option<u32>,
    pub members: Vec<u32>,
    pub spacing: f32,
    pub speed: f32,
    pub target: Option<Position>,
    /// Heading in radians, 0 = world +x.
    pub facing: f32,
}

/// Complete simulation state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current simulation tick.
    pub tick: u64,
    /// Elapsed simulation time in seconds.
    pub time: f64,
    /// Walkability grid revision; changes whenever blocked cells change.
    pub grid_revision: u64,
    pub units: Vec<UnitSnapshot>,
    pub formations: Vec<FormationSnapshot>,
}

impl Snapshot {
    /// Create a snapshot from the ECS world.
    pub fn from_world(world: &mut World, tick: u64, time: f64) -> Self {
        let mut units = Vec::new();

        let mut query = world.query::<(
            &UnitId,
            &Team,
            Option<&UnitKind>,
            &Position,
            &Velocity,
            &Health,
            Option<&PathFollower>,
        )>();
        let registry = world.get_resource::<FormationRegistry>();

        for (unit_id, team, kind, pos, vel, health, follower) in query.iter(world) {
            units.push(UnitSnapshot {
                id: unit_id.0,
                team: team.0,
                kind: kind.copied(),
                x: pos.x,
                z: pos.z,
                vx: vel.vx,
                vz: vel.vz,
                alive: health.is_alive(),
                formation: None,
                waypoints: follower.map_or(0, |f| f.waypoints.len()),
            });
        }
        units.sort_by_key(|u| u.id);

        let mut formations = Vec::new();
        if let Some(registry) = registry {
            let unit_of = |entity: Entity| world.get::<UnitId>(entity).map(|u| u.0);
            for id in registry.ids() {
                let Some(formation) = registry.get(id) else {
                    continue;
                };
                let members: Vec<u32> = formation.members().iter().filter_map(|&e| unit_of(e)).collect();
                for unit in units.iter_mut().filter(|u| members.contains(&u.id)) {
                    unit.formation = Some(id.0);
                }
                formations.push(FormationSnapshot {
                    id: id.0,
                    pattern: formation.pattern(),
                    state: formation.state(),
                    leader: unit_of(formation.leader()),
                    members,
                    spacing: formation.spacing(),
                    speed: formation.speed(),
                    target: formation.target(),
                    facing: formation.facing(),
                });
            }
        }

        let grid_revision = world
            .get_resource::<Pathfinder>()
            .map_or(0, |pathfinder| pathfinder.grid().revision());

        Self {
            tick,
            time,
            grid_revision,
            units,
            formations,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize to pretty JSON string (for debugging).
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
