//! Public API for the simulation.
//!
//! `SimWorld` owns the ECS world, the tick schedule and every session-scoped
//! resource (spatial hash, pathfinder, formation registry). Creating one is
//! session init; [`SimWorld::reset`] is session teardown.
//!
//! ## Fixed Timestep
//!
//! The simulation uses a fixed timestep internally (default 30 Hz). When `step(dt)` is called,
//! the simulation accumulates time and runs fixed updates as needed. This ensures deterministic
//! behavior regardless of frame rate.

use crate::components::*;
use crate::config::SimConfig;
use crate::error::{OrderError, PathError};
use crate::formation::{Formation, FormationId, FormationPattern, FormationRegistry, FormationState, MemberInfo};
use crate::pathfinder::{Path, Pathfinder};
use crate::spatial::{spatial_grid_update_system, SpatialEntry, SpatialGrid};
use crate::systems::*;
use crate::walkability::Footprint;
use crate::world::Snapshot;
use bevy_ecs::prelude::*;
use log::{debug, info, warn};
use std::collections::HashMap;

/// The main simulation world container.
///
/// Holds the ECS world and schedule, providing a clean API for:
/// - Initializing and resetting the session
/// - Stepping the simulation forward
/// - Spawning agents and obstacles
/// - Issuing move and group-move orders
/// - Spatial and path queries
/// - Extracting state snapshots
pub struct SimWorld {
    world: World,
    schedule: Schedule,
    /// Accumulated time for fixed timestep.
    time_accumulator: f32,
}

fn insert_session_resources(world: &mut World, config: &SimConfig) {
    world.insert_resource(DeltaTime(config.fixed_timestep));
    world.insert_resource(SimClock::default());
    world.insert_resource(ObstaclesDirty::default());
    world.insert_resource(SpatialGrid::new(config.spatial.cell_size, config.half_world_size()));
    world.insert_resource(Pathfinder::new(config.world_size, config.pathfinding.clone()));
    world.insert_resource(FormationRegistry::default());
    world.insert_resource(config.clone());
}

impl SimWorld {
    /// Create a new empty simulation world.
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    /// Create a new simulation world with custom configuration.
    pub fn with_config(config: SimConfig) -> Self {
        let mut world = World::new();
        insert_session_resources(&mut world, &config);

        // Strict order: grid rebuild before any path use, spatial sync before flocking.
        let mut schedule = Schedule::default();
        schedule.add_systems(
            (
                obstacle_grid_system,
                spatial_grid_update_system,
                formation_maintenance_system,
                formation_steering_system,
                path_following_system,
                movement_system,
                formation_arrival_system,
            )
                .chain(),
        );

        info!(
            "simulation initialized: world {}x{}, {} Hz, path grid {}",
            config.world_size,
            config.world_size,
            (1.0 / config.fixed_timestep).round(),
            config.pathfinding.grid_size
        );

        Self {
            world,
            schedule,
            time_accumulator: 0.0,
        }
    }

    /// Session teardown: despawn every entity and replace every session
    /// resource with a fresh one. The configuration is kept.
    pub fn reset(&mut self) {
        let config = self.config().clone();
        self.world.clear_entities();
        insert_session_resources(&mut self.world, &config);
        self.time_accumulator = 0.0;
        info!("simulation reset");
    }

    /// Step the simulation forward by `dt` seconds.
    ///
    /// Uses fixed timestep internally - accumulates time and runs fixed updates
    /// as needed. This ensures deterministic behavior regardless of frame rate.
    pub fn step(&mut self, dt: f32) {
        let fixed_dt = self.config().fixed_timestep;
        if !dt.is_finite() || dt <= 0.0 || fixed_dt <= 0.0 {
            return;
        }

        self.time_accumulator += dt;
        while self.time_accumulator >= fixed_dt {
            self.fixed_update(fixed_dt);
            self.time_accumulator -= fixed_dt;
        }
    }

    /// Run a single fixed timestep update.
    fn fixed_update(&mut self, dt: f32) {
        self.world.resource_mut::<DeltaTime>().0 = dt;
        self.world.resource_mut::<SimClock>().advance(dt);
        self.schedule.run(&mut self.world);
    }

    /// Get the current tick number.
    pub fn current_tick(&self) -> u64 {
        self.world.resource::<SimClock>().tick
    }

    /// Get the elapsed simulation time.
    pub fn current_time(&self) -> f64 {
        self.world.resource::<SimClock>().elapsed
    }

    pub fn config(&self) -> &SimConfig {
        self.world.resource::<SimConfig>()
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Get a snapshot of the current simulation state.
    pub fn snapshot(&mut self) -> Snapshot {
        let clock = *self.world.resource::<SimClock>();
        Snapshot::from_world(&mut self.world, clock.tick, clock.elapsed)
    }

    /// Get the snapshot as a JSON string.
    pub fn snapshot_json(&mut self) -> String {
        self.snapshot().to_json().unwrap_or_else(|_| "{}".to_string())
    }

    // ------------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------------

    /// Spawn an agent. It is indexed in the spatial grid immediately.
    pub fn spawn_unit(&mut self, id: u32, team: u8, x: f32, z: f32) -> Entity {
        let entity = self.world.spawn(UnitBundle::new(id, team, x, z)).id();
        self.world
            .resource_mut::<SpatialGrid>()
            .insert(SpatialEntry::new(entity, x, z, team));
        entity
    }

    /// Spawn an agent with a type tag and its own top speed.
    pub fn spawn_unit_of_kind(&mut self, id: u32, team: u8, kind: UnitKind, x: f32, z: f32, speed: f32) -> Entity {
        let entity = self.spawn_unit(id, team, x, z);
        self.world.entity_mut(entity).insert((kind, MoveSpeed(speed)));
        entity
    }

    /// Find the live entity for a unit id.
    pub fn unit_entity(&mut self, unit_id: u32) -> Option<Entity> {
        let mut query = self.world.query::<(Entity, &UnitId)>();
        query
            .iter(&self.world)
            .find(|(_, id)| id.0 == unit_id)
            .map(|(e, _)| e)
    }

    pub fn unit_position(&mut self, unit_id: u32) -> Option<Position> {
        let entity = self.unit_entity(unit_id)?;
        self.world.get::<Position>(entity).copied()
    }

    pub fn unit_count(&mut self) -> usize {
        let mut query = self.world.query::<&UnitId>();
        query.iter(&self.world).count()
    }

    pub fn set_move_speed(&mut self, unit_id: u32, speed: f32) -> bool {
        let Some(entity) = self.unit_entity(unit_id) else {
            return false;
        };
        self.world.entity_mut(entity).insert(MoveSpeed(speed));
        true
    }

    /// Damage a unit. Returns `true` if this killed it.
    pub fn damage(&mut self, unit_id: u32, amount: f32) -> bool {
        let Some(entity) = self.unit_entity(unit_id) else {
            return false;
        };
        let Some(mut health) = self.world.get_mut::<Health>(entity) else {
            return false;
        };
        let was_alive = health.is_alive();
        health.damage(amount);
        let died = was_alive && !health.is_alive();
        if died {
            self.world.resource_mut::<SpatialGrid>().remove(entity);
        }
        died
    }

    pub fn kill(&mut self, unit_id: u32) -> bool {
        self.damage(unit_id, f32::INFINITY)
    }

    /// Remove a unit from the session. Spatial grid and formation membership
    /// are dropped here, exactly once.
    pub fn despawn_unit(&mut self, unit_id: u32) -> bool {
        let Some(entity) = self.unit_entity(unit_id) else {
            return false;
        };
        self.world.resource_mut::<SpatialGrid>().remove(entity);
        self.world.resource_mut::<FormationRegistry>().remove_member(entity);
        self.world.despawn(entity)
    }

    // ------------------------------------------------------------------------
    // Obstacles
    // ------------------------------------------------------------------------

    fn obstacle_entity(&mut self, obstacle_id: u32) -> Option<Entity> {
        let mut query = self.world.query::<(Entity, &ObstacleId)>();
        query
            .iter(&self.world)
            .find(|(_, id)| id.0 == obstacle_id)
            .map(|(e, _)| e)
    }

    fn mark_obstacles_dirty(&mut self) {
        self.world.resource_mut::<ObstaclesDirty>().mark();
    }

    /// Spawn a building. Only completed buildings block movement.
    pub fn spawn_structure(&mut self, id: u32, x: f32, z: f32, radius: f32, complete: bool) -> Entity {
        let entity = self
            .world
            .spawn(ObstacleBundle::new(id, x, z, Obstacle::structure(radius, complete)))
            .id();
        self.mark_obstacles_dirty();
        entity
    }

    pub fn complete_structure(&mut self, id: u32) -> bool {
        let Some(entity) = self.obstacle_entity(id) else {
            return false;
        };
        let Some(mut obstacle) = self.world.get_mut::<Obstacle>(entity) else {
            return false;
        };
        obstacle.kind = ObstacleKind::Structure { complete: true };
        self.mark_obstacles_dirty();
        true
    }

    /// Spawn a resource deposit. Blocks until fully harvested.
    pub fn spawn_resource_node(&mut self, id: u32, x: f32, z: f32, radius: f32, amount: u32) -> Entity {
        let entity = self
            .world
            .spawn(ObstacleBundle::new(id, x, z, Obstacle::resource_node(radius, amount)))
            .id();
        self.mark_obstacles_dirty();
        entity
    }

    /// Harvest from a resource node. Returns what is left, or `None` for an
    /// unknown node.
    pub fn deplete_resource(&mut self, id: u32, amount: u32) -> Option<u32> {
        let entity = self.obstacle_entity(id)?;
        let mut obstacle = self.world.get_mut::<Obstacle>(entity)?;
        let ObstacleKind::ResourceNode { remaining } = obstacle.kind else {
            return None;
        };
        let left = remaining.saturating_sub(amount);
        obstacle.kind = ObstacleKind::ResourceNode { remaining: left };
        self.mark_obstacles_dirty();
        Some(left)
    }

    pub fn destroy_obstacle(&mut self, id: u32) -> bool {
        let Some(entity) = self.obstacle_entity(id) else {
            return false;
        };
        self.mark_obstacles_dirty();
        self.world.despawn(entity)
    }

    /// Block terrain permanently. Survives obstacle rebuilds.
    pub fn stamp_terrain(&mut self, x: f32, z: f32, radius: f32) {
        self.world
            .resource_mut::<Pathfinder>()
            .stamp_static_disc(Footprint::new(x, z, radius));
    }

    /// Apply a pending obstacle rebuild now rather than at the next tick.
    pub fn flush_obstacles(&mut self) -> bool {
        if !self.world.resource::<ObstaclesDirty>().0 {
            return false;
        }
        rebuild_obstacle_grid(&mut self.world)
    }

    // ------------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------------

    /// Path a single unit to `(x, z)`. An individual order takes the unit out
    /// of its formation. Returns the number of waypoints.
    pub fn order_move(&mut self, unit_id: u32, x: f32, z: f32) -> Result<usize, OrderError> {
        let entity = self.unit_entity(unit_id).ok_or(OrderError::UnknownUnit(unit_id))?;
        let start = self
            .world
            .get::<Position>(entity)
            .copied()
            .ok_or(OrderError::UnknownUnit(unit_id))?;
        self.world.resource_mut::<FormationRegistry>().remove_member(entity);

        match self.find_path(start, Position::new(x, z)) {
            Ok(path) => {
                let len = path.len();
                self.world.entity_mut(entity).insert(PathFollower::new(path));
                Ok(len)
            }
            Err(err) => {
                self.world.entity_mut(entity).remove::<PathFollower>();
                Err(err.into())
            }
        }
    }

    /// Move a group of units to `(x, z)` as a formation.
    ///
    /// Two or more live units form a new formation (taking them out of any
    /// previous one). A single live unit gets a direct path and no formation.
    /// A non-positive spacing falls back to the configured default.
    pub fn order_group_move(
        &mut self,
        unit_ids: &[u32],
        x: f32,
        z: f32,
        pattern: FormationPattern,
        spacing: f32,
    ) -> Option<FormationId> {
        self.flush_obstacles();

        let mut members = Vec::new();
        let mut positions = HashMap::new();
        for &unit_id in unit_ids {
            let Some(entity) = self.unit_entity(unit_id) else {
                continue;
            };
            let entity_ref = self.world.entity(entity);
            let alive = entity_ref.get::<Health>().is_some_and(|h| h.is_alive());
            let Some(pos) = entity_ref.get::<Position>().copied().filter(|_| alive) else {
                continue;
            };
            if positions.insert(entity, pos).is_some() {
                continue;
            }
            members.push(MemberInfo {
                entity,
                kind: entity_ref.get::<UnitKind>().copied(),
                speed: entity_ref.get::<MoveSpeed>().map_or(0.0, |s| s.0),
            });
        }

        match members.len() {
            0 => {
                warn!("group move to ({:.1}, {:.1}) has no live units", x, z);
                return None;
            }
            1 => {
                let unit_id = self.world.get::<UnitId>(members[0].entity).map(|u| u.0)?;
                if let Err(err) = self.order_move(unit_id, x, z) {
                    debug!("single-unit group move failed: {}", err);
                }
                return None;
            }
            _ => {}
        }

        let spacing = if spacing.is_finite() && spacing > 0.0 {
            spacing
        } else {
            self.config().formation.default_spacing
        };
        let id = self
            .world
            .resource_mut::<FormationRegistry>()
            .create(members, pattern, spacing)?;
        self.issue_formation_move(id, x, z, &positions);
        Some(id)
    }

    /// Run `move_to` on a formation and hand each member its path.
    fn issue_formation_move(&mut self, id: FormationId, x: f32, z: f32, positions: &HashMap<Entity, Position>) -> bool {
        let now = self.current_time();
        let orders = self.world.resource_scope(|world, mut pathfinder: Mut<Pathfinder>| {
            let mut registry = world.resource_mut::<FormationRegistry>();
            registry
                .get_mut(id)
                .map(|formation| formation.move_to(x, z, &mut pathfinder, |e| positions.get(&e).copied(), now))
        });
        let Some(orders) = orders else {
            return false;
        };
        for order in orders {
            if let Ok(mut entity) = self.world.get_entity_mut(order.entity) {
                entity.insert(PathFollower::new(order.waypoints));
            }
        }
        true
    }

    /// Re-send a formation to its current target, e.g. after a layout change.
    fn reissue_formation(&mut self, id: FormationId) {
        let Some(formation) = self.formation(id) else {
            return;
        };
        let Some(target) = formation.target() else {
            return;
        };
        let members = formation.members().to_vec();
        let positions: HashMap<Entity, Position> = members
            .into_iter()
            .filter_map(|e| self.world.get::<Position>(e).map(|p| (e, *p)))
            .collect();
        self.flush_obstacles();
        self.issue_formation_move(id, target.x, target.z, &positions);
    }

    /// Change a formation's layout. A formation with a target is re-sent to it.
    pub fn set_formation_pattern(&mut self, id: FormationId, pattern: FormationPattern) -> bool {
        let Some(formation) = self.world.resource_mut::<FormationRegistry>().into_inner().get_mut(id) else {
            return false;
        };
        formation.set_pattern(pattern);
        self.reissue_formation(id);
        true
    }

    pub fn set_formation_spacing(&mut self, id: FormationId, spacing: f32) -> bool {
        if !spacing.is_finite() || spacing <= 0.0 {
            return false;
        }
        let Some(formation) = self.world.resource_mut::<FormationRegistry>().into_inner().get_mut(id) else {
            return false;
        };
        formation.set_spacing(spacing);
        self.reissue_formation(id);
        true
    }

    pub fn formation(&self, id: FormationId) -> Option<&Formation> {
        self.world.resource::<FormationRegistry>().get(id)
    }

    /// `Dissolved` for formations that existed but are gone, `None` for ids never issued.
    pub fn formation_state(&self, id: FormationId) -> Option<FormationState> {
        self.world.resource::<FormationRegistry>().state(id)
    }

    pub fn formation_of(&mut self, unit_id: u32) -> Option<FormationId> {
        let entity = self.unit_entity(unit_id)?;
        self.world.resource::<FormationRegistry>().formation_of(entity)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Path between two points against the current obstacle layout.
    pub fn find_path(&mut self, start: Position, end: Position) -> Result<Path, PathError> {
        self.flush_obstacles();
        let now = self.current_time();
        self.world.resource_mut::<Pathfinder>().find_path(start, end, now)
    }

    /// Ids of living units within `radius`, closest first.
    pub fn query_radius(&self, x: f32, z: f32, radius: f32) -> Vec<u32> {
        let grid = self.world.resource::<SpatialGrid>();
        grid.query_radius_sorted(x, z, radius, |_| true)
            .into_iter()
            .filter_map(|hit| self.world.get::<UnitId>(hit.entry.entity).map(|u| u.0))
            .collect()
    }

    /// Closest living unit within `max_radius`, optionally excluding a team.
    pub fn find_nearest(&self, x: f32, z: f32, max_radius: f32, exclude_team: Option<u8>) -> Option<u32> {
        let grid = self.world.resource::<SpatialGrid>();
        let entry = grid.find_nearest(x, z, max_radius, |e| exclude_team != Some(e.team))?;
        self.world.get::<UnitId>(entry.entity).map(|u| u.0)
    }

    /// Get the spatial grid reference (for debugging/visualization).
    pub fn spatial_grid(&self) -> &SpatialGrid {
        self.world.resource::<SpatialGrid>()
    }

    pub fn pathfinder(&self) -> &Pathfinder {
        self.world.resource::<Pathfinder>()
    }

    /// Get direct access to the ECS world (for advanced usage).
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Get mutable access to the ECS world (for advanced usage).
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> SimWorld {
        SimWorld::with_config(SimConfig {
            fixed_timestep: 0.05,
            ..Default::default()
        })
    }

    fn run_until<F>(sim: &mut SimWorld, seconds: f32, mut done: F) -> bool
    where
        F: FnMut(&mut SimWorld) -> bool,
    {
        let ticks = (seconds / 0.05) as usize;
        for _ in 0..ticks {
            sim.step(0.05);
            if done(sim) {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_new_world() {
        let sim = SimWorld::new();
        assert_eq!(sim.current_tick(), 0);
        assert_eq!(sim.config().world_size, 500.0);
    }

    #[test]
    fn test_step_advances_tick() {
        let mut sim = sim();
        sim.step(0.05);
        assert_eq!(sim.current_tick(), 1);
        sim.step(0.05);
        assert_eq!(sim.current_tick(), 2);
        sim.step(0.01);
        assert_eq!(sim.current_tick(), 2);
        sim.step(f32::NAN);
        sim.step(-1.0);
        assert_eq!(sim.current_tick(), 2);
    }

    #[test]
    fn test_path_around_disc_obstacle() {
        let mut sim = sim();
        sim.spawn_structure(1, 0.0, 0.0, 15.0, true);

        let path = sim
            .find_path(Position::new(-200.0, -200.0), Position::new(200.0, 200.0))
            .unwrap();
        assert_eq!(path.first(), Some(&Position::new(-200.0, -200.0)));
        assert_eq!(path.last(), Some(&Position::new(200.0, 200.0)));
        assert!(path.len() > 2);

        // Cells with centers inside the disc cover the square (-10, 10) on both axes.
        for pair in path.windows(2) {
            for step in 0..=200 {
                let t = step as f32 / 200.0;
                let x = pair[0].x + (pair[1].x - pair[0].x) * t;
                let z = pair[0].z + (pair[1].z - pair[0].z) * t;
                assert!(x.abs() >= 9.99 || z.abs() >= 9.99, "segment crosses disc at ({x}, {z})");
            }
        }
    }

    #[test]
    fn test_structure_blocks_only_when_complete() {
        let mut sim = sim();
        sim.spawn_structure(1, 0.0, 0.0, 15.0, false);
        let open = sim.find_path(Position::new(-100.0, 0.0), Position::new(100.0, 0.0)).unwrap();
        assert_eq!(open.len(), 2);
        let revision = sim.snapshot().grid_revision;

        assert!(sim.complete_structure(1));
        let detour = sim.find_path(Position::new(-100.0, 0.0), Position::new(100.0, 0.0)).unwrap();
        assert!(detour.len() > 2);
        assert!(sim.snapshot().grid_revision > revision);
        assert!(!sim.complete_structure(99));
    }

    #[test]
    fn test_depleted_resource_stops_blocking() {
        let mut sim = sim();
        sim.spawn_resource_node(5, 0.0, 0.0, 15.0, 100);
        sim.step(0.05);
        assert!(!sim.pathfinder().grid().is_walkable_at(0.0, 0.0));

        assert_eq!(sim.deplete_resource(5, 60), Some(40));
        sim.step(0.05);
        assert!(!sim.pathfinder().grid().is_walkable_at(0.0, 0.0));

        assert_eq!(sim.deplete_resource(5, 60), Some(0));
        sim.step(0.05);
        assert!(sim.pathfinder().grid().is_walkable_at(0.0, 0.0));
        assert_eq!(sim.deplete_resource(77, 1), None);
    }

    #[test]
    fn test_order_move_reaches_target() {
        let mut sim = sim();
        sim.spawn_unit(1, 0, -50.0, 0.0);
        sim.spawn_structure(10, 0.0, 0.0, 15.0, true);

        let waypoints = sim.order_move(1, 50.0, 0.0).unwrap();
        assert!(waypoints > 2);

        let arrived = run_until(&mut sim, 30.0, |sim| {
            sim.unit_position(1)
                .is_some_and(|p| p.distance_to(&Position::new(50.0, 0.0)) <= 2.0)
        });
        assert!(arrived);
        assert_eq!(sim.order_move(42, 0.0, 0.0), Err(OrderError::UnknownUnit(42)));
    }

    #[test]
    fn test_box_formation_leader_targets_and_arrival() {
        let mut sim = sim();
        sim.spawn_unit_of_kind(1, 0, UnitKind::Striker, -20.0, 20.0, 10.0);
        sim.spawn_unit_of_kind(2, 0, UnitKind::Interceptor, -40.0, 20.0, 10.0);
        let heavy = sim.spawn_unit_of_kind(3, 0, UnitKind::Heavy, 0.0, 0.0, 10.0);
        sim.spawn_unit_of_kind(4, 0, UnitKind::Striker, -20.0, -20.0, 10.0);
        sim.spawn_unit_of_kind(5, 0, UnitKind::Interceptor, -40.0, -20.0, 10.0);

        let id = sim
            .order_group_move(&[1, 2, 3, 4, 5], 100.0, 0.0, FormationPattern::Box, 25.0)
            .unwrap();

        let formation = sim.formation(id).unwrap();
        assert_eq!(formation.leader(), heavy);
        assert!(formation.facing().abs() < 1e-6);
        for &member in formation.members() {
            let (dx, dz) = formation.offset_of(member).unwrap();
            let slot = formation.slot_target(member).unwrap();
            assert!((slot.x - (100.0 + dx)).abs() < 1e-3);
            assert!((slot.z - dz).abs() < 1e-3);
        }
        let members = formation.members().to_vec();
        assert!(!formation.is_complete(|e| sim.world().get::<Position>(e).copied(), 3.0));
        assert_eq!(sim.formation_state(id), Some(FormationState::Moving));

        let arrived = run_until(&mut sim, 60.0, |sim| sim.formation_state(id) == Some(FormationState::Arrived));
        assert!(arrived);

        let formation = sim.formation(id).unwrap();
        for member in members {
            let pos = *sim.world().get::<Position>(member).unwrap();
            assert!(pos.distance_to(&formation.slot_target(member).unwrap()) < 3.0);
        }
    }

    #[test]
    fn test_members_never_exceed_formation_speed() {
        let mut sim = sim();
        sim.spawn_unit_of_kind(1, 0, UnitKind::Heavy, 0.0, 0.0, 4.0);
        sim.spawn_unit_of_kind(2, 0, UnitKind::Scout, 0.0, 30.0, 20.0);
        let id = sim
            .order_group_move(&[1, 2], 150.0, 0.0, FormationPattern::Line, 30.0)
            .unwrap();
        assert_eq!(sim.formation(id).unwrap().speed(), 4.0);

        for _ in 0..40 {
            sim.step(0.05);
            let snapshot = sim.snapshot();
            for unit in &snapshot.units {
                assert!((unit.vx * unit.vx + unit.vz * unit.vz).sqrt() <= 4.0 + 1e-3);
            }
        }
    }

    #[test]
    fn test_formation_dissolves_when_members_die() {
        let mut sim = sim();
        for i in 0..3 {
            sim.spawn_unit(i, 0, 0.0, i as f32 * 10.0);
        }
        let id = sim
            .order_group_move(&[0, 1, 2], 50.0, 50.0, FormationPattern::Wedge, 20.0)
            .unwrap();

        assert!(sim.kill(0));
        sim.step(0.05);
        assert_eq!(sim.formation(id).unwrap().len(), 2);

        assert!(sim.kill(1));
        assert!(!sim.kill(1));
        sim.step(0.05);
        assert_eq!(sim.formation_state(id), Some(FormationState::Dissolved));
        assert_eq!(sim.formation_of(2), None);
    }

    #[test]
    fn test_formation_still_arrives_after_losing_leader() {
        let mut sim = sim();
        sim.spawn_unit_of_kind(1, 0, UnitKind::Heavy, 0.0, 0.0, 10.0);
        let b = sim.spawn_unit_of_kind(2, 0, UnitKind::Striker, 0.0, -20.0, 10.0);
        let c = sim.spawn_unit_of_kind(3, 0, UnitKind::Striker, 0.0, 20.0, 10.0);
        let id = sim
            .order_group_move(&[1, 2, 3], 100.0, 0.0, FormationPattern::Line, 25.0)
            .unwrap();

        sim.step(1.0);
        assert!(sim.kill(1));
        sim.step(0.05);
        assert_eq!(sim.formation(id).unwrap().leader(), b);

        let arrived = run_until(&mut sim, 60.0, |sim| sim.formation_state(id) == Some(FormationState::Arrived));
        assert!(arrived);

        let formation = sim.formation(id).unwrap();
        for member in [b, c] {
            let pos = *sim.world().get::<Position>(member).unwrap();
            assert!(pos.distance_to(&formation.slot_target(member).unwrap()) < 3.0);
        }
    }

    #[test]
    fn test_despawn_removes_from_grid_and_formation() {
        let mut sim = sim();
        sim.spawn_unit(1, 0, 0.0, 0.0);
        sim.spawn_unit(2, 0, 5.0, 0.0);
        let id = sim.order_group_move(&[1, 2], 40.0, 0.0, FormationPattern::Column, 10.0).unwrap();

        assert!(sim.despawn_unit(2));
        assert!(!sim.despawn_unit(2));
        assert_eq!(sim.query_radius(0.0, 0.0, 50.0), vec![1]);
        assert_eq!(sim.formation_state(id), Some(FormationState::Dissolved));

        sim.step(0.05);
        assert_eq!(sim.spatial_grid().total_count(), 1);
    }

    #[test]
    fn test_group_move_edge_cases() {
        let mut sim = sim();
        sim.spawn_unit(1, 0, 0.0, 0.0);
        sim.spawn_unit(2, 0, 10.0, 0.0);
        sim.kill(2);

        assert_eq!(sim.order_group_move(&[], 10.0, 10.0, FormationPattern::Box, 25.0), None);
        assert_eq!(sim.order_group_move(&[99], 10.0, 10.0, FormationPattern::Box, 25.0), None);

        // One live unit moves on its own.
        assert_eq!(sim.order_group_move(&[1, 2], 30.0, 0.0, FormationPattern::Box, 25.0), None);
        assert_eq!(sim.formation_of(1), None);
        let entity = sim.unit_entity(1).unwrap();
        assert!(sim.world().get::<PathFollower>(entity).is_some());
    }

    #[test]
    fn test_new_group_steals_members() {
        let mut sim = sim();
        for i in 0..4 {
            sim.spawn_unit(i, 0, i as f32 * 10.0, 0.0);
        }
        let first = sim.order_group_move(&[0, 1, 2], 0.0, 100.0, FormationPattern::Line, 0.0).unwrap();
        assert_eq!(sim.formation(first).unwrap().spacing(), 25.0);

        let second = sim.order_group_move(&[1, 2, 3], 0.0, -100.0, FormationPattern::Line, 20.0).unwrap();
        assert_ne!(first, second);
        assert_eq!(sim.formation_state(first), Some(FormationState::Dissolved));
        assert_eq!(sim.formation_of(0), None);
        assert_eq!(sim.formation_of(3), Some(second));
    }

    #[test]
    fn test_layout_change_resends_formation() {
        let mut sim = sim();
        sim.spawn_unit(1, 0, 0.0, 0.0);
        sim.spawn_unit(2, 0, 0.0, 10.0);
        let id = sim.order_group_move(&[1, 2], 100.0, 0.0, FormationPattern::Line, 20.0).unwrap();

        assert!(sim.set_formation_pattern(id, FormationPattern::Column));
        assert!(sim.set_formation_spacing(id, 40.0));
        assert!(!sim.set_formation_spacing(id, -1.0));

        let formation = sim.formation(id).unwrap();
        assert_eq!(formation.pattern(), FormationPattern::Column);
        let trailing = formation.members()[1];
        let slot = formation.slot_target(trailing).unwrap();
        assert!((slot.x - 60.0).abs() < 1e-3);

        let entity_path = sim.world().get::<PathFollower>(trailing).unwrap();
        assert_eq!(entity_path.waypoints.back(), Some(&slot));
        assert!(!sim.set_formation_pattern(FormationId(77), FormationPattern::Box));
    }

    #[test]
    fn test_queries() {
        let mut sim = sim();
        sim.spawn_unit(1, 0, 0.0, 0.0);
        sim.spawn_unit(2, 1, 8.0, 0.0);
        sim.spawn_unit(3, 1, 3.0, 0.0);

        assert_eq!(sim.query_radius(0.0, 0.0, 10.0), vec![1, 3, 2]);
        assert_eq!(sim.find_nearest(0.0, 0.0, 10.0, None), Some(1));
        assert_eq!(sim.find_nearest(0.0, 0.0, 10.0, Some(0)), Some(3));
        assert_eq!(sim.find_nearest(0.0, 0.0, 2.0, Some(0)), None);
    }

    #[test]
    fn test_reset_clears_session() {
        let mut sim = sim();
        sim.spawn_unit(1, 0, 0.0, 0.0);
        sim.spawn_unit(2, 0, 10.0, 0.0);
        sim.spawn_structure(3, 50.0, 50.0, 10.0, true);
        sim.order_group_move(&[1, 2], 100.0, 0.0, FormationPattern::Line, 20.0);
        sim.step(0.05);

        sim.reset();
        assert_eq!(sim.current_tick(), 0);
        assert_eq!(sim.unit_count(), 0);
        assert_eq!(sim.spatial_grid().total_count(), 0);
        assert!(sim.pathfinder().grid().is_walkable_at(50.0, 50.0));
        assert_eq!(sim.pathfinder().cached_paths(), 0);
        assert_eq!(sim.formation_state(FormationId(0)), None);

        sim.step(0.05);
        assert_eq!(sim.current_tick(), 1);
    }

    #[test]
    fn test_snapshot_json() {
        let mut sim = sim();
        sim.spawn_unit(1, 0, 0.0, 0.0);
        sim.spawn_unit(2, 0, 10.0, 0.0);
        sim.order_group_move(&[1, 2], 100.0, 0.0, FormationPattern::Spread, 20.0);
        let json = sim.snapshot_json();
        assert!(json.contains("units"));
        assert!(json.contains("formations"));
        assert!(json.contains("Spread"));
        assert!(json.contains("Moving"));
    }

    #[test]
    fn test_terrain_and_destroyed_obstacles() {
        let mut sim = sim();
        sim.spawn_structure(1, 100.0, 0.0, 15.0, true);
        sim.stamp_terrain(-100.0, 0.0, 15.0);
        sim.step(0.05);
        assert!(!sim.pathfinder().grid().is_walkable_at(100.0, 0.0));
        assert!(!sim.pathfinder().grid().is_walkable_at(-100.0, 0.0));

        assert!(sim.destroy_obstacle(1));
        assert!(!sim.destroy_obstacle(1));
        sim.step(0.05);
        assert!(sim.pathfinder().grid().is_walkable_at(100.0, 0.0));
        assert!(!sim.pathfinder().grid().is_walkable_at(-100.0, 0.0));
    }

    #[test]
    fn test_move_speed_override() {
        let mut sim = sim();
        sim.spawn_unit(1, 0, 0.0, 0.0);
        assert!(sim.set_move_speed(1, 20.0));
        assert!(!sim.set_move_speed(2, 20.0));

        sim.order_move(1, 100.0, 0.0).unwrap();
        sim.step(0.05);
        let pos = sim.unit_position(1).unwrap();
        assert!((pos.x - 1.0).abs() < 1e-3);
    }
}
