//! Obstacle grid maintenance.

use crate::components::*;
use crate::pathfinder::Pathfinder;
use crate::systems::movement::SimClock;
use crate::walkability::Footprint;
use bevy_ecs::prelude::*;

/// Set by commands that add, complete, deplete or remove obstacles.
/// Consumed by the next grid rebuild.
#[derive(Resource, Debug, Default)]
pub struct ObstaclesDirty(pub bool);

impl ObstaclesDirty {
    pub fn mark(&mut self) {
        self.0 = true;
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.0)
    }
}

/// Footprint of an obstacle if it currently blocks movement.
pub fn blocking_footprint(pos: &Position, obstacle: &Obstacle, health: &Health) -> Option<Footprint> {
    (health.is_alive() && obstacle.is_blocking() && pos.is_finite()).then(|| Footprint::new(pos.x, pos.z, obstacle.radius))
}

/// Rebuild the walkability grid from every blocking obstacle, right now.
///
/// Used by commands that must not path against a stale grid within the
/// current tick. Returns `true` if walkability changed.
pub fn rebuild_obstacle_grid(world: &mut World) -> bool {
    let now = world.get_resource::<SimClock>().map(|c| c.elapsed).unwrap_or(0.0);
    let mut query = world.query::<(&Position, &Obstacle, &Health)>();
    let footprints: Vec<Footprint> = query
        .iter(world)
        .filter_map(|(pos, obstacle, health)| blocking_footprint(pos, obstacle, health))
        .collect();
    if let Some(mut dirty) = world.get_resource_mut::<ObstaclesDirty>() {
        dirty.take();
    }
    world
        .get_resource_mut::<Pathfinder>()
        .map(|mut pathfinder| pathfinder.rebuild_obstacles(footprints, now))
        .unwrap_or(false)
}

/// System that keeps the dynamic walkability layer in sync with obstacles.
///
/// Skips the rebuild unless the dirty flag is set or change detection saw an
/// obstacle spawn, change or disappear. Expired cache entries are still evicted.
pub fn obstacle_grid_system(
    clock: Res<SimClock>,
    mut dirty: ResMut<ObstaclesDirty>,
    mut pathfinder: ResMut<Pathfinder>,
    changed: Query<(), (With<Obstacle>, Or<(Changed<Obstacle>, Changed<Position>, Changed<Health>)>)>,
    mut removed: RemovedComponents<Obstacle>,
    obstacles: Query<(&Position, &Obstacle, &Health)>,
) {
    let flagged = dirty.take();
    let removed_any = removed.read().count() > 0;
    if !flagged && !removed_any && changed.is_empty() {
        pathfinder.evict_expired(clock.elapsed);
        return;
    }

    let footprints = obstacles
        .iter()
        .filter_map(|(pos, obstacle, health)| blocking_footprint(pos, obstacle, health));
    pathfinder.rebuild_obstacles(footprints, clock.elapsed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathfindingConfig;

    fn world() -> (World, Schedule) {
        let mut world = World::new();
        world.insert_resource(SimClock::default());
        world.insert_resource(ObstaclesDirty::default());
        world.insert_resource(Pathfinder::new(500.0, PathfindingConfig::default()));
        let mut schedule = Schedule::default();
        schedule.add_systems(obstacle_grid_system);
        (world, schedule)
    }

    fn revision(world: &World) -> u64 {
        world.resource::<Pathfinder>().grid().revision()
    }

    #[test]
    fn test_only_blocking_obstacles_are_stamped() {
        let (mut world, mut schedule) = world();
        world.spawn(ObstacleBundle::new(1, 0.0, 0.0, Obstacle::structure(15.0, false)));
        let node = world.spawn(ObstacleBundle::new(2, 100.0, 0.0, Obstacle::resource_node(10.0, 50))).id();

        schedule.run(&mut world);
        let grid = world.resource::<Pathfinder>().grid();
        assert!(grid.is_walkable_at(0.0, 0.0));
        assert!(!grid.is_walkable_at(100.0, 0.0));

        world.get_mut::<Obstacle>(node).unwrap().kind = ObstacleKind::ResourceNode { remaining: 0 };
        schedule.run(&mut world);
        assert!(world.resource::<Pathfinder>().grid().is_walkable_at(100.0, 0.0));
    }

    #[test]
    fn test_rebuild_skipped_without_changes() {
        let (mut world, mut schedule) = world();
        world.spawn(ObstacleBundle::new(1, 0.0, 0.0, Obstacle::structure(15.0, true)));
        schedule.run(&mut world);
        let after_spawn = revision(&world);
        assert!(after_spawn > 0);

        schedule.run(&mut world);
        schedule.run(&mut world);
        assert_eq!(revision(&world), after_spawn);
    }

    #[test]
    fn test_despawned_obstacle_frees_cells() {
        let (mut world, mut schedule) = world();
        let wall = world.spawn(ObstacleBundle::new(1, 0.0, 0.0, Obstacle::structure(15.0, true))).id();
        schedule.run(&mut world);
        assert!(!world.resource::<Pathfinder>().grid().is_walkable_at(0.0, 0.0));

        world.despawn(wall);
        schedule.run(&mut world);
        assert!(world.resource::<Pathfinder>().grid().is_walkable_at(0.0, 0.0));
    }

    #[test]
    fn test_immediate_rebuild_clears_flag() {
        let (mut world, _) = world();
        world.spawn(ObstacleBundle::new(1, 0.0, 0.0, Obstacle::structure(15.0, true)));
        world.resource_mut::<ObstaclesDirty>().mark();

        assert!(rebuild_obstacle_grid(&mut world));
        assert!(!world.resource::<ObstaclesDirty>().0);
        assert!(!rebuild_obstacle_grid(&mut world));
    }
}
