//! Formation systems - membership upkeep, flocking and arrival.

use crate::components::*;
use crate::config::SimConfig;
use crate::formation::{FormationId, FormationRegistry, FormationState};
use crate::pathfinder::Pathfinder;
use crate::spatial::SpatialGrid;
use crate::systems::movement::SimClock;
use bevy_ecs::prelude::*;
use log::debug;

/// System that removes dead or despawned members from their formations.
/// Formations left with fewer than two members dissolve; moving formations
/// that shrank get fresh paths to their shifted slots.
pub fn formation_maintenance_system(
    mut commands: Commands,
    clock: Res<SimClock>,
    mut registry: ResMut<FormationRegistry>,
    mut pathfinder: ResMut<Pathfinder>,
    agents: Query<(&Position, &Health), With<UnitId>>,
) {
    let position_of = |entity: Entity| {
        agents
            .get(entity)
            .ok()
            .filter(|(_, health)| health.is_alive())
            .map(|(pos, _)| *pos)
    };
    registry.prune(|entity| position_of(entity).is_some());

    for id in registry.take_reslots() {
        let Some(formation) = registry.get(id) else {
            continue;
        };
        let orders = formation.reslot(&mut pathfinder, position_of, clock.elapsed);
        debug!("formation {:?} re-slotted {} members", id, orders.len());
        for order in orders {
            if let Some(mut entity) = commands.get_entity(order.entity) {
                entity.try_insert(PathFollower::new(order.waypoints));
            }
        }
    }
}

/// System that writes flocking forces for members of moving formations.
/// Everyone else gets a cleared steering accumulator.
pub fn formation_steering_system(
    registry: Res<FormationRegistry>,
    grid: Res<SpatialGrid>,
    config: Res<SimConfig>,
    mut agents: Query<(Entity, &Position, &Velocity, Option<&BodyRadius>, &mut SteeringForce), With<UnitId>>,
) {
    for (entity, pos, vel, body, mut steering) in agents.iter_mut() {
        steering.clear();
        let Some(formation) = registry.formation_for(entity) else {
            continue;
        };
        if formation.state() != FormationState::Moving {
            continue;
        }
        let body_radius = body.map_or(0.0, |b| b.0);
        let (fx, fz) = formation.flocking_force(entity, *pos, *vel, body_radius, &grid, &config.formation);
        steering.add(fx, fz);
    }
}

/// System that moves formations whose members all reached their slots to `Arrived`.
pub fn formation_arrival_system(
    mut registry: ResMut<FormationRegistry>,
    config: Res<SimConfig>,
    agents: Query<(&Position, &Health), With<UnitId>>,
) {
    let tolerance = config.formation.arrival_tolerance;
    let position_of = |entity: Entity| {
        agents
            .get(entity)
            .ok()
            .filter(|(_, health)| health.is_alive())
            .map(|(pos, _)| *pos)
    };

    let arrived: Vec<FormationId> = registry
        .iter()
        .filter(|f| f.state() == FormationState::Moving && f.is_complete(position_of, tolerance))
        .map(|f| f.id)
        .collect();

    for id in arrived {
        if let Some(formation) = registry.get_mut(id) {
            formation.mark_arrived();
            debug!("formation {:?} arrived", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathfindingConfig;
    use crate::formation::{FormationPattern, MemberInfo};
    use crate::spatial::spatial_grid_update_system;

    fn world() -> World {
        let mut world = World::new();
        world.insert_resource(SimConfig::default());
        world.insert_resource(SpatialGrid::new(20.0, 250.0));
        world.insert_resource(FormationRegistry::default());
        world.insert_resource(Pathfinder::new(500.0, PathfindingConfig::default()));
        world.insert_resource(SimClock::default());
        world
    }

    fn form(world: &mut World, units: &[Entity]) -> FormationId {
        let members = units
            .iter()
            .map(|&entity| MemberInfo {
                entity,
                kind: None,
                speed: 10.0,
            })
            .collect();
        world
            .resource_mut::<FormationRegistry>()
            .create(members, FormationPattern::Line, 25.0)
            .unwrap()
    }

    #[test]
    fn test_dead_members_dissolve_formation() {
        let mut world = world();
        let a = world.spawn(UnitBundle::new(1, 0, 0.0, 0.0)).id();
        let b = world.spawn(UnitBundle::new(2, 0, 5.0, 0.0)).id();
        let c = world.spawn(UnitBundle::new(3, 0, 10.0, 0.0)).id();
        let id = form(&mut world, &[a, b, c]);

        let mut schedule = Schedule::default();
        schedule.add_systems(formation_maintenance_system);

        world.get_mut::<Health>(a).unwrap().kill();
        schedule.run(&mut world);
        assert_eq!(world.resource::<FormationRegistry>().get(id).unwrap().len(), 2);

        world.despawn(b);
        schedule.run(&mut world);
        let registry = world.resource::<FormationRegistry>();
        assert_eq!(registry.state(id), Some(FormationState::Dissolved));
        assert_eq!(registry.formation_of(c), None);
    }

    #[test]
    fn test_shrunk_moving_formation_gets_new_paths() {
        let mut world = world();
        let units: Vec<Entity> = (0..3).map(|i| world.spawn(UnitBundle::new(i, 0, 0.0, i as f32 * 5.0)).id()).collect();
        let id = form(&mut world, &units);
        world.resource_scope(|world, mut pathfinder: Mut<Pathfinder>| {
            let mut registry = world.resource_mut::<FormationRegistry>();
            let formation = registry.get_mut(id).unwrap();
            formation.move_to(100.0, 0.0, &mut pathfinder, |_| Some(Position::new(0.0, 0.0)), 0.0);
        });

        let mut schedule = Schedule::default();
        schedule.add_systems(formation_maintenance_system);
        world.get_mut::<Health>(units[0]).unwrap().kill();
        schedule.run(&mut world);

        let registry = world.resource::<FormationRegistry>();
        let formation = registry.get(id).unwrap();
        assert_eq!(formation.len(), 2);
        for &entity in &units[1..] {
            let slot = formation.slot_target(entity).unwrap();
            let follower = world.get::<PathFollower>(entity).unwrap();
            assert_eq!(follower.waypoints.back(), Some(&slot));
        }
        assert!(world.get::<PathFollower>(units[0]).is_none());
    }

    #[test]
    fn test_steering_only_for_moving_formations() {
        let mut world = world();
        let a = world.spawn(UnitBundle::new(1, 0, 0.0, 0.0)).id();
        let b = world.spawn(UnitBundle::new(2, 0, 4.0, 0.0)).id();
        let loner = world.spawn(UnitBundle::new(3, 0, -4.0, 0.0)).id();
        let id = form(&mut world, &[a, b]);

        let mut schedule = Schedule::default();
        schedule.add_systems((spatial_grid_update_system, formation_steering_system).chain());

        schedule.run(&mut world);
        assert_eq!(world.get::<SteeringForce>(a).unwrap().fx, 0.0);

        let mut pathfinder = Pathfinder::new(500.0, PathfindingConfig::default());
        let start = Position::new(0.0, 0.0);
        world
            .resource_mut::<FormationRegistry>()
            .get_mut(id)
            .unwrap()
            .move_to(100.0, 0.0, &mut pathfinder, |_| Some(start), 0.0);

        schedule.run(&mut world);
        assert!(world.get::<SteeringForce>(a).unwrap().fx < 0.0);
        assert!(world.get::<SteeringForce>(b).unwrap().fx > 0.0);
        assert_eq!(world.get::<SteeringForce>(loner).unwrap().fx, 0.0);
    }

    #[test]
    fn test_arrival_marks_formation() {
        let mut world = world();
        let a = world.spawn(UnitBundle::new(1, 0, 0.0, 0.0)).id();
        let b = world.spawn(UnitBundle::new(2, 0, 0.0, 0.0)).id();
        let id = form(&mut world, &[a, b]);

        let mut pathfinder = Pathfinder::new(500.0, PathfindingConfig::default());
        let slots = {
            let mut registry = world.resource_mut::<FormationRegistry>();
            let formation = registry.get_mut(id).unwrap();
            formation.move_to(50.0, 0.0, &mut pathfinder, |_| Some(Position::new(0.0, 0.0)), 0.0);
            [formation.slot_target(a).unwrap(), formation.slot_target(b).unwrap()]
        };

        let mut schedule = Schedule::default();
        schedule.add_systems(formation_arrival_system);
        schedule.run(&mut world);
        assert_eq!(world.resource::<FormationRegistry>().state(id), Some(FormationState::Moving));

        *world.get_mut::<Position>(a).unwrap() = slots[0];
        *world.get_mut::<Position>(b).unwrap() = Position::new(slots[1].x + 1.0, slots[1].z);
        schedule.run(&mut world);
        assert_eq!(world.resource::<FormationRegistry>().state(id), Some(FormationState::Arrived));
    }
}
