//! Movement systems - waypoint following and position integration.

use crate::components::*;
use crate::config::SimConfig;
use crate::formation::{FormationRegistry, FormationState};
use bevy_ecs::prelude::*;

/// Resource containing the delta time for the current tick.
#[derive(Resource, Default)]
pub struct DeltaTime(pub f32);

/// Simulation tick counter and elapsed time.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct SimClock {
    pub tick: u64,
    /// Seconds since session start. Path cache ages are measured against this.
    pub elapsed: f64,
}

impl SimClock {
    pub fn advance(&mut self, dt: f32) {
        self.tick += 1;
        self.elapsed += dt as f64;
    }
}

/// System that turns the remaining path plus steering into a velocity.
///
/// Reached waypoints are popped in a loop first, so several waypoints
/// inside the arrival radius are consumed in one tick. Formation members
/// never go faster than their formation's slowest member.
pub fn path_following_system(
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    registry: Res<FormationRegistry>,
    mut agents: Query<
        (
            Entity,
            &Position,
            &mut Velocity,
            &MoveSpeed,
            &SteeringForce,
            &Health,
            Option<&mut PathFollower>,
        ),
        With<UnitId>,
    >,
) {
    let arrival = config.pathfinding.waypoint_arrival_radius;
    let delta = dt.0.max(f32::EPSILON);

    for (entity, pos, mut vel, speed, steering, health, follower) in agents.iter_mut() {
        let (Some(mut follower), true) = (follower, health.is_alive()) else {
            *vel = Velocity::default();
            continue;
        };

        while let Some(waypoint) = follower.next_waypoint() {
            if pos.distance_to(&waypoint) > arrival {
                break;
            }
            follower.waypoints.pop_front();
        }

        let Some(waypoint) = follower.next_waypoint() else {
            *vel = Velocity::default();
            continue;
        };

        let max_speed = registry
            .formation_for(entity)
            .filter(|f| f.state() == FormationState::Moving)
            .map_or(speed.0, |f| f.speed().min(speed.0));

        let dx = waypoint.x - pos.x;
        let dz = waypoint.z - pos.z;
        let dist = (dx * dx + dz * dz).sqrt();
        // Never overshoot the waypoint in a single tick.
        let seek_speed = max_speed.min(dist / delta);
        let mut vx = dx / dist * seek_speed + steering.fx;
        let mut vz = dz / dist * seek_speed + steering.fz;

        let magnitude = (vx * vx + vz * vz).sqrt();
        if magnitude > max_speed {
            vx *= max_speed / magnitude;
            vz *= max_speed / magnitude;
        }
        *vel = Velocity::new(vx, vz);
    }
}

/// System that applies velocity to position, keeping agents inside the world.
pub fn movement_system(
    dt: Res<DeltaTime>,
    config: Res<SimConfig>,
    mut query: Query<(&mut Position, &Velocity), With<UnitId>>,
) {
    let delta = dt.0;
    let half = config.half_world_size();
    for (mut pos, vel) in query.iter_mut() {
        if !vel.vx.is_finite() || !vel.vz.is_finite() {
            continue;
        }
        if vel.vx == 0.0 && vel.vz == 0.0 {
            continue;
        }
        pos.x = (pos.x + vel.vx * delta).clamp(-half, half);
        pos.z = (pos.z + vel.vz * delta).clamp(-half, half);
    }
}
