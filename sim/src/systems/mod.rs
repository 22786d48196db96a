//! ECS systems for the movement core.
//!
//! Systems contain the per-tick logic that operates on components and the
//! session resources. `SimWorld` runs them strictly chained, in this order:
//!
//! 1. `obstacle_grid_system` - rebuilds the walkability grid when obstacles changed
//! 2. `spatial_grid_update_system` - syncs the spatial hash with agent positions
//! 3. `formation_maintenance_system` - drops dead members, dissolves small formations, re-paths shrunk ones
//! 4. `formation_steering_system` - flocking forces for moving formation members
//! 5. `path_following_system` - turns waypoints and steering into velocity
//! 6. `movement_system` - integrates velocity into position
//! 7. `formation_arrival_system` - marks formations whose members all reached their slots
//!
//! The obstacle rebuild runs before any path request of the tick, and the
//! spatial update runs before any flocking query, so no system reads stale data.

pub mod formation;
pub mod movement;
pub mod obstacles;

pub use formation::*;
pub use movement::*;
pub use obstacles::*;
