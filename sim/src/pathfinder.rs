//! Grid pathfinding.
//!
//! Bounded A* over the 8-connected walkability grid with an octile heuristic
//! and corner-cut prevention, followed by line-of-sight smoothing. Successful
//! results are cached for a short time, keyed by (start cell, end cell).
//!
//! A cached path is served only while it is younger than the TTL *and* the
//! grid has not changed since it was computed: any rebuild that alters
//! walkability bumps the grid revision and empties the cache.

use crate::components::Position;
use crate::config::PathfindingConfig;
use crate::error::PathError;
use crate::walkability::{Footprint, WalkabilityGrid};
use bevy_ecs::prelude::*;
use log::{debug, trace};
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Ordered world-space waypoints, start first.
pub type Path = Vec<Position>;

const SQRT_2: f32 = std::f32::consts::SQRT_2;

/// 8-connected moves and their costs.
const NEIGHBORS: [(i64, i64, f32); 8] = [
    (1, 0, 1.0),
    (-1, 0, 1.0),
    (0, 1, 1.0),
    (0, -1, 1.0),
    (1, 1, SQRT_2),
    (1, -1, SQRT_2),
    (-1, 1, SQRT_2),
    (-1, -1, SQRT_2),
];

/// Octile distance between two cells.
#[inline]
pub fn octile_distance(ax: usize, az: usize, bx: usize, bz: usize) -> f32 {
    let dx = ax.abs_diff(bx) as f32;
    let dz = az.abs_diff(bz) as f32;
    dx.max(dz) + (SQRT_2 - 1.0) * dx.min(dz)
}

#[derive(Debug, Clone)]
struct CachedPath {
    waypoints: Path,
    created_at: f64,
    revision: u64,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathfinderStats {
    /// Searches actually run (cache misses).
    pub searches: u64,
    pub cache_hits: u64,
    pub failures: u64,
}

/// Session-scoped pathfinder: walkability grid plus path cache.
#[derive(Resource, Debug)]
pub struct Pathfinder {
    grid: WalkabilityGrid,
    config: PathfindingConfig,
    cache: HashMap<u64, CachedPath>,
    stats: PathfinderStats,
}

impl Pathfinder {
    pub fn new(world_size: f32, config: PathfindingConfig) -> Self {
        let grid = if config.block_map_edges {
            WalkabilityGrid::with_map_edges(world_size, config.grid_size)
        } else {
            WalkabilityGrid::new(world_size, config.grid_size)
        };
        Self::with_grid(grid, config)
    }

    pub fn with_grid(grid: WalkabilityGrid, config: PathfindingConfig) -> Self {
        Self {
            grid,
            config,
            cache: HashMap::new(),
            stats: PathfinderStats::default(),
        }
    }

    pub fn grid(&self) -> &WalkabilityGrid {
        &self.grid
    }

    pub fn config(&self) -> &PathfindingConfig {
        &self.config
    }

    pub fn stats(&self) -> PathfinderStats {
        self.stats
    }

    pub fn cached_paths(&self) -> usize {
        self.cache.len()
    }

    pub fn set_max_expansions(&mut self, max_expansions: usize) {
        self.config.max_expansions = max_expansions;
    }

    // ------------------------------------------------------------------------
    // Grid maintenance
    // ------------------------------------------------------------------------

    /// Rebuild the dynamic obstacle layer from the current blockers.
    ///
    /// Returns `true` if walkability changed; the path cache is then dropped.
    pub fn rebuild_obstacles<I>(&mut self, footprints: I, now: f64) -> bool
    where
        I: IntoIterator<Item = Footprint>,
    {
        let clearance = self.config.obstacle_clearance;
        let changed = self.grid.rebuild_dynamic(
            footprints
                .into_iter()
                .map(|f| Footprint::new(f.x, f.z, f.radius + clearance)),
        );
        if changed {
            debug!(
                "walkability grid rebuilt: revision {}, {} blocked cells, {} cached paths dropped",
                self.grid.revision(),
                self.grid.blocked_count(),
                self.cache.len()
            );
            self.cache.clear();
        } else {
            self.evict_expired(now);
        }
        changed
    }

    /// Permanently block terrain. Invalidates cached paths.
    pub fn stamp_static_disc(&mut self, footprint: Footprint) {
        let before = self.grid.revision();
        self.grid.stamp_static_disc(footprint);
        if self.grid.revision() != before {
            self.cache.clear();
        }
    }

    pub fn set_static_blocked(&mut self, x: usize, z: usize, blocked: bool) {
        let before = self.grid.revision();
        self.grid.set_static_blocked(x, z, blocked);
        if self.grid.revision() != before {
            self.cache.clear();
        }
    }

    /// Drop cache entries older than the TTL.
    pub fn evict_expired(&mut self, now: f64) {
        let ttl = self.config.cache_ttl;
        self.cache.retain(|_, entry| now - entry.created_at < ttl);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    #[inline]
    fn cache_key(start: usize, end: usize) -> u64 {
        ((start as u64) << 32) | (end as u64 & 0xFFFF_FFFF)
    }

    /// Find a smoothed path from `start` to `end` at simulation time `now` (seconds).
    ///
    /// Coordinates are clamped into the grid. A blocked destination is
    /// replaced by the nearest walkable cell found by an expanding ring search.
    pub fn find_path(&mut self, start: Position, end: Position, now: f64) -> Result<Path, PathError> {
        let (sx, sz) = self.grid.clamp_world(start.x, start.z);
        let (ex, ez) = self.grid.clamp_world(end.x, end.z);
        let start_cell = self.grid.world_to_grid(sx, sz);
        let end_cell = self.grid.world_to_grid(ex, ez);
        let start_idx = start_cell.1 * self.grid.width + start_cell.0;
        let end_idx = end_cell.1 * self.grid.width + end_cell.0;
        let key = Self::cache_key(start_idx, end_idx);

        if let Some(entry) = self.cache.get(&key) {
            if now - entry.created_at < self.config.cache_ttl && entry.revision == self.grid.revision() {
                trace!("path cache hit {:?} -> {:?}", start_cell, end_cell);
                let mut waypoints = entry.waypoints.clone();
                // Entries are shared per cell pair; re-anchor to this request's exact points.
                if let Some(first) = waypoints.first_mut() {
                    *first = Position::new(sx, sz);
                }
                if self.grid.is_walkable(end_cell.0 as i64, end_cell.1 as i64) {
                    let end = Position::new(ex, ez);
                    match waypoints.len() {
                        1 if waypoints[0] != end => waypoints.push(end),
                        1 => {}
                        _ => {
                            if let Some(last) = waypoints.last_mut() {
                                *last = end;
                            }
                        }
                    }
                    if waypoints.len() == 2 && waypoints[0] == waypoints[1] {
                        waypoints.pop();
                    }
                }
                // Moved endpoints can swing the outer segments across a blocked cell.
                if self.outer_segments_clear(&waypoints) {
                    self.stats.cache_hits += 1;
                    return Ok(waypoints);
                }
                trace!("cached path {:?} -> {:?} blocked after re-anchoring", start_cell, end_cell);
            }
        }

        self.stats.searches += 1;
        let result = self.search(Position::new(sx, sz), start_cell, Position::new(ex, ez), end_cell);
        match &result {
            Ok(waypoints) => {
                self.cache.insert(
                    key,
                    CachedPath {
                        waypoints: waypoints.clone(),
                        created_at: now,
                        revision: self.grid.revision(),
                    },
                );
            }
            Err(err) => {
                self.stats.failures += 1;
                debug!("no path {:?} -> {:?}: {}", start_cell, end_cell, err);
            }
        }
        result
    }

    fn outer_segments_clear(&self, waypoints: &[Position]) -> bool {
        let clear = |a: &Position, b: &Position| self.grid.line_of_sight(a.x, a.z, b.x, b.z);
        match waypoints {
            [first, second, ..] => {
                let n = waypoints.len();
                clear(first, second) && clear(&waypoints[n - 2], &waypoints[n - 1])
            }
            _ => true,
        }
    }

    fn search(
        &self,
        start: Position,
        start_cell: (usize, usize),
        end: Position,
        end_cell: (usize, usize),
    ) -> Result<Path, PathError> {
        let (goal_cell, exact_end) = if self.grid.is_walkable(end_cell.0 as i64, end_cell.1 as i64) {
            (end_cell, end)
        } else {
            let radius = self.config.goal_search_radius;
            let cell = self
                .nearest_walkable(end_cell, radius)
                .ok_or(PathError::NoWalkableGoal { radius })?;
            let (wx, wz) = self.grid.grid_to_world(cell.0, cell.1);
            (cell, Position::new(wx, wz))
        };

        let cells = self.find_grid_path(start_cell, goal_cell)?;
        let mut points: Path = cells
            .iter()
            .map(|&(gx, gz)| {
                let (wx, wz) = self.grid.grid_to_world(gx, gz);
                Position::new(wx, wz)
            })
            .collect();

        if points.len() == 1 {
            points.push(exact_end);
        } else if let Some(last) = points.last_mut() {
            *last = exact_end;
        }
        points[0] = start;
        if points.len() == 2 && points[0] == points[1] {
            points.pop();
        }

        Ok(self.smooth_path(&points))
    }

    /// Raw A* cell path from `start` to `goal`, both inclusive.
    ///
    /// The start cell is accepted even if blocked, so agents standing inside a
    /// freshly placed obstacle can still walk out.
    pub fn find_grid_path(
        &self,
        start: (usize, usize),
        goal: (usize, usize),
    ) -> Result<Vec<(usize, usize)>, PathError> {
        let grid = &self.grid;
        let (Some(start_idx), Some(goal_idx)) = (grid.cell_index(start.0, start.1), grid.cell_index(goal.0, goal.1))
        else {
            return Err(PathError::Unreachable);
        };
        if start_idx == goal_idx {
            return Ok(vec![start]);
        }
        if !grid.is_walkable_index(goal_idx) {
            return Err(PathError::Unreachable);
        }

        let size = grid.len();
        let mut g_score = vec![f32::INFINITY; size];
        let mut came_from = vec![usize::MAX; size];
        let mut closed = vec![false; size];
        let mut open: BinaryHeap<Reverse<(OrderedFloat<f32>, OrderedFloat<f32>, usize)>> = BinaryHeap::new();

        let h0 = octile_distance(start.0, start.1, goal.0, goal.1);
        g_score[start_idx] = 0.0;
        open.push(Reverse((OrderedFloat(h0), OrderedFloat(h0), start_idx)));

        let budget = self.config.max_expansions;
        let mut expansions = 0usize;

        while let Some(Reverse((_, _, current))) = open.pop() {
            if closed[current] {
                continue;
            }
            if current == goal_idx {
                return Ok(Self::reconstruct(grid, &came_from, start_idx, goal_idx));
            }
            if expansions >= budget {
                return Err(PathError::BudgetExceeded { expansions });
            }
            expansions += 1;
            closed[current] = true;

            let (cx, cz) = grid.index_to_cell(current);
            let (cx, cz) = (cx as i64, cz as i64);
            for &(dx, dz, cost) in &NEIGHBORS {
                let (nx, nz) = (cx + dx, cz + dz);
                if !grid.is_walkable(nx, nz) {
                    continue;
                }
                // No squeezing diagonally past a blocked orthogonal neighbor.
                if dx != 0 && dz != 0 && (!grid.is_walkable(cx + dx, cz) || !grid.is_walkable(cx, cz + dz)) {
                    continue;
                }
                let neighbor = nz as usize * grid.width + nx as usize;
                if closed[neighbor] {
                    continue;
                }
                let tentative = g_score[current] + cost;
                if tentative < g_score[neighbor] {
                    g_score[neighbor] = tentative;
                    came_from[neighbor] = current;
                    let h = octile_distance(nx as usize, nz as usize, goal.0, goal.1);
                    open.push(Reverse((OrderedFloat(tentative + h), OrderedFloat(h), neighbor)));
                }
            }
        }

        Err(PathError::Unreachable)
    }

    fn reconstruct(grid: &WalkabilityGrid, came_from: &[usize], start: usize, goal: usize) -> Vec<(usize, usize)> {
        let mut cells = vec![grid.index_to_cell(goal)];
        let mut current = goal;
        while current != start {
            current = came_from[current];
            cells.push(grid.index_to_cell(current));
        }
        cells.reverse();
        cells
    }

    /// Nearest walkable cell to `center`, searching square rings of growing
    /// radius. Within the first ring that has any walkable cell, the one
    /// closest by Euclidean distance wins.
    pub fn nearest_walkable(&self, center: (usize, usize), max_radius: u32) -> Option<(usize, usize)> {
        let (cx, cz) = (center.0 as i64, center.1 as i64);
        if self.grid.is_walkable(cx, cz) {
            return Some(center);
        }
        for r in 1..=max_radius as i64 {
            let mut best: Option<(i64, (usize, usize))> = None;
            for dz in -r..=r {
                for dx in -r..=r {
                    if dx.abs() != r && dz.abs() != r {
                        continue;
                    }
                    let (x, z) = (cx + dx, cz + dz);
                    if !self.grid.is_walkable(x, z) {
                        continue;
                    }
                    let dist_sq = dx * dx + dz * dz;
                    if best.map_or(true, |(d, _)| dist_sq < d) {
                        best = Some((dist_sq, (x as usize, z as usize)));
                    }
                }
            }
            if let Some((_, cell)) = best {
                return Some(cell);
            }
        }
        None
    }

    /// String-pull a waypoint list: from each anchor, jump to the furthest
    /// later waypoint with an unobstructed straight line.
    pub fn smooth_path(&self, points: &[Position]) -> Path {
        if points.len() <= 2 {
            return points.to_vec();
        }
        let mut smoothed = vec![points[0]];
        let mut anchor = 0;
        while anchor < points.len() - 1 {
            let from = points[anchor];
            let next = (anchor + 2..points.len())
                .rev()
                .find(|&j| self.grid.line_of_sight(from.x, from.z, points[j].x, points[j].z))
                .unwrap_or(anchor + 1);
            smoothed.push(points[next]);
            anchor = next;
        }
        smoothed
    }
}
