//! Walkability grid - the rasterized obstacle map used by the pathfinder.
//!
//! Two layers are OR-ed together: a permanent static layer (map edges,
//! impassable terrain) and a dynamic layer that is rebuilt from the current
//! set of blocking obstacles. Grid cells are addressed as `(x, z)` with
//! cell `(0, 0)` at the world's minimum corner.

use serde::{Deserialize, Serialize};

/// Disc stamped into the dynamic layer by a blocking obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub x: f32,
    pub z: f32,
    pub radius: f32,
}

impl Footprint {
    pub fn new(x: f32, z: f32, radius: f32) -> Self {
        Self { x, z, radius }
    }
}

/// Grid of walkable/blocked cells covering the whole world.
#[derive(Debug, Clone)]
pub struct WalkabilityGrid {
    /// Width of the grid in cells.
    pub width: usize,
    /// Height of the grid in cells.
    pub height: usize,
    /// Size of each cell in world units.
    pub cell_size: f32,
    /// World position of the minimum corner of cell (0, 0).
    pub origin_x: f32,
    pub origin_z: f32,
    static_layer: Vec<bool>,
    dynamic_layer: Vec<bool>,
    /// Bumped whenever the combined walkability changes.
    revision: u64,
}

/// Map a possibly non-finite value into `[min, max]`. NaN lands on the midpoint.
#[inline]
fn sanitize(value: f32, min: f32, max: f32) -> f32 {
    if value.is_nan() {
        (min + max) * 0.5
    } else {
        value.clamp(min, max)
    }
}

impl WalkabilityGrid {
    /// Create an open grid covering a square world of edge `world_size`, centered on the origin.
    pub fn new(world_size: f32, cell_size: f32) -> Self {
        let cells = ((world_size / cell_size).ceil() as usize).max(1);
        let half = world_size * 0.5;
        Self {
            width: cells,
            height: cells,
            cell_size,
            origin_x: -half,
            origin_z: -half,
            static_layer: vec![false; cells * cells],
            dynamic_layer: vec![false; cells * cells],
            revision: 0,
        }
    }

    /// Create a grid whose outermost ring of cells is permanently blocked.
    pub fn with_map_edges(world_size: f32, cell_size: f32) -> Self {
        let mut grid = Self::new(world_size, cell_size);
        grid.block_map_edges();
        grid
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Get the cell index for grid coordinates.
    #[inline]
    pub fn cell_index(&self, x: usize, z: usize) -> Option<usize> {
        if x < self.width && z < self.height {
            Some(z * self.width + x)
        } else {
            None
        }
    }

    #[inline]
    pub fn index_to_cell(&self, index: usize) -> (usize, usize) {
        (index % self.width, index / self.width)
    }

    /// Clamp a world position into the grid's extent. Non-finite input is
    /// clamped rather than rejected.
    pub fn clamp_world(&self, world_x: f32, world_z: f32) -> (f32, f32) {
        let max_x = self.origin_x + self.width as f32 * self.cell_size;
        let max_z = self.origin_z + self.height as f32 * self.cell_size;
        (
            sanitize(world_x, self.origin_x, max_x),
            sanitize(world_z, self.origin_z, max_z),
        )
    }

    /// Convert world coordinates to grid coordinates, clamped into bounds.
    pub fn world_to_grid(&self, world_x: f32, world_z: f32) -> (usize, usize) {
        let (world_x, world_z) = self.clamp_world(world_x, world_z);
        let gx = ((world_x - self.origin_x) / self.cell_size).floor() as i64;
        let gz = ((world_z - self.origin_z) / self.cell_size).floor() as i64;
        (
            gx.clamp(0, self.width as i64 - 1) as usize,
            gz.clamp(0, self.height as i64 - 1) as usize,
        )
    }

    /// Convert grid coordinates to world coordinates (center of cell).
    pub fn grid_to_world(&self, gx: usize, gz: usize) -> (f32, f32) {
        (
            self.origin_x + (gx as f32 + 0.5) * self.cell_size,
            self.origin_z + (gz as f32 + 0.5) * self.cell_size,
        )
    }

    /// Walkability by signed coordinates; anything off the grid is blocked.
    #[inline]
    pub fn is_walkable(&self, x: i64, z: i64) -> bool {
        if x < 0 || z < 0 {
            return false;
        }
        match self.cell_index(x as usize, z as usize) {
            Some(i) => !self.static_layer[i] && !self.dynamic_layer[i],
            None => false,
        }
    }

    #[inline]
    pub fn is_walkable_index(&self, index: usize) -> bool {
        index < self.len() && !self.static_layer[index] && !self.dynamic_layer[index]
    }

    /// Walkability of the cell containing a world position.
    pub fn is_walkable_at(&self, world_x: f32, world_z: f32) -> bool {
        let (gx, gz) = self.world_to_grid(world_x, world_z);
        self.is_walkable(gx as i64, gz as i64)
    }

    pub fn blocked_count(&self) -> usize {
        (0..self.len()).filter(|&i| !self.is_walkable_index(i)).count()
    }

    // ------------------------------------------------------------------------
    // Static layer
    // ------------------------------------------------------------------------

    pub fn set_static_blocked(&mut self, x: usize, z: usize, blocked: bool) {
        if let Some(i) = self.cell_index(x, z) {
            if self.static_layer[i] != blocked {
                self.static_layer[i] = blocked;
                self.revision += 1;
            }
        }
    }

    /// Permanently block every cell on the border of the map.
    pub fn block_map_edges(&mut self) {
        for x in 0..self.width {
            self.set_static_blocked(x, 0, true);
            self.set_static_blocked(x, self.height - 1, true);
        }
        for z in 0..self.height {
            self.set_static_blocked(0, z, true);
            self.set_static_blocked(self.width - 1, z, true);
        }
    }

    /// Permanently block a disc of terrain.
    pub fn stamp_static_disc(&mut self, footprint: Footprint) {
        let mut layer = std::mem::take(&mut self.static_layer);
        let changed = self.stamp_disc(&mut layer, footprint);
        self.static_layer = layer;
        if changed {
            self.revision += 1;
        }
    }

    // ------------------------------------------------------------------------
    // Dynamic layer
    // ------------------------------------------------------------------------

    /// Rebuild the dynamic layer from scratch.
    ///
    /// The previous dynamic layer is discarded entirely before stamping, so
    /// destroyed obstacles leave no residue. Returns `true` if the combined
    /// walkability changed, in which case the revision is bumped.
    pub fn rebuild_dynamic<I>(&mut self, footprints: I) -> bool
    where
        I: IntoIterator<Item = Footprint>,
    {
        let mut layer = vec![false; self.len()];
        for footprint in footprints {
            self.stamp_disc(&mut layer, footprint);
        }
        let changed = layer != self.dynamic_layer;
        self.dynamic_layer = layer;
        if changed {
            self.revision += 1;
        }
        changed
    }

    /// Mark every cell whose center lies inside the disc, plus the cell
    /// holding the disc center. Returns whether any cell flipped.
    fn stamp_disc(&self, layer: &mut [bool], footprint: Footprint) -> bool {
        if !footprint.x.is_finite() || !footprint.z.is_finite() || !(footprint.radius >= 0.0) {
            return false;
        }
        let (cx, cz) = self.world_to_grid(footprint.x, footprint.z);
        let grid_radius = ((footprint.radius / self.cell_size).ceil() as i64).saturating_add(1);
        let radius_sq = footprint.radius * footprint.radius;
        let mut changed = false;

        let (cx, cz) = (cx as i64, cz as i64);
        let x_range = cx.saturating_sub(grid_radius).max(0)..=cx.saturating_add(grid_radius).min(self.width as i64 - 1);
        let z_range = cz.saturating_sub(grid_radius).max(0)..=cz.saturating_add(grid_radius).min(self.height as i64 - 1);

        for gz in z_range {
            for gx in x_range.clone() {
                let Some(i) = self.cell_index(gx as usize, gz as usize) else {
                    continue;
                };
                let (wx, wz) = self.grid_to_world(gx as usize, gz as usize);
                let dist_sq = (wx - footprint.x).powi(2) + (wz - footprint.z).powi(2);
                if (dist_sq <= radius_sq || (gx == cx && gz == cz)) && !layer[i] {
                    layer[i] = true;
                    changed = true;
                }
            }
        }
        changed
    }

    // ------------------------------------------------------------------------
    // Line of sight
    // ------------------------------------------------------------------------

    /// True if every cell touched by the segment a→b is walkable.
    ///
    /// Walks the grid with a voxel traversal. When the segment passes exactly
    /// through a cell corner both side cells must be walkable, matching the
    /// pathfinder's corner-cutting rule.
    pub fn line_of_sight(&self, ax: f32, az: f32, bx: f32, bz: f32) -> bool {
        let (ax, az) = self.clamp_world(ax, az);
        let (bx, bz) = self.clamp_world(bx, bz);
        let (mut cx, mut cz) = self.world_to_grid(ax, az);
        let (ex, ez) = self.world_to_grid(bx, bz);
        let (cx_i, cz_i) = (cx as i64, cz as i64);
        if !self.is_walkable(cx_i, cz_i) {
            return false;
        }

        let dx = bx - ax;
        let dz = bz - az;
        let step_x: i64 = if ex > cx { 1 } else { -1 };
        let step_z: i64 = if ez > cz { 1 } else { -1 };

        // Parametric distance along the segment to the next vertical/horizontal boundary.
        let fx = (ax - self.origin_x) / self.cell_size;
        let fz = (az - self.origin_z) / self.cell_size;
        let cell_dx = dx / self.cell_size;
        let cell_dz = dz / self.cell_size;
        let (mut t_max_x, t_delta_x) = if cell_dx.abs() > f32::EPSILON {
            let boundary = if step_x > 0 { cx as f32 + 1.0 } else { cx as f32 };
            ((boundary - fx) / cell_dx, (1.0 / cell_dx).abs())
        } else {
            (f32::INFINITY, f32::INFINITY)
        };
        let (mut t_max_z, t_delta_z) = if cell_dz.abs() > f32::EPSILON {
            let boundary = if step_z > 0 { cz as f32 + 1.0 } else { cz as f32 };
            ((boundary - fz) / cell_dz, (1.0 / cell_dz).abs())
        } else {
            (f32::INFINITY, f32::INFINITY)
        };

        let mut remaining = ex.abs_diff(cx) + ez.abs_diff(cz);
        while remaining > 0 {
            let x_done = cx == ex;
            let z_done = cz == ez;
            let tie = (t_max_x - t_max_z).abs() < 1e-5;

            if !x_done && !z_done && tie {
                let side_a = self.is_walkable(cx as i64 + step_x, cz as i64);
                let side_b = self.is_walkable(cx as i64, cz as i64 + step_z);
                if !side_a || !side_b {
                    return false;
                }
                cx = (cx as i64 + step_x) as usize;
                cz = (cz as i64 + step_z) as usize;
                t_max_x += t_delta_x;
                t_max_z += t_delta_z;
                remaining -= 2;
            } else if !x_done && (z_done || t_max_x < t_max_z) {
                cx = (cx as i64 + step_x) as usize;
                t_max_x += t_delta_x;
                remaining -= 1;
            } else {
                cz = (cz as i64 + step_z) as usize;
                t_max_z += t_delta_z;
                remaining -= 1;
            }

            if !self.is_walkable(cx as i64, cz as i64) {
                return false;
            }
        }
        true
    }
}
