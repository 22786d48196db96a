//! Spatial partitioning for efficient neighbor queries.
//!
//! Provides O(1) cell lookup and O(k) neighbor queries where k is the number
//! of entities in nearby cells, rather than O(n) for brute force.
//!
//! The grid is maintained incrementally: an agent that stays inside its cell
//! only has its stored sample refreshed, and the forward (cell -> entries) and
//! reverse (entity -> cell) maps are always changed together.

use crate::components::{Health, Position, Team, UnitId, Velocity};
use bevy_ecs::prelude::*;
use std::collections::HashMap;

/// Packed integer key of a spatial cell.
pub type CellKey = u64;

/// Pack two signed cell coordinates into one integer key.
#[inline]
pub fn pack_cell(cx: i32, cz: i32) -> CellKey {
    ((cx as u32 as u64) << 32) | (cz as u32 as u64)
}

/// Inverse of [`pack_cell`].
#[inline]
pub fn unpack_cell(key: CellKey) -> (i32, i32) {
    ((key >> 32) as u32 as i32, key as u32 as i32)
}

/// Grid-based spatial partitioning structure.
///
/// Divides the world into cells and tracks which entities are in each cell.
/// Enables fast neighbor queries by only checking nearby cells.
#[derive(Resource, Debug)]
pub struct SpatialGrid {
    /// Cell size in world units.
    pub cell_size: f32,
    /// Half of the world edge; cell 0 starts at -half_world_size.
    pub half_world_size: f32,
    /// Map from cell key to the entries in that cell.
    cells: HashMap<CellKey, Vec<SpatialEntry>>,
    /// Reverse lookup: entity to cell.
    entity_cells: HashMap<Entity, CellKey>,
}

/// Snapshot of one agent stored in a spatial cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialEntry {
    pub entity: Entity,
    pub x: f32,
    pub z: f32,
    pub vx: f32,
    pub vz: f32,
    pub team: u8,
    pub alive: bool,
}

impl SpatialEntry {
    pub fn new(entity: Entity, x: f32, z: f32, team: u8) -> Self {
        Self {
            entity,
            x,
            z,
            vx: 0.0,
            vz: 0.0,
            team,
            alive: true,
        }
    }

    /// Build an entry from agent components. Positionless agents yield `None`.
    pub fn from_agent(
        entity: Entity,
        position: Option<&Position>,
        velocity: Option<&Velocity>,
        team: Team,
        alive: bool,
    ) -> Option<Self> {
        let pos = position.filter(|p| p.is_finite())?;
        let vel = velocity.copied().unwrap_or_default();
        Some(Self {
            entity,
            x: pos.x,
            z: pos.z,
            vx: vel.vx,
            vz: vel.vz,
            team: team.0,
            alive,
        })
    }

    #[inline]
    fn distance_sq(&self, x: f32, z: f32) -> f32 {
        let dx = self.x - x;
        let dz = self.z - z;
        dx * dx + dz * dz
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.z)
    }
}

/// Query result carrying the exact distance to the query point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialHit {
    pub entry: SpatialEntry,
    pub distance: f32,
}

impl Default for SpatialGrid {
    fn default() -> Self {
        Self::new(20.0, 250.0)
    }
}

impl SpatialGrid {
    /// Create a new spatial grid with the given cell size over a world of
    /// edge `2 * half_world_size`.
    pub fn new(cell_size: f32, half_world_size: f32) -> Self {
        Self {
            cell_size,
            half_world_size,
            cells: HashMap::new(),
            entity_cells: HashMap::new(),
        }
    }

    /// Convert world coordinates to cell coordinates.
    #[inline]
    pub fn world_to_cell(&self, x: f32, z: f32) -> (i32, i32) {
        (
            ((x + self.half_world_size) / self.cell_size).floor() as i32,
            ((z + self.half_world_size) / self.cell_size).floor() as i32,
        )
    }

    #[inline]
    pub fn key_for(&self, x: f32, z: f32) -> CellKey {
        let (cx, cz) = self.world_to_cell(x, z);
        pack_cell(cx, cz)
    }

    /// Insert an entity. Non-finite positions are ignored.
    ///
    /// Inserting an entity that is already tracked behaves like [`update`](Self::update).
    pub fn insert(&mut self, entry: SpatialEntry) {
        self.update(entry);
    }

    /// Refresh an entity's sample and move it between cells if needed.
    ///
    /// Returns `true` when the entity changed cells (or was newly added).
    /// Staying inside the same cell leaves the cell structure untouched.
    pub fn update(&mut self, entry: SpatialEntry) -> bool {
        if !entry.x.is_finite() || !entry.z.is_finite() {
            return false;
        }
        let key = self.key_for(entry.x, entry.z);

        match self.entity_cells.get(&entry.entity).copied() {
            Some(old_key) if old_key == key => {
                if let Some(slot) = self
                    .cells
                    .get_mut(&key)
                    .and_then(|entries| entries.iter_mut().find(|e| e.entity == entry.entity))
                {
                    *slot = entry;
                }
                false
            }
            Some(old_key) => {
                self.detach(entry.entity, old_key);
                self.cells.entry(key).or_default().push(entry);
                self.entity_cells.insert(entry.entity, key);
                true
            }
            None => {
                self.cells.entry(key).or_default().push(entry);
                self.entity_cells.insert(entry.entity, key);
                true
            }
        }
    }

    /// Remove an entity from the grid. Removing an unknown entity is a no-op.
    pub fn remove(&mut self, entity: Entity) -> bool {
        match self.entity_cells.remove(&entity) {
            Some(key) => {
                self.detach(entity, key);
                true
            }
            None => false,
        }
    }

    fn detach(&mut self, entity: Entity, key: CellKey) {
        if let Some(entries) = self.cells.get_mut(&key) {
            entries.retain(|e| e.entity != entity);
            if entries.is_empty() {
                self.cells.remove(&key);
            }
        }
    }

    /// Visit every live candidate whose cell overlaps the circle's bounding box.
    fn for_each_candidate<F>(&self, x: f32, z: f32, radius: f32, mut visit: F)
    where
        F: FnMut(&SpatialEntry),
    {
        if !x.is_finite() || !z.is_finite() || !(radius >= 0.0) {
            return;
        }
        let (min_cx, min_cz) = self.world_to_cell(x - radius, z - radius);
        let (max_cx, max_cz) = self.world_to_cell(x + radius, z + radius);
        let span = (max_cx as i64 - min_cx as i64 + 1).saturating_mul(max_cz as i64 - min_cz as i64 + 1);

        // Very large radii cover more cells than are occupied; walk the map instead.
        if span > self.cells.len() as i64 {
            for (key, entries) in &self.cells {
                let (cx, cz) = unpack_cell(*key);
                if cx < min_cx || cx > max_cx || cz < min_cz || cz > max_cz {
                    continue;
                }
                entries.iter().filter(|e| e.alive).for_each(&mut visit);
            }
            return;
        }

        for cx in min_cx..=max_cx {
            for cz in min_cz..=max_cz {
                if let Some(entries) = self.cells.get(&pack_cell(cx, cz)) {
                    entries.iter().filter(|e| e.alive).for_each(&mut visit);
                }
            }
        }
    }

    /// Query all living entities within a radius of a point.
    pub fn query_radius(&self, x: f32, z: f32, radius: f32) -> Vec<SpatialEntry> {
        self.query_radius_with(x, z, radius, |_| true)
    }

    /// Query all living entities within a radius that also satisfy `filter`.
    pub fn query_radius_with<F>(&self, x: f32, z: f32, radius: f32, filter: F) -> Vec<SpatialEntry>
    where
        F: Fn(&SpatialEntry) -> bool,
    {
        let radius_sq = radius * radius;
        let mut results = Vec::new();
        self.for_each_candidate(x, z, radius, |entry| {
            if entry.distance_sq(x, z) <= radius_sq && filter(entry) {
                results.push(*entry);
            }
        });
        results
    }

    /// Like [`query_radius_with`](Self::query_radius_with), sorted by distance (closest first).
    pub fn query_radius_sorted<F>(&self, x: f32, z: f32, radius: f32, filter: F) -> Vec<SpatialHit>
    where
        F: Fn(&SpatialEntry) -> bool,
    {
        let radius_sq = radius * radius;
        let mut results = Vec::new();
        self.for_each_candidate(x, z, radius, |entry| {
            let dist_sq = entry.distance_sq(x, z);
            if dist_sq <= radius_sq && filter(entry) {
                results.push(SpatialHit {
                    entry: *entry,
                    distance: dist_sq.sqrt(),
                });
            }
        });
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results
    }

    /// Closest living entity within `max_radius` that satisfies `filter`.
    pub fn find_nearest<F>(&self, x: f32, z: f32, max_radius: f32, filter: F) -> Option<SpatialEntry>
    where
        F: Fn(&SpatialEntry) -> bool,
    {
        let mut best: Option<(f32, SpatialEntry)> = None;
        let max_sq = max_radius * max_radius;
        self.for_each_candidate(x, z, max_radius, |entry| {
            let dist_sq = entry.distance_sq(x, z);
            if dist_sq > max_sq || !filter(entry) {
                return;
            }
            if best.map_or(true, |(d, _)| dist_sq < d) {
                best = Some((dist_sq, *entry));
            }
        });
        best.map(|(_, entry)| entry)
    }

    /// Get the nearest living entity of another team.
    pub fn nearest_enemy(&self, x: f32, z: f32, max_radius: f32, my_team: u8) -> Option<SpatialEntry> {
        self.find_nearest(x, z, max_radius, |e| e.team != my_team)
    }

    /// Cell the entity is currently filed under.
    pub fn cell_of(&self, entity: Entity) -> Option<CellKey> {
        self.entity_cells.get(&entity).copied()
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.entity_cells.contains_key(&entity)
    }

    /// Get count of entities in a cell.
    pub fn cell_count(&self, key: CellKey) -> usize {
        self.cells.get(&key).map(|v| v.len()).unwrap_or(0)
    }

    /// Number of non-empty cells.
    pub fn occupied_cells(&self) -> usize {
        self.cells.len()
    }

    /// Get total entity count.
    pub fn total_count(&self) -> usize {
        self.entity_cells.len()
    }
}

/// System that keeps the spatial grid in sync with agent positions.
///
/// Runs before any flocking query in the same tick, so neighbor data is never stale.
pub fn spatial_grid_update_system(
    mut grid: ResMut<SpatialGrid>,
    agents: Query<(Entity, Option<&Position>, Option<&Velocity>, &Team, &Health), With<UnitId>>,
    mut removed: RemovedComponents<UnitId>,
) {
    for entity in removed.read() {
        grid.remove(entity);
    }

    for (entity, pos, vel, team, health) in agents.iter() {
        match SpatialEntry::from_agent(entity, pos, vel, *team, health.is_alive()) {
            Some(entry) => {
                grid.update(entry);
            }
            None => {
                grid.remove(entity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> SpatialGrid {
        SpatialGrid::new(10.0, 250.0)
    }

    #[test]
    fn test_spatial_grid_insert_query() {
        let mut grid = grid();

        let e1 = Entity::from_raw(1);
        let e2 = Entity::from_raw(2);
        let e3 = Entity::from_raw(3);

        grid.insert(SpatialEntry::new(e1, 5.0, 5.0, 0));
        grid.insert(SpatialEntry::new(e2, 15.0, 5.0, 0));
        grid.insert(SpatialEntry::new(e3, 100.0, 100.0, 1));

        assert_eq!(grid.query_radius(5.0, 5.0, 15.0).len(), 2);
        assert_eq!(grid.query_radius(5.0, 5.0, 5.0).len(), 1);
        assert_eq!(grid.query_radius(100.0, 100.0, 10.0).len(), 1);
    }

    #[test]
    fn test_radius_query_is_exact_circle() {
        let mut grid = grid();
        let points = [
            (0.0, 0.0),
            (3.0, 4.0),
            (7.0, 7.0),
            (-9.9, 0.5),
            (10.0, 0.0),
            (-25.0, 31.0),
            (0.0, -10.0001),
        ];
        for (i, &(x, z)) in points.iter().enumerate() {
            grid.insert(SpatialEntry::new(Entity::from_raw(i as u32), x, z, 0));
        }

        for r in [0.0f32, 1.0, 5.0, 9.9, 10.0, 10.5, 40.0] {
            let found = grid.query_radius(0.0, 0.0, r);
            let expected = points
                .iter()
                .filter(|(x, z)| (x * x + z * z).sqrt() <= r)
                .count();
            assert_eq!(found.len(), expected, "radius {r}");
            for entry in found {
                assert!((entry.x * entry.x + entry.z * entry.z).sqrt() <= r);
            }
        }
    }

    #[test]
    fn test_unbounded_radius_returns_everything() {
        let mut grid = grid();
        grid.insert(SpatialEntry::new(Entity::from_raw(1), -240.0, 240.0, 0));
        grid.insert(SpatialEntry::new(Entity::from_raw(2), 3.0, -7.0, 1));
        grid.insert(SpatialEntry::new(Entity::from_raw(3), 1.0e6, 1.0e6, 1));

        assert_eq!(grid.query_radius(0.0, 0.0, 1.0e12).len(), 3);
        assert_eq!(grid.query_radius(0.0, 0.0, f32::INFINITY).len(), 3);
        assert!(grid.find_nearest(0.0, 0.0, f32::INFINITY, |_| true).is_some());
    }

    #[test]
    fn test_dead_entities_are_not_returned() {
        let mut grid = grid();
        let e1 = Entity::from_raw(1);
        let mut entry = SpatialEntry::new(e1, 1.0, 1.0, 0);
        grid.insert(entry);
        entry.alive = false;
        grid.update(entry);

        assert!(grid.query_radius(0.0, 0.0, 10.0).is_empty());
        assert!(grid.find_nearest(0.0, 0.0, 10.0, |_| true).is_none());
        assert!(grid.contains(e1));
    }

    #[test]
    fn test_update_within_cell_keeps_structure() {
        let mut grid = grid();
        let e1 = Entity::from_raw(1);
        grid.insert(SpatialEntry::new(e1, 1.0, 1.0, 0));
        let key = grid.cell_of(e1).unwrap();

        let moved = grid.update(SpatialEntry::new(e1, 8.0, 2.0, 0));
        assert!(!moved);
        assert_eq!(grid.cell_of(e1), Some(key));
        assert_eq!(grid.cell_count(key), 1);
        assert_eq!(grid.occupied_cells(), 1);
        // Stored sample is refreshed for exact distance tests.
        assert_eq!(grid.query_radius(8.0, 2.0, 0.1).len(), 1);
    }

    #[test]
    fn test_update_across_cells_moves_entry() {
        let mut grid = grid();
        let e1 = Entity::from_raw(1);
        grid.insert(SpatialEntry::new(e1, 1.0, 1.0, 0));
        let old_key = grid.cell_of(e1).unwrap();

        assert!(grid.update(SpatialEntry::new(e1, 35.0, -12.0, 0)));
        let new_key = grid.cell_of(e1).unwrap();
        assert_ne!(old_key, new_key);
        assert_eq!(grid.cell_count(old_key), 0);
        assert_eq!(grid.cell_count(new_key), 1);
        assert_eq!(grid.occupied_cells(), 1);
        assert_eq!(grid.total_count(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut grid = grid();
        let e1 = Entity::from_raw(1);
        grid.insert(SpatialEntry::new(e1, 1.0, 1.0, 0));

        assert!(grid.remove(e1));
        assert!(!grid.remove(e1));
        assert!(grid.query_radius(1.0, 1.0, 100.0).is_empty());
        assert_eq!(grid.occupied_cells(), 0);
    }

    #[test]
    fn test_positionless_and_non_finite_agents_are_skipped() {
        let mut grid = grid();
        let e1 = Entity::from_raw(1);
        assert!(SpatialEntry::from_agent(e1, None, None, Team(0), true).is_none());

        grid.insert(SpatialEntry::new(e1, f32::NAN, 0.0, 0));
        assert_eq!(grid.total_count(), 0);
        assert!(grid.query_radius(f32::NAN, 0.0, 10.0).is_empty());
        assert!(grid.query_radius(0.0, 0.0, -1.0).is_empty());
    }

    #[test]
    fn test_sorted_query_and_filter() {
        let mut grid = grid();
        grid.insert(SpatialEntry::new(Entity::from_raw(1), 30.0, 0.0, 1));
        grid.insert(SpatialEntry::new(Entity::from_raw(2), 10.0, 0.0, 0));
        grid.insert(SpatialEntry::new(Entity::from_raw(3), 20.0, 0.0, 1));

        let hits = grid.query_radius_sorted(0.0, 0.0, 50.0, |_| true);
        let distances: Vec<f32> = hits.iter().map(|h| h.distance).collect();
        assert_eq!(distances, vec![10.0, 20.0, 30.0]);

        let red = grid.query_radius_sorted(0.0, 0.0, 50.0, |e| e.team == 1);
        assert_eq!(red.len(), 2);
        assert_eq!(red[0].entry.entity, Entity::from_raw(3));
    }

    #[test]
    fn test_nearest_enemy() {
        let mut grid = grid();

        let e1 = Entity::from_raw(1);
        let e2 = Entity::from_raw(2);
        let e3 = Entity::from_raw(3);

        grid.insert(SpatialEntry::new(e1, 0.0, 0.0, 0));
        grid.insert(SpatialEntry::new(e2, 30.0, 0.0, 1));
        grid.insert(SpatialEntry::new(e3, 20.0, 0.0, 1));

        assert_eq!(grid.nearest_enemy(0.0, 0.0, 50.0, 0).map(|e| e.entity), Some(e3));
        assert!(grid.nearest_enemy(0.0, 0.0, 15.0, 0).is_none());
    }

    #[test]
    fn test_huge_radius_walks_occupied_cells() {
        let mut grid = grid();
        grid.insert(SpatialEntry::new(Entity::from_raw(1), -240.0, -240.0, 0));
        grid.insert(SpatialEntry::new(Entity::from_raw(2), 240.0, 240.0, 0));
        assert_eq!(grid.query_radius(0.0, 0.0, 1.0e7).len(), 2);
    }

    #[test]
    fn test_pack_roundtrip_negative_cells() {
        for &(cx, cz) in &[(0, 0), (-1, 5), (123, -77), (i32::MIN, i32::MAX)] {
            assert_eq!(unpack_cell(pack_cell(cx, cz)), (cx, cz));
        }
    }
}
