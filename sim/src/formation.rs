//! Formations - groups of agents that move as one.
//!
//! A formation assigns each member a slot offset from a geometric pattern,
//! sends every member to `target + rotate(offset, facing)`, and supplies
//! per-member flocking forces so members do not bunch up on the way.
//!
//! Offsets live in formation-local space: +x points along the heading
//! (forward), +z is lateral. A facing of 0 means heading along world +x.

use crate::components::{Position, UnitKind, Velocity};
use crate::config::FormationConfig;
use crate::pathfinder::{Path, Pathfinder};
use crate::spatial::SpatialGrid;
use bevy_ecs::prelude::*;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::f32::consts::TAU;

/// Golden angle in radians, used by the spread pattern.
const GOLDEN_ANGLE: f32 = 2.399_963_2;

// ============================================================================
// PATTERNS
// ============================================================================

/// Geometric layout of a formation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormationPattern {
    /// Side by side, perpendicular to the heading.
    #[default]
    Line,
    /// Single file.
    Column,
    /// Triangle with the leader at the tip.
    Wedge,
    /// Square-ish grid.
    Box,
    /// Ring around the target.
    Circle,
    /// Golden-angle spiral for maximum dispersion.
    Spread,
}

impl FormationPattern {
    /// Local `(dx, dz)` offset of slot `index` out of `total`.
    pub fn offset(&self, index: usize, total: usize, spacing: f32) -> (f32, f32) {
        match self {
            FormationPattern::Line => line_offset(index, spacing),
            FormationPattern::Column => column_offset(index, spacing),
            FormationPattern::Wedge => wedge_offset(index, spacing),
            FormationPattern::Box => box_offset(index, total, spacing),
            FormationPattern::Circle => circle_offset(index, total, spacing),
            FormationPattern::Spread => spread_offset(index, spacing),
        }
    }
}

/// Slot 0 in the middle, then alternating right/left.
pub fn line_offset(index: usize, spacing: f32) -> (f32, f32) {
    if index == 0 {
        return (0.0, 0.0);
    }
    let rank = ((index + 1) / 2) as f32;
    let side = if index % 2 == 1 { 1.0 } else { -1.0 };
    (0.0, side * rank * spacing)
}

pub fn column_offset(index: usize, spacing: f32) -> (f32, f32) {
    (-(index as f32) * spacing, 0.0)
}

/// Row r holds r + 1 slots, centered laterally, each row one spacing further back.
pub fn wedge_offset(index: usize, spacing: f32) -> (f32, f32) {
    let row = (((8 * index + 1) as f32).sqrt() - 1.0) / 2.0;
    let row = row.floor() as usize;
    let first_in_row = row * (row + 1) / 2;
    let pos_in_row = index.saturating_sub(first_in_row) as f32;
    let dz = (pos_in_row - row as f32 / 2.0) * spacing;
    (-(row as f32) * spacing, dz)
}

/// `ceil(sqrt(total))` columns, rows and columns centered on the origin.
pub fn box_offset(index: usize, total: usize, spacing: f32) -> (f32, f32) {
    let total = total.max(1);
    let cols = (total as f32).sqrt().ceil() as usize;
    let rows = total.div_ceil(cols);
    let row = (index / cols) as f32;
    let col = (index % cols) as f32;
    let dz = (col - (cols as f32 - 1.0) / 2.0) * spacing;
    let dx = -(row - (rows as f32 - 1.0) / 2.0) * spacing;
    (dx, dz)
}

/// Evenly spaced on a ring whose circumference is `total * spacing`.
pub fn circle_offset(index: usize, total: usize, spacing: f32) -> (f32, f32) {
    if total <= 1 {
        return (0.0, 0.0);
    }
    let radius = spacing * total as f32 / TAU;
    let angle = index as f32 * TAU / total as f32;
    (radius * angle.cos(), radius * angle.sin())
}

pub fn spread_offset(index: usize, spacing: f32) -> (f32, f32) {
    let radius = spacing * (index as f32).sqrt();
    let angle = index as f32 * GOLDEN_ANGLE;
    (radius * angle.cos(), radius * angle.sin())
}

/// Rotate a local offset into world space.
#[inline]
pub fn rotate_offset(dx: f32, dz: f32, facing: f32) -> (f32, f32) {
    let (sin, cos) = facing.sin_cos();
    (dx * cos - dz * sin, dx * sin + dz * cos)
}

// ============================================================================
// FORMATION
// ============================================================================

/// Unique formation identifier. Never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormationId(pub u32);

/// Lifecycle of a formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormationState {
    /// Offsets assigned, no target yet.
    Forming,
    /// Heading for a target.
    Moving,
    /// Every member reached its slot. A new order re-enters `Moving`.
    Arrived,
    /// Fewer than two members remain. Terminal.
    Dissolved,
}

/// What the formation needs to know about a member when it is built.
#[derive(Debug, Clone, Copy)]
pub struct MemberInfo {
    pub entity: Entity,
    pub kind: Option<UnitKind>,
    pub speed: f32,
}

/// Per-member result of a move order.
#[derive(Debug, Clone)]
pub struct MemberOrder {
    pub entity: Entity,
    /// The member's own slot in world space.
    pub target: Position,
    pub waypoints: Path,
}

#[derive(Debug, Clone)]
pub struct Formation {
    pub id: FormationId,
    members: Vec<Entity>,
    speeds: HashMap<Entity, f32>,
    offsets: HashMap<Entity, (f32, f32)>,
    pattern: FormationPattern,
    spacing: f32,
    leader: Entity,
    speed: f32,
    target: Option<Position>,
    facing: f32,
    state: FormationState,
}

impl Formation {
    /// Build a formation. Members are ordered heaviest type first; the first
    /// becomes leader. Returns `None` for an empty member list.
    /// Repeated entities keep their first entry.
    pub fn new(id: FormationId, mut members: Vec<MemberInfo>, pattern: FormationPattern, spacing: f32) -> Option<Self> {
        let mut seen = HashSet::new();
        members.retain(|m| seen.insert(m.entity));
        members.sort_by_key(|m| UnitKind::priority_of(m.kind));
        let leader = members.first()?.entity;
        let mut formation = Self {
            id,
            members: members.iter().map(|m| m.entity).collect(),
            speeds: members.iter().map(|m| (m.entity, m.speed)).collect(),
            offsets: HashMap::new(),
            pattern,
            spacing,
            leader,
            speed: 0.0,
            target: None,
            facing: 0.0,
            state: FormationState::Forming,
        };
        formation.recompute();
        Some(formation)
    }

    fn recompute(&mut self) {
        let total = self.members.len();
        self.offsets = self
            .members
            .iter()
            .enumerate()
            .map(|(i, &e)| (e, self.pattern.offset(i, total, self.spacing)))
            .collect();
        self.speed = self
            .members
            .iter()
            .filter_map(|e| self.speeds.get(e).copied())
            .fold(f32::INFINITY, f32::min);
        if !self.speed.is_finite() {
            self.speed = 0.0;
        }
    }

    pub fn members(&self) -> &[Entity] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.offsets.contains_key(&entity)
    }

    pub fn leader(&self) -> Entity {
        self.leader
    }

    pub fn pattern(&self) -> FormationPattern {
        self.pattern
    }

    pub fn spacing(&self) -> f32 {
        self.spacing
    }

    /// Speed of the slowest member.
    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn target(&self) -> Option<Position> {
        self.target
    }

    pub fn facing(&self) -> f32 {
        self.facing
    }

    pub fn state(&self) -> FormationState {
        self.state
    }

    pub fn offset_of(&self, entity: Entity) -> Option<(f32, f32)> {
        self.offsets.get(&entity).copied()
    }

    pub fn set_pattern(&mut self, pattern: FormationPattern) {
        self.pattern = pattern;
        self.recompute();
    }

    pub fn set_spacing(&mut self, spacing: f32) {
        self.spacing = spacing;
        self.recompute();
    }

    /// Drop a member and re-slot the rest. Losing the leader promotes the
    /// next member in priority order. Returns `false` if it was not a member.
    pub fn remove_member(&mut self, entity: Entity) -> bool {
        let Some(index) = self.members.iter().position(|&e| e == entity) else {
            return false;
        };
        self.members.remove(index);
        self.speeds.remove(&entity);
        if let Some(&first) = self.members.first() {
            if self.leader == entity {
                self.leader = first;
            }
        }
        self.recompute();
        if self.members.len() < 2 {
            self.state = FormationState::Dissolved;
        }
        true
    }

    /// World-space slot of a member for the current target and facing.
    pub fn slot_target(&self, entity: Entity) -> Option<Position> {
        let target = self.target?;
        let (dx, dz) = self.offset_of(entity)?;
        let (rx, rz) = rotate_offset(dx, dz, self.facing);
        Some(Position::new(target.x + rx, target.z + rz))
    }

    /// Order the formation to `(x, z)`.
    ///
    /// Facing is taken from the leader toward the target. Each member gets a
    /// path to its own rotated slot; when no path exists it gets the slot as a
    /// single direct waypoint. Members without a position are skipped.
    pub fn move_to<F>(
        &mut self,
        x: f32,
        z: f32,
        pathfinder: &mut Pathfinder,
        position_of: F,
        now: f64,
    ) -> Vec<MemberOrder>
    where
        F: Fn(Entity) -> Option<Position>,
    {
        if self.state == FormationState::Dissolved {
            return Vec::new();
        }
        let leader_pos = position_of(self.leader).unwrap_or(Position::new(x, z));
        self.facing = (z - leader_pos.z).atan2(x - leader_pos.x);
        self.target = Some(Position::new(x, z));
        self.state = FormationState::Moving;

        let orders = self.reslot(pathfinder, position_of, now);
        debug!(
            "formation {:?} moving to ({:.1}, {:.1}), facing {:.2} rad, {} orders",
            self.id,
            x,
            z,
            self.facing,
            orders.len()
        );
        orders
    }

    /// Path every member to its slot for the current target and facing.
    /// Members without a position or slot are skipped.
    pub fn reslot<F>(&self, pathfinder: &mut Pathfinder, position_of: F, now: f64) -> Vec<MemberOrder>
    where
        F: Fn(Entity) -> Option<Position>,
    {
        let mut orders = Vec::with_capacity(self.members.len());
        for &entity in &self.members {
            let (Some(start), Some(slot)) = (position_of(entity), self.slot_target(entity)) else {
                continue;
            };
            let waypoints = pathfinder.find_path(start, slot, now).unwrap_or_else(|err| {
                debug!("formation {:?}: {:?} falls back to direct move ({})", self.id, entity, err);
                vec![slot]
            });
            orders.push(MemberOrder {
                entity,
                target: slot,
                waypoints,
            });
        }
        orders
    }

    /// True once every member is within `tolerance` of its slot.
    /// Members without a position (dead, despawned) never hold the group up.
    pub fn is_complete<F>(&self, position_of: F, tolerance: f32) -> bool
    where
        F: Fn(Entity) -> Option<Position>,
    {
        if self.target.is_none() {
            return false;
        }
        self.members.iter().all(|&entity| match (position_of(entity), self.slot_target(entity)) {
            (Some(pos), Some(slot)) => pos.distance_to(&slot) < tolerance,
            _ => true,
        })
    }

    pub fn mark_arrived(&mut self) {
        if self.state == FormationState::Moving {
            self.state = FormationState::Arrived;
        }
    }

    /// Separation, cohesion and alignment against same-formation neighbors.
    ///
    /// Neighbors count within `separation_radius`, or within two body radii
    /// when bodies are larger than that.
    pub fn flocking_force(
        &self,
        entity: Entity,
        pos: Position,
        vel: Velocity,
        body_radius: f32,
        grid: &SpatialGrid,
        config: &FormationConfig,
    ) -> (f32, f32) {
        let radius = config.separation_radius.max(2.0 * body_radius);
        let neighbors = grid.query_radius_with(pos.x, pos.z, radius, |e| e.entity != entity && self.contains(e.entity));
        if neighbors.is_empty() {
            return (0.0, 0.0);
        }

        let mut sep = (0.0, 0.0);
        let mut center = (0.0, 0.0);
        let mut avg_vel = (0.0, 0.0);
        for other in &neighbors {
            let dx = pos.x - other.x;
            let dz = pos.z - other.z;
            let dist = (dx * dx + dz * dz).sqrt();
            if dist > 1e-4 && dist < radius {
                sep.0 += dx / dist;
                sep.1 += dz / dist;
            }
            center.0 += other.x;
            center.1 += other.z;
            avg_vel.0 += other.vx;
            avg_vel.1 += other.vz;
        }
        let n = neighbors.len() as f32;
        center = (center.0 / n, center.1 / n);
        avg_vel = (avg_vel.0 / n, avg_vel.1 / n);

        let fx = sep.0 * config.separation_weight
            + (center.0 - pos.x) * config.cohesion_weight
            + (avg_vel.0 - vel.vx) * config.alignment_weight;
        let fz = sep.1 * config.separation_weight
            + (center.1 - pos.z) * config.cohesion_weight
            + (avg_vel.1 - vel.vz) * config.alignment_weight;
        (fx, fz)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// All live formations plus the agent -> formation back-reference.
#[derive(Resource, Debug, Default)]
pub struct FormationRegistry {
    formations: HashMap<FormationId, Formation>,
    member_of: HashMap<Entity, FormationId>,
    next_id: u32,
    /// Moving formations whose slots shifted after losing a member.
    reslot_queue: Vec<FormationId>,
}

impl FormationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a formation. Members are first taken out of any formation they
    /// already belong to, which may dissolve it.
    ///
    /// Repeated entities count once; fewer than two distinct members is refused.
    pub fn create(&mut self, members: Vec<MemberInfo>, pattern: FormationPattern, spacing: f32) -> Option<FormationId> {
        let distinct: HashSet<Entity> = members.iter().map(|m| m.entity).collect();
        if distinct.len() < 2 {
            return None;
        }
        for member in &members {
            self.remove_member(member.entity);
        }
        let id = FormationId(self.next_id);
        let formation = Formation::new(id, members, pattern, spacing)?;
        self.next_id += 1;
        for &entity in formation.members() {
            self.member_of.insert(entity, id);
        }
        debug!(
            "formation {:?} created: {} members, {:?}, leader {:?}",
            id,
            formation.len(),
            pattern,
            formation.leader()
        );
        self.formations.insert(id, formation);
        Some(id)
    }

    pub fn get(&self, id: FormationId) -> Option<&Formation> {
        self.formations.get(&id)
    }

    pub fn get_mut(&mut self, id: FormationId) -> Option<&mut Formation> {
        self.formations.get_mut(&id)
    }

    pub fn formation_of(&self, entity: Entity) -> Option<FormationId> {
        self.member_of.get(&entity).copied()
    }

    pub fn formation_for(&self, entity: Entity) -> Option<&Formation> {
        self.formation_of(entity).and_then(|id| self.formations.get(&id))
    }

    /// State of a formation. Issued ids that are gone were dissolved.
    pub fn state(&self, id: FormationId) -> Option<FormationState> {
        match self.formations.get(&id) {
            Some(f) => Some(f.state()),
            None if id.0 < self.next_id => Some(FormationState::Dissolved),
            None => None,
        }
    }

    /// Remove an agent from its formation. Returns the formation's id if this
    /// dissolved it.
    pub fn remove_member(&mut self, entity: Entity) -> Option<FormationId> {
        let id = self.member_of.remove(&entity)?;
        let formation = self.formations.get_mut(&id)?;
        formation.remove_member(entity);
        match formation.state() {
            FormationState::Dissolved => {
                self.dissolve(id);
                return Some(id);
            }
            FormationState::Moving if !self.reslot_queue.contains(&id) => self.reslot_queue.push(id),
            _ => {}
        }
        None
    }

    /// Take the moving formations that lost members since the last call.
    /// Their members need fresh paths to the shifted slots.
    pub fn take_reslots(&mut self) -> Vec<FormationId> {
        let mut ids = std::mem::take(&mut self.reslot_queue);
        ids.retain(|id| self.formations.contains_key(id));
        ids
    }

    /// Tear a formation down, releasing all remaining members.
    pub fn dissolve(&mut self, id: FormationId) -> bool {
        let Some(formation) = self.formations.remove(&id) else {
            return false;
        };
        for entity in formation.members() {
            self.member_of.remove(entity);
        }
        debug!("formation {:?} dissolved ({} members left)", id, formation.len());
        true
    }

    /// Drop every member `is_live` rejects. Returns the formations that dissolved.
    pub fn prune<F>(&mut self, is_live: F) -> Vec<FormationId>
    where
        F: Fn(Entity) -> bool,
    {
        // Collect first; removal mutates the maps being walked.
        let dead: Vec<Entity> = self.member_of.keys().copied().filter(|&e| !is_live(e)).collect();
        dead.into_iter().filter_map(|e| self.remove_member(e)).collect()
    }

    pub fn ids(&self) -> Vec<FormationId> {
        let mut ids: Vec<FormationId> = self.formations.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Formation> {
        self.formations.values()
    }

    pub fn len(&self) -> usize {
        self.formations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formations.is_empty()
    }
}
