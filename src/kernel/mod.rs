//! Per-cell kernel programs
//!
//! A kernel is a pure function evaluated once per grid cell. It reads the
//! same cell of up to seven bound input grids plus a uniform block and
//! produces one `vec4` for the output grid. Every program carries a WGSL body
//! for the GPU backend and a CPU evaluation used by the reference backend.

pub mod programs;

pub use programs::{
    EnemyBulletCollision, LaserCollision, LaserPosition, LaserVelocity, LinearPosition,
    LinearVelocity, PlayerBulletCollision,
};

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::compute::GridId;
use crate::consts::*;

/// Shared WGSL header: uniform block, bindings and motion helpers
pub const PRELUDE_WGSL: &str = include_str!("shaders/prelude.wgsl");
/// 2x2 summing reducer
pub const REDUCE_WGSL: &str = include_str!("shaders/reduce.wgsl");

/// Named input slots, in binding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputSlot {
    Position,
    Velocity,
    Collision,
    InitialPosition,
    InitialVelocity,
    Timings,
    EndTimings,
}

impl InputSlot {
    pub const ALL: [InputSlot; 7] = [
        InputSlot::Position,
        InputSlot::Velocity,
        InputSlot::Collision,
        InputSlot::InitialPosition,
        InputSlot::InitialVelocity,
        InputSlot::Timings,
        InputSlot::EndTimings,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Source grid for every input slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelInputs(pub [GridId; 7]);

impl KernelInputs {
    #[inline]
    pub fn get(&self, slot: InputSlot) -> GridId {
        self.0[slot.index()]
    }

    #[inline]
    pub fn set(&mut self, slot: InputSlot, grid: GridId) {
        self.0[slot.index()] = grid;
    }

    pub fn contains(&self, grid: GridId) -> bool {
        self.0.contains(&grid)
    }
}

/// Which quantity a kernel produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelRole {
    Position,
    Velocity,
    Collision,
}

// ============================================================================
// UNIFORM BLOCK (must match prelude.wgsl)
// ============================================================================

/// Uniforms visible to every kernel; all members are vec4-aligned
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct KernelUniforms {
    /// delta, time since start, grid width, unused
    pub timing: [f32; 4],
    /// translation from parent, rotation from parent, bullet radius, laser length
    pub flags: [f32; 4],
    pub parent_position: [f32; 4],
    /// Column-major
    pub parent_rotation: [[f32; 4]; 4],
    pub player_position: [f32; 4],
    pub arena_min: [f32; 4],
    pub arena_max: [f32; 4],
    /// x = floor, y = walls, z = ceiling
    pub environment_mask: [f32; 4],
    /// bullet, life, bomb (one-hot times bullet value)
    pub bullet_type_a: [f32; 4],
    /// power, point, special
    pub bullet_type_b: [f32; 4],
    /// bullet warning, laser warning, graze distance, null threshold
    pub tuning: [f32; 4],
    /// xyz + radius
    pub enemies: [[f32; 4]; MAX_ENEMIES],
    /// xyz + radius
    pub bombs: [[f32; 4]; MAX_BOMBS],
}

/// Unused collider slot: far below the arena with zero radius
pub const EMPTY_COLLIDER: [f32; 4] = [NULL_COORD, NULL_COORD, NULL_COORD, 0.0];

impl Default for KernelUniforms {
    fn default() -> Self {
        Self {
            timing: [0.001, 0.001, 2.0, 0.0],
            flags: [1.0, 0.0, 1.0, 0.0],
            parent_position: [0.0; 4],
            parent_rotation: Mat4::IDENTITY.to_cols_array_2d(),
            player_position: [0.0; 4],
            arena_min: [ARENA_MIN[0], ARENA_MIN[1], ARENA_MIN[2], 0.0],
            arena_max: [ARENA_MAX[0], ARENA_MAX[1], ARENA_MAX[2], 0.0],
            environment_mask: [1.0, 0.0, 0.0, 0.0],
            bullet_type_a: [0.0; 4],
            bullet_type_b: [0.0; 4],
            tuning: [BULLET_WARNING, LASER_WARNING, GRAZE_DISTANCE, NULL_THRESHOLD],
            enemies: [EMPTY_COLLIDER; MAX_ENEMIES],
            bombs: [EMPTY_COLLIDER; MAX_BOMBS],
        }
    }
}

impl KernelUniforms {
    #[inline]
    pub fn delta(&self) -> f32 {
        self.timing[0]
    }

    #[inline]
    pub fn time_since_start(&self) -> f32 {
        self.timing[1]
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.timing[2] as u32
    }

    pub fn set_delta(&mut self, delta: f32) {
        self.timing[0] = delta;
    }

    pub fn set_time_since_start(&mut self, time: f32) {
        self.timing[1] = time;
    }

    pub fn set_width(&mut self, width: u32) {
        self.timing[2] = width as f32;
    }

    pub fn set_parent(&mut self, position: Vec3, rotation: Mat4) {
        self.parent_position = position.extend(0.0).to_array();
        self.parent_rotation = rotation.to_cols_array_2d();
    }

    pub fn set_player_position(&mut self, position: Vec3) {
        self.player_position = position.extend(0.0).to_array();
    }

    pub fn set_arena(&mut self, min: Vec3, max: Vec3, mask: Vec3) {
        self.arena_min = min.extend(0.0).to_array();
        self.arena_max = max.extend(0.0).to_array();
        self.environment_mask = mask.extend(0.0).to_array();
    }

    pub fn set_pass_through(&mut self, translation: bool, rotation: bool) {
        self.flags[0] = if translation { 1.0 } else { 0.0 };
        self.flags[1] = if rotation { 1.0 } else { 0.0 };
    }

    pub fn set_bullet_radius(&mut self, radius: f32) {
        self.flags[2] = radius;
    }

    pub fn set_laser_length(&mut self, length: f32) {
        self.flags[3] = length;
    }

    /// Publish collider lists; slots past the supplied ones are emptied
    pub fn set_enemies(&mut self, enemies: &[[f32; 4]]) {
        fill_colliders(&mut self.enemies, enemies);
    }

    pub fn set_bombs(&mut self, bombs: &[[f32; 4]]) {
        fill_colliders(&mut self.bombs, bombs);
    }

    pub(crate) fn parent_rotation_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.parent_rotation)
    }
}

fn fill_colliders(slots: &mut [[f32; 4]], source: &[[f32; 4]]) {
    for (i, slot) in slots.iter_mut().enumerate() {
        *slot = source.get(i).copied().unwrap_or(EMPTY_COLLIDER);
    }
}

// ============================================================================
// PROGRAMS
// ============================================================================

/// View of one cell handed to a program's CPU evaluation
pub struct CellContext<'a> {
    pub index: usize,
    pub width: u32,
    pub uniforms: &'a KernelUniforms,
    inputs: [&'a [[f32; 4]]; 7],
}

impl<'a> CellContext<'a> {
    pub fn new(
        index: usize,
        width: u32,
        uniforms: &'a KernelUniforms,
        inputs: [&'a [[f32; 4]]; 7],
    ) -> Self {
        Self {
            index,
            width,
            uniforms,
            inputs,
        }
    }

    /// Same-index cell of the grid bound to `slot`
    #[inline]
    pub fn read(&self, slot: InputSlot) -> Vec4 {
        self.inputs[slot.index()]
            .get(self.index)
            .map(|c| Vec4::from_array(*c))
            .unwrap_or(Vec4::splat(NULL_COORD))
    }
}

/// A per-cell pure function
pub trait CellProgram: Send + Sync {
    /// Unique name; backends cache compiled pipelines by it
    fn name(&self) -> &'static str;

    /// WGSL defining `fn cell_value(i: u32) -> vec4<f32>` against the prelude
    fn wgsl(&self) -> &'static str;

    /// Reference evaluation of one cell
    fn eval(&self, ctx: &CellContext) -> Vec4;
}

/// Full WGSL module for a program: prelude followed by its body
pub fn compose_wgsl(program: &dyn CellProgram) -> String {
    let mut source = String::with_capacity(PRELUDE_WGSL.len() + program.wgsl().len() + 1);
    source.push_str(PRELUDE_WGSL);
    source.push('\n');
    source.push_str(program.wgsl());
    source
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout_is_vec4_aligned() {
        let size = std::mem::size_of::<KernelUniforms>();
        assert_eq!(size % 16, 0);
        // 11 vec4 members, one mat4, enemy and bomb arrays
        assert_eq!(size, 16 * (11 + 4 + MAX_ENEMIES + MAX_BOMBS));
    }

    #[test]
    fn test_prelude_array_sizes_match_constants() {
        assert!(PRELUDE_WGSL.contains(&format!("array<vec4<f32>, {MAX_ENEMIES}>")));
        assert!(PRELUDE_WGSL.contains(&format!("array<vec4<f32>, {MAX_BOMBS}>")));
        assert!(PRELUDE_WGSL.contains(&format!("{MAX_BULLETS_PER_GROUP}.0")));
    }

    #[test]
    fn test_set_enemies_clears_unused_slots() {
        let mut uniforms = KernelUniforms::default();
        uniforms.set_enemies(&[[1.0, 2.0, 3.0, 0.5]; 3]);
        uniforms.set_enemies(&[[4.0, 5.0, 6.0, 1.0]]);
        assert_eq!(uniforms.enemies[0], [4.0, 5.0, 6.0, 1.0]);
        assert_eq!(uniforms.enemies[1], EMPTY_COLLIDER);
        assert_eq!(uniforms.enemies[2], EMPTY_COLLIDER);
    }

    #[test]
    fn test_compose_wgsl_includes_body() {
        let source = compose_wgsl(&LinearPosition);
        assert!(source.starts_with(PRELUDE_WGSL));
        assert!(source.contains("fn cell_value"));
    }
}
