//! Built-in kernel programs
//!
//! CPU evaluations mirror the WGSL bodies in `shaders/` cell for cell.

use glam::{Mat3, Vec3, Vec4, Vec4Swizzles};

use super::{CellContext, CellProgram, InputSlot, KernelUniforms};
use crate::consts::*;

const PACK_K: f32 = MAX_BULLETS_PER_GROUP as f32;

#[inline]
fn flag(cond: bool) -> f32 {
    if cond { 1.0 } else { 0.0 }
}

fn null_cell() -> Vec4 {
    Vec4::new(NULL_COORD, NULL_COORD, NULL_COORD, 1.0)
}

fn in_scene(u: &KernelUniforms, p: Vec3) -> f32 {
    flag(p.y > u.tuning[3])
}

struct Motion {
    position: Vec3,
    velocity: Vec3,
    velocity_w: f32,
}

/// Activation, parent transform and emitter follow
fn motion_header(ctx: &CellContext, follow_window: f32) -> Motion {
    let u = ctx.uniforms;
    let threshold = u.tuning[3];

    let rot = if u.flags[1] > 0.5 {
        Mat3::from_mat4(u.parent_rotation_matrix())
    } else {
        Mat3::IDENTITY
    };

    let raw_position = ctx.read(InputSlot::InitialPosition).xyz();
    let moved = rot * raw_position + u.flags[0] * Vec3::from_slice(&u.parent_position[..3]);
    let initial_position = if raw_position.y <= threshold {
        raw_position
    } else {
        moved
    };

    let raw_velocity = ctx.read(InputSlot::InitialVelocity);
    let initial_velocity = (rot * raw_velocity.xyz()).extend(raw_velocity.w);

    let previous_position = ctx.read(InputSlot::Position).xyz();
    let previous_velocity = ctx.read(InputSlot::Velocity);

    let d_timing = u.time_since_start() - ctx.read(InputSlot::Timings).w;
    let assign = d_timing > 0.0 && previous_velocity.w < 0.5;
    let alive = previous_position.y > threshold;
    let follow = d_timing > 0.0 && d_timing < follow_window && alive;

    let position = if assign || follow {
        initial_position
    } else {
        previous_position
    };
    let velocity = if assign {
        initial_velocity
    } else {
        previous_velocity
    };

    Motion {
        position,
        velocity: velocity.xyz(),
        velocity_w: velocity.w,
    }
}

fn integrate(ctx: &CellContext, m: &Motion) -> Vec4 {
    let collided = ctx.read(InputSlot::Collision).w != 0.0;
    if collided || m.position.y <= ctx.uniforms.tuning[3] {
        return null_cell();
    }
    (m.position + m.velocity * ctx.uniforms.delta()).extend(1.0)
}

fn environment_collision(u: &KernelUniforms, p: Vec3) -> f32 {
    let mask = u.environment_mask;
    let mut hit = mask[0] * flag(p.y < u.arena_min[1]);
    hit = hit.max(mask[1] * flag(p.x < u.arena_min[0] || p.x > u.arena_max[0]));
    hit.max(mask[2] * flag(p.y > u.arena_max[1]))
}

fn segment_distance(a: Vec3, b: Vec3, p: Vec3) -> f32 {
    let ab = b - a;
    let l2 = ab.length_squared().max(0.01);
    let t = ((p - a).dot(ab) / l2).clamp(0.0, 1.0);
    p.distance(a + t * ab)
}

fn laser_distance(position: Vec3, velocity: Vec3, laser_len: f32, p: Vec3) -> f32 {
    let direction = velocity / velocity.length().max(0.001);
    segment_distance(position, position + direction * laser_len, p)
}

/// 1 when the cell is before its warning window closes or past its end time
fn has_ended(ctx: &CellContext, warning: f32) -> f32 {
    let d_timing = ctx.uniforms.time_since_start() - ctx.read(InputSlot::Timings).w;
    let end = ctx.read(InputSlot::EndTimings).w;
    flag(d_timing > end).max(flag(d_timing < warning))
}

// ============================================================================
// MOTION
// ============================================================================

/// `p + v·dt`; follows the emitter during the warning window
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearPosition;

impl CellProgram for LinearPosition {
    fn name(&self) -> &'static str {
        "linear_position"
    }

    fn wgsl(&self) -> &'static str {
        include_str!("shaders/linear_position.wgsl")
    }

    fn eval(&self, ctx: &CellContext) -> Vec4 {
        let m = motion_header(ctx, ctx.uniforms.tuning[0]);
        integrate(ctx, &m)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinearVelocity;

impl CellProgram for LinearVelocity {
    fn name(&self) -> &'static str {
        "linear_velocity"
    }

    fn wgsl(&self) -> &'static str {
        include_str!("shaders/linear_velocity.wgsl")
    }

    fn eval(&self, ctx: &CellContext) -> Vec4 {
        let m = motion_header(ctx, ctx.uniforms.tuning[0]);
        m.velocity.extend(m.velocity_w)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LaserPosition;

impl CellProgram for LaserPosition {
    fn name(&self) -> &'static str {
        "laser_position"
    }

    fn wgsl(&self) -> &'static str {
        include_str!("shaders/laser_position.wgsl")
    }

    fn eval(&self, ctx: &CellContext) -> Vec4 {
        let m = motion_header(ctx, 0.0);
        integrate(ctx, &m)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LaserVelocity;

impl CellProgram for LaserVelocity {
    fn name(&self) -> &'static str {
        "laser_velocity"
    }

    fn wgsl(&self) -> &'static str {
        include_str!("shaders/laser_velocity.wgsl")
    }

    fn eval(&self, ctx: &CellContext) -> Vec4 {
        let m = motion_header(ctx, 0.0);
        m.velocity.extend(m.velocity_w)
    }
}

// ============================================================================
// COLLISION
// ============================================================================

/// Packed tallies for enemy-fired bullets
#[derive(Debug, Clone, Copy, Default)]
pub struct EnemyBulletCollision;

impl CellProgram for EnemyBulletCollision {
    fn name(&self) -> &'static str {
        "enemy_bullet_collision"
    }

    fn wgsl(&self) -> &'static str {
        include_str!("shaders/enemy_collision.wgsl")
    }

    fn eval(&self, ctx: &CellContext) -> Vec4 {
        let u = ctx.uniforms;
        let p = ctx.read(InputSlot::Position).xyz();

        let [is_bullet, is_life, is_bomb, _] = u.bullet_type_a;
        let [is_power, is_point, is_special, _] = u.bullet_type_b;

        let mut environment = environment_collision(u, p);
        for bomb in &u.bombs {
            let close = is_bullet * flag(p.distance(Vec3::from_slice(&bomb[..3])) < bomb[3]);
            environment = environment.max(close);
        }

        let radius = u.flags[2];
        let player_position = Vec3::from_slice(&u.player_position[..3]);
        let player_distance = player_position.distance(p);
        let is_graze = flag((radius + u.tuning[2]) - player_distance > 0.0);
        let player = flag(player_distance < radius);

        let w = player + environment + is_bullet * PACK_K * player;
        let x = is_point * player + PACK_K * is_bullet * is_graze;
        let y = is_bomb * player + 1000.0 * is_life * player;
        let z = is_power * player + 1000.0 * is_special * player;

        let collision = Vec4::new(x, y, z, w) * in_scene(u, p);
        collision * (1.0 - has_ended(ctx, u.tuning[0]))
    }
}

/// Segment test along the laser direction; only bombs and the player count
#[derive(Debug, Clone, Copy, Default)]
pub struct LaserCollision;

impl CellProgram for LaserCollision {
    fn name(&self) -> &'static str {
        "laser_collision"
    }

    fn wgsl(&self) -> &'static str {
        include_str!("shaders/laser_collision.wgsl")
    }

    fn eval(&self, ctx: &CellContext) -> Vec4 {
        let u = ctx.uniforms;
        let p = ctx.read(InputSlot::Position).xyz();
        let velocity = ctx.read(InputSlot::Velocity).xyz();
        let laser_len = u.flags[3];

        let mut environment: f32 = 0.0;
        for bomb in &u.bombs {
            let d = laser_distance(p, velocity, laser_len, Vec3::from_slice(&bomb[..3]));
            environment = environment.max(flag(d < bomb[3]));
        }

        let player_position = Vec3::from_slice(&u.player_position[..3]);
        let player = flag(laser_distance(p, velocity, laser_len, player_position) < u.flags[2]);

        let w = player + environment + PACK_K * player;
        let collision = Vec4::new(0.0, 0.0, 0.0, w) * in_scene(u, p);
        collision * (1.0 - has_ended(ctx, u.tuning[1]))
    }
}

/// `(position, collisionID)` for player-fired bullets
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerBulletCollision;

impl CellProgram for PlayerBulletCollision {
    fn name(&self) -> &'static str {
        "player_bullet_collision"
    }

    fn wgsl(&self) -> &'static str {
        include_str!("shaders/player_collision.wgsl")
    }

    fn eval(&self, ctx: &CellContext) -> Vec4 {
        let u = ctx.uniforms;
        let p = ctx.read(InputSlot::Position).xyz();

        let mut id = environment_collision(u, p);
        for (i, enemy) in u.enemies.iter().enumerate() {
            let close = flag(p.distance(Vec3::from_slice(&enemy[..3])) < enemy[3]);
            id = id.max(close * (MAX_ENEMIES + i) as f32);
        }

        p.extend(id * in_scene(u, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NULL: [f32; 4] = [NULL_COORD; 4];

    /// Single-cell grids in slot order
    struct Cell {
        slots: [[[f32; 4]; 1]; 7],
    }

    impl Cell {
        fn new() -> Self {
            Self {
                slots: [
                    [[NULL_COORD, NULL_COORD, NULL_COORD, 1.0]],
                    [[0.0; 4]],
                    [[0.0; 4]],
                    [[0.0, 1.0, 0.0, 1.0]],
                    [[1.0, 0.0, 0.0, 1.0]],
                    [[NULL_COORD, NULL_COORD, NULL_COORD, 0.0]],
                    [[NULL_COORD, NULL_COORD, NULL_COORD, 10.0]],
                ],
            }
        }

        fn with(mut self, slot: InputSlot, value: [f32; 4]) -> Self {
            self.slots[slot.index()] = [value];
            self
        }

        fn eval(&self, program: &dyn CellProgram, uniforms: &KernelUniforms) -> Vec4 {
            let inputs: [&[[f32; 4]]; 7] = [
                &self.slots[0],
                &self.slots[1],
                &self.slots[2],
                &self.slots[3],
                &self.slots[4],
                &self.slots[5],
                &self.slots[6],
            ];
            program.eval(&CellContext::new(0, 1, uniforms, inputs))
        }
    }

    fn uniforms_at(time: f32, delta: f32) -> KernelUniforms {
        let mut u = KernelUniforms::default();
        u.set_time_since_start(time);
        u.set_delta(delta);
        u
    }

    #[test]
    fn test_inactive_bullet_stays_null() {
        let cell = Cell::new().with(InputSlot::Timings, [NULL_COORD, NULL_COORD, NULL_COORD, 5.0]);
        let out = cell.eval(&LinearPosition, &uniforms_at(1.0, 0.1));
        assert_eq!(out, null_cell());

        let v = cell.eval(&LinearVelocity, &uniforms_at(1.0, 0.1));
        assert_eq!(v, Vec4::ZERO);
    }

    #[test]
    fn test_activation_assigns_initial_state() {
        let cell = Cell::new();
        let u = uniforms_at(0.5, 0.1);
        let p = cell.eval(&LinearPosition, &u);
        assert!((p - Vec4::new(0.1, 1.0, 0.0, 1.0)).length() < 1e-6);

        let v = cell.eval(&LinearVelocity, &u);
        assert_eq!(v, Vec4::new(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn test_activated_velocity_is_not_reassigned() {
        let cell = Cell::new()
            .with(InputSlot::Position, [3.0, 1.0, 0.0, 1.0])
            .with(InputSlot::Velocity, [0.0, 2.0, 0.0, 1.0]);
        let v = cell.eval(&LaserVelocity, &uniforms_at(5.0, 0.1));
        assert_eq!(v, Vec4::new(0.0, 2.0, 0.0, 1.0));

        let p = cell.eval(&LaserPosition, &uniforms_at(5.0, 0.5));
        assert!((p - Vec4::new(3.0, 2.0, 0.0, 1.0)).length() < 1e-6);
    }

    #[test]
    fn test_collided_bullet_goes_null() {
        let cell = Cell::new()
            .with(InputSlot::Position, [0.0, 1.0, 0.0, 1.0])
            .with(InputSlot::Velocity, [1.0, 0.0, 0.0, 1.0])
            .with(InputSlot::Collision, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(cell.eval(&LinearPosition, &uniforms_at(5.0, 0.1)), null_cell());
    }

    #[test]
    fn test_parent_translation_and_rotation() {
        let cell = Cell::new().with(InputSlot::InitialPosition, [1.0, 0.0, 0.0, 1.0]);
        let mut u = uniforms_at(0.5, 0.0);
        u.set_parent(
            Vec3::new(0.0, 5.0, 0.0),
            glam::Mat4::from_rotation_y(std::f32::consts::FRAC_PI_2),
        );
        u.set_pass_through(true, true);
        let p = cell.eval(&LinearPosition, &u);
        assert!((p.xyz() - Vec3::new(0.0, 5.0, -1.0)).length() < 1e-5);

        u.set_pass_through(false, false);
        let p = cell.eval(&LinearPosition, &u);
        assert!((p.xyz() - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_enemy_bullet_hits_player_after_warning() {
        let cell = Cell::new().with(InputSlot::Position, [0.0, 1.0, 0.0, 1.0]);
        let mut u = uniforms_at(1.0, 0.1);
        u.set_player_position(Vec3::new(0.0, 1.2, 0.0));
        u.set_bullet_radius(0.5);
        u.bullet_type_a = [1.0, 0.0, 0.0, 0.0];

        let c = cell.eval(&EnemyBulletCollision, &u);
        assert_eq!(c.x, PACK_K);
        assert_eq!(c.w, 1.0 + PACK_K);

        // inside the warning window nothing registers
        let c = cell.eval(&EnemyBulletCollision, &uniforms_at(0.1, 0.1));
        assert_eq!(c, Vec4::ZERO);
    }

    #[test]
    fn test_enemy_pickup_categories() {
        let cell = Cell::new().with(InputSlot::Position, [0.0, 1.0, 0.0, 1.0]);
        let mut u = uniforms_at(1.0, 0.1);
        u.set_player_position(Vec3::new(0.0, 1.0, 0.0));
        u.bullet_type_a = [0.0, 2.0, 0.0, 0.0];
        let c = cell.eval(&EnemyBulletCollision, &u);
        assert_eq!(c, Vec4::new(0.0, 2000.0, 0.0, 1.0));

        u.bullet_type_a = [0.0; 4];
        u.bullet_type_b = [1.0, 0.0, 0.0, 0.0];
        let c = cell.eval(&EnemyBulletCollision, &u);
        assert_eq!(c, Vec4::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn test_enemy_bullet_hits_floor_and_bombs() {
        let cell = Cell::new().with(InputSlot::Position, [0.0, -0.5, 0.0, 1.0]);
        let mut u = uniforms_at(1.0, 0.1);
        u.set_player_position(Vec3::new(5.0, 5.0, 5.0));
        let c = cell.eval(&EnemyBulletCollision, &u);
        assert_eq!(c.w, 1.0);

        let cell = Cell::new().with(InputSlot::Position, [2.0, 2.0, 0.0, 1.0]);
        u.set_bombs(&[[2.0, 2.5, 0.0, 1.0]]);
        assert_eq!(cell.eval(&EnemyBulletCollision, &u).w, 0.0);
        u.bullet_type_a = [1.0, 0.0, 0.0, 0.0];
        assert_eq!(cell.eval(&EnemyBulletCollision, &u).w, 1.0);
    }

    #[test]
    fn test_laser_segment_reaches_player() {
        let cell = Cell::new()
            .with(InputSlot::Position, [0.0, 1.0, 0.0, 1.0])
            .with(InputSlot::Velocity, [0.0, 0.0, 2.0, 1.0]);
        let mut u = uniforms_at(2.0, 0.1);
        u.set_player_position(Vec3::new(0.0, 1.0, 4.0));
        u.set_bullet_radius(0.3);

        u.set_laser_length(5.0);
        assert_eq!(cell.eval(&LaserCollision, &u).w, 1.0 + PACK_K);

        u.set_laser_length(3.0);
        assert_eq!(cell.eval(&LaserCollision, &u).w, 0.0);

        // laser warning still open
        u.set_laser_length(5.0);
        u.set_time_since_start(0.5);
        assert_eq!(cell.eval(&LaserCollision, &u).w, 0.0);
    }

    #[test]
    fn test_player_bullet_collision_ids() {
        let cell = Cell::new().with(InputSlot::Position, [1.0, 2.0, 3.0, 1.0]);
        let mut u = uniforms_at(1.0, 0.1);
        u.set_enemies(&[[9.0, 9.0, 9.0, 1.0], [1.0, 2.0, 3.5, 1.0]]);
        let c = cell.eval(&PlayerBulletCollision, &u);
        assert_eq!(c, Vec4::new(1.0, 2.0, 3.0, (MAX_ENEMIES + 1) as f32));

        let cell = Cell::new().with(InputSlot::Position, [1.0, -1.0, 3.0, 1.0]);
        assert_eq!(cell.eval(&PlayerBulletCollision, &u).w, 1.0);

        let cell = Cell::new().with(InputSlot::Position, NULL);
        assert_eq!(cell.eval(&PlayerBulletCollision, &u).w, 0.0);
    }
}
