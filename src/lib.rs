//! Danmaku Compute - data-parallel bullet simulation
//!
//! Core modules:
//! - `grid`: Square state grids and the buffer builder
//! - `kernel`: Per-cell kernel programs and their uniform block
//! - `compute`: Backends that evaluate kernels (CPU reference, wgpu)
//! - `sim`: Differential system, collision reduction, async readback, group manager
//! - `behaviour`: Motion/collision bindings and the collision encoding
//! - `recipe`: Declarative recipes, pattern and end-timing compilers, cache
//! - `audio`: Sound trigger schedules derived from bullet timings
//! - `settings`: Runtime configuration

pub mod audio;
pub mod behaviour;
pub mod compute;
pub mod error;
pub mod grid;
pub mod kernel;
pub mod recipe;
pub mod settings;
pub mod sim;

pub use error::{BulletError, Result};
pub use settings::{Difficulty, SimConfig};

/// Simulation constants
pub mod consts {
    /// Enemy slots published to collision kernels each frame
    pub const MAX_ENEMIES: usize = 50;
    /// Bomb slots published to collision kernels each frame
    pub const MAX_BOMBS: usize = 8;
    /// Hard per-group instance capacity, also the tally packing multiplier
    pub const MAX_BULLETS_PER_GROUP: usize = 100_000;

    /// Sentinel coordinate for inert cells (far outside the arena)
    pub const NULL_COORD: f32 = -510.0;
    /// Anything with y below this is treated as not in the scene
    pub const NULL_THRESHOLD: f32 = -500.0;

    /// Seconds after activation before a bullet can collide
    pub const BULLET_WARNING: f32 = 0.2;
    /// Seconds after activation before a laser can collide
    pub const LASER_WARNING: f32 = 1.0;
    /// Extra distance around a bullet that counts as a graze
    pub const GRAZE_DISTANCE: f32 = 0.5;

    /// End time used for groups with an infinite lifespan
    pub const INFINITE_END_TIME: f32 = 8_000_000.0;

    /// Transfer slots per readback pool (pipeline depth)
    pub const READBACK_DEPTH: usize = 16;

    /// Arena dimensions
    pub const ARENA_WIDTH: f32 = 15.0;
    pub const ARENA_HEIGHT: f32 = 10.0;
    pub const ARENA_LENGTH: f32 = 20.0;
    pub const ARENA_MIN: [f32; 3] = [-ARENA_WIDTH / 2.0, 0.0, -ARENA_LENGTH / 2.0];
    pub const ARENA_MAX: [f32; 3] = [ARENA_WIDTH / 2.0, ARENA_HEIGHT, ARENA_LENGTH / 2.0];
}

/// Smallest power of two >= n (1 for n == 0)
#[inline]
pub fn next_power_of_two(n: u32) -> u32 {
    if n == 0 { 1 } else { n.next_power_of_two() }
}

/// Width of the square grid that holds `n` entities
#[inline]
pub fn grid_width(n: usize) -> u32 {
    let side = (n as f64).sqrt().ceil() as u32;
    next_power_of_two(side).max(2)
}
