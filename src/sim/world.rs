//! Global actor state
//!
//! The surrounding game owns a `WorldSnapshot` and passes it to the manager
//! each frame. The manager copies it once into flat `ActorBuffers` before any
//! kernel runs; kernels only ever read those buffers.

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::consts::*;
use crate::kernel::{EMPTY_COLLIDER, KernelUniforms};

/// Sphere an enemy or bomb occupies
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Collider {
    pub position: Vec3,
    pub radius: f32,
}

impl Collider {
    pub fn new(position: Vec3, radius: f32) -> Self {
        Self { position, radius }
    }

    fn packed(&self) -> [f32; 4] {
        self.position.extend(self.radius).to_array()
    }
}

/// Identity of a transform bullets can be emitted from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EmitterId(pub u32);

/// World transform of an emitter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParentTransform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for ParentTransform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl ParentTransform {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn rotation_matrix(&self) -> Mat4 {
        Mat4::from_quat(self.rotation)
    }
}

/// Authoritative actor state for one frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub player_position: Vec3,
    /// Index in this list is the enemy id reported by player-bullet hits
    pub enemies: Vec<Collider>,
    pub bombs: Vec<Collider>,
    pub emitters: HashMap<EmitterId, ParentTransform>,
}

impl WorldSnapshot {
    pub fn set_emitter(&mut self, id: EmitterId, transform: ParentTransform) {
        self.emitters.insert(id, transform);
    }

    /// Transform of an emitter; unknown emitters sit at the origin
    pub fn emitter(&self, id: EmitterId) -> ParentTransform {
        self.emitters.get(&id).copied().unwrap_or_default()
    }
}

/// Flat arrays rewritten once per frame and copied into kernel uniforms
#[derive(Debug, Clone)]
pub struct ActorBuffers {
    pub player_position: Vec3,
    pub enemies: [[f32; 4]; MAX_ENEMIES],
    pub bombs: [[f32; 4]; MAX_BOMBS],
}

impl Default for ActorBuffers {
    fn default() -> Self {
        Self {
            player_position: Vec3::ZERO,
            enemies: [EMPTY_COLLIDER; MAX_ENEMIES],
            bombs: [EMPTY_COLLIDER; MAX_BOMBS],
        }
    }
}

impl ActorBuffers {
    /// Copy the snapshot in; colliders past the slot limits are dropped
    pub fn write(&mut self, world: &WorldSnapshot) {
        if world.enemies.len() > MAX_ENEMIES {
            log::warn!(
                "{} enemies in the world, only the first {} collide",
                world.enemies.len(),
                MAX_ENEMIES
            );
        }
        if world.bombs.len() > MAX_BOMBS {
            log::warn!(
                "{} bombs in the world, only the first {} collide",
                world.bombs.len(),
                MAX_BOMBS
            );
        }

        self.player_position = world.player_position;
        for (i, slot) in self.enemies.iter_mut().enumerate() {
            *slot = world.enemies.get(i).map_or(EMPTY_COLLIDER, Collider::packed);
        }
        for (i, slot) in self.bombs.iter_mut().enumerate() {
            *slot = world.bombs.get(i).map_or(EMPTY_COLLIDER, Collider::packed);
        }
    }

    /// Publish into a kernel's uniform block
    pub fn apply(&self, uniforms: &mut KernelUniforms) {
        uniforms.set_player_position(self.player_position);
        uniforms.enemies = self.enemies;
        uniforms.bombs = self.bombs;
    }
}
