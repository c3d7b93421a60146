//! Bullet behaviours
//!
//! A behaviour binds a differential system to one motion model and one
//! collision encoding, owns the group's clock and publishes each step's grids
//! to the group material.

pub mod encoding;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compute::ComputeBackend;
use crate::consts::*;
use crate::error::{BulletError, Result};
use crate::grid::SourceGrids;
use crate::kernel::{
    CellProgram, EnemyBulletCollision, KernelRole, KernelUniforms, LaserCollision, LaserPosition,
    LaserVelocity, LinearPosition, LinearVelocity, PlayerBulletCollision,
};
use crate::recipe::BehaviourOptions;
use crate::recipe::registry::BulletMaterial;
use crate::settings::SimConfig;
use crate::sim::{ActorBuffers, DifferentialSystem, KernelSet, ParentTransform, StepOutput};

/// Motion model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MotionKind {
    Linear,
    LinearLaser,
}

impl MotionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionKind::Linear => "linear",
            MotionKind::LinearLaser => "linearLaser",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "linear" => Ok(MotionKind::Linear),
            "linearLaser" => Ok(MotionKind::LinearLaser),
            _ => Err(BulletError::unsupported("behaviour", name)),
        }
    }

    pub fn is_laser(&self) -> bool {
        matches!(self, MotionKind::LinearLaser)
    }
}

/// Who fired the group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Enemy,
    Player,
}

/// Collision encoding a group reports in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionProfile {
    /// Packed player tallies, reduced to one cell
    EnemyBullet,
    /// Packed player tallies along a segment, reduced to one cell
    EnemyLaser,
    /// Per-cell `(position, collisionID)`
    PlayerBullet,
}

impl CollisionProfile {
    pub fn of(motion: MotionKind, side: Side) -> Self {
        match (side, motion) {
            (Side::Player, _) => CollisionProfile::PlayerBullet,
            (Side::Enemy, MotionKind::Linear) => CollisionProfile::EnemyBullet,
            (Side::Enemy, MotionKind::LinearLaser) => CollisionProfile::EnemyLaser,
        }
    }

    /// Enemy tallies are summed on the device; player hits need every cell
    pub fn downsample(&self) -> bool {
        !matches!(self, CollisionProfile::PlayerBullet)
    }
}

/// What touching an enemy bullet does to the player
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulletCategory {
    #[default]
    Bullet = 0,
    Life = 1,
    Bomb = 2,
    Power = 3,
    Point = 4,
    Special = 5,
}

impl BulletCategory {
    pub fn from_index(index: u8) -> Result<Self> {
        Ok(match index {
            0 => BulletCategory::Bullet,
            1 => BulletCategory::Life,
            2 => BulletCategory::Bomb,
            3 => BulletCategory::Power,
            4 => BulletCategory::Point,
            5 => BulletCategory::Special,
            _ => return Err(BulletError::unsupported("bullet type", index.to_string())),
        })
    }

    /// One-hot `(bullet, life, bomb)` and `(power, point, special)` scaled by `value`
    pub fn type_packs(self, value: f32) -> ([f32; 4], [f32; 4]) {
        let mut slots = [0.0f32; 6];
        slots[self as usize] = value;
        (
            [slots[0], slots[1], slots[2], 0.0],
            [slots[3], slots[4], slots[5], 0.0],
        )
    }
}

/// Everything `Behaviour::init` needs besides the backend
pub struct BehaviourInit<'a> {
    pub sources: &'a SourceGrids,
    pub parent: ParentTransform,
    pub actors: &'a ActorBuffers,
    pub config: &'a SimConfig,
    /// Required for laser motion
    pub laser_length: Option<f32>,
}

enum BehaviourState {
    Uninit,
    Ready(Box<DifferentialSystem>),
    Disposed,
}

pub struct Behaviour {
    motion: MotionKind,
    profile: CollisionProfile,
    category: BulletCategory,
    bullet_value: f32,
    radius: f32,
    translation_from_parent: bool,
    rotation_from_parent: bool,
    disable_warning: bool,
    laser_length: f32,

    state: BehaviourState,
    time_since_start: f32,
    last_step: Option<StepOutput>,
}

impl Behaviour {
    pub fn new(options: &BehaviourOptions, radius: f32) -> Self {
        Self {
            motion: options.behaviour,
            profile: CollisionProfile::of(options.behaviour, options.side),
            category: options.bullet_type,
            bullet_value: options.bullet_value,
            radius,
            translation_from_parent: options.translation_from_parent,
            rotation_from_parent: options.rotation_from_parent,
            disable_warning: options.disable_warning,
            laser_length: 0.0,
            state: BehaviourState::Uninit,
            time_since_start: 0.001,
            last_step: None,
        }
    }

    pub fn motion(&self) -> MotionKind {
        self.motion
    }

    pub fn profile(&self) -> CollisionProfile {
        self.profile
    }

    pub fn bullet_value(&self) -> f32 {
        self.bullet_value
    }

    pub fn time_since_start(&self) -> f32 {
        self.time_since_start
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, BehaviourState::Ready(_))
    }

    /// Grid to read collisions from, once the first step has run
    pub fn collision_result(&self) -> Option<crate::compute::GridId> {
        self.last_step.map(|s| s.collision_result)
    }

    pub fn last_step(&self) -> Option<StepOutput> {
        self.last_step
    }

    fn kernel_set(&self) -> KernelSet {
        let (position, velocity): (Arc<dyn CellProgram>, Arc<dyn CellProgram>) = match self.motion {
            MotionKind::Linear => (Arc::new(LinearPosition), Arc::new(LinearVelocity)),
            MotionKind::LinearLaser => (Arc::new(LaserPosition), Arc::new(LaserVelocity)),
        };
        let collision: Arc<dyn CellProgram> = match self.profile {
            CollisionProfile::EnemyBullet => Arc::new(EnemyBulletCollision),
            CollisionProfile::EnemyLaser => Arc::new(LaserCollision),
            CollisionProfile::PlayerBullet => Arc::new(PlayerBulletCollision),
        };
        KernelSet {
            position,
            velocity,
            collision,
        }
    }

    fn static_uniforms(&self, u: &mut KernelUniforms, init: &BehaviourInit) {
        let config = init.config;
        u.set_pass_through(self.translation_from_parent, self.rotation_from_parent);
        u.set_parent(init.parent.position, init.parent.rotation_matrix());
        u.set_time_since_start(self.time_since_start);
        u.set_bullet_radius(self.radius);
        u.set_laser_length(self.laser_length);
        u.set_arena(config.arena_min, config.arena_max, config.environment_collision);
        u.tuning = [
            config.bullet_warning,
            config.laser_warning,
            config.graze_distance,
            NULL_THRESHOLD,
        ];
        let (a, b) = self.category.type_packs(self.bullet_value);
        u.bullet_type_a = a;
        u.bullet_type_b = b;
        init.actors.apply(u);
    }

    /// Build the differential system over the group's source grids
    pub fn init(&mut self, backend: &mut dyn ComputeBackend, init: BehaviourInit) -> Result<()> {
        if !matches!(self.state, BehaviourState::Uninit) {
            return Err(BulletError::state("behaviour initialised twice"));
        }
        if self.motion.is_laser() {
            self.laser_length = init.laser_length.ok_or_else(|| {
                BulletError::config("laser behaviour requires meshOptions.laserLength")
            })?;
        }

        let set = self.kernel_set();
        let system = DifferentialSystem::new(
            backend,
            &set,
            init.sources,
            self.profile.downsample(),
            &mut |_role: KernelRole, u: &mut KernelUniforms| self.static_uniforms(u, &init),
        )?;

        log::debug!(
            "Behaviour {} ({:?}) ready, width {}",
            self.motion.as_str(),
            self.profile,
            system.width()
        );
        self.state = BehaviourState::Ready(Box::new(system));
        Ok(())
    }

    /// Advance the clock and the system, then republish grids to `material`.
    /// `None` while warming up or after dispose.
    pub fn update(
        &mut self,
        backend: &mut dyn ComputeBackend,
        delta: f32,
        parent: ParentTransform,
        actors: &ActorBuffers,
        material: &mut BulletMaterial,
    ) -> Result<Option<StepOutput>> {
        let system = match &mut self.state {
            BehaviourState::Uninit => {
                return Err(BulletError::state("behaviour updated before init"));
            }
            BehaviourState::Disposed => return Ok(None),
            BehaviourState::Ready(system) => system,
        };

        self.time_since_start += delta;
        let time = self.time_since_start;
        let rotation = parent.rotation_matrix();

        let step = system.update(backend, delta, &mut |u| {
            u.set_parent(parent.position, rotation);
            u.set_time_since_start(time);
            actors.apply(u);
        })?;

        if let Some(step) = step {
            self.last_step = Some(step);
            material.publish(&step, time, self.disable_warning);
        }
        Ok(step)
    }

    pub fn dispose(&mut self, backend: &mut dyn ComputeBackend) -> Result<()> {
        match std::mem::replace(&mut self.state, BehaviourState::Disposed) {
            BehaviourState::Ready(mut system) => {
                self.last_step = None;
                system.dispose(backend)
            }
            BehaviourState::Uninit => {
                self.state = BehaviourState::Uninit;
                Err(BulletError::state("behaviour disposed before init"))
            }
            BehaviourState::Disposed => Err(BulletError::state("behaviour disposed twice")),
        }
    }
}
