//! Simulation settings
//!
//! Loaded once at startup; everything here is read-only while groups run.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::consts::*;
use crate::error::{BulletError, Result};

/// Difficulty levels that deferred recipe fields are resolved against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
    Lunatic,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "Easy",
            Difficulty::Normal => "Normal",
            Difficulty::Hard => "Hard",
            Difficulty::Lunatic => "Lunatic",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "easy" => Some(Difficulty::Easy),
            "normal" => Some(Difficulty::Normal),
            "hard" => Some(Difficulty::Hard),
            "lunatic" => Some(Difficulty::Lunatic),
            _ => None,
        }
    }

    /// Numeric level (1-4) that recipe functions receive
    pub fn number(&self) -> u8 {
        match self {
            Difficulty::Easy => 1,
            Difficulty::Normal => 2,
            Difficulty::Hard => 3,
            Difficulty::Lunatic => 4,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Difficulty::Easy),
            2 => Some(Difficulty::Normal),
            3 => Some(Difficulty::Hard),
            4 => Some(Difficulty::Lunatic),
            _ => None,
        }
    }
}

/// Runtime configuration for the bullet simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Lower arena corner
    pub arena_min: Vec3,
    /// Upper arena corner
    pub arena_max: Vec3,
    /// Per-axis environment collision switches: x = floor, y = walls, z = ceiling
    pub environment_collision: Vec3,

    /// Difficulty used to resolve deferred recipe fields
    pub difficulty: Difficulty,
    /// Seed for pattern offsets
    pub seed: u64,

    /// Transfer slots per readback pool
    pub readback_depth: usize,

    /// Graze ring width around enemy bullets
    pub graze_distance: f32,
    /// Collision grace period after a bullet activates
    pub bullet_warning: f32,
    /// Collision grace period after a laser activates
    pub laser_warning: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            arena_min: Vec3::from_array(ARENA_MIN),
            arena_max: Vec3::from_array(ARENA_MAX),
            environment_collision: Vec3::new(1.0, 0.0, 0.0),

            difficulty: Difficulty::Normal,
            seed: 0x5eed,

            readback_depth: READBACK_DEPTH,

            graze_distance: GRAZE_DISTANCE,
            bullet_warning: BULLET_WARNING,
            laser_warning: LASER_WARNING,
        }
    }
}

impl SimConfig {
    /// Parse a JSON config (missing fields fall back to defaults)
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SimConfig = serde_json::from_str(json)
            .map_err(|e| BulletError::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BulletError::config(format!("config not serializable: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.readback_depth == 0 {
            return Err(BulletError::config("readback_depth must be at least 1"));
        }
        if self.arena_min.cmpge(self.arena_max).any() {
            return Err(BulletError::config("arena_min must be below arena_max on every axis"));
        }
        Ok(())
    }
}
