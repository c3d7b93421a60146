//! Sound cues derived from bullet timings
//!
//! Playback belongs to the host; this module only decides when a group's
//! emission sound should fire.

use serde::{Deserialize, Serialize};

use crate::error::{BulletError, Result};

/// Registered emission sounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SoundEffect {
    /// Short shot, one per activation wave
    EnemyShoot,
    /// Rising charge before a laser
    EnemyChargeUp,
    /// Sustained beam
    Laser,
}

impl SoundEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoundEffect::EnemyShoot => "enemyShoot",
            SoundEffect::EnemyChargeUp => "enemyChargeUp",
            SoundEffect::Laser => "laser",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "enemyShoot" => Ok(SoundEffect::EnemyShoot),
            "enemyChargeUp" => Ok(SoundEffect::EnemyChargeUp),
            "laser" => Ok(SoundEffect::Laser),
            _ => Err(BulletError::unsupported("sound", name)),
        }
    }
}

/// Remaining trigger times for one group
#[derive(Debug, Clone)]
pub struct SoundSchedule {
    effect: SoundEffect,
    /// Ascending, no duplicates
    timings: Vec<f32>,
    time_since_start: f32,
}

impl SoundSchedule {
    pub fn new(effect: SoundEffect, timings: &[f32]) -> Self {
        let mut timings: Vec<f32> = timings.iter().copied().filter(|t| t.is_finite()).collect();
        timings.sort_by(f32::total_cmp);
        timings.dedup();
        Self {
            effect,
            timings,
            time_since_start: 0.0,
        }
    }

    pub fn effect(&self) -> SoundEffect {
        self.effect
    }

    pub fn remaining(&self) -> usize {
        self.timings.len()
    }

    /// Advance the clock; returns one cue per timing crossed this frame
    pub fn update(&mut self, delta: f32) -> usize {
        self.time_since_start += delta;
        let now = self.time_since_start;
        let crossed = self.timings.partition_point(|&t| now > t);
        self.timings.drain(..crossed);
        crossed
    }
}
