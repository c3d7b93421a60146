//! Bullet pattern compiler
//!
//! Generators produce initial positions and velocities; the compiler then
//! applies the optional random offset, fills missing timings with zero and
//! expands `repeat`. Results are memoised per recipe id.

use std::f32::consts::PI;
use std::sync::Arc;

use glam::Vec3;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{PatternOptions, RecipeCache, RecipeId};
use crate::consts::*;
use crate::error::{BulletError, Result};
use crate::grid::StateGrid;

/// Registered pattern generators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// Fibonacci-lattice sphere
    Burst,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Burst => "burst",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "burst" => Ok(PatternKind::Burst),
            _ => Err(BulletError::unsupported("pattern", name)),
        }
    }
}

/// Emit the whole pattern `times` times, `delay` seconds apart
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Repeat {
    pub times: usize,
    pub delay: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum RandKeyword {
    #[serde(rename = "rand")]
    Rand,
}

/// One axis of a random offset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RandComponent {
    Value(f32),
    /// Uniform in `[min, max)`
    Range([f32; 2]),
    /// Uniform in `[-1, 1)`
    Rand(#[serde(with = "rand_keyword")] ()),
}

mod rand_keyword {
    use super::RandKeyword;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(_: &(), serializer: S) -> Result<S::Ok, S::Error> {
        RandKeyword::Rand.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<(), D::Error> {
        RandKeyword::deserialize(deserializer).map(|_| ())
    }
}

impl RandComponent {
    fn sample(&self, rng: &mut impl Rng) -> f32 {
        match *self {
            RandComponent::Value(v) => v,
            RandComponent::Range([min, max]) if min < max => rng.random_range(min..max),
            RandComponent::Range([min, _]) => min,
            RandComponent::Rand(()) => rng.random_range(-1.0..1.0),
        }
    }
}

/// Randomised vector spec; missing axes are zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RandVector {
    pub x: Option<RandComponent>,
    pub y: Option<RandComponent>,
    pub z: Option<RandComponent>,
    pub normalize_to_length: Option<f32>,
}

impl RandVector {
    pub fn new(x: RandComponent, y: RandComponent, z: RandComponent) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            normalize_to_length: None,
        }
    }

    /// Draw one vector. Zero components become 1e-6 so the kernels never see
    /// an exactly zero offset axis.
    pub fn sample(&self, rng: &mut impl Rng) -> Vec3 {
        let mut axis = |c: &Option<RandComponent>| {
            let v = c.map_or(0.0, |c| c.sample(&mut *rng));
            if v == 0.0 { 0.000_001 } else { v }
        };
        let v = Vec3::new(axis(&self.x), axis(&self.y), axis(&self.z));
        match self.normalize_to_length {
            Some(length) if length != 0.0 => v.normalize_or_zero() * length,
            _ => v,
        }
    }
}

/// Initial positions are either explicit points or a grid produced on the device
#[derive(Debug, Clone, PartialEq)]
pub enum PatternPositions {
    Points(Vec<Vec3>),
    Grid(StateGrid),
}

/// Compiled pattern, shared through the cache
#[derive(Debug, Clone, PartialEq)]
pub struct BulletPattern {
    pub uid: RecipeId,
    pub positions: PatternPositions,
    pub velocities: Vec<Vec3>,
    pub timings: Vec<f32>,
}

impl BulletPattern {
    /// Entity count
    pub fn len(&self) -> usize {
        self.timings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timings.is_empty()
    }
}

struct Generated {
    positions: PatternPositions,
    velocities: Vec<Vec3>,
    timings: Option<Vec<f32>>,
}

/// Points on a Fibonacci lattice over the sphere band `y_start - [0, y_length]`
pub fn burst(options: &PatternOptions, radius: f32) -> Vec<Vec3> {
    let num = options.num;
    let golden_angle = PI * (3.0 - 5.0f32.sqrt());
    let theta_length = if options.theta_length == 0.0 {
        PI * 2.0
    } else {
        options.theta_length
    };

    (0..num)
        .map(|i| {
            let t = if num > 1 {
                i as f32 / (num - 1) as f32
            } else {
                0.0
            };
            let y = options.y_start - t * options.y_length;
            let ring = (1.0 - y * y).max(0.0).sqrt();
            let theta = (golden_angle * i as f32) % theta_length + options.theta_start;
            Vec3::new(theta.cos() * ring, y, theta.sin() * ring) * radius
        })
        .collect()
}

fn make_burst_pattern(options: &PatternOptions) -> Generated {
    let (positions, velocities) = match &options.speeds {
        Some(speeds) => {
            let shell = burst(options, options.radius);
            let positions = speeds.iter().flat_map(|_| shell.iter().copied()).collect();
            let velocities = speeds.iter().flat_map(|&s| burst(options, s)).collect();
            (positions, velocities)
        }
        None => (burst(options, options.radius), burst(options, options.speed)),
    };
    Generated {
        positions: PatternPositions::Points(positions),
        velocities,
        timings: None,
    }
}

fn generate(options: &PatternOptions) -> Generated {
    match options.pattern {
        PatternKind::Burst => make_burst_pattern(options),
    }
}

/// Offset, default timings, repeat and the capacity check
fn compile(options: &PatternOptions, generated: Generated, rng: &mut impl Rng) -> Result<BulletPattern> {
    let Generated {
        mut positions,
        mut velocities,
        timings,
    } = generated;

    if let Some(offset) = &options.offset {
        let PatternPositions::Points(points) = &mut positions else {
            return Err(BulletError::config("offset can not be applied to grid positions"));
        };
        let offset = offset.sample(rng);
        for p in points.iter_mut() {
            *p += offset;
        }
    }

    let mut timings = match (timings, &positions) {
        (Some(timings), _) => timings,
        (None, PatternPositions::Points(points)) => vec![0.0; points.len()],
        (None, PatternPositions::Grid(_)) => {
            return Err(BulletError::config("timings must be supplied with grid positions"));
        }
    };

    if let Some(repeat) = options.repeat {
        let PatternPositions::Points(points) = &mut positions else {
            return Err(BulletError::config("grid positions can not be repeated"));
        };
        if repeat.times == 0 {
            return Err(BulletError::config("repeat.times must be at least 1"));
        }
        let n = timings.len();
        *points = points.repeat(repeat.times);
        velocities = velocities.repeat(repeat.times);
        timings = (0..repeat.times)
            .flat_map(|i| {
                let shift = i as f32 * repeat.delay;
                timings[..n].iter().map(move |t| t + shift)
            })
            .collect();
    }

    if timings.len() > MAX_BULLETS_PER_GROUP {
        return Err(BulletError::Capacity {
            requested: timings.len(),
            max: MAX_BULLETS_PER_GROUP,
        });
    }

    Ok(BulletPattern {
        uid: options.uid.clone(),
        positions,
        velocities,
        timings,
    })
}

/// Compile (or fetch) the pattern for `options`. `first_compute` marks a
/// precompute pass and silences the cache-miss warning.
pub fn make_bullet_pattern(
    options: &PatternOptions,
    cache: &mut RecipeCache,
    rng: &mut impl Rng,
    first_compute: bool,
) -> Result<Arc<BulletPattern>> {
    if let Some(pattern) = cache.pattern(&options.uid) {
        return Ok(pattern);
    }

    if !options.disable_precomputation && !first_compute {
        log::warn!(
            "Bullet pattern {} ({}) wasn't precomputed",
            options.uid,
            options.pattern.as_str()
        );
    }

    let pattern = Arc::new(compile(options, generate(options), rng)?);

    if !options.disable_precomputation {
        cache.insert_pattern(Arc::clone(&pattern));
    }
    Ok(pattern)
}
