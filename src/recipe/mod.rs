//! Declarative bullet recipes
//!
//! A `RecipeSpec` is what content authors write: every field optional, any
//! field a function of difficulty. `prepare_bullet_instruction` merges it
//! over the defaults, resolves deferred fields once, parses variant names and
//! stamps one shared `RecipeId` on every sub-option so all caches key alike.

pub mod cache;
pub mod deferred;
pub mod end_timing;
pub mod pattern;
pub mod registry;

pub use cache::{RecipeCache, ResolvedSources};
pub use deferred::Deferred;
pub use end_timing::{EndTimingPolicy, make_end_timings};
pub use pattern::{BulletPattern, PatternKind, PatternPositions, RandComponent, RandVector, Repeat, make_bullet_pattern};
pub use registry::{BulletMaterial, BulletMesh, MaterialKind, MeshKind};

use std::f32::consts::PI;
use std::fmt;

use serde::Deserialize;

use crate::audio::SoundEffect;
use crate::behaviour::{BulletCategory, MotionKind, Side};
use crate::error::{BulletError, Result};
use crate::settings::Difficulty;
use deferred::{pick, pick_opt};

/// Shared cache key for one recipe's patterns, timings and grids
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipeId(pub String);

impl From<&str> for RecipeId {
    fn from(s: &str) -> Self {
        RecipeId(s.to_string())
    }
}

impl From<String> for RecipeId {
    fn from(s: String) -> Self {
        RecipeId(s)
    }
}

impl fmt::Display for RecipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// RESOLVED OPTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialOptions {
    pub uid: RecipeId,
    pub material: MaterialKind,
    pub color: [f32; 3],
    pub double_sided: bool,
    pub has_alpha: bool,
    pub alpha: Option<f32>,
    pub glow: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternOptions {
    pub uid: RecipeId,
    pub pattern: PatternKind,
    pub num: usize,
    pub speed: f32,
    pub radius: f32,
    /// Skip memoisation
    pub disable_precomputation: bool,
    pub repeat: Option<Repeat>,
    pub offset: Option<RandVector>,
    /// One burst shell per entry
    pub speeds: Option<Vec<f32>>,
    pub theta_start: f32,
    pub theta_length: f32,
    pub y_start: f32,
    pub y_length: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndTimingOptions {
    pub uid: RecipeId,
    pub timing: EndTimingPolicy,
    pub time: Option<f32>,
    pub times: Option<Vec<f32>>,
    pub disable_precomputation: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshOptions {
    pub uid: RecipeId,
    pub mesh: MeshKind,
    pub radius: f32,
    pub laser_length: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BehaviourOptions {
    pub uid: RecipeId,
    pub behaviour: MotionKind,
    pub side: Side,
    pub bullet_value: f32,
    pub bullet_type: BulletCategory,
    pub translation_from_parent: bool,
    pub rotation_from_parent: bool,
    pub disable_warning: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoundOptions {
    pub uid: RecipeId,
    pub mute: bool,
    pub sound: SoundEffect,
}

/// Fully resolved recipe; immutable once prepared
#[derive(Debug, Clone, PartialEq)]
pub struct BulletRecipe {
    pub uid: RecipeId,
    pub material: MaterialOptions,
    pub pattern: PatternOptions,
    pub end_timing: EndTimingOptions,
    pub mesh: MeshOptions,
    pub behaviour: BehaviourOptions,
    pub sound: SoundOptions,
    /// Seconds; infinite groups never expire
    pub lifespan: f32,
}

// ============================================================================
// AUTHORED SPEC
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MaterialSpec {
    pub material: Option<Deferred<String>>,
    pub color: Option<Deferred<[f32; 3]>>,
    pub double_sided: Option<Deferred<bool>>,
    pub has_alpha: Option<Deferred<bool>>,
    pub alpha: Option<Deferred<f32>>,
    pub glow: Option<Deferred<bool>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PatternSpec {
    pub pattern: Option<Deferred<String>>,
    pub num: Option<Deferred<usize>>,
    pub speed: Option<Deferred<f32>>,
    pub radius: Option<Deferred<f32>>,
    pub disable_precomputation: Option<Deferred<bool>>,
    pub repeat: Option<Deferred<Repeat>>,
    pub offset: Option<Deferred<RandVector>>,
    pub speeds: Option<Deferred<Vec<f32>>>,
    pub theta_start: Option<Deferred<f32>>,
    pub theta_length: Option<Deferred<f32>>,
    pub y_start: Option<Deferred<f32>>,
    pub y_length: Option<Deferred<f32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndTimingSpec {
    pub timing: Option<Deferred<String>>,
    pub time: Option<Deferred<f32>>,
    pub times: Option<Deferred<Vec<f32>>>,
    pub disable_precomputation: Option<Deferred<bool>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshSpec {
    pub mesh: Option<Deferred<String>>,
    pub radius: Option<Deferred<f32>>,
    pub laser_length: Option<Deferred<f32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BehaviourSpec {
    pub behaviour: Option<Deferred<String>>,
    pub side: Option<Deferred<Side>>,
    pub bullet_value: Option<Deferred<f32>>,
    pub bullet_type: Option<Deferred<BulletCategory>>,
    pub translation_from_parent: Option<Deferred<bool>>,
    pub rotation_from_parent: Option<Deferred<bool>>,
    pub disable_warning: Option<Deferred<bool>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SoundSpec {
    pub mute: Option<Deferred<bool>>,
    pub sound: Option<Deferred<String>>,
}

/// Partial recipe as authored
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecipeSpec {
    /// Explicit cache key; recipes sharing one reuse each other's grids
    pub uid: Option<String>,
    pub material_options: MaterialSpec,
    pub pattern_options: PatternSpec,
    pub end_timing_options: EndTimingSpec,
    pub mesh_options: MeshSpec,
    pub behaviour_options: BehaviourSpec,
    pub sound_options: SoundSpec,
    pub lifespan: Option<Deferred<f32>>,
}

impl RecipeSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BulletError::config(format!("invalid recipe: {e}")))
    }
}

pub const DEFAULT_LIFESPAN: f32 = 10.0;

/// Merge over defaults, resolve every deferred field for `difficulty` and
/// assign one identity to all sub-options. `fallback_uid` is used when the
/// recipe carries none.
pub fn prepare_bullet_instruction(
    recipe: &Deferred<RecipeSpec>,
    difficulty: Difficulty,
    fallback_uid: RecipeId,
) -> Result<BulletRecipe> {
    let spec = recipe.resolve(difficulty);
    let d = difficulty;
    let uid = spec.uid.clone().map(RecipeId).unwrap_or(fallback_uid);

    let m = &spec.material_options;
    let material = MaterialOptions {
        uid: uid.clone(),
        material: MaterialKind::from_name(&pick(&m.material, d, "fresnel".into()))?,
        color: pick(&m.color, d, [1.0, 0.0, 0.0]),
        double_sided: pick(&m.double_sided, d, false),
        has_alpha: pick(&m.has_alpha, d, false),
        alpha: pick_opt(&m.alpha, d),
        glow: pick(&m.glow, d, false),
    };

    let p = &spec.pattern_options;
    let pattern = PatternOptions {
        uid: uid.clone(),
        pattern: PatternKind::from_name(&pick(&p.pattern, d, "burst".into()))?,
        num: pick(&p.num, d, 100),
        speed: pick(&p.speed, d, 1.0),
        radius: pick(&p.radius, d, 1.0),
        disable_precomputation: pick(&p.disable_precomputation, d, false),
        repeat: pick_opt(&p.repeat, d),
        offset: pick_opt(&p.offset, d),
        speeds: pick_opt(&p.speeds, d),
        theta_start: pick(&p.theta_start, d, 0.0),
        theta_length: pick(&p.theta_length, d, PI * 2.0),
        y_start: pick(&p.y_start, d, 1.0),
        y_length: pick(&p.y_length, d, 2.0),
    };

    let e = &spec.end_timing_options;
    let end_timing = EndTimingOptions {
        uid: uid.clone(),
        timing: EndTimingPolicy::from_name(&pick(&e.timing, d, "lifespan".into()))?,
        time: pick_opt(&e.time, d),
        times: pick_opt(&e.times, d),
        disable_precomputation: pick(&e.disable_precomputation, d, false),
    };

    let me = &spec.mesh_options;
    let mesh = MeshOptions {
        uid: uid.clone(),
        mesh: MeshKind::from_name(&pick(&me.mesh, d, "sphere".into()))?,
        radius: pick(&me.radius, d, 1.0),
        laser_length: pick_opt(&me.laser_length, d),
    };

    let b = &spec.behaviour_options;
    let behaviour = BehaviourOptions {
        uid: uid.clone(),
        behaviour: MotionKind::from_name(&pick(&b.behaviour, d, "linear".into()))?,
        side: pick(&b.side, d, Side::Enemy),
        bullet_value: pick(&b.bullet_value, d, 1.0),
        bullet_type: pick(&b.bullet_type, d, BulletCategory::Bullet),
        translation_from_parent: pick(&b.translation_from_parent, d, true),
        rotation_from_parent: pick(&b.rotation_from_parent, d, false),
        disable_warning: pick(&b.disable_warning, d, false),
    };

    let s = &spec.sound_options;
    let sound = SoundOptions {
        uid: uid.clone(),
        mute: pick(&s.mute, d, false),
        sound: SoundEffect::from_name(&pick(&s.sound, d, "enemyShoot".into()))?,
    };

    let lifespan = match pick_opt(&spec.lifespan, d) {
        Some(l) if l.is_nan() || l < 0.0 => {
            return Err(BulletError::config(format!("lifespan must be positive, got {l}")));
        }
        Some(l) if l > 0.0 => l,
        _ => DEFAULT_LIFESPAN,
    };

    Ok(BulletRecipe {
        uid,
        material,
        pattern,
        end_timing,
        mesh,
        behaviour,
        sound,
        lifespan,
    })
}
