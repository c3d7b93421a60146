//! Material and mesh registries
//!
//! Rendering lives outside this crate; these produce the render-facing
//! parameters a host needs to draw a group, plus the grid bindings each step
//! republishes.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::{MaterialOptions, MeshOptions};
use crate::compute::GridId;
use crate::consts::*;
use crate::error::{BulletError, Result};
use crate::sim::StepOutput;

/// Registered bullet materials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialKind {
    Fresnel,
    Laser,
}

impl MaterialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialKind::Fresnel => "fresnel",
            MaterialKind::Laser => "laser",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "fresnel" => Ok(MaterialKind::Fresnel),
            "laser" => Ok(MaterialKind::Laser),
            _ => Err(BulletError::unsupported("material", name)),
        }
    }
}

/// Registered bullet meshes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshKind {
    Sphere,
    Laser,
}

impl MeshKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshKind::Sphere => "sphere",
            MeshKind::Laser => "laser",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sphere" => Ok(MeshKind::Sphere),
            "laser" => Ok(MeshKind::Laser),
            _ => Err(BulletError::unsupported("mesh", name)),
        }
    }
}

/// Grids and clock the material samples each frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MaterialBindings {
    pub position: Option<GridId>,
    pub velocity: Option<GridId>,
    pub collision: Option<GridId>,
    pub time_since_start: f32,
    pub disable_warning: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulletMaterial {
    pub kind: MaterialKind,
    pub color: Vec3,
    pub alpha: f32,
    pub back_face_culling: bool,
    pub glow: bool,
    pub bindings: MaterialBindings,
}

impl BulletMaterial {
    pub fn publish(&mut self, step: &StepOutput, time_since_start: f32, disable_warning: bool) {
        self.bindings = MaterialBindings {
            position: Some(step.position),
            velocity: Some(step.velocity),
            collision: Some(step.collision),
            time_since_start,
            disable_warning,
        };
    }
}

pub fn make_bullet_material(options: &MaterialOptions) -> BulletMaterial {
    let alpha = match options.alpha {
        Some(alpha) if alpha != 0.0 => alpha,
        _ if options.has_alpha => 0.2,
        _ => 1.0,
    };
    BulletMaterial {
        kind: options.material,
        color: Vec3::from_array(options.color),
        alpha,
        back_face_culling: !options.double_sided,
        glow: options.glow,
        bindings: MaterialBindings::default(),
    }
}

/// Instanced mesh description for one group
#[derive(Debug, Clone, PartialEq)]
pub struct BulletMesh {
    pub kind: MeshKind,
    pub radius: f32,
    pub laser_length: Option<f32>,
    pub instances: usize,
}

pub fn make_bullet_mesh(options: &MeshOptions, instances: usize) -> Result<BulletMesh> {
    if instances > MAX_BULLETS_PER_GROUP {
        return Err(BulletError::Capacity {
            requested: instances,
            max: MAX_BULLETS_PER_GROUP,
        });
    }
    if options.mesh == MeshKind::Laser && options.laser_length.is_none() {
        return Err(BulletError::config("laser mesh requires laserLength"));
    }
    Ok(BulletMesh {
        kind: options.mesh,
        radius: options.radius,
        laser_length: options.laser_length,
        instances,
    })
}
