//! Parallel-reduction chain over a collision grid
//!
//! Stage k reads a grid of width R and writes one of width R/2, each cell the
//! sum of a 2x2 block. Stages run until width 1, so the last grid holds the
//! sum of every source cell.

use crate::compute::{ComputeBackend, GridId};
use crate::error::{BulletError, Result};

pub struct ReductionChain {
    stages: Vec<GridId>,
}

impl ReductionChain {
    /// Allocate intermediates for a source grid of `width` (a power of two >= 2)
    pub fn new(backend: &mut dyn ComputeBackend, width: u32) -> Result<Self> {
        if width < 2 || !width.is_power_of_two() {
            return Err(BulletError::config(format!(
                "reduction source width must be a power of two >= 2, got {width}"
            )));
        }

        let mut stages = Vec::new();
        let mut w = width / 2;
        while w >= 1 {
            match backend.allocate(w, [0.0; 4]) {
                Ok(stage) => stages.push(stage),
                Err(err) => {
                    Self { stages }.release(backend);
                    return Err(err);
                }
            }
            if w == 1 {
                break;
            }
            w /= 2;
        }
        Ok(Self { stages })
    }

    pub fn depth(&self) -> usize {
        self.stages.len()
    }

    /// Width-1 output grid
    pub fn output(&self) -> Option<GridId> {
        self.stages.last().copied()
    }

    /// Run every stage starting from `source`
    pub fn run(&self, backend: &mut dyn ComputeBackend, source: GridId) -> Result<GridId> {
        let mut current = source;
        for &stage in &self.stages {
            backend.reduce(current, stage)?;
            current = stage;
        }
        Ok(current)
    }

    pub fn release(self, backend: &mut dyn ComputeBackend) {
        for stage in self.stages {
            backend.release(stage);
        }
    }
}
