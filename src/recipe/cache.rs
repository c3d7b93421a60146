//! Memoised recipe artefacts keyed by `RecipeId`

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;

use super::{BulletPattern, BulletRecipe, PatternPositions, RecipeId, make_bullet_pattern, make_end_timings};
use crate::error::Result;
use crate::grid::SourceGrids;

/// Everything a group needs to build its differential system
#[derive(Debug, Clone)]
pub struct ResolvedSources {
    pub pattern: Arc<BulletPattern>,
    pub end_timings: Arc<[f32]>,
    pub grids: Arc<SourceGrids>,
}

#[derive(Debug, Default)]
pub struct RecipeCache {
    patterns: HashMap<RecipeId, Arc<BulletPattern>>,
    end_timings: HashMap<RecipeId, Arc<[f32]>>,
    grids: HashMap<RecipeId, Arc<SourceGrids>>,
}

impl RecipeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pattern(&self, uid: &RecipeId) -> Option<Arc<BulletPattern>> {
        self.patterns.get(uid).cloned()
    }

    pub fn insert_pattern(&mut self, pattern: Arc<BulletPattern>) {
        self.patterns.insert(pattern.uid.clone(), pattern);
    }

    pub fn end_timings(&self, uid: &RecipeId) -> Option<Arc<[f32]>> {
        self.end_timings.get(uid).cloned()
    }

    pub fn insert_end_timings(&mut self, uid: RecipeId, ends: Arc<[f32]>) {
        self.end_timings.insert(uid, ends);
    }

    pub fn grids(&self, uid: &RecipeId) -> Option<Arc<SourceGrids>> {
        self.grids.get(uid).cloned()
    }

    /// Whether any artefact of `uid` is memoised
    pub fn contains(&self, uid: &RecipeId) -> bool {
        self.patterns.contains_key(uid)
            || self.end_timings.contains_key(uid)
            || self.grids.contains_key(uid)
    }

    /// Distinct recipes with at least one memoised artefact
    pub fn len(&self) -> usize {
        self.patterns
            .keys()
            .chain(self.end_timings.keys())
            .chain(self.grids.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.end_timings.is_empty() && self.grids.is_empty()
    }

    /// Drop every artefact for one recipe
    pub fn evict(&mut self, uid: &RecipeId) {
        self.patterns.remove(uid);
        self.end_timings.remove(uid);
        self.grids.remove(uid);
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
        self.end_timings.clear();
        self.grids.clear();
    }

    /// Pattern, end timings and source grids for `recipe`, cached or fresh.
    /// `first_compute` silences the not-precomputed warning.
    pub fn resolve(
        &mut self,
        recipe: &BulletRecipe,
        rng: &mut impl Rng,
        first_compute: bool,
    ) -> Result<ResolvedSources> {
        let pattern = make_bullet_pattern(&recipe.pattern, self, rng, first_compute)?;
        let end_timings = make_end_timings(&recipe.end_timing, pattern.len(), recipe.lifespan, self)?;

        let grids = match self.grids(&recipe.uid) {
            Some(grids) => grids,
            None => {
                let grids = Arc::new(build_grids(&pattern, &end_timings));
                let memoise = !recipe.pattern.disable_precomputation
                    && !recipe.end_timing.disable_precomputation;
                if memoise {
                    self.grids.insert(recipe.uid.clone(), Arc::clone(&grids));
                }
                grids
            }
        };

        Ok(ResolvedSources {
            pattern,
            end_timings,
            grids,
        })
    }

    /// Build and memoise a recipe ahead of its first use
    pub fn precompute(&mut self, recipe: &BulletRecipe, rng: &mut impl Rng) -> Result<()> {
        let resolved = self.resolve(recipe, rng, true)?;
        log::debug!(
            "Precomputed recipe {}: {} bullets, grid width {}",
            recipe.uid,
            resolved.pattern.len(),
            resolved.grids.width()
        );
        Ok(())
    }
}

fn build_grids(pattern: &BulletPattern, end_timings: &[f32]) -> SourceGrids {
    match &pattern.positions {
        PatternPositions::Points(points) => {
            SourceGrids::from_vectors(points, &pattern.velocities, &pattern.timings, end_timings)
        }
        PatternPositions::Grid(grid) => SourceGrids::with_initial_positions(
            grid.clone(),
            &pattern.velocities,
            &pattern.timings,
            end_timings,
        ),
    }
}
