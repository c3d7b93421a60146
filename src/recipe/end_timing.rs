//! Per-entity end times

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{EndTimingOptions, RecipeCache};
use crate::consts::*;
use crate::error::{BulletError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndTimingPolicy {
    /// Everything ends with the group
    Lifespan,
    /// Consecutive equal-sized batches end at successive `times`
    Batch,
    /// One shared `time`
    Uniform,
}

impl EndTimingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndTimingPolicy::Lifespan => "lifespan",
            EndTimingPolicy::Batch => "batch",
            EndTimingPolicy::Uniform => "uniform",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "lifespan" => Ok(EndTimingPolicy::Lifespan),
            "batch" => Ok(EndTimingPolicy::Batch),
            "uniform" => Ok(EndTimingPolicy::Uniform),
            _ => Err(BulletError::unsupported("end timing", name)),
        }
    }
}

fn compute(options: &EndTimingOptions, n: usize, lifespan: f32) -> Result<Vec<f32>> {
    match options.timing {
        EndTimingPolicy::Lifespan => {
            let end = if lifespan.is_finite() {
                lifespan
            } else {
                INFINITE_END_TIME
            };
            Ok(vec![end; n])
        }
        EndTimingPolicy::Batch => {
            let times = options
                .times
                .as_deref()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| BulletError::config("times must be set when end timing is batch"))?;
            let per_batch = n / times.len();
            let mut ends: Vec<f32> = times
                .iter()
                .flat_map(|&t| std::iter::repeat_n(t, per_batch))
                .collect();
            // uneven split: the remainder ends with the last batch
            if let Some(&last) = times.last() {
                ends.resize(n, last);
            }
            Ok(ends)
        }
        EndTimingPolicy::Uniform => {
            let time = options
                .time
                .ok_or_else(|| BulletError::config("time must be set when end timing is uniform"))?;
            Ok(vec![time; n])
        }
    }
}

/// End times for `n` entities, memoised by recipe id
pub fn make_end_timings(
    options: &EndTimingOptions,
    n: usize,
    lifespan: f32,
    cache: &mut RecipeCache,
) -> Result<Arc<[f32]>> {
    if let Some(ends) = cache.end_timings(&options.uid) {
        return Ok(ends);
    }

    let ends: Arc<[f32]> = compute(options, n, lifespan)?.into();
    if !options.disable_precomputation {
        cache.insert_end_timings(options.uid.clone(), Arc::clone(&ends));
    }
    Ok(ends)
}
