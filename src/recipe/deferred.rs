//! Value-or-function-of-difficulty recipe fields

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};

use crate::settings::Difficulty;

/// A recipe field that is either fixed or computed from the difficulty.
/// Resolved once when the recipe is prepared.
pub enum Deferred<T> {
    Literal(T),
    ByDifficulty(Arc<dyn Fn(Difficulty) -> T + Send + Sync>),
}

impl<T> Deferred<T> {
    pub fn by_difficulty(f: impl Fn(Difficulty) -> T + Send + Sync + 'static) -> Self {
        Deferred::ByDifficulty(Arc::new(f))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Deferred::Literal(_))
    }
}

impl<T: Clone> Deferred<T> {
    pub fn resolve(&self, difficulty: Difficulty) -> T {
        match self {
            Deferred::Literal(value) => value.clone(),
            Deferred::ByDifficulty(f) => f(difficulty),
        }
    }
}

impl<T> From<T> for Deferred<T> {
    fn from(value: T) -> Self {
        Deferred::Literal(value)
    }
}

impl<T: Clone> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        match self {
            Deferred::Literal(value) => Deferred::Literal(value.clone()),
            Deferred::ByDifficulty(f) => Deferred::ByDifficulty(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Deferred::ByDifficulty(_) => f.write_str("ByDifficulty(..)"),
        }
    }
}

/// Serialized recipes can only carry literals
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Deferred<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Deferred::Literal)
    }
}

/// Resolve an optional field, falling back to `default`
pub(crate) fn pick<T: Clone>(field: &Option<Deferred<T>>, difficulty: Difficulty, default: T) -> T {
    field.as_ref().map_or(default, |f| f.resolve(difficulty))
}

pub(crate) fn pick_opt<T: Clone>(field: &Option<Deferred<T>>, difficulty: Difficulty) -> Option<T> {
    field.as_ref().map(|f| f.resolve(difficulty))
}
