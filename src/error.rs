//! Error taxonomy for group creation, simulation stepping and readback

use thiserror::Error;

/// Everything that can go wrong inside the simulation core
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BulletError {
    /// A field required by the chosen policy or variant is missing
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation invoked out of lifecycle order
    #[error("state error: {0}")]
    State(String),

    /// Unregistered pattern/material/mesh/behaviour/sound name
    #[error("unsupported {kind}: {name}")]
    UnsupportedVariant { kind: &'static str, name: String },

    /// Entity count exceeds the fixed per-group instance maximum
    #[error("capacity exceeded: {requested} bullets requested, group maximum is {max}")]
    Capacity { requested: usize, max: usize },

    /// A readback fence reported failure
    #[error("readback failed: {0}")]
    Readback(String),

    /// Device or dispatch failure reported by a compute backend
    #[error("compute backend error: {0}")]
    Backend(String),
}

impl BulletError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn unsupported(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnsupportedVariant {
            kind,
            name: name.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BulletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BulletError::unsupported("pattern", "spiral");
        assert_eq!(err.to_string(), "unsupported pattern: spiral");

        let err = BulletError::Capacity {
            requested: 200_000,
            max: 100_000,
        };
        assert!(err.to_string().contains("200000"));
    }
}
