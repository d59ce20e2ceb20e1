//! Error types for test-time adaptation

use std::path::PathBuf;
use thiserror::Error;

/// Adaptation errors
#[derive(Debug, Error)]
pub enum AdaptError {
    /// Invalid or unsatisfiable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No adapter configuration fits the requested parameter budget
    #[error(
        "Budget unreachable: target {target:.0} trainable params, band [{lower:.0}, {upper:.0}], closest candidate {closest:?}"
    )]
    BudgetUnreachable {
        target: f64,
        lower: f64,
        upper: f64,
        closest: Option<usize>,
    },

    /// A data handle can resolve a forbidden partition
    #[error("Data isolation violation: {path:?} overlaps forbidden partition {root:?}")]
    DataIsolationViolation { path: PathBuf, root: PathBuf },

    /// NaN/inf in loss, descriptors or gradients, or exploding gradients
    #[error("Numeric instability: {0}")]
    NumericInstability(String),

    /// Checkpoint could not be parsed or does not match the run
    #[error("Checkpoint corruption: {0}")]
    CheckpointCorruption(String),

    /// Adapter error
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Shape mismatch
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Sample source error
    #[error("Source error: {0}")]
    Source(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdaptError {
    /// Fatal errors abort the run; everything else is handled per step.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AdaptError::NumericInstability(_))
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        AdaptError::Configuration(msg.into())
    }

    pub(crate) fn numeric(msg: impl Into<String>) -> Self {
        AdaptError::NumericInstability(msg.into())
    }
}

/// Result type for adaptation operations
pub type Result<T> = std::result::Result<T, AdaptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AdaptError::BudgetUnreachable {
            target: 1000.0,
            lower: 900.0,
            upper: 1100.0,
            closest: Some(1536),
        };
        let msg = err.to_string();
        assert!(msg.contains("900"));
        assert!(msg.contains("1536"));
    }

    #[test]
    fn test_only_numeric_is_recoverable() {
        assert!(!AdaptError::numeric("nan loss").is_fatal());
        assert!(AdaptError::config("bad").is_fatal());
        assert!(AdaptError::DataIsolationViolation {
            path: "/data/train".into(),
            root: "/data".into(),
        }
        .is_fatal());
    }
}
