//! Run configuration

use crate::adapter::AdapterSpec;
use crate::budget::BudgetConfig;
use crate::checkpoint::CheckpointConfig;
use crate::gate::GateConfig;
use crate::objective::{MethodPreset, ObjectiveKind};
use crate::optimizer::OptimizerConfig;
use crate::prior::PriorConfig;
use crate::scheduler::{LearningRateSchedule, RampSchedule};
use crate::scorer::ScorerConfig;
use crate::stopping::StoppingConfig;
use crate::views::BoundaryView;
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// How adapters are placed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdapterPlacement {
    /// Use this exact spec
    Explicit { spec: AdapterSpec },
    /// Search for a spec matching a parameter budget
    Budget { search: BudgetConfig },
}

impl Default for AdapterPlacement {
    fn default() -> Self {
        AdapterPlacement::Budget {
            search: BudgetConfig::default(),
        }
    }
}

/// Step-level numeric guards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericConfig {
    /// Global-norm gradient clip
    pub max_grad_norm: f32,
    /// Gradient norms above this skip the step
    pub explode_threshold: f32,
    /// Consecutive skipped steps before the run aborts
    pub max_consecutive_skips: u32,
}

impl Default for NumericConfig {
    fn default() -> Self {
        Self {
            max_grad_norm: 1.0,
            explode_threshold: 1e4,
            max_consecutive_skips: 3,
        }
    }
}

/// Complete configuration of an adaptation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptConfig {
    pub method: MethodPreset,
    /// Overrides the method's task objective
    pub objective: Option<ObjectiveKind>,
    pub placement: AdapterPlacement,
    /// Alignment weight schedule; its target defaults to the method's
    pub ramp: RampSchedule,
    pub learning_rate: LearningRateSchedule,
    pub optimizer: OptimizerConfig,
    pub gate: GateConfig,
    pub prior: PriorConfig,
    pub scorer: ScorerConfig,
    /// Boundary band width in pixels
    pub band_width: usize,
    /// First channel of the boundary view
    #[serde(default)]
    pub boundary_view: BoundaryView,
    pub max_steps: u64,
    pub numeric: NumericConfig,
    /// Mean-teacher EMA decay
    pub teacher_decay: f32,
    pub stopping: StoppingConfig,
    pub checkpoint: CheckpointConfig,
    /// Emit per-step loss terms every N steps
    pub log_interval: u64,
    /// Seed for adapter initialization
    pub seed: u64,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        Self::for_method(MethodPreset::Symalign)
    }
}

impl AdaptConfig {
    /// Defaults for a method preset
    pub fn for_method(method: MethodPreset) -> Self {
        Self {
            method,
            objective: None,
            placement: AdapterPlacement::default(),
            ramp: RampSchedule {
                target: method.ramp_target(),
                ..RampSchedule::default()
            },
            learning_rate: LearningRateSchedule::default(),
            optimizer: OptimizerConfig::default(),
            gate: GateConfig::default(),
            prior: PriorConfig::default(),
            scorer: ScorerConfig::default(),
            band_width: 2,
            boundary_view: BoundaryView::default(),
            max_steps: 1000,
            numeric: NumericConfig::default(),
            teacher_decay: 0.99,
            stopping: StoppingConfig::default(),
            checkpoint: CheckpointConfig::default(),
            log_interval: 10,
            seed: 0,
        }
    }

    /// Use an explicit adapter spec
    pub fn with_spec(mut self, spec: AdapterSpec) -> Self {
        self.placement = AdapterPlacement::Explicit { spec };
        self
    }

    /// Set the step limit
    pub fn max_steps(mut self, steps: u64) -> Self {
        self.max_steps = steps;
        self
    }

    /// Set checkpointing
    pub fn checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Task objective in effect
    pub fn objective_kind(&self) -> ObjectiveKind {
        self.objective.unwrap_or_else(|| self.method.objective())
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.ramp.validate()?;
        self.learning_rate.validate()?;
        self.optimizer.validate()?;
        self.gate.validate()?;
        self.prior.validate()?;
        self.scorer.validate()?;
        self.stopping.validate()?;
        if let AdapterPlacement::Budget { search } = &self.placement {
            search.validate()?;
        }
        if self.band_width == 0 {
            return Err(AdaptError::config("band_width must be >= 1"));
        }
        if self.max_steps == 0 {
            return Err(AdaptError::config("max_steps must be >= 1"));
        }
        if !(0.0..1.0).contains(&self.teacher_decay) {
            return Err(AdaptError::config(format!(
                "teacher_decay {} must be in [0, 1)",
                self.teacher_decay
            )));
        }
        let n = &self.numeric;
        if !(n.max_grad_norm > 0.0) || !(n.explode_threshold >= n.max_grad_norm) {
            return Err(AdaptError::config(
                "max_grad_norm must be positive and below explode_threshold",
            ));
        }
        if n.max_consecutive_skips == 0 {
            return Err(AdaptError::config("max_consecutive_skips must be >= 1"));
        }
        if self.checkpoint.interval > 0 && self.checkpoint.path.is_none() {
            return Err(AdaptError::config("checkpoint interval set without a path"));
        }
        Ok(())
    }

    /// Load from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_validate() {
        for method in ["tent", "mean-teacher", "self-training", "norm-only", "symalign"] {
            let config = AdaptConfig::for_method(method.parse().unwrap());
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_method_drives_objective_and_ramp() {
        let config = AdaptConfig::for_method(MethodPreset::MeanTeacher);
        assert_eq!(config.objective_kind(), ObjectiveKind::Consistency);
        assert_eq!(config.ramp.target, 0.0);

        let overridden = AdaptConfig {
            objective: Some(ObjectiveKind::Entropy),
            ..config
        };
        assert_eq!(overridden.objective_kind(), ObjectiveKind::Entropy);
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AdaptConfig::default().max_steps(42);
        assert_eq!(config.boundary_view, BoundaryView::BandOnly);
        config.boundary_view = BoundaryView::MaskedProbability;
        config.to_json_file(&path).unwrap();
        let loaded = AdaptConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.max_steps, 42);
        assert_eq!(loaded.boundary_view, BoundaryView::MaskedProbability);
        assert_eq!(loaded.method, MethodPreset::Symalign);
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let mut config = AdaptConfig::default();
        config.gate.min_confidence = 2.0;
        assert!(matches!(config.validate(), Err(AdaptError::Configuration(_))));

        let config = AdaptConfig {
            checkpoint: CheckpointConfig {
                interval: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
