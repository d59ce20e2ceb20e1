//! Step-indexed schedules for the learning rate and the alignment weight
//!
//! Both schedules are pure functions of the step counter, so a resumed run
//! reproduces the exact values of an uninterrupted one.

use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Shape of the post-warmup phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    /// Constant learning rate
    #[default]
    Constant,
    /// Linear decay
    Linear,
    /// Cosine annealing
    Cosine,
}

/// Learning rate schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRateSchedule {
    /// Peak learning rate
    pub initial_lr: f32,
    /// Final learning rate
    pub final_lr: f32,
    /// Warmup steps (linear from 0 to `initial_lr`)
    pub warmup_steps: u64,
    /// Steps over which the decay runs
    pub total_steps: u64,
    /// Scheduler type
    pub scheduler_type: SchedulerType,
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        Self {
            initial_lr: 1e-3,
            final_lr: 1e-5,
            warmup_steps: 0,
            total_steps: 1000,
            scheduler_type: SchedulerType::Constant,
        }
    }
}

impl LearningRateSchedule {
    /// Constant rate without warmup
    pub fn constant(lr: f32) -> Self {
        Self {
            initial_lr: lr,
            final_lr: lr,
            ..Default::default()
        }
    }

    /// Set warmup steps
    pub fn warmup(mut self, steps: u64) -> Self {
        self.warmup_steps = steps;
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.initial_lr > 0.0) || !(self.final_lr >= 0.0) {
            return Err(AdaptError::config("learning rates must be positive"));
        }
        Ok(())
    }

    /// Learning rate used for the update at `step`
    pub fn lr_at(&self, step: u64) -> f32 {
        if step < self.warmup_steps {
            // First update uses a non-zero rate
            return self.initial_lr * (step + 1) as f32 / self.warmup_steps as f32;
        }

        let post_warmup_step = step - self.warmup_steps;
        let post_warmup_total = self.total_steps.saturating_sub(self.warmup_steps);
        if post_warmup_total == 0 {
            return self.initial_lr;
        }
        let progress = (post_warmup_step as f32 / post_warmup_total as f32).min(1.0);

        match self.scheduler_type {
            SchedulerType::Constant => self.initial_lr,
            SchedulerType::Linear => self.initial_lr + (self.final_lr - self.initial_lr) * progress,
            SchedulerType::Cosine => {
                let cosine_decay = 0.5 * (1.0 + (PI * progress).cos());
                self.final_lr + (self.initial_lr - self.final_lr) * cosine_decay
            }
        }
    }
}

/// Warmup curve of the alignment weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampShape {
    #[default]
    Linear,
    Cosine,
}

/// Alignment weight `lambda_sym(step)`: 0 at step 0, `target` from `warmup_steps` on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampSchedule {
    pub target: f32,
    pub warmup_steps: u64,
    pub shape: RampShape,
}

impl Default for RampSchedule {
    fn default() -> Self {
        Self {
            target: 0.1,
            warmup_steps: 50,
            shape: RampShape::Linear,
        }
    }
}

impl RampSchedule {
    /// Create a ramp
    pub fn new(target: f32, warmup_steps: u64) -> Self {
        Self {
            target,
            warmup_steps,
            shape: RampShape::Linear,
        }
    }

    /// Set ramp shape
    pub fn shape(mut self, shape: RampShape) -> Self {
        self.shape = shape;
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.target >= 0.0 && self.target.is_finite()) {
            return Err(AdaptError::config(format!(
                "ramp target {} must be non-negative",
                self.target
            )));
        }
        Ok(())
    }

    /// Weight at `step`; monotonically non-decreasing
    pub fn value_at(&self, step: u64) -> f32 {
        if step >= self.warmup_steps {
            return self.target;
        }
        let progress = step as f32 / self.warmup_steps as f32;
        let shaped = match self.shape {
            RampShape::Linear => progress,
            RampShape::Cosine => 0.5 * (1.0 - (PI * progress).cos()),
        };
        self.target * shaped
    }
}
