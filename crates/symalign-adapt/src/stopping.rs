//! Unsupervised stopping rules

use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Signal watched by the plateau rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateauSignal {
    #[default]
    TotalLoss,
    TaskLoss,
    MeanEntropy,
}

/// Half-window mean change below `min_delta`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateauRule {
    pub window: usize,
    pub min_delta: f32,
    pub signal: PlateauSignal,
}

/// Global prior mean moves less than `threshold` for `patience` updating steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorStabilityRule {
    pub threshold: f32,
    pub patience: u32,
}

/// Gate accept rate at least `floor` for `patience` steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRateRule {
    pub floor: f32,
    pub patience: u32,
}

/// Stopping configuration; every rule is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoppingConfig {
    /// No rule fires before this many steps
    pub min_steps: u64,
    pub plateau: Option<PlateauRule>,
    pub prior_stability: Option<PriorStabilityRule>,
    pub accept_rate: Option<AcceptRateRule>,
}

impl StoppingConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if let Some(rule) = &self.plateau {
            if rule.window < 2 || rule.window % 2 != 0 || !(rule.min_delta >= 0.0) {
                return Err(AdaptError::config(
                    "plateau window must be even and >= 2, min_delta non-negative",
                ));
            }
        }
        if let Some(rule) = &self.prior_stability {
            if rule.patience == 0 || !(rule.threshold >= 0.0) {
                return Err(AdaptError::config("prior stability needs patience >= 1"));
            }
        }
        if let Some(rule) = &self.accept_rate {
            if rule.patience == 0 || !(0.0..=1.0).contains(&rule.floor) {
                return Err(AdaptError::config("accept-rate floor must be in [0, 1], patience >= 1"));
            }
        }
        Ok(())
    }
}

/// Rule that ended the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopRule {
    LossPlateau,
    PriorStable,
    AcceptRateStable,
}

impl fmt::Display for StopRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopRule::LossPlateau => "loss plateau",
            StopRule::PriorStable => "prior stable",
            StopRule::AcceptRateStable => "accept rate stable",
        };
        f.write_str(name)
    }
}

/// What one committed step reports to the monitors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepObservation {
    /// Steps committed so far, including this one
    pub step: u64,
    pub total_loss: f32,
    pub task_loss: f32,
    pub mean_entropy: f32,
    /// Global mean shift, `None` when no sample updated the prior
    pub prior_shift: Option<f32>,
    pub accept_rate: f32,
}

/// Monitor state; persisted in checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoppingMonitor {
    history: VecDeque<f32>,
    stable_prior_steps: u32,
    accept_streak: u32,
}

impl StoppingMonitor {
    /// Fresh monitors
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed step and report the first rule that fires
    pub fn observe(&mut self, config: &StoppingConfig, obs: &StepObservation) -> Option<StopRule> {
        let mut fired = None;

        if let Some(rule) = &config.plateau {
            let value = match rule.signal {
                PlateauSignal::TotalLoss => obs.total_loss,
                PlateauSignal::TaskLoss => obs.task_loss,
                PlateauSignal::MeanEntropy => obs.mean_entropy,
            };
            self.history.push_back(value);
            while self.history.len() > rule.window {
                self.history.pop_front();
            }
            if self.history.len() == rule.window {
                let half = rule.window / 2;
                let older: f32 = self.history.iter().take(half).sum::<f32>() / half as f32;
                let newer: f32 = self.history.iter().skip(half).sum::<f32>() / half as f32;
                if (older - newer).abs() < rule.min_delta {
                    fired = fired.or(Some(StopRule::LossPlateau));
                }
            }
        }

        if let Some(rule) = &config.prior_stability {
            if let Some(shift) = obs.prior_shift {
                if shift < rule.threshold {
                    self.stable_prior_steps += 1;
                } else {
                    self.stable_prior_steps = 0;
                }
            }
            if self.stable_prior_steps >= rule.patience {
                fired = fired.or(Some(StopRule::PriorStable));
            }
        }

        if let Some(rule) = &config.accept_rate {
            if obs.accept_rate >= rule.floor {
                self.accept_streak += 1;
            } else {
                self.accept_streak = 0;
            }
            if self.accept_streak >= rule.patience {
                fired = fired.or(Some(StopRule::AcceptRateStable));
            }
        }

        if obs.step < config.min_steps {
            return None;
        }
        fired
    }
}
