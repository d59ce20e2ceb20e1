//! Confidence and degeneracy gate

use crate::views::{boundary_to_area_ratio, component_count, ProbabilityMap};
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};

/// How fragmented a predicted mask may be
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "proxy", rename_all = "snake_case")]
pub enum FragmentationProxy {
    /// 4-connected foreground component count
    ComponentCount { max_components: usize },
    /// Boundary length divided by foreground area
    BoundaryRatio { max_ratio: f32 },
}

/// Gate thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Mean confidence must exceed this
    pub min_confidence: f32,
    /// Foreground fraction must be strictly above this
    pub min_foreground: f32,
    /// Foreground fraction must be strictly below this
    pub max_foreground: f32,
    /// Fragmentation bound
    pub fragmentation: FragmentationProxy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            min_foreground: 0.01,
            max_foreground: 0.95,
            fragmentation: FragmentationProxy::ComponentCount { max_components: 8 },
        }
    }
}

impl GateConfig {
    /// Set confidence threshold
    pub fn min_confidence(mut self, threshold: f32) -> Self {
        self.min_confidence = threshold;
        self
    }

    /// Set foreground bounds
    pub fn foreground(mut self, min: f32, max: f32) -> Self {
        self.min_foreground = min;
        self.max_foreground = max;
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.min_confidence) {
            return Err(AdaptError::config(format!(
                "min_confidence {} must be in [0, 1)",
                self.min_confidence
            )));
        }
        if !(0.0 <= self.min_foreground
            && self.min_foreground < self.max_foreground
            && self.max_foreground <= 1.0)
        {
            return Err(AdaptError::config(format!(
                "foreground bounds ({}, {}) must satisfy 0 <= min < max <= 1",
                self.min_foreground, self.max_foreground
            )));
        }
        if let FragmentationProxy::BoundaryRatio { max_ratio } = self.fragmentation {
            if !(max_ratio > 0.0) {
                return Err(AdaptError::config("boundary ratio bound must be positive"));
            }
        }
        Ok(())
    }
}

/// Why a sample was accepted or rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Accepted,
    LowConfidence,
    DegenerateMask,
    FragmentationOutOfRange,
}

/// Per-sample gate outcome
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub reason: GateReason,
    /// Measured mean confidence
    pub confidence: f32,
    /// Measured foreground fraction (if evaluated)
    pub foreground: Option<f32>,
    /// Measured fragmentation (if evaluated)
    pub fragmentation: Option<f32>,
}

impl GateDecision {
    /// Whether the sample may update the prior and the alignment loss
    pub fn accepted(&self) -> bool {
        self.reason == GateReason::Accepted
    }
}

/// Stateless per-sample gate
#[derive(Debug, Clone)]
pub struct ConfidenceGate {
    config: GateConfig,
}

impl ConfidenceGate {
    /// Create a gate from validated thresholds
    pub fn new(config: GateConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Gate configuration
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Evaluate rules in order; the first failing rule sets the reason
    pub fn evaluate(&self, prediction: &ProbabilityMap) -> GateDecision {
        let confidence = prediction.mean_confidence();
        let mut decision = GateDecision {
            reason: GateReason::Accepted,
            confidence,
            foreground: None,
            fragmentation: None,
        };

        if !(confidence > self.config.min_confidence) {
            decision.reason = GateReason::LowConfidence;
            return decision;
        }

        let foreground = prediction.foreground_fraction();
        decision.foreground = Some(foreground);
        if !(foreground > self.config.min_foreground && foreground < self.config.max_foreground) {
            decision.reason = GateReason::DegenerateMask;
            return decision;
        }

        let mask = prediction.binary();
        let (h, w) = (prediction.height, prediction.width);
        let within = match self.config.fragmentation {
            FragmentationProxy::ComponentCount { max_components } => {
                let count = component_count(&mask, h, w);
                decision.fragmentation = Some(count as f32);
                count <= max_components
            }
            FragmentationProxy::BoundaryRatio { max_ratio } => {
                let ratio = boundary_to_area_ratio(&mask, h, w);
                decision.fragmentation = Some(ratio);
                ratio <= max_ratio
            }
        };
        if !within {
            decision.reason = GateReason::FragmentationOutOfRange;
        }

        decision
    }

    /// Evaluate a batch
    pub fn evaluate_batch(&self, predictions: &[ProbabilityMap]) -> Vec<GateDecision> {
        predictions.iter().map(|p| self.evaluate(p)).collect()
    }
}

/// Fraction of accepted decisions (0 for an empty batch)
pub fn accept_rate(decisions: &[GateDecision]) -> f32 {
    if decisions.is_empty() {
        return 0.0;
    }
    decisions.iter().filter(|d| d.accepted()).count() as f32 / decisions.len() as f32
}
