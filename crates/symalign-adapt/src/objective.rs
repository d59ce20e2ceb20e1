//! Unsupervised task objectives and method presets

use crate::adapter::AdapterKind;
use crate::views::ProbabilityMap;
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const EPS: f32 = 1e-6;

/// Task objective
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectiveKind {
    /// Mean per-pixel binary entropy
    Entropy,
    /// Mean squared difference to the mean-teacher prediction
    Consistency,
    /// Cross-entropy against confident teacher pseudo-labels
    SelfTraining { threshold: f32 },
    /// Adapters trained by the alignment term alone
    NormOnly,
}

/// Loss and per-pixel gradient of one prediction
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLoss {
    pub loss: f32,
    pub grad: Vec<f32>,
}

/// Objective resolved from an [`ObjectiveKind`]
#[derive(Debug, Clone)]
pub struct Objective {
    kind: ObjectiveKind,
}

impl Objective {
    /// Create an objective, checking its parameters
    pub fn new(kind: ObjectiveKind) -> Result<Self> {
        if let ObjectiveKind::SelfTraining { threshold } = kind {
            if !(0.5..1.0).contains(&threshold) {
                return Err(AdaptError::config(format!(
                    "self-training threshold {} must be in [0.5, 1)",
                    threshold
                )));
            }
        }
        Ok(Self { kind })
    }

    /// Objective kind
    pub fn kind(&self) -> ObjectiveKind {
        self.kind
    }

    /// Whether only gate-accepted samples contribute to the task loss
    pub fn requires_gating(&self) -> bool {
        matches!(self.kind, ObjectiveKind::SelfTraining { .. })
    }

    /// Whether a mean-teacher prediction is needed
    pub fn needs_teacher(&self) -> bool {
        matches!(
            self.kind,
            ObjectiveKind::Consistency | ObjectiveKind::SelfTraining { .. }
        )
    }

    /// Loss of one prediction and its gradient w.r.t. the probabilities
    pub fn compute(&self, prediction: &ProbabilityMap, teacher: Option<&ProbabilityMap>) -> Result<TaskLoss> {
        let p = &prediction.data;
        let n = p.len() as f32;

        let teacher = match (self.needs_teacher(), teacher) {
            (true, Some(t)) => {
                if t.data.len() != p.len() {
                    return Err(AdaptError::ShapeMismatch {
                        expected: vec![prediction.height, prediction.width],
                        got: vec![t.height, t.width],
                    });
                }
                Some(&t.data)
            }
            (true, None) => {
                return Err(AdaptError::config("objective requires a teacher prediction"));
            }
            (false, _) => None,
        };

        let result = match (self.kind, teacher) {
            (ObjectiveKind::Entropy, _) => {
                let mut loss = 0.0;
                let grad = p
                    .iter()
                    .map(|&pi| {
                        let q = pi.clamp(EPS, 1.0 - EPS);
                        loss -= q * q.ln() + (1.0 - q) * (1.0 - q).ln();
                        ((1.0 - q) / q).ln() / n
                    })
                    .collect();
                TaskLoss { loss: loss / n, grad }
            }
            (ObjectiveKind::Consistency, Some(t)) => {
                let mut loss = 0.0;
                let grad = p
                    .iter()
                    .zip(t)
                    .map(|(pi, ti)| {
                        let d = pi - ti;
                        loss += d * d;
                        2.0 * d / n
                    })
                    .collect();
                TaskLoss { loss: loss / n, grad }
            }
            (ObjectiveKind::SelfTraining { threshold }, Some(t)) => {
                let confident = t.iter().filter(|ti| ti.max(1.0 - **ti) >= threshold).count();
                if confident == 0 {
                    TaskLoss {
                        loss: 0.0,
                        grad: vec![0.0; p.len()],
                    }
                } else {
                    let m = confident as f32;
                    let mut loss = 0.0;
                    let grad = p
                        .iter()
                        .zip(t)
                        .map(|(&pi, &ti)| {
                            if ti.max(1.0 - ti) < threshold {
                                return 0.0;
                            }
                            let y = if ti > 0.5 { 1.0 } else { 0.0 };
                            let q = pi.clamp(EPS, 1.0 - EPS);
                            loss -= y * q.ln() + (1.0 - y) * (1.0 - q).ln();
                            (q - y) / (q * (1.0 - q)) / m
                        })
                        .collect();
                    TaskLoss { loss: loss / m, grad }
                }
            }
            _ => TaskLoss {
                loss: 0.0,
                grad: vec![0.0; p.len()],
            },
        };
        Ok(result)
    }
}

/// Named adaptation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodPreset {
    Tent,
    MeanTeacher,
    SelfTraining,
    NormOnly,
    Symalign,
}

impl MethodPreset {
    /// Task objective of the method
    pub fn objective(&self) -> ObjectiveKind {
        match self {
            MethodPreset::Tent | MethodPreset::Symalign => ObjectiveKind::Entropy,
            MethodPreset::MeanTeacher => ObjectiveKind::Consistency,
            MethodPreset::SelfTraining => ObjectiveKind::SelfTraining { threshold: 0.9 },
            MethodPreset::NormOnly => ObjectiveKind::NormOnly,
        }
    }

    /// Adapter family used when no explicit spec is configured
    pub fn default_adapter(&self) -> AdapterKind {
        match self {
            MethodPreset::Tent | MethodPreset::NormOnly => AdapterKind::AffineOnly,
            _ => AdapterKind::LowRank { rank: 4, alpha: 4.0 },
        }
    }

    /// Target alignment weight; only `symalign` aligns to the prior
    pub fn ramp_target(&self) -> f32 {
        match self {
            MethodPreset::Symalign => 0.1,
            _ => 0.0,
        }
    }

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            MethodPreset::Tent => "tent",
            MethodPreset::MeanTeacher => "mean-teacher",
            MethodPreset::SelfTraining => "self-training",
            MethodPreset::NormOnly => "norm-only",
            MethodPreset::Symalign => "symalign",
        }
    }
}

impl fmt::Display for MethodPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MethodPreset {
    type Err = AdaptError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "tent" => Ok(MethodPreset::Tent),
            "mean-teacher" => Ok(MethodPreset::MeanTeacher),
            "self-training" => Ok(MethodPreset::SelfTraining),
            "norm-only" => Ok(MethodPreset::NormOnly),
            "symalign" => Ok(MethodPreset::Symalign),
            other => Err(AdaptError::config(format!("unknown method '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(values: &[f32]) -> ProbabilityMap {
        ProbabilityMap::new(1, values.len(), values.to_vec()).unwrap()
    }

    fn check_grad(objective: &Objective, p: &[f32], teacher: Option<&ProbabilityMap>) {
        let base = objective.compute(&map(p), teacher).unwrap();
        for i in 0..p.len() {
            let mut bumped = p.to_vec();
            bumped[i] += 1e-3;
            let up = objective.compute(&map(&bumped), teacher).unwrap().loss;
            let fd = (up - base.loss) / 1e-3;
            assert!((fd - base.grad[i]).abs() < 1e-2, "pixel {}: {} vs {}", i, fd, base.grad[i]);
        }
    }

    #[test]
    fn test_entropy() {
        let objective = Objective::new(ObjectiveKind::Entropy).unwrap();
        let uncertain = objective.compute(&map(&[0.5, 0.5]), None).unwrap();
        let confident = objective.compute(&map(&[0.99, 0.01]), None).unwrap();
        assert!((uncertain.loss - std::f32::consts::LN_2).abs() < 1e-5);
        assert!(confident.loss < uncertain.loss);
        check_grad(&objective, &[0.3, 0.8, 0.6], None);
        assert!(!objective.requires_gating());
    }

    #[test]
    fn test_consistency_needs_teacher() {
        let objective = Objective::new(ObjectiveKind::Consistency).unwrap();
        assert!(objective.compute(&map(&[0.5]), None).is_err());
        let teacher = map(&[0.2, 0.9, 0.4]);
        check_grad(&objective, &[0.3, 0.8, 0.6], Some(&teacher));
        let same = objective.compute(&teacher, Some(&teacher)).unwrap();
        assert_eq!(same.loss, 0.0);
    }

    #[test]
    fn test_self_training_masks_uncertain_pixels() {
        let objective = Objective::new(ObjectiveKind::SelfTraining { threshold: 0.8 }).unwrap();
        assert!(objective.requires_gating());
        let teacher = map(&[0.95, 0.5, 0.1]);
        let out = objective.compute(&map(&[0.7, 0.3, 0.2]), Some(&teacher)).unwrap();
        assert_eq!(out.grad[1], 0.0);
        assert!(out.grad[0] < 0.0 && out.grad[2] > 0.0);
        check_grad(&objective, &[0.7, 0.3, 0.2], Some(&teacher));

        let none_confident = objective.compute(&map(&[0.7]), Some(&map(&[0.5]))).unwrap();
        assert_eq!(none_confident.loss, 0.0);
    }

    #[test]
    fn test_norm_only_is_zero() {
        let objective = Objective::new(ObjectiveKind::NormOnly).unwrap();
        let out = objective.compute(&map(&[0.3, 0.9]), None).unwrap();
        assert_eq!(out.loss, 0.0);
        assert!(out.grad.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(Objective::new(ObjectiveKind::SelfTraining { threshold: 1.2 }).is_err());
    }

    #[test]
    fn test_preset_parse() {
        for preset in [
            MethodPreset::Tent,
            MethodPreset::MeanTeacher,
            MethodPreset::SelfTraining,
            MethodPreset::NormOnly,
            MethodPreset::Symalign,
        ] {
            assert_eq!(preset.name().parse::<MethodPreset>().unwrap(), preset);
        }
        assert_eq!("Mean_Teacher".parse::<MethodPreset>().unwrap(), MethodPreset::MeanTeacher);
        assert!("bogus".parse::<MethodPreset>().is_err());
        assert_eq!(MethodPreset::Symalign.objective(), ObjectiveKind::Entropy);
        assert!(MethodPreset::Symalign.ramp_target() > 0.0);
    }
}
