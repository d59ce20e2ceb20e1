//! Adapter optimizers with checkpointable state

use crate::adapter::{AdapterSet, ParamMap};
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};

/// Optimizer selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    /// Stochastic gradient descent with optional momentum
    Sgd { momentum: f32 },
    /// Adam with bias correction
    Adam {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: f32,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            OptimizerConfig::Sgd { momentum } => (0.0..1.0).contains(&momentum),
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
                weight_decay,
            } => {
                (0.0..1.0).contains(&beta1)
                    && (0.0..1.0).contains(&beta2)
                    && epsilon > 0.0
                    && weight_decay >= 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(AdaptError::config(format!("invalid optimizer settings {:?}", self)))
        }
    }
}

/// Moments and step count; persisted in checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Updates applied
    pub t: u64,
    /// First moment (Adam) or velocity (SGD)
    pub first: ParamMap,
    /// Second moment (Adam only)
    pub second: ParamMap,
}

/// Optimizer over the parameters of an [`AdapterSet`]
#[derive(Debug, Clone)]
pub struct AdapterOptimizer {
    config: OptimizerConfig,
    state: OptimizerState,
}

impl AdapterOptimizer {
    /// Create optimizer with fresh state
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: OptimizerState::default(),
        })
    }

    /// Create optimizer from saved state
    pub fn with_state(config: OptimizerConfig, state: OptimizerState) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, state })
    }

    /// Current state
    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    /// Apply one update with learning rate `lr`
    pub fn step(&mut self, adapters: &mut AdapterSet, grads: &ParamMap, lr: f32) -> Result<()> {
        let mut params = adapters.params();
        self.state.t += 1;
        let t = self.state.t;

        for (name, values) in params.iter_mut() {
            let grad = match grads.get(name) {
                Some(g) if g.len() == values.len() => g,
                Some(g) => {
                    return Err(AdaptError::ShapeMismatch {
                        expected: vec![values.len()],
                        got: vec![g.len()],
                    })
                }
                None => continue,
            };
            let m = self
                .state
                .first
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; values.len()]);

            match self.config {
                OptimizerConfig::Sgd { momentum } => {
                    for ((w, g), v) in values.iter_mut().zip(grad).zip(m.iter_mut()) {
                        *v = momentum * *v + g;
                        *w -= lr * *v;
                    }
                }
                OptimizerConfig::Adam {
                    beta1,
                    beta2,
                    epsilon,
                    weight_decay,
                } => {
                    let v = self
                        .state
                        .second
                        .entry(name.clone())
                        .or_insert_with(|| vec![0.0; values.len()]);
                    let bias_correction1 = 1.0 - beta1.powf(t as f32);
                    let bias_correction2 = 1.0 - beta2.powf(t as f32);

                    for i in 0..values.len() {
                        let g = grad[i];
                        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
                        let m_hat = m[i] / bias_correction1;
                        let v_hat = v[i] / bias_correction2;
                        let update = m_hat / (v_hat.sqrt() + epsilon);
                        values[i] -= lr * (update + weight_decay * values[i]);
                    }
                }
            }
        }

        adapters.set_params(&params)
    }
}

/// Global L2 norm over all gradients
pub fn grad_norm(grads: &ParamMap) -> f32 {
    grads
        .values()
        .flat_map(|g| g.iter())
        .map(|g| g * g)
        .sum::<f32>()
        .sqrt()
}

/// Clip gradients by global norm; returns the norm before clipping
pub fn clip_grad_norm(grads: &mut ParamMap, max_norm: f32) -> f32 {
    let total_norm = grad_norm(grads);
    if total_norm > max_norm {
        let scale = max_norm / total_norm;
        for grad in grads.values_mut() {
            for g in grad.iter_mut() {
                *g *= scale;
            }
        }
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterKind, AdapterSpec};
    use crate::model::LayerShape;

    fn affine_set() -> AdapterSet {
        let layers = vec![LayerShape::new("fc0", 2, 2)];
        let spec = AdapterSpec::new(AdapterKind::AffineOnly, vec!["fc0".into()]);
        AdapterSet::inject(&layers, &spec, 0).unwrap()
    }

    #[test]
    fn test_sgd_step() {
        let mut set = affine_set();
        let mut opt = AdapterOptimizer::new(OptimizerConfig::Sgd { momentum: 0.0 }).unwrap();
        let grads: ParamMap = [("fc0".to_string(), vec![1.0, -1.0, 0.5, 0.0])].into();
        opt.step(&mut set, &grads, 0.1).unwrap();
        assert_eq!(set.params()["fc0"], vec![-0.1, 0.1, -0.05, 0.0]);
        assert_eq!(opt.state().t, 1);
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        let mut set = affine_set();
        let mut opt = AdapterOptimizer::new(OptimizerConfig::default()).unwrap();
        let grads: ParamMap = [("fc0".to_string(), vec![3.0, -0.01, 0.0, 100.0])].into();
        opt.step(&mut set, &grads, 0.01).unwrap();
        let p = &set.params()["fc0"];
        assert!((p[0] + 0.01).abs() < 1e-4);
        assert!((p[1] - 0.01).abs() < 1e-4);
        assert_eq!(p[2], 0.0);
        assert!((p[3] + 0.01).abs() < 1e-4);
    }

    #[test]
    fn test_adam_bias_correction_past_i32_steps() {
        let mut set = affine_set();
        let state = OptimizerState {
            t: 3_000_000_000,
            ..Default::default()
        };
        let mut opt = AdapterOptimizer::with_state(OptimizerConfig::default(), state).unwrap();
        let grads: ParamMap = [("fc0".to_string(), vec![1.0, 0.0, 0.0, 0.0])].into();
        opt.step(&mut set, &grads, 0.01).unwrap();

        // Bias corrections are 1, so the step is lr * (1 - beta1) / sqrt(1 - beta2)
        let expected = -0.01 * 0.1 / 0.001f32.sqrt();
        let p = &set.params()["fc0"];
        assert!(p[0].is_finite());
        assert!((p[0] - expected).abs() < 1e-4, "{} vs {}", p[0], expected);
        assert_eq!(opt.state().t, 3_000_000_001);
    }

    #[test]
    fn test_restored_state_continues_identically() {
        let grads: ParamMap = [("fc0".to_string(), vec![0.3, -0.2, 0.1, 0.4])].into();
        let mut a_set = affine_set();
        let mut a = AdapterOptimizer::new(OptimizerConfig::default()).unwrap();
        for _ in 0..4 {
            a.step(&mut a_set, &grads, 0.01).unwrap();
        }

        let mut b_set = affine_set();
        let mut b = AdapterOptimizer::new(OptimizerConfig::default()).unwrap();
        for _ in 0..2 {
            b.step(&mut b_set, &grads, 0.01).unwrap();
        }
        let json = serde_json::to_string(b.state()).unwrap();
        let state: OptimizerState = serde_json::from_str(&json).unwrap();
        let mut b = AdapterOptimizer::with_state(OptimizerConfig::default(), state).unwrap();
        for _ in 0..2 {
            b.step(&mut b_set, &grads, 0.01).unwrap();
        }
        assert_eq!(a_set, b_set);
    }

    #[test]
    fn test_clip_grad_norm() {
        let mut grads: ParamMap = [
            ("a".to_string(), vec![3.0]),
            ("b".to_string(), vec![4.0]),
        ]
        .into();
        let norm = clip_grad_norm(&mut grads, 1.0);
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((grad_norm(&grads) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_config() {
        assert!(AdapterOptimizer::new(OptimizerConfig::Sgd { momentum: 1.5 }).is_err());
    }
}
