//! Robust alignment of descriptors against a prior snapshot

use crate::prior::{PriorState, Spread};
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};

/// Bounded-influence transform of the whitened deviation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RobustLoss {
    /// Per-dimension Huber with break point `delta`, averaged over dimensions
    Huber { delta: f32 },
    /// Half the squared Mahalanobis distance, saturating at the clip radius
    ClippedMahalanobis,
}

impl Default for RobustLoss {
    fn default() -> Self {
        RobustLoss::Huber { delta: 1.0 }
    }
}

/// Scorer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub loss: RobustLoss,
    /// Clip radius in standard deviations
    pub clip: f32,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            loss: RobustLoss::default(),
            clip: 3.0,
        }
    }
}

impl ScorerConfig {
    /// Set robust transform
    pub fn loss(mut self, loss: RobustLoss) -> Self {
        self.loss = loss;
        self
    }

    /// Set clip radius
    pub fn clip(mut self, clip: f32) -> Self {
        self.clip = clip;
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.clip > 0.0 && self.clip.is_finite()) {
            return Err(AdaptError::config(format!("clip {} must be positive", self.clip)));
        }
        if let RobustLoss::Huber { delta } = self.loss {
            if !(delta > 0.0) {
                return Err(AdaptError::config("huber delta must be positive"));
            }
        }
        Ok(())
    }

    /// Largest loss a single descriptor can produce
    pub fn bound(&self) -> f32 {
        match self.loss {
            RobustLoss::Huber { delta } => huber(self.clip, delta),
            RobustLoss::ClippedMahalanobis => 0.5 * self.clip * self.clip,
        }
    }
}

fn huber(z: f32, delta: f32) -> f32 {
    let a = z.abs();
    if a <= delta {
        0.5 * a * a
    } else {
        delta * (a - 0.5 * delta)
    }
}

fn huber_grad(z: f32, delta: f32) -> f32 {
    z.clamp(-delta, delta)
}

/// Loss and its gradient w.r.t. the descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub loss: f32,
    pub grad: Vec<f32>,
}

impl Score {
    fn zero(dim: usize) -> Self {
        Self {
            loss: 0.0,
            grad: vec![0.0; dim],
        }
    }
}

/// Stateless robust scorer
#[derive(Debug, Clone)]
pub struct RobustScorer {
    config: ScorerConfig,
}

impl RobustScorer {
    /// Create scorer
    pub fn new(config: ScorerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Scorer configuration
    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Per-sample loss bound
    pub fn bound(&self) -> f32 {
        self.config.bound()
    }

    /// Score a descriptor; a prior with fewer than `min_count` samples scores zero
    pub fn score(&self, descriptor: &[f32], prior: &PriorState, min_count: u64) -> Result<Score> {
        let k = prior.dim();
        check_dim(descriptor, k)?;
        if !prior.is_ready(min_count) {
            return Ok(Score::zero(k));
        }

        let whitening = Whitening::of(prior)?;
        let z = whitening.whiten(descriptor, &prior.mean);
        let clip = self.config.clip;

        let (loss, grad_z) = match self.config.loss {
            RobustLoss::Huber { delta } => {
                let n = k as f32;
                let mut loss = 0.0;
                let grad: Vec<f32> = z
                    .iter()
                    .map(|&zi| {
                        let clipped = zi.clamp(-clip, clip);
                        loss += huber(clipped, delta);
                        if zi.abs() > clip {
                            0.0
                        } else {
                            huber_grad(zi, delta) / n
                        }
                    })
                    .collect();
                (loss / n, grad)
            }
            RobustLoss::ClippedMahalanobis => {
                let dist = z.iter().map(|v| v * v).sum::<f32>().sqrt();
                if dist >= clip {
                    (0.5 * clip * clip, vec![0.0; k])
                } else {
                    (0.5 * dist * dist, z.clone())
                }
            }
        };

        Ok(Score {
            loss,
            grad: whitening.pull_back(&grad_z),
        })
    }

    /// Unclipped squared Mahalanobis distance
    pub fn squared_distance(&self, descriptor: &[f32], prior: &PriorState) -> Result<f32> {
        check_dim(descriptor, prior.dim())?;
        let z = Whitening::of(prior)?.whiten(descriptor, &prior.mean);
        Ok(z.iter().map(|v| v * v).sum())
    }
}

fn check_dim(descriptor: &[f32], k: usize) -> Result<()> {
    if descriptor.len() != k {
        return Err(AdaptError::ShapeMismatch {
            expected: vec![k],
            got: vec![descriptor.len()],
        });
    }
    Ok(())
}

/// Map from descriptor deviation to whitened coordinates
enum Whitening {
    /// 1 / sigma per dimension
    Diagonal(Vec<f32>),
    /// Lower Cholesky factor, row-major
    Cholesky { dim: usize, lower: Vec<f32> },
}

impl Whitening {
    fn of(prior: &PriorState) -> Result<Self> {
        match &prior.spread {
            Spread::Diagonal { variance } => Ok(Whitening::Diagonal(
                variance.iter().map(|v| 1.0 / v.sqrt()).collect(),
            )),
            Spread::Full { covariance } => {
                let dim = prior.dim();
                Ok(Whitening::Cholesky {
                    dim,
                    lower: cholesky(covariance, dim)?,
                })
            }
        }
    }

    fn whiten(&self, d: &[f32], mean: &[f32]) -> Vec<f32> {
        let diff: Vec<f32> = d.iter().zip(mean).map(|(a, b)| a - b).collect();
        match self {
            Whitening::Diagonal(inv) => diff.iter().zip(inv).map(|(x, s)| x * s).collect(),
            Whitening::Cholesky { dim, lower } => {
                // Forward substitution: L z = diff
                let n = *dim;
                let mut z = vec![0.0; n];
                for i in 0..n {
                    let mut acc = diff[i];
                    for j in 0..i {
                        acc -= lower[i * n + j] * z[j];
                    }
                    z[i] = acc / lower[i * n + i];
                }
                z
            }
        }
    }

    /// Gradient w.r.t. the descriptor given the gradient w.r.t. `z`
    fn pull_back(&self, grad_z: &[f32]) -> Vec<f32> {
        match self {
            Whitening::Diagonal(inv) => grad_z.iter().zip(inv).map(|(g, s)| g * s).collect(),
            Whitening::Cholesky { dim, lower } => {
                // Back substitution: L^T g = grad_z
                let n = *dim;
                let mut g = vec![0.0; n];
                for i in (0..n).rev() {
                    let mut acc = grad_z[i];
                    for j in i + 1..n {
                        acc -= lower[j * n + i] * g[j];
                    }
                    g[i] = acc / lower[i * n + i];
                }
                g
            }
        }
    }
}

/// Cholesky factor of a symmetric matrix; tiny pivots are regularized
fn cholesky(matrix: &[f32], n: usize) -> Result<Vec<f32>> {
    if matrix.len() != n * n {
        return Err(AdaptError::ShapeMismatch {
            expected: vec![n, n],
            got: vec![matrix.len()],
        });
    }
    const JITTER: f32 = 1e-6;
    let mut lower = vec![0.0f32; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[i * n + j];
            for p in 0..j {
                sum -= lower[i * n + p] * lower[j * n + p];
            }
            if i == j {
                lower[i * n + i] = sum.max(JITTER).sqrt();
            } else {
                lower[i * n + j] = sum / lower[j * n + j];
            }
        }
    }
    if lower.iter().any(|v| !v.is_finite()) {
        return Err(AdaptError::numeric("covariance factorization produced non-finite values"));
    }
    Ok(lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::{PriorConfig, SpreadKind};
    use crate::views::Scale;

    fn ready_prior(kind: SpreadKind, mean: &[f32], variance: f32) -> PriorState {
        let mut state = PriorState::empty(Scale::Global, mean.len(), kind);
        state.mean = mean.to_vec();
        state.count = 100;
        state.spread = match kind {
            SpreadKind::Diagonal => Spread::Diagonal {
                variance: vec![variance; mean.len()],
            },
            SpreadKind::Full => {
                let k = mean.len();
                let mut covariance = vec![0.0; k * k];
                for i in 0..k {
                    covariance[i * k + i] = variance;
                }
                Spread::Full { covariance }
            }
        };
        state
    }

    #[test]
    fn test_not_ready_scores_zero() {
        let scorer = RobustScorer::new(ScorerConfig::default()).unwrap();
        let mut prior = ready_prior(SpreadKind::Diagonal, &[0.0, 0.0], 1.0);
        prior.count = 3;
        let score = scorer.score(&[50.0, -50.0], &prior, 4).unwrap();
        assert_eq!(score.loss, 0.0);
        assert!(score.grad.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_huber_values() {
        let scorer = RobustScorer::new(ScorerConfig::default()).unwrap();
        let prior = ready_prior(SpreadKind::Diagonal, &[0.0], 4.0);
        // z = 1 / 2 = 0.5 -> quadratic region
        let s = scorer.score(&[1.0], &prior, 1).unwrap();
        assert!((s.loss - 0.125).abs() < 1e-6);
        assert!((s.grad[0] - 0.25).abs() < 1e-6);
        // z = 2 -> linear region, delta * (2 - 0.5)
        let s = scorer.score(&[4.0], &prior, 1).unwrap();
        assert!((s.loss - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_outlier_is_bounded() {
        for loss in [RobustLoss::Huber { delta: 1.0 }, RobustLoss::ClippedMahalanobis] {
            let scorer = RobustScorer::new(ScorerConfig::default().loss(loss)).unwrap();
            let prior = ready_prior(SpreadKind::Diagonal, &[1.0, 1.0], 1.0);
            let s = scorer.score(&[1e6, -1e6], &prior, 1).unwrap();
            assert!(s.loss <= scorer.bound() + 1e-6);
            assert!(s.grad.iter().all(|g| *g == 0.0));
            assert!(scorer.squared_distance(&[1e6, -1e6], &prior).unwrap() > 1e11);
        }
    }

    #[test]
    fn test_full_matches_diagonal_for_isotropic() {
        let config = ScorerConfig::default().loss(RobustLoss::ClippedMahalanobis);
        let scorer = RobustScorer::new(config).unwrap();
        let diag = ready_prior(SpreadKind::Diagonal, &[0.5, -0.5, 2.0], 2.0);
        let full = ready_prior(SpreadKind::Full, &[0.5, -0.5, 2.0], 2.0);
        let d = [1.0, 0.0, 2.5];
        let a = scorer.score(&d, &diag, 1).unwrap();
        let b = scorer.score(&d, &full, 1).unwrap();
        assert!((a.loss - b.loss).abs() < 1e-5);
        for (x, y) in a.grad.iter().zip(&b.grad) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_full_gradient_matches_finite_difference() {
        let scorer =
            RobustScorer::new(ScorerConfig::default().loss(RobustLoss::ClippedMahalanobis).clip(10.0)).unwrap();
        let config = PriorConfig {
            decay: 0.3,
            min_count: 1,
            update_clip: None,
            ..Default::default()
        };
        let mut prior = PriorState::empty(Scale::Global, 2, SpreadKind::Full);
        for (step, d) in [[0.0, 0.0], [1.0, 0.5], [2.0, 1.5], [-1.0, -0.2]].iter().enumerate() {
            prior = prior.updated(d, step as u64, &config).unwrap();
        }
        let d = [0.7, -0.3];
        let analytic = scorer.score(&d, &prior, 1).unwrap();
        for i in 0..2 {
            let mut bumped = d;
            bumped[i] += 1e-3;
            let up = scorer.score(&bumped, &prior, 1).unwrap().loss;
            let fd = (up - analytic.loss) / 1e-3;
            assert!((fd - analytic.grad[i]).abs() < 1e-2, "dim {}: {} vs {}", i, fd, analytic.grad[i]);
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let scorer = RobustScorer::new(ScorerConfig::default()).unwrap();
        let prior = ready_prior(SpreadKind::Diagonal, &[0.0, 0.0], 1.0);
        assert!(scorer.score(&[1.0], &prior, 1).is_err());
    }

    #[test]
    fn test_invalid_config() {
        assert!(RobustScorer::new(ScorerConfig::default().clip(0.0)).is_err());
        assert!(RobustScorer::new(ScorerConfig::default().loss(RobustLoss::Huber { delta: -1.0 })).is_err());
    }
}
