//! Streaming symbolic prior: EMA mean and spread of accepted descriptors
//!
//! A [`PriorState`] is a plain value. [`PriorState::updated`] returns the next
//! state instead of mutating in place, and the [`PriorTracker`] publishes whole
//! [`PriorPair`] snapshots behind an `Arc`. Within a step the orchestrator
//! stages updates on a private copy ([`StagedPriors`]) while the scorer reads
//! the snapshot taken at the start of the step; the staged copy is published
//! only if the step commits.

use crate::descriptor::Descriptor;
use crate::views::Scale;
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which spread estimate to track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadKind {
    /// Per-dimension variance
    #[default]
    Diagonal,
    /// Full covariance matrix
    Full,
}

/// Running spread estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Spread {
    Diagonal { variance: Vec<f32> },
    /// Row-major `k x k`
    Full { covariance: Vec<f32> },
}

/// Prior tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorConfig {
    /// EMA decay rate `alpha`
    pub decay: f32,
    /// Accepted samples required before the prior is used for scoring
    pub min_count: u64,
    /// Lower bound on every variance
    pub variance_floor: f32,
    /// Variance assigned on the first accepted sample
    pub initial_variance: f32,
    /// Clip deviations to this many standard deviations once ready
    pub update_clip: Option<f32>,
    /// Diagonal or full spread
    pub spread: SpreadKind,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            decay: 0.01,
            min_count: 32,
            variance_floor: 1e-4,
            initial_variance: 1.0,
            update_clip: Some(3.0),
            spread: SpreadKind::Diagonal,
        }
    }
}

impl PriorConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err(AdaptError::config(format!("decay {} must be in (0, 1]", self.decay)));
        }
        if self.min_count == 0 {
            return Err(AdaptError::config("min_count must be >= 1"));
        }
        if !(self.variance_floor > 0.0) || !(self.initial_variance >= self.variance_floor) {
            return Err(AdaptError::config(
                "variance_floor must be positive and initial_variance >= variance_floor",
            ));
        }
        if let Some(clip) = self.update_clip {
            if !(clip > 0.0) {
                return Err(AdaptError::config("update_clip must be positive"));
            }
        }
        Ok(())
    }
}

/// EMA statistics of one descriptor scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorState {
    pub scale: Scale,
    pub mean: Vec<f32>,
    pub spread: Spread,
    /// Accepted samples folded in since the last reset
    pub count: u64,
    /// Step of the most recent update
    pub last_step: Option<u64>,
}

impl PriorState {
    /// Empty prior (count 0)
    pub fn empty(scale: Scale, dim: usize, kind: SpreadKind) -> Self {
        let spread = match kind {
            SpreadKind::Diagonal => Spread::Diagonal {
                variance: vec![0.0; dim],
            },
            SpreadKind::Full => Spread::Full {
                covariance: vec![0.0; dim * dim],
            },
        };
        Self {
            scale,
            mean: vec![0.0; dim],
            spread,
            count: 0,
            last_step: None,
        }
    }

    /// Descriptor dimensionality
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Whether enough samples were seen to score against this prior
    pub fn is_ready(&self, min_count: u64) -> bool {
        self.count >= min_count
    }

    /// Per-dimension variance (the covariance diagonal for full spread)
    pub fn variance(&self) -> Vec<f32> {
        match &self.spread {
            Spread::Diagonal { variance } => variance.clone(),
            Spread::Full { covariance } => {
                let k = self.dim();
                (0..k).map(|i| covariance[i * k + i]).collect()
            }
        }
    }

    /// Fold one accepted descriptor into a new state
    pub fn updated(&self, descriptor: &[f32], step: u64, config: &PriorConfig) -> Result<Self> {
        let k = self.dim();
        if descriptor.len() != k {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![k],
                got: vec![descriptor.len()],
            });
        }
        if descriptor.iter().any(|v| !v.is_finite()) {
            return Err(AdaptError::numeric(format!(
                "non-finite {:?} descriptor",
                self.scale
            )));
        }

        let mut next = self.clone();
        next.count += 1;
        next.last_step = Some(step);

        if self.count == 0 {
            next.mean = descriptor.to_vec();
            next.spread = match &self.spread {
                Spread::Diagonal { .. } => Spread::Diagonal {
                    variance: vec![config.initial_variance; k],
                },
                Spread::Full { .. } => {
                    let mut covariance = vec![0.0; k * k];
                    for i in 0..k {
                        covariance[i * k + i] = config.initial_variance;
                    }
                    Spread::Full { covariance }
                }
            };
            return Ok(next);
        }

        let alpha = config.decay;
        let variance = self.variance();
        let clip = config
            .update_clip
            .filter(|_| self.is_ready(config.min_count));
        let delta: Vec<f32> = descriptor
            .iter()
            .zip(&self.mean)
            .zip(&variance)
            .map(|((d, m), v)| {
                let raw = d - m;
                match clip {
                    Some(c) => {
                        let limit = c * v.sqrt();
                        raw.clamp(-limit, limit)
                    }
                    None => raw,
                }
            })
            .collect();

        for (m, d) in next.mean.iter_mut().zip(&delta) {
            *m += alpha * d;
        }

        match &mut next.spread {
            Spread::Diagonal { variance } => {
                for (v, d) in variance.iter_mut().zip(&delta) {
                    *v = ((1.0 - alpha) * *v + alpha * d * d).max(config.variance_floor);
                }
            }
            Spread::Full { covariance } => {
                for i in 0..k {
                    for j in 0..k {
                        let c = &mut covariance[i * k + j];
                        *c = (1.0 - alpha) * *c + alpha * delta[i] * delta[j];
                    }
                    let diag = &mut covariance[i * k + i];
                    *diag = diag.max(config.variance_floor);
                }
            }
        }

        Ok(next)
    }
}

/// Global and boundary priors, published together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorPair {
    pub global: PriorState,
    pub boundary: PriorState,
}

impl PriorPair {
    /// Empty priors at both scales
    pub fn empty(dim: usize, kind: SpreadKind) -> Self {
        Self {
            global: PriorState::empty(Scale::Global, dim, kind),
            boundary: PriorState::empty(Scale::Boundary, dim, kind),
        }
    }
}

/// Accepted descriptors from one sample stream within a logical step
#[derive(Debug, Clone, Default)]
pub struct DescriptorBatch {
    /// Stream identifier; batches are folded in ascending order
    pub stream: u32,
    /// `(global, boundary)` descriptor pairs in arrival order
    pub pairs: Vec<(Descriptor, Descriptor)>,
}

impl DescriptorBatch {
    /// Empty batch for a stream
    pub fn new(stream: u32) -> Self {
        Self {
            stream,
            pairs: Vec::new(),
        }
    }

    /// Append an accepted sample
    pub fn push(&mut self, global: Descriptor, boundary: Descriptor) {
        self.pairs.push((global, boundary));
    }
}

/// Private, not-yet-published prior updates for the current step
#[derive(Debug, Clone)]
pub struct StagedPriors {
    pairs: PriorPair,
    step: u64,
    accepted: usize,
}

impl StagedPriors {
    /// Fold one accepted sample into the staged priors
    pub fn observe(&mut self, global: &Descriptor, boundary: &Descriptor, config: &PriorConfig) -> Result<()> {
        let g = self.pairs.global.updated(global.values(), self.step, config)?;
        let b = self.pairs.boundary.updated(boundary.values(), self.step, config)?;
        self.pairs.global = g;
        self.pairs.boundary = b;
        self.accepted += 1;
        Ok(())
    }

    /// Reduce several streams into this step's single update
    pub fn observe_streams(&mut self, mut batches: Vec<DescriptorBatch>, config: &PriorConfig) -> Result<()> {
        batches.sort_by_key(|b| b.stream);
        for batch in &batches {
            for (g, b) in &batch.pairs {
                self.observe(g, b, config)?;
            }
        }
        Ok(())
    }

    /// Samples folded in this step
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Staged state (not visible to the scorer)
    pub fn pairs(&self) -> &PriorPair {
        &self.pairs
    }
}

/// Outcome of publishing a staged update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishSummary {
    /// Samples folded in
    pub accepted: usize,
    /// L-infinity change of the global mean
    pub global_mean_shift: f32,
}

/// Single-writer owner of the published priors
#[derive(Debug, Clone)]
pub struct PriorTracker {
    config: PriorConfig,
    published: Arc<PriorPair>,
}

impl PriorTracker {
    /// Empty tracker for `dim`-dimensional descriptors
    pub fn new(config: PriorConfig, dim: usize) -> Result<Self> {
        config.validate()?;
        let published = Arc::new(PriorPair::empty(dim, config.spread));
        Ok(Self { config, published })
    }

    /// Tracker restored from a snapshot
    pub fn from_pair(config: PriorConfig, pair: PriorPair) -> Result<Self> {
        config.validate()?;
        if pair.global.dim() != pair.boundary.dim() {
            return Err(AdaptError::ShapeMismatch {
                expected: vec![pair.global.dim()],
                got: vec![pair.boundary.dim()],
            });
        }
        Ok(Self {
            config,
            published: Arc::new(pair),
        })
    }

    /// Tracker configuration
    pub fn config(&self) -> &PriorConfig {
        &self.config
    }

    /// Immutable snapshot of the published priors
    pub fn snapshot(&self) -> Arc<PriorPair> {
        Arc::clone(&self.published)
    }

    /// Begin staging updates for `step`
    pub fn stage(&self, step: u64) -> StagedPriors {
        StagedPriors {
            pairs: (*self.published).clone(),
            step,
            accepted: 0,
        }
    }

    /// Publish staged updates; readers holding older snapshots are unaffected
    pub fn publish(&mut self, staged: StagedPriors) -> PublishSummary {
        let global_mean_shift = staged
            .pairs
            .global
            .mean
            .iter()
            .zip(&self.published.global.mean)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max);
        let accepted = staged.accepted;
        if accepted > 0 {
            self.published = Arc::new(staged.pairs);
        }
        PublishSummary {
            accepted,
            global_mean_shift: if accepted > 0 { global_mean_shift } else { 0.0 },
        }
    }

    /// Fold a single accepted sample and publish immediately
    pub fn update(&mut self, global: &Descriptor, boundary: &Descriptor, step: u64) -> Result<PublishSummary> {
        let mut staged = self.stage(step);
        staged.observe(global, boundary, &self.config)?;
        Ok(self.publish(staged))
    }

    /// Drop all statistics
    pub fn reset(&mut self) {
        let dim = self.published.global.dim();
        self.published = Arc::new(PriorPair::empty(dim, self.config.spread));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(values: &[f32]) -> Descriptor {
        Descriptor(values.to_vec())
    }

    #[test]
    fn test_first_sample_initializes() {
        let config = PriorConfig::default();
        let state = PriorState::empty(Scale::Global, 2, SpreadKind::Diagonal);
        let next = state.updated(&[3.0, -1.0], 0, &config).unwrap();
        assert_eq!(next.mean, vec![3.0, -1.0]);
        assert_eq!(next.variance(), vec![1.0, 1.0]);
        assert_eq!(next.count, 1);
        assert_eq!(next.last_step, Some(0));
        // Original value untouched
        assert_eq!(state.count, 0);
    }

    #[test]
    fn test_unclipped_ema_formula() {
        let config = PriorConfig {
            decay: 0.5,
            update_clip: None,
            ..Default::default()
        };
        let s = PriorState::empty(Scale::Global, 1, SpreadKind::Diagonal)
            .updated(&[0.0], 0, &config)
            .unwrap()
            .updated(&[2.0], 1, &config)
            .unwrap();
        assert!((s.mean[0] - 1.0).abs() < 1e-6);
        // (1 - 0.5) * 1.0 + 0.5 * 2^2
        assert!((s.variance()[0] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_ema_converges_to_constant() {
        let config = PriorConfig {
            decay: 0.05,
            ..Default::default()
        };
        let mut tracker = PriorTracker::new(config, 3).unwrap();
        tracker.update(&d(&[0.0, 0.0, 0.0]), &d(&[0.0; 3]), 0).unwrap();
        let target = [2.0, -4.0, 0.5];
        let n = (5.0 / 0.05) as u64;
        for step in 1..=n {
            tracker.update(&d(&target), &d(&target), step).unwrap();
        }
        let snap = tracker.snapshot();
        for (m, t) in snap.global.mean.iter().zip(&target) {
            assert!((m - t).abs() <= 0.01 * t.abs(), "mean {} target {}", m, t);
        }
    }

    #[test]
    fn test_variance_floor() {
        let config = PriorConfig {
            decay: 0.5,
            variance_floor: 0.1,
            initial_variance: 0.1,
            ..Default::default()
        };
        let mut s = PriorState::empty(Scale::Boundary, 1, SpreadKind::Full);
        for step in 0..50 {
            s = s.updated(&[1.0], step, &config).unwrap();
        }
        assert!((s.variance()[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_clip_limits_outlier_pull() {
        let config = PriorConfig {
            decay: 0.1,
            min_count: 1,
            update_clip: Some(3.0),
            ..Default::default()
        };
        let s = PriorState::empty(Scale::Global, 1, SpreadKind::Diagonal)
            .updated(&[0.0], 0, &config)
            .unwrap();
        let pulled = s.updated(&[1000.0], 1, &config).unwrap();
        assert!((pulled.mean[0] - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_non_finite_rejected() {
        let s = PriorState::empty(Scale::Global, 1, SpreadKind::Diagonal);
        let err = s.updated(&[f32::NAN], 0, &PriorConfig::default()).unwrap_err();
        assert!(matches!(err, AdaptError::NumericInstability(_)));
    }

    #[test]
    fn test_staged_updates_invisible_until_published() {
        let mut tracker = PriorTracker::new(PriorConfig::default(), 2).unwrap();
        let before = tracker.snapshot();

        let mut staged = tracker.stage(0);
        staged.observe(&d(&[1.0, 1.0]), &d(&[2.0, 2.0]), tracker.config()).unwrap();
        assert_eq!(tracker.snapshot().global.count, 0);

        // Dropping the staged copy discards it
        drop(staged);
        assert_eq!(*tracker.snapshot(), *before);

        let mut staged = tracker.stage(1);
        staged.observe(&d(&[1.0, 1.0]), &d(&[2.0, 2.0]), tracker.config()).unwrap();
        let summary = tracker.publish(staged);
        assert_eq!(summary.accepted, 1);
        assert_eq!(tracker.snapshot().global.count, 1);
        assert_eq!(before.global.count, 0);
    }

    #[test]
    fn test_streams_reduce_in_stream_order() {
        let config = PriorConfig {
            update_clip: None,
            ..Default::default()
        };
        let tracker = PriorTracker::new(config.clone(), 1).unwrap();

        let mut a = DescriptorBatch::new(1);
        a.push(d(&[5.0]), d(&[5.0]));
        let mut b = DescriptorBatch::new(0);
        b.push(d(&[1.0]), d(&[1.0]));

        let mut reduced = tracker.stage(0);
        reduced.observe_streams(vec![a, b], &config).unwrap();

        let mut sequential = tracker.stage(0);
        sequential.observe(&d(&[1.0]), &d(&[1.0]), &config).unwrap();
        sequential.observe(&d(&[5.0]), &d(&[5.0]), &config).unwrap();

        assert_eq!(reduced.pairs(), sequential.pairs());
        assert_eq!(reduced.accepted(), 2);
    }

    #[test]
    fn test_reset_clears_statistics() {
        use crate::scorer::{RobustScorer, ScorerConfig};

        let config = PriorConfig {
            min_count: 2,
            ..Default::default()
        };
        let mut tracker = PriorTracker::new(config, 2).unwrap();
        for step in 0..4 {
            tracker.update(&d(&[1.0, 2.0]), &d(&[0.5, 0.5]), step).unwrap();
        }
        let scorer = RobustScorer::new(ScorerConfig::default()).unwrap();
        let far = [40.0, -40.0];
        assert!(scorer.score(&far, &tracker.snapshot().global, 2).unwrap().loss > 0.0);

        tracker.reset();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.global.count, 0);
        assert_eq!(snapshot.boundary.count, 0);
        assert_eq!(snapshot.global.last_step, None);
        assert_eq!(snapshot.global.dim(), 2);
        let score = scorer.score(&far, &snapshot.global, 2).unwrap();
        assert_eq!(score.loss, 0.0);
        assert!(score.grad.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_invalid_config() {
        let bad = PriorConfig {
            decay: 0.0,
            ..Default::default()
        };
        assert!(PriorTracker::new(bad, 2).is_err());
    }
}
