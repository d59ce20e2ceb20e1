//! Adaptation loop: forward, gate, stage priors, assemble losses, update adapters
//!
//! The orchestrator is the single writer of the adapter parameters and the
//! priors. Within a step everything is computed against the state as it was
//! at the start of the step; the result is committed only once every numeric
//! check has passed, so a skipped step leaves no trace besides the consumed
//! batch.

use crate::adapter::{AdapterSet, AdapterSpec, ParamMap};
use crate::budget::{self, ParameterBudget};
use crate::checkpoint::{CheckpointBody, CheckpointStore};
use crate::config::{AdaptConfig, AdapterPlacement};
use crate::descriptor::DescriptorEncoder;
use crate::gate::{ConfidenceGate, GateDecision};
use crate::isolation::{IsolatedSource, Sample, SampleSource};
use crate::model::Backbone;
use crate::objective::Objective;
use crate::optimizer::{clip_grad_norm, grad_norm, AdapterOptimizer};
use crate::prior::{PriorPair, PriorTracker, StagedPriors};
use crate::scorer::RobustScorer;
use crate::state::{AdaptationState, RunStats};
use crate::stopping::{StepObservation, StopRule, StoppingMonitor};
use crate::views::PredictionView;
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a run aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortCause {
    DataIsolation,
    BudgetUnreachable,
    Configuration,
    RepeatedNumericInstability,
    CheckpointCorruption,
    Io,
}

impl AbortCause {
    fn of(err: &AdaptError) -> Self {
        match err {
            AdaptError::DataIsolationViolation { .. } => AbortCause::DataIsolation,
            AdaptError::BudgetUnreachable { .. } => AbortCause::BudgetUnreachable,
            AdaptError::NumericInstability(_) => AbortCause::RepeatedNumericInstability,
            AdaptError::CheckpointCorruption(_) => AbortCause::CheckpointCorruption,
            AdaptError::Io(_) | AdaptError::Json(_) | AdaptError::Source(_) => AbortCause::Io,
            AdaptError::Configuration(_) | AdaptError::Adapter(_) | AdaptError::ShapeMismatch { .. } => {
                AbortCause::Configuration
            }
        }
    }
}

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptPhase {
    Init,
    Stepping,
    Converged(StopRule),
    StepLimitReached,
    Aborted(AbortCause),
}

impl AdaptPhase {
    /// No further steps will run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AdaptPhase::Converged(_) | AdaptPhase::StepLimitReached | AdaptPhase::Aborted(_)
        )
    }
}

impl fmt::Display for AdaptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdaptPhase::Init => f.write_str("init"),
            AdaptPhase::Stepping => f.write_str("stepping"),
            AdaptPhase::Converged(rule) => write!(f, "converged ({})", rule),
            AdaptPhase::StepLimitReached => f.write_str("step limit reached"),
            AdaptPhase::Aborted(cause) => write!(f, "aborted ({:?})", cause),
        }
    }
}

/// Loss terms of one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossTerms {
    pub task: f32,
    pub align_global: f32,
    pub align_boundary: f32,
    pub lambda_sym: f32,
    /// `task + lambda_sym * (align_global + align_boundary)`
    pub total: f32,
}

impl LossTerms {
    fn new(task: f32, align_global: f32, align_boundary: f32, lambda_sym: f32) -> Self {
        Self {
            task,
            align_global,
            align_boundary,
            lambda_sym,
            total: task + lambda_sym * (align_global + align_boundary),
        }
    }
}

/// Result of a call to [`Orchestrator::step`]
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step committed
    Committed { terms: LossTerms, accepted: usize },
    /// Batch consumed, nothing committed
    Skipped { reason: String },
    /// Source had no batch; the run stays in `Stepping`
    Paused,
    /// Run is in a terminal phase
    Finished(AdaptPhase),
}

/// Summary returned by [`Orchestrator::run`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub phase: AdaptPhase,
    pub steps: u64,
    pub batches_consumed: u64,
    pub skipped_steps: u64,
    pub accept_rate: f32,
    pub last_terms: Option<LossTerms>,
}

/// Live state built at init
struct Runtime {
    spec: AdapterSpec,
    budget: Option<ParameterBudget>,
    gate: ConfidenceGate,
    scorer: RobustScorer,
    objective: Objective,
    tracker: PriorTracker,
    optimizer: AdapterOptimizer,
    adapters: AdapterSet,
    teacher: Option<AdapterSet>,
    monitor: StoppingMonitor,
    step: u64,
    batches_consumed: u64,
    consecutive_skips: u32,
    stats: RunStats,
}

/// Everything a step computed before commit
struct PendingStep {
    grads: ParamMap,
    staged: StagedPriors,
    terms: LossTerms,
    accepted: usize,
    accept_rate: f32,
    mean_entropy: f32,
}

/// Test-time adaptation loop over an isolated sample stream
pub struct Orchestrator<B, E, S> {
    config: AdaptConfig,
    backbone: B,
    encoder: E,
    source: IsolatedSource<S>,
    phase: AdaptPhase,
    runtime: Option<Runtime>,
    last_terms: Option<LossTerms>,
}

impl<B, E, S> Orchestrator<B, E, S>
where
    B: Backbone,
    E: DescriptorEncoder,
    S: SampleSource,
{
    /// Create an orchestrator; nothing is resolved until [`Orchestrator::init`]
    pub fn new(config: AdaptConfig, backbone: B, encoder: E, source: IsolatedSource<S>) -> Self {
        Self {
            config,
            backbone,
            encoder,
            source,
            phase: AdaptPhase::Init,
            runtime: None,
            last_terms: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> AdaptPhase {
        self.phase
    }

    /// Configuration
    pub fn config(&self) -> &AdaptConfig {
        &self.config
    }

    /// Isolated source, e.g. to feed a paused run
    pub fn source_mut(&mut self) -> &mut IsolatedSource<S> {
        &mut self.source
    }

    /// Resolved adapter spec (after init)
    pub fn adapter_spec(&self) -> Option<&AdapterSpec> {
        self.runtime.as_ref().map(|rt| &rt.spec)
    }

    /// Current adapters (after init)
    pub fn adapters(&self) -> Option<&AdapterSet> {
        self.runtime.as_ref().map(|rt| &rt.adapters)
    }

    /// Published priors (after init)
    pub fn priors(&self) -> Option<Arc<PriorPair>> {
        self.runtime.as_ref().map(|rt| rt.tracker.snapshot())
    }

    /// Loss terms of the last committed step
    pub fn last_terms(&self) -> Option<LossTerms> {
        self.last_terms
    }

    /// Validate, resolve adapters and load or create the initial state
    pub fn init(&mut self) -> Result<()> {
        if self.phase != AdaptPhase::Init {
            return Ok(());
        }
        match self.build_runtime() {
            Ok(runtime) => {
                info!(
                    "Adaptation initialized: method {}, {} trainable params on {} layers, step {}",
                    self.config.method,
                    runtime.adapters.total_params(),
                    runtime.spec.targets.len(),
                    runtime.step
                );
                self.runtime = Some(runtime);
                self.phase = AdaptPhase::Stepping;
                if self.config.max_steps <= self.runtime.as_ref().map_or(0, |rt| rt.step) {
                    self.phase = AdaptPhase::StepLimitReached;
                }
                Ok(())
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    fn build_runtime(&mut self) -> Result<Runtime> {
        let config = &self.config;
        config.validate()?;

        let layers = self.backbone.layers();
        let (spec, budget) = match &config.placement {
            AdapterPlacement::Explicit { spec } => (spec.clone(), None),
            AdapterPlacement::Budget { search } => {
                let resolution = budget::resolve(search, &layers, self.backbone.total_params())?;
                (resolution.spec, Some(search.budget))
            }
        };

        let gate = ConfidenceGate::new(config.gate.clone())?;
        let scorer = RobustScorer::new(config.scorer.clone())?;
        let objective = Objective::new(config.objective_kind())?;
        let adapters = AdapterSet::inject(&layers, &spec, config.seed)?;
        let fresh_tracker = PriorTracker::new(config.prior.clone(), self.encoder.dim())?;

        let state = match self.load_resume(&spec)? {
            Some(state) => state,
            None => AdaptationState::fresh(
                adapters,
                objective.needs_teacher(),
                (*fresh_tracker.snapshot()).clone(),
            ),
        };

        let mut runtime = Runtime {
            gate,
            scorer,
            tracker: PriorTracker::from_pair(config.prior.clone(), state.priors)?,
            optimizer: AdapterOptimizer::with_state(config.optimizer, state.optimizer)?,
            teacher: match (objective.needs_teacher(), state.teacher_adapters) {
                (true, Some(t)) => Some(t),
                (true, None) => Some(state.adapters.clone()),
                (false, _) => None,
            },
            objective,
            adapters: state.adapters,
            monitor: state.monitor,
            step: state.step,
            batches_consumed: state.batches_consumed,
            consecutive_skips: state.consecutive_skips,
            stats: state.stats,
            spec,
            budget,
        };

        if runtime.tracker.snapshot().global.dim() != self.encoder.dim() {
            return Err(AdaptError::CheckpointCorruption(format!(
                "prior dimension {} does not match encoder dimension {}",
                runtime.tracker.snapshot().global.dim(),
                self.encoder.dim()
            )));
        }

        if runtime.batches_consumed > 0 {
            let skipped = self.source.skip_batches(runtime.batches_consumed)?;
            if skipped < runtime.batches_consumed {
                warn!(
                    "Source ended while fast-forwarding: skipped {} of {} batches",
                    skipped, runtime.batches_consumed
                );
                runtime.batches_consumed = skipped;
            }
        }

        Ok(runtime)
    }

    /// Load the resume checkpoint; unreadable checkpoints fall back to a fresh start unless strict
    fn load_resume(&self, spec: &AdapterSpec) -> Result<Option<AdaptationState>> {
        let Some(path) = &self.config.checkpoint.resume_from else {
            return Ok(None);
        };
        let loaded = CheckpointStore::load(path).and_then(|body| {
            if &body.adapter_spec != spec {
                return Err(AdaptError::CheckpointCorruption(format!(
                    "checkpoint adapter spec {:?} does not match resolved spec {:?}",
                    body.adapter_spec, spec
                )));
            }
            Ok(body.state)
        });

        match loaded {
            Ok(state) => {
                info!(
                    "Resuming from {} at step {} ({} batches consumed)",
                    path.display(),
                    state.step,
                    state.batches_consumed
                );
                Ok(Some(state))
            }
            Err(e @ (AdaptError::CheckpointCorruption(_) | AdaptError::Io(_))) => {
                if self.config.checkpoint.strict_resume {
                    return Err(match e {
                        AdaptError::Io(io) => {
                            AdaptError::CheckpointCorruption(format!("cannot read {}: {}", path.display(), io))
                        }
                        other => other,
                    });
                }
                warn!("Ignoring unusable checkpoint {}: {}; starting fresh", path.display(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn abort(&mut self, err: AdaptError) -> AdaptError {
        let cause = AbortCause::of(&err);
        error!("Adaptation aborted ({:?}): {}", cause, err);
        self.phase = AdaptPhase::Aborted(cause);
        err
    }

    /// Run one step over the next batch
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.phase == AdaptPhase::Init {
            self.init()?;
        }
        if self.phase.is_terminal() {
            return Ok(StepOutcome::Finished(self.phase));
        }

        let batch = match self.source.next_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(StepOutcome::Paused),
            Err(e) => return Err(self.abort(e)),
        };

        let Some(rt) = self.runtime.as_mut() else {
            return Err(AdaptError::config("orchestrator not initialized"));
        };
        rt.batches_consumed += 1;
        rt.stats.samples_seen += batch.len() as u64;

        if batch.is_empty() {
            return Ok(StepOutcome::Skipped {
                reason: "empty batch".into(),
            });
        }

        let pending = match self.compute_step(&batch) {
            Ok(pending) => pending,
            Err(e) if !e.is_fatal() => return self.skip(e),
            Err(e) => return Err(self.abort(e)),
        };

        match self.commit(pending) {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abort(e)),
        }
    }

    fn skip(&mut self, err: AdaptError) -> Result<StepOutcome> {
        let max = self.config.numeric.max_consecutive_skips;
        let Some(rt) = self.runtime.as_mut() else {
            return Err(err);
        };
        rt.consecutive_skips += 1;
        rt.stats.skipped_steps += 1;
        warn!(
            "Skipping step {} ({} consecutive): {}",
            rt.step, rt.consecutive_skips, err
        );
        if rt.consecutive_skips >= max {
            return Err(self.abort(err));
        }
        Ok(StepOutcome::Skipped {
            reason: err.to_string(),
        })
    }

    /// Forward, gate, score and backpropagate against the start-of-step state
    fn compute_step(&self, batch: &[Sample]) -> Result<PendingStep> {
        let rt = self
            .runtime
            .as_ref()
            .ok_or_else(|| AdaptError::config("orchestrator not initialized"))?;
        let config = &self.config;
        let snapshot = rt.tracker.snapshot();
        let lambda = config.ramp.value_at(rt.step);
        let min_count = config.prior.min_count;

        let mut forwards = Vec::with_capacity(batch.len());
        for sample in batch {
            let (prediction, cache) = self.backbone.forward(&sample.image, &rt.adapters)?;
            let teacher = match &rt.teacher {
                Some(t) if rt.objective.needs_teacher() => {
                    Some(self.backbone.forward(&sample.image, t)?.0)
                }
                _ => None,
            };
            let decision = rt.gate.evaluate(&prediction);
            forwards.push((prediction, cache, teacher, decision));
        }

        let decisions: Vec<GateDecision> = forwards.iter().map(|f| f.3).collect();
        let accepted = decisions.iter().filter(|d| d.accepted()).count();
        let task_count = if rt.objective.requires_gating() {
            accepted
        } else {
            forwards.len()
        };

        let mut staged = rt.tracker.stage(rt.step);
        let mut grads = rt.adapters.zero_grads();
        let (mut task_sum, mut align_g, mut align_b, mut entropy_sum) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);

        for ((prediction, cache, teacher, decision), sample) in forwards.iter().zip(batch) {
            entropy_sum += prediction.mean_entropy();
            let mut grad_p = vec![0.0f32; prediction.data.len()];

            if decision.accepted() || !rt.objective.requires_gating() {
                let task = rt.objective.compute(prediction, teacher.as_ref())?;
                task_sum += task.loss;
                let scale = 1.0 / task_count as f32;
                for (g, t) in grad_p.iter_mut().zip(&task.grad) {
                    *g += scale * t;
                }
            }

            if decision.accepted() {
                let (global, boundary) =
                    PredictionView::pair(prediction, config.band_width, config.boundary_view);
                let d_global = self.encoder.encode(&global, &sample.image)?;
                let d_boundary = self.encoder.encode(&boundary, &sample.image)?;
                if !d_global.is_finite() || !d_boundary.is_finite() {
                    return Err(AdaptError::numeric("non-finite descriptor"));
                }
                staged.observe(&d_global, &d_boundary, &config.prior)?;

                let s_global = rt.scorer.score(d_global.values(), &snapshot.global, min_count)?;
                let s_boundary = rt.scorer.score(d_boundary.values(), &snapshot.boundary, min_count)?;
                align_g += s_global.loss;
                align_b += s_boundary.loss;

                if lambda > 0.0 {
                    let scale = lambda / accepted as f32;
                    for (view, score) in [(&global, &s_global), (&boundary, &s_boundary)] {
                        if !view.differentiable || score.grad.iter().all(|g| *g == 0.0) {
                            continue;
                        }
                        let primary = self.encoder.backward(view, &sample.image, &score.grad)?;
                        for (g, v) in grad_p.iter_mut().zip(view.grad_to_prediction(&primary)) {
                            *g += scale * v;
                        }
                    }
                }
            }

            if grad_p.iter().any(|g| *g != 0.0) {
                let sample_grads = self.backbone.backward(cache, &grad_p, &rt.adapters)?;
                for (name, g) in sample_grads {
                    if let Some(acc) = grads.get_mut(&name) {
                        for (a, v) in acc.iter_mut().zip(&g) {
                            *a += v;
                        }
                    }
                }
            }
        }

        let task = if task_count > 0 { task_sum / task_count as f32 } else { 0.0 };
        let (align_global, align_boundary) = if accepted > 0 {
            (align_g / accepted as f32, align_b / accepted as f32)
        } else {
            (0.0, 0.0)
        };
        let terms = LossTerms::new(task, align_global, align_boundary, lambda);

        if !terms.total.is_finite() {
            return Err(AdaptError::numeric(format!("non-finite loss {:?}", terms)));
        }
        if grads.values().flatten().any(|g| !g.is_finite()) {
            return Err(AdaptError::numeric("non-finite adapter gradient"));
        }
        let norm = grad_norm(&grads);
        if norm > config.numeric.explode_threshold {
            return Err(AdaptError::numeric(format!(
                "gradient norm {:.3e} exceeds {:.3e}",
                norm, config.numeric.explode_threshold
            )));
        }
        clip_grad_norm(&mut grads, config.numeric.max_grad_norm);

        Ok(PendingStep {
            grads,
            staged,
            terms,
            accepted,
            accept_rate: accepted as f32 / forwards.len() as f32,
            mean_entropy: entropy_sum / forwards.len() as f32,
        })
    }

    /// Apply a computed step: optimizer, mean teacher, prior publish, monitors
    fn commit(&mut self, pending: PendingStep) -> Result<StepOutcome> {
        let config = &self.config;
        let rt = self
            .runtime
            .as_mut()
            .ok_or_else(|| AdaptError::config("orchestrator not initialized"))?;

        let lr = config.learning_rate.lr_at(rt.step);
        rt.optimizer.step(&mut rt.adapters, &pending.grads, lr)?;
        if let Some(teacher) = rt.teacher.as_mut() {
            teacher.ema_towards(&rt.adapters, config.teacher_decay)?;
        }
        let summary = rt.tracker.publish(pending.staged);

        rt.step += 1;
        rt.consecutive_skips = 0;
        rt.stats.samples_accepted += pending.accepted as u64;

        let observation = StepObservation {
            step: rt.step,
            total_loss: pending.terms.total,
            task_loss: pending.terms.task,
            mean_entropy: pending.mean_entropy,
            prior_shift: (summary.accepted > 0).then_some(summary.global_mean_shift),
            accept_rate: pending.accept_rate,
        };
        let stop = rt.monitor.observe(&config.stopping, &observation);

        if config.log_interval > 0 && rt.step % config.log_interval == 0 {
            debug!(
                "step {}: total {:.5} task {:.5} align_g {:.5} align_b {:.5} lambda {:.4} lr {:.2e} accepted {}",
                rt.step,
                pending.terms.total,
                pending.terms.task,
                pending.terms.align_global,
                pending.terms.align_boundary,
                pending.terms.lambda_sym,
                lr,
                pending.accepted
            );
        }

        let step = rt.step;
        self.last_terms = Some(pending.terms);

        if let Some(rule) = stop {
            info!("Converged at step {}: {}", step, rule);
            self.phase = AdaptPhase::Converged(rule);
        } else if step >= config.max_steps {
            info!("Step limit {} reached", config.max_steps);
            self.phase = AdaptPhase::StepLimitReached;
        }

        let interval = self.config.checkpoint.interval;
        if interval > 0 && step % interval == 0 {
            self.checkpoint_now()?;
        }

        Ok(StepOutcome::Committed {
            terms: pending.terms,
            accepted: pending.accepted,
        })
    }

    /// Step until the run finishes or the source pauses
    pub fn run(&mut self) -> Result<RunReport> {
        loop {
            match self.step()? {
                StepOutcome::Committed { .. } | StepOutcome::Skipped { .. } => {}
                StepOutcome::Paused => {
                    info!("Source exhausted; pausing at step {}", self.report().steps);
                    break;
                }
                StepOutcome::Finished(_) => break,
            }
            if self.phase.is_terminal() {
                break;
            }
        }
        Ok(self.report())
    }

    /// Summary of the run so far
    pub fn report(&self) -> RunReport {
        let (steps, batches_consumed, skipped_steps, accept_rate) = match &self.runtime {
            Some(rt) => (
                rt.step,
                rt.batches_consumed,
                rt.stats.skipped_steps,
                rt.stats.accept_rate(),
            ),
            None => (0, 0, 0, 0.0),
        };
        RunReport {
            phase: self.phase,
            steps,
            batches_consumed,
            skipped_steps,
            accept_rate,
            last_terms: self.last_terms,
        }
    }

    /// Snapshot of the full adaptation state (after init)
    pub fn state(&self) -> Option<AdaptationState> {
        self.runtime.as_ref().map(|rt| AdaptationState {
            step: rt.step,
            batches_consumed: rt.batches_consumed,
            optimizer: rt.optimizer.state().clone(),
            adapters: rt.adapters.clone(),
            teacher_adapters: rt.teacher.clone(),
            priors: (*rt.tracker.snapshot()).clone(),
            monitor: rt.monitor.clone(),
            consecutive_skips: rt.consecutive_skips,
            stats: rt.stats.clone(),
        })
    }

    /// Write a checkpoint to the configured path
    pub fn checkpoint_now(&mut self) -> Result<()> {
        let path = self
            .config
            .checkpoint
            .path
            .clone()
            .ok_or_else(|| AdaptError::config("no checkpoint path configured"))?;
        let (Some(state), Some(rt)) = (self.state(), self.runtime.as_ref()) else {
            return Err(AdaptError::config("orchestrator not initialized"));
        };
        let body = CheckpointBody {
            adapter_spec: rt.spec.clone(),
            budget: rt.budget,
            state,
        };
        CheckpointStore::new(path).save(&body)?;
        if let Some(rt) = self.runtime.as_mut() {
            rt.stats.checkpoints_written += 1;
        }
        Ok(())
    }
}

impl<B, E, S> fmt::Debug for Orchestrator<B, E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("step", &self.runtime.as_ref().map(|rt| rt.step))
            .finish()
    }
}
