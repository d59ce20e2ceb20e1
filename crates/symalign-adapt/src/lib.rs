//! Source-free test-time adaptation
//!
//! This crate adapts a frozen segmentation model to a shifted, unlabeled
//! target stream:
//! - Budget-matched adapters (low-rank, structured-sparse, affine-only)
//! - Confidence and degeneracy gating of predictions
//! - Streaming EMA prior over structural descriptors at global and boundary scale
//! - Robust (Huber / clipped Mahalanobis) alignment to that prior
//! - Checkpointed adaptation loop with unsupervised stopping rules
//!
//! Reference collaborators ([`LinearBackbone`], [`ProjectionEncoder`],
//! [`MemorySource`]) make the engine runnable without external models.

mod adapter;
mod budget;
mod checkpoint;
mod config;
mod descriptor;
mod error;
mod gate;
mod isolation;
mod model;
mod objective;
mod optimizer;
mod orchestrator;
mod prior;
mod scheduler;
mod scorer;
mod state;
mod stopping;
mod views;

pub use adapter::{Adapter, AdapterKind, AdapterParams, AdapterSet, AdapterSpec, ParamMap};
pub use budget::{resolve as resolve_budget, AdapterFamily, BudgetConfig, BudgetResolution, ParameterBudget};
pub use checkpoint::{CheckpointBody, CheckpointConfig, CheckpointStore, FORMAT_VERSION};
pub use config::{AdaptConfig, AdapterPlacement, NumericConfig};
pub use descriptor::{Descriptor, DescriptorEncoder, EncoderOutput, ProjectionEncoder};
pub use error::{AdaptError, Result};
pub use gate::{accept_rate, ConfidenceGate, FragmentationProxy, GateConfig, GateDecision, GateReason};
pub use isolation::{DomainTag, IsolatedSource, IsolationPolicy, MemorySource, Sample, SampleSource};
pub use model::{Backbone, FrozenLinear, Image, LayerShape, LinearBackbone, LinearCache};
pub use objective::{MethodPreset, Objective, ObjectiveKind, TaskLoss};
pub use optimizer::{clip_grad_norm, grad_norm, AdapterOptimizer, OptimizerConfig, OptimizerState};
pub use orchestrator::{AbortCause, AdaptPhase, LossTerms, Orchestrator, RunReport, StepOutcome};
pub use prior::{
    DescriptorBatch, PriorConfig, PriorPair, PriorState, PriorTracker, PublishSummary, Spread, SpreadKind,
    StagedPriors,
};
pub use scheduler::{LearningRateSchedule, RampSchedule, RampShape, SchedulerType};
pub use scorer::{RobustLoss, RobustScorer, Score, ScorerConfig};
pub use state::{AdaptationState, RunStats};
pub use stopping::{
    AcceptRateRule, PlateauRule, PlateauSignal, PriorStabilityRule, StepObservation, StopRule, StoppingConfig,
    StoppingMonitor,
};
pub use views::{
    boundary_band, boundary_to_area_ratio, component_count, BoundaryView, PredictionView, ProbabilityMap, Scale,
};
