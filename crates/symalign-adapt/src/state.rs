//! Persistent adaptation state

use crate::adapter::AdapterSet;
use crate::optimizer::OptimizerState;
use crate::prior::PriorPair;
use crate::stopping::StoppingMonitor;
use serde::{Deserialize, Serialize};

/// Running counters over the whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Samples read from the source
    pub samples_seen: u64,
    /// Samples accepted by the gate in committed steps
    pub samples_accepted: u64,
    /// Steps skipped for numeric reasons
    pub skipped_steps: u64,
    /// Checkpoints written
    pub checkpoints_written: u64,
}

impl RunStats {
    /// Accepted fraction of all samples seen
    pub fn accept_rate(&self) -> f32 {
        if self.samples_seen == 0 {
            return 0.0;
        }
        self.samples_accepted as f32 / self.samples_seen as f32
    }
}

/// Everything needed to continue a run exactly where it stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationState {
    /// Committed steps
    pub step: u64,
    /// Batches read, including skipped steps
    pub batches_consumed: u64,
    pub optimizer: OptimizerState,
    pub adapters: AdapterSet,
    /// Mean-teacher copy, present when the objective uses one
    pub teacher_adapters: Option<AdapterSet>,
    pub priors: PriorPair,
    pub monitor: StoppingMonitor,
    pub consecutive_skips: u32,
    pub stats: RunStats,
}

impl AdaptationState {
    /// Fresh state around injected adapters
    pub fn fresh(adapters: AdapterSet, with_teacher: bool, priors: PriorPair) -> Self {
        let teacher_adapters = with_teacher.then(|| adapters.clone());
        Self {
            step: 0,
            batches_consumed: 0,
            optimizer: OptimizerState::default(),
            adapters,
            teacher_adapters,
            priors,
            monitor: StoppingMonitor::new(),
            consecutive_skips: 0,
            stats: RunStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::SpreadKind;

    #[test]
    fn test_fresh_state() {
        let state = AdaptationState::fresh(AdapterSet::new(), true, PriorPair::empty(3, SpreadKind::Diagonal));
        assert_eq!(state.step, 0);
        assert!(state.teacher_adapters.is_some());
        assert_eq!(state.priors.global.count, 0);
        assert_eq!(state.stats.accept_rate(), 0.0);
    }
}
