//! Resumable optimization progress counters
//!
//! Every optimizer-facing operation records ready/started/completed
//! transitions. Snapshots serialize, so a restarted run can skip the
//! optimizer indices already completed for the current batch position.

use serde::{Deserialize, Serialize};

/// Counter triple for one operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyCompletedTracker {
    /// Operation was requested
    pub ready: u64,
    /// Operation began executing
    pub started: u64,
    /// Operation finished
    pub completed: u64,
}

impl ReadyCompletedTracker {
    /// Record that the operation was requested
    pub fn increment_ready(&mut self) {
        self.ready += 1;
    }

    /// Record that the operation began
    pub fn increment_started(&mut self) {
        self.started += 1;
    }

    /// Record that the operation finished
    pub fn increment_completed(&mut self) {
        self.completed += 1;
    }

    /// Reset all counters to zero
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Step and zero-grad progress for the optimizer currently in scope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerProgress {
    /// Optimizer step calls
    pub step: ReadyCompletedTracker,
    /// Gradient zeroing calls
    pub zero_grad: ReadyCompletedTracker,
}

impl OptimizerProgress {
    /// Reset both trackers
    pub fn reset(&mut self) {
        self.step.reset();
        self.zero_grad.reset();
    }
}

/// Full optimization progress for the batch loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationProgress {
    /// Counters for the active optimizer
    pub optimizer: OptimizerProgress,
    /// Index of the optimizer last dispatched; restart resumes here
    pub optimizer_idx: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_increments() {
        let mut tracker = ReadyCompletedTracker::default();
        tracker.increment_ready();
        tracker.increment_started();
        tracker.increment_completed();
        tracker.increment_completed();
        assert_eq!(tracker.ready, 1);
        assert_eq!(tracker.started, 1);
        assert_eq!(tracker.completed, 2);
    }

    #[test]
    fn test_tracker_reset() {
        let mut tracker = ReadyCompletedTracker { ready: 3, started: 2, completed: 1 };
        tracker.reset();
        assert_eq!(tracker, ReadyCompletedTracker::default());
    }

    #[test]
    fn test_progress_serde_round_trip() {
        let mut progress = OptimizationProgress::default();
        progress.optimizer_idx = 1;
        progress.optimizer.step.increment_ready();
        progress.optimizer.step.increment_completed();
        progress.optimizer.zero_grad.increment_ready();

        let json = serde_json::to_string(&progress).unwrap();
        let back: OptimizationProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, progress);
    }
}
