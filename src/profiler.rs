//! Profiler collaborator
//!
//! Named-phase timing around forward, backward, and optimizer-step work.
//! The loop only starts/stops phases; aggregation is up to the impl.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Scoped timing collaborator
pub trait Profiler {
    /// Begin timing the named phase
    fn start(&self, action: &str);

    /// End timing the named phase
    fn stop(&self, action: &str);
}

/// Run `f` inside a profiled phase
pub fn profiled<R>(profiler: &dyn Profiler, action: &str, f: impl FnOnce() -> R) -> R {
    profiler.start(action);
    let out = f();
    profiler.stop(action);
    out
}

/// Profiler that discards all timing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProfiler;

impl Profiler for NoopProfiler {
    fn start(&self, _action: &str) {}
    fn stop(&self, _action: &str) {}
}

/// Profiler that records call counts and cumulative durations per phase
#[derive(Debug, Default)]
pub struct RecordingProfiler {
    open: RefCell<BTreeMap<String, Instant>>,
    recorded: RefCell<BTreeMap<String, (usize, Duration)>>,
}

impl RecordingProfiler {
    /// Create an empty recording profiler
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed invocations of the named phase
    pub fn count(&self, action: &str) -> usize {
        self.recorded.borrow().get(action).map_or(0, |(n, _)| *n)
    }

    /// Cumulative time spent in the named phase
    pub fn total(&self, action: &str) -> Duration {
        self.recorded.borrow().get(action).map_or(Duration::ZERO, |(_, d)| *d)
    }

    /// Names of all phases recorded so far
    pub fn phases(&self) -> Vec<String> {
        self.recorded.borrow().keys().cloned().collect()
    }
}

impl Profiler for RecordingProfiler {
    fn start(&self, action: &str) {
        self.open.borrow_mut().insert(action.to_string(), Instant::now());
    }

    fn stop(&self, action: &str) {
        let started = self.open.borrow_mut().remove(action);
        if let Some(started) = started {
            let mut recorded = self.recorded.borrow_mut();
            let entry = recorded.entry(action.to_string()).or_insert((0, Duration::ZERO));
            entry.0 += 1;
            entry.1 += started.elapsed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_profiler_counts_phases() {
        let profiler = RecordingProfiler::new();
        profiled(&profiler, "forward", || ());
        profiled(&profiler, "forward", || ());
        profiled(&profiler, "backward", || ());

        assert_eq!(profiler.count("forward"), 2);
        assert_eq!(profiler.count("backward"), 1);
        assert_eq!(profiler.count("zero_grad"), 0);
        assert_eq!(profiler.phases(), vec!["backward".to_string(), "forward".to_string()]);
    }

    #[test]
    fn test_profiled_returns_closure_value() {
        let profiler = NoopProfiler;
        let value = profiled(&profiler, "phase", || 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn test_unmatched_stop_is_ignored() {
        let profiler = RecordingProfiler::new();
        profiler.stop("never_started");
        assert_eq!(profiler.count("never_started"), 0);
    }
}
