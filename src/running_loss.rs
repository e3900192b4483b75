//! Running loss tracking for display
//!
//! Two independent stages: an accumulation buffer reset every
//! accumulation window, and a fixed-capacity sliding window of finalized
//! scaled losses that survives across windows until evicted FIFO.

use std::collections::VecDeque;

/// Default sliding-window capacity
pub const DEFAULT_WINDOW: usize = 20;

/// Bounded loss accumulator with a sliding display window
#[derive(Clone, Debug)]
pub struct RunningLoss {
    accumulated: Vec<f32>,
    window: VecDeque<f32>,
    capacity: usize,
}

impl Default for RunningLoss {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl RunningLoss {
    /// Create a tracker with the given window capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            accumulated: Vec::new(),
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a loss value to the accumulation buffer
    pub fn accumulate(&mut self, loss: f32) {
        self.accumulated.push(loss);
    }

    /// Fold the buffered mean (times `scale`) into the window
    ///
    /// An empty buffer is a no-op: nothing is pushed and no reset is
    /// needed. After a non-empty fold the buffer is empty again, so no
    /// value is ever counted twice.
    pub fn fold_into_window(&mut self, scale: f32) {
        if self.accumulated.is_empty() {
            return;
        }
        let mean = self.accumulated.iter().sum::<f32>() / self.accumulated.len() as f32;
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(mean * scale);
        self.accumulated.clear();
    }

    /// Mean of the sliding window, if any values were finalized
    pub fn mean(&self) -> Option<f32> {
        if self.window.is_empty() {
            None
        } else {
            Some(self.window.iter().sum::<f32>() / self.window.len() as f32)
        }
    }

    /// Most recently finalized value
    pub fn last(&self) -> Option<f32> {
        self.window.back().copied()
    }

    /// Number of values currently in the sliding window
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Number of values currently buffered for accumulation
    pub fn buffered(&self) -> usize {
        self.accumulated.len()
    }

    /// Clear buffer and window
    pub fn reset(&mut self) {
        self.accumulated.clear();
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_fold_scales_buffer_mean() {
        let mut running = RunningLoss::new(20);
        running.accumulate(1.0);
        running.accumulate(3.0);
        running.fold_into_window(2.0);

        assert_eq!(running.buffered(), 0);
        assert_relative_eq!(running.last().unwrap(), 4.0);
    }

    #[test]
    fn test_buffer_empty_after_fold() {
        let mut running = RunningLoss::new(20);
        running.accumulate(0.5);
        running.fold_into_window(1.0);
        assert_eq!(running.buffered(), 0);
        assert_eq!(running.window_len(), 1);
    }

    #[test]
    fn test_empty_buffer_fold_is_noop() {
        let mut running = RunningLoss::new(20);
        running.fold_into_window(1.0);
        assert_eq!(running.window_len(), 0);
        assert!(running.mean().is_none());
        assert!(running.last().is_none());
    }

    #[test]
    fn test_window_evicts_oldest_at_capacity() {
        let mut running = RunningLoss::new(20);
        for i in 0..21 {
            running.accumulate(i as f32);
            running.fold_into_window(1.0);
        }
        assert_eq!(running.window_len(), 20);
        // value 0.0 was evicted; window now holds 1..=20
        assert_relative_eq!(running.mean().unwrap(), 10.5);
        assert_relative_eq!(running.last().unwrap(), 20.0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut running = RunningLoss::new(20);
        running.accumulate(1.0);
        running.fold_into_window(1.0);
        running.accumulate(2.0);
        running.reset();
        assert_eq!(running.buffered(), 0);
        assert_eq!(running.window_len(), 0);
    }

    proptest! {
        #[test]
        fn window_never_exceeds_capacity(losses in prop::collection::vec(-1e3f32..1e3, 0..100)) {
            let mut running = RunningLoss::new(20);
            for loss in losses {
                running.accumulate(loss);
                running.fold_into_window(1.0);
                prop_assert!(running.window_len() <= 20);
                prop_assert_eq!(running.buffered(), 0);
            }
        }
    }
}
