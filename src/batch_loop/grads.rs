//! Gradient management: zeroing, backward, norm tracking, clipping

use std::rc::Rc;

use crate::accelerator::Accelerator;
use crate::closure::{BackwardFn, ZeroGradFn};
use crate::config::LoopConfig;
use crate::error::LoopError;
use crate::module::{MetricCollection, TrainingModule};

use super::TrainingBatchLoop;

impl TrainingBatchLoop {
    /// Build the zero-grad function for the window-opening batch
    ///
    /// Progress counters bracket the before-zero-grad hook and the actual
    /// zeroing, so a resumed run can tell how far this got.
    pub(crate) fn make_zero_grad_fn(&self, batch_idx: usize, opt_idx: usize) -> ZeroGradFn {
        let module = Rc::clone(&self.module);
        let accelerator = Rc::clone(&self.accelerator);
        let progress = Rc::clone(&self.progress);
        let epoch = self.current_epoch;

        Box::new(move || {
            progress.borrow_mut().optimizer.zero_grad.increment_ready();
            module.on_before_zero_grad(opt_idx);
            progress.borrow_mut().optimizer.zero_grad.increment_started();
            accelerator.zero_grad(epoch, batch_idx, opt_idx);
            progress.borrow_mut().optimizer.zero_grad.increment_completed();
        })
    }

    /// Build the backward function for one optimizer
    ///
    /// Backward is delegated to the accelerator. When this batch
    /// completes the accumulation window, gradient norms are tracked and
    /// gradients clipped before the step; otherwise both are deferred to
    /// the window-closing batch.
    pub(crate) fn make_backward_fn(&self, batch_idx: usize, opt_idx: usize) -> BackwardFn {
        let module = Rc::clone(&self.module);
        let accelerator = Rc::clone(&self.accelerator);
        let logger = Rc::clone(&self.logger);
        let config = self.config().clone();
        let should_accumulate = self.should_accumulate(batch_idx);
        let global_step = self.global_step;

        Box::new(move |loss| {
            accelerator.backward(loss, opt_idx)?;

            if !should_accumulate {
                let norms =
                    track_and_norm_grad(&*module, &*accelerator, opt_idx, &config, global_step);
                if !norms.is_empty() {
                    logger.log_grad_norms(&norms);
                }
            }

            if config.terminate_on_non_finite && !loss.is_finite() {
                return Err(LoopError::NonFiniteLoss { loss });
            }
            Ok(())
        })
    }
}

/// Track gradient norms (when enabled and due) and clip gradients
fn track_and_norm_grad(
    module: &dyn TrainingModule,
    accelerator: &dyn Accelerator,
    opt_idx: usize,
    config: &LoopConfig,
    global_step: usize,
) -> MetricCollection {
    let mut norms = MetricCollection::new();
    if let Some(norm_type) = config.track_grad_norm {
        if (global_step + 1) % config.log_every_n_steps == 0 {
            norms = module.grad_norm(norm_type);
        }
    }
    accelerator.clip_gradients(opt_idx, config.gradient_clip_val, config.gradient_clip_algorithm);
    norms
}

#[cfg(test)]
mod tests {
    use super::super::testing::loop_with;
    use super::*;
    use crate::config::{ClipAlgorithm, LoopConfig};
    use crate::error::Result;
    use crate::module::{StepArgs, StepOutput};
    use std::cell::RefCell;

    struct NormyModule;

    impl TrainingModule for NormyModule {
        fn training_step(&self, _args: StepArgs<'_>) -> Result<StepOutput> {
            Ok(StepOutput::Skip)
        }

        fn grad_norm(&self, norm_type: f32) -> MetricCollection {
            let mut norms = MetricCollection::new();
            norms.insert(format!("grad_{norm_type}_norm_total"), 1.25);
            norms
        }
    }

    #[derive(Default)]
    struct ClipRecorder {
        clipped: RefCell<Vec<(usize, f32)>>,
    }

    impl Accelerator for ClipRecorder {
        fn backward(&self, _loss: f32, _opt_idx: usize) -> Result<()> {
            Ok(())
        }

        fn zero_grad(&self, _epoch: usize, _batch_idx: usize, _opt_idx: usize) {}

        fn clip_gradients(&self, opt_idx: usize, clip_val: f32, _algorithm: ClipAlgorithm) {
            self.clipped.borrow_mut().push((opt_idx, clip_val));
        }
    }

    #[test]
    fn test_norms_tracked_only_on_logging_interval() {
        let config = LoopConfig {
            track_grad_norm: Some(2.0),
            log_every_n_steps: 10,
            ..Default::default()
        };
        let accelerator = ClipRecorder::default();

        // global step 9 -> (9 + 1) % 10 == 0, due
        let norms = track_and_norm_grad(&NormyModule, &accelerator, 0, &config, 9);
        assert_eq!(norms.len(), 1);

        // global step 5 -> not due
        let norms = track_and_norm_grad(&NormyModule, &accelerator, 0, &config, 5);
        assert!(norms.is_empty());
    }

    #[test]
    fn test_norm_tracking_disabled_by_default() {
        let config = LoopConfig { log_every_n_steps: 1, ..Default::default() };
        let norms = track_and_norm_grad(&NormyModule, &ClipRecorder::default(), 0, &config, 0);
        assert!(norms.is_empty());
    }

    #[test]
    fn test_clipping_always_delegated() {
        let config = LoopConfig { gradient_clip_val: 0.5, ..Default::default() };
        let accelerator = ClipRecorder::default();
        track_and_norm_grad(&NormyModule, &accelerator, 1, &config, 0);
        assert_eq!(*accelerator.clipped.borrow(), vec![(1, 0.5)]);
    }

    #[test]
    fn test_zero_grad_counters_bracket_execution() {
        let batch_loop = loop_with(1, LoopConfig::default());
        let mut zero_grad = batch_loop.make_zero_grad_fn(0, 0);
        zero_grad();

        let progress = batch_loop.progress();
        assert_eq!(progress.optimizer.zero_grad.ready, 1);
        assert_eq!(progress.optimizer.zero_grad.started, 1);
        assert_eq!(progress.optimizer.zero_grad.completed, 1);
    }

    #[test]
    fn test_non_finite_loss_fails_backward_when_enabled() {
        let config = LoopConfig { terminate_on_non_finite: true, ..Default::default() };
        let mut batch_loop = loop_with(1, LoopConfig::default());
        batch_loop.config = config;
        let mut backward = batch_loop.make_backward_fn(0, 0);

        assert!(backward(1.0).is_ok());
        assert!(matches!(backward(f32::NAN), Err(LoopError::NonFiniteLoss { .. })));
    }
}
