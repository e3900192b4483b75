//! Step execution: forward dispatch, output processing, closure assembly

use std::cell::RefCell;
use std::rc::Rc;

use crate::accelerator::Accelerator;
use crate::batch::Batch;
use crate::closure::{Closure, ClosureResult, StepFn};
use crate::error::{LoopError, Result};
use crate::module::{build_step_args, HiddenState, StepOutput, TrainingModule};
use crate::profiler::{profiled, Profiler};

use super::TrainingBatchLoop;

/// Normalized step output: loss (if any) plus loggable metrics
struct ProcessedOutput {
    loss: Option<f32>,
    metrics: crate::module::MetricCollection,
}

impl TrainingBatchLoop {
    /// Assemble the closure for one split/optimizer
    ///
    /// Zero-grad and backward are omitted under manual optimization or
    /// when backward is explicitly skipped; zero-grad additionally only
    /// appears on the first batch of an accumulation window.
    pub(crate) fn make_closure(
        &self,
        split: &Batch,
        batch_idx: usize,
        opt_idx: Option<usize>,
    ) -> Closure {
        let step_fn = self.make_step_fn(split, batch_idx, opt_idx);

        let (zero_grad_fn, backward_fn) =
            if self.module().automatic_optimization() && !self.skip_backward() {
                let is_first_batch_to_accumulate =
                    batch_idx % self.config().accumulate_grad_batches == 0;
                let zero_grad_fn = if is_first_batch_to_accumulate {
                    opt_idx.map(|idx| self.make_zero_grad_fn(batch_idx, idx))
                } else {
                    None
                };
                let backward_fn = opt_idx.map(|idx| self.make_backward_fn(batch_idx, idx));
                (zero_grad_fn, backward_fn)
            } else {
                (None, None)
            };

        Closure::new(step_fn, zero_grad_fn, backward_fn, Rc::clone(&self.profiler))
    }

    /// Build the step function running the forward pass for the split
    fn make_step_fn(&self, split: &Batch, batch_idx: usize, opt_idx: Option<usize>) -> StepFn {
        let module = Rc::clone(&self.module);
        let accelerator = Rc::clone(&self.accelerator);
        let profiler = Rc::clone(&self.profiler);
        let hiddens = Rc::clone(&self.hiddens);
        let split = split.clone();
        let accumulate_grad_batches = self.config().accumulate_grad_batches;

        Box::new(move || {
            training_step(
                &*module,
                &*accelerator,
                &*profiler,
                &hiddens,
                &split,
                batch_idx,
                opt_idx,
                accumulate_grad_batches,
            )
        })
    }
}

/// Run the forward step with its tied hooks and normalize the output
///
/// Returns `None` when the step produced no result collection, which
/// signals "skip optimization for this split/optimizer" and is a valid
/// outcome. Under automatic optimization the returned loss is scaled by
/// the accumulation-window size so accumulated gradients sum to the same
/// scale as a non-accumulated step.
#[allow(clippy::too_many_arguments)]
fn training_step(
    module: &dyn TrainingModule,
    accelerator: &dyn Accelerator,
    profiler: &dyn Profiler,
    hiddens: &RefCell<Option<HiddenState>>,
    split: &Batch,
    batch_idx: usize,
    opt_idx: Option<usize>,
    accumulate_grad_batches: usize,
) -> Result<Option<ClosureResult>> {
    let output = profiled(profiler, "model_forward", || {
        let args = build_step_args(split, batch_idx, opt_idx, hiddens.borrow().clone());
        let output = profiled(profiler, "training_step", || -> Result<StepOutput> {
            let output = accelerator.training_step(module, args)?;
            accelerator.post_training_step();
            Ok(output)
        })?;
        module.training_step_end(output)
    })?;

    check_step_output(module, &output)?;
    let Some(processed) = process_step_output(output, hiddens) else {
        return Ok(None);
    };

    if module.automatic_optimization() {
        // validated above: automatic outputs always carry a loss
        let Some(raw_loss) = processed.loss else {
            return Ok(None);
        };
        let closure_loss = raw_loss / accumulate_grad_batches as f32;
        // keep a detached copy of the scaled loss for display
        Ok(Some(ClosureResult {
            closure_loss: Some(closure_loss),
            loss: Some(closure_loss),
            metrics: processed.metrics,
        }))
    } else {
        Ok(Some(ClosureResult { closure_loss: None, loss: None, metrics: processed.metrics }))
    }
}

/// Validate the step output shape for the current optimization mode
fn check_step_output(module: &dyn TrainingModule, output: &StepOutput) -> Result<()> {
    if module.automatic_optimization() && matches!(output, StepOutput::Metrics { .. }) {
        return Err(LoopError::Misconfiguration(
            "the training step output has no loss; automatic optimization requires one"
                .to_string(),
        ));
    }
    Ok(())
}

/// Extract the result collection and thread the hidden state forward
fn process_step_output(
    output: StepOutput,
    hiddens: &RefCell<Option<HiddenState>>,
) -> Option<ProcessedOutput> {
    match output {
        StepOutput::Skip => None,
        StepOutput::Loss { loss, metrics, hiddens: new_hiddens } => {
            *hiddens.borrow_mut() = new_hiddens;
            Some(ProcessedOutput { loss: Some(loss), metrics })
        }
        StepOutput::Metrics { metrics, hiddens: new_hiddens } => {
            *hiddens.borrow_mut() = new_hiddens;
            Some(ProcessedOutput { loss: None, metrics })
        }
    }
}
