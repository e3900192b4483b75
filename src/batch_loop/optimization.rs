//! Optimizer coordination: frequency rotation, toggling, step dispatch

use std::cell::RefCell;
use std::rc::Rc;

use crate::accelerator::BlockedSync;
use crate::batch::Batch;
use crate::closure::{Closure, ClosureResult};
use crate::config::AmpBackend;
use crate::error::{LoopError, Result};
use crate::module::{StepFlags, TrainingModule};
use crate::optim::{EvalStyle, LoggedOptimizer, Optimizer};

use super::TrainingBatchLoop;

/// Restores full trainable-parameter scope when dropped
///
/// Construction scopes the module's trainable parameters to a single
/// optimizer so other optimizers' parameters do not accumulate unwanted
/// gradients; the symmetric untoggle runs even on early exit.
pub(crate) struct ToggleGuard {
    module: Rc<dyn TrainingModule>,
    opt_idx: usize,
}

impl ToggleGuard {
    fn new(module: Rc<dyn TrainingModule>, opt_idx: usize) -> Self {
        module.toggle_optimizer(opt_idx);
        Self { module, opt_idx }
    }
}

impl Drop for ToggleGuard {
    fn drop(&mut self) {
        self.module.untoggle_optimizer(self.opt_idx);
    }
}

impl TrainingBatchLoop {
    /// The optimizers active at the given batch index, in index order
    ///
    /// Without configured frequencies every optimizer is active once per
    /// split. With frequencies, exactly one optimizer is active: batch
    /// indices rotate through the optimizers proportionally to their
    /// frequency weights (period = sum of frequencies).
    pub fn get_active_optimizers(
        &self,
        batch_idx: usize,
    ) -> Vec<(usize, Rc<RefCell<dyn Optimizer>>)> {
        if self.config().optimizer_frequencies.is_empty() {
            return self.optimizers.iter().cloned().enumerate().collect();
        }

        // frequencies are immutable post-setup, so the cumsum is cached
        let cumsum = self.freq_cumsum.get_or_init(|| {
            self.config()
                .optimizer_frequencies
                .iter()
                .scan(0, |acc, &freq| {
                    *acc += freq;
                    Some(*acc)
                })
                .collect()
        });
        let period = cumsum.last().copied().unwrap_or(0);
        if period == 0 {
            return self.optimizers.iter().cloned().enumerate().collect();
        }

        let position = batch_idx % period;
        let opt_idx = cumsum.iter().position(|&c| c > position).unwrap_or(0);
        match self.optimizers.get(opt_idx) {
            Some(optimizer) => vec![(opt_idx, Rc::clone(optimizer))],
            None => Vec::new(),
        }
    }

    /// Number of optimizers active at the given batch index
    pub fn num_active_optimizers(&self, batch_idx: usize) -> usize {
        self.get_active_optimizers(batch_idx).len()
    }

    /// Run the closure for one split/optimizer, stepping if due
    ///
    /// While accumulating, the closure runs directly with distributed
    /// gradient sync suppressed. At a window boundary under automatic
    /// optimization the closure is handed to the optimizer step instead.
    pub(crate) fn run_optimization(
        &mut self,
        batch_idx: usize,
        split: &Batch,
        opt_idx: Option<usize>,
        optimizer: Option<&Rc<RefCell<dyn Optimizer>>>,
    ) -> Result<Option<ClosureResult>> {
        let _toggle = self.toggle_scope(opt_idx);
        let mut closure = self.make_closure(split, batch_idx, opt_idx);

        if self.should_accumulate(batch_idx) {
            let _sync = BlockedSync::new(&*self.accelerator);
            closure.run()?;
        } else if self.module().automatic_optimization() {
            match (opt_idx, optimizer) {
                (Some(opt_idx), Some(optimizer)) => {
                    self.optimizer_step(optimizer, opt_idx, batch_idx, &mut closure)?;
                }
                _ => {
                    closure.run()?;
                }
            }
        } else {
            closure.run()?;
        }

        let result = closure.into_result();
        if let Some(result) = &result {
            // absent result means the step chose to skip optimization
            self.update_running_loss(result.loss);
        }
        Ok(result)
    }

    /// Perform the optimizer step through the module hook
    ///
    /// Fails fast when a multi-evaluation optimizer is paired with native
    /// mixed precision; the two are incompatible.
    pub(crate) fn optimizer_step(
        &self,
        optimizer: &Rc<RefCell<dyn Optimizer>>,
        opt_idx: usize,
        batch_idx: usize,
        closure: &mut Closure,
    ) -> Result<()> {
        let using_multi_eval = optimizer.borrow().eval_style() == EvalStyle::MultiEval;
        let using_native_amp = self.config().amp_backend == AmpBackend::Native;
        if using_native_amp && using_multi_eval {
            return Err(LoopError::Misconfiguration(
                "optimizers that evaluate their closure multiple times are not \
                 compatible with native mixed precision"
                    .to_string(),
            ));
        }

        let mut logged = LoggedOptimizer::new(optimizer.as_ref(), &*self.profiler, opt_idx);

        self.progress.borrow_mut().optimizer.step.increment_ready();
        self.module.optimizer_step(
            self.current_epoch,
            batch_idx,
            &mut logged,
            opt_idx,
            closure,
            StepFlags { using_native_amp, using_multi_eval },
        )?;
        self.progress.borrow_mut().optimizer.step.increment_completed();
        Ok(())
    }

    /// Scope trainable parameters to the active optimizer, if needed
    fn toggle_scope(&self, opt_idx: Option<usize>) -> Option<ToggleGuard> {
        let opt_idx = opt_idx?;
        if self.module().automatic_optimization() && self.optimizers.len() > 1 {
            Some(ToggleGuard::new(Rc::clone(&self.module), opt_idx))
        } else {
            None
        }
    }
}
