//! Single-batch training loop driver
//!
//! Runs over one batch of data: splits it (truncated BPTT), determines
//! the active optimizer(s) per split, composes forward/backward/zero-grad
//! into a closure, and executes that closure either directly or through
//! the optimizer step. Results accumulate into a per-optimizer output
//! buffer returned to the caller.

mod grads;
mod optimization;
mod step;

use std::cell::{OnceCell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::accelerator::Accelerator;
use crate::batch::Batch;
use crate::closure::ClosureResult;
use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::logging::{LoggerConnector, WarningCache};
use crate::module::{HiddenState, HookSignal, TrainingModule};
use crate::optim::Optimizer;
use crate::profiler::{profiled, Profiler};
use crate::progress::OptimizationProgress;
use crate::running_loss::RunningLoss;

/// Outcome signal of one batch run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopSignal {
    /// Batch processed (or skipped as empty) normally
    Completed,
    /// A begin-of-batch hook requested an abort
    Aborted,
}

/// Aggregated result of running one batch
#[derive(Clone, Debug)]
pub struct BatchOutput {
    /// Completion signal
    pub signal: LoopSignal,
    /// Per-optimizer sequences of step results collected across splits
    pub step_outputs: Vec<Vec<ClosureResult>>,
}

impl BatchOutput {
    fn skipped() -> Self {
        Self { signal: LoopSignal::Completed, step_outputs: vec![Vec::new()] }
    }

    fn aborted() -> Self {
        Self { signal: LoopSignal::Aborted, step_outputs: Vec::new() }
    }
}

/// Executes the training step(s) for one batch
///
/// Collaborators are shared handles so the closures built per split can
/// re-enter them (an optimizer evaluating its closure runs the forward
/// step while the module is in scope). `current_epoch` and `global_step`
/// are owned by the outer loops and written here before each run.
pub struct TrainingBatchLoop {
    module: Rc<dyn TrainingModule>,
    accelerator: Rc<dyn Accelerator>,
    logger: Rc<dyn LoggerConnector>,
    profiler: Rc<dyn Profiler>,
    optimizers: Vec<Rc<RefCell<dyn Optimizer>>>,
    config: LoopConfig,

    /// Epoch index maintained by the outer epoch loop
    pub current_epoch: usize,
    /// Global optimizer-step count maintained by the outer loop
    pub global_step: usize,
    /// Running loss for display
    pub running_loss: RunningLoss,

    progress: Rc<RefCell<OptimizationProgress>>,
    hiddens: Rc<RefCell<Option<HiddenState>>>,
    batch_outputs: Vec<Vec<ClosureResult>>,
    remaining_splits: VecDeque<(usize, Batch)>,
    split_idx: Option<usize>,
    freq_cumsum: OnceCell<Vec<usize>>,
    warning_cache: WarningCache,
    skip_backward: bool,
    restarting: bool,
}

impl TrainingBatchLoop {
    /// Create a loop over the given collaborators
    pub fn new(
        module: Rc<dyn TrainingModule>,
        accelerator: Rc<dyn Accelerator>,
        logger: Rc<dyn LoggerConnector>,
        profiler: Rc<dyn Profiler>,
        optimizers: Vec<Rc<RefCell<dyn Optimizer>>>,
        config: LoopConfig,
    ) -> Result<Self> {
        config.validate()?;
        if module.automatic_optimization() && optimizers.is_empty() {
            return Err(LoopError::Misconfiguration(
                "automatic optimization requires at least one optimizer".to_string(),
            ));
        }
        if !config.optimizer_frequencies.is_empty()
            && config.optimizer_frequencies.len() != optimizers.len()
        {
            return Err(LoopError::Misconfiguration(format!(
                "got {} optimizer frequencies for {} optimizers",
                config.optimizer_frequencies.len(),
                optimizers.len()
            )));
        }

        Ok(Self {
            module,
            accelerator,
            logger,
            profiler,
            optimizers,
            config,
            current_epoch: 0,
            global_step: 0,
            running_loss: RunningLoss::default(),
            progress: Rc::new(RefCell::new(OptimizationProgress::default())),
            hiddens: Rc::new(RefCell::new(None)),
            batch_outputs: Vec::new(),
            remaining_splits: VecDeque::new(),
            split_idx: None,
            freq_cumsum: OnceCell::new(),
            warning_cache: WarningCache::new(),
            skip_backward: false,
            restarting: false,
        })
    }

    /// Run all splits of one batch together with the batch-start hooks
    ///
    /// `None` is the skip signal: a warning is emitted once and an empty
    /// output returned without firing any hooks. An `Abort` from either
    /// batch-start hook short-circuits the run before any split work.
    pub fn run(&mut self, batch: Option<&Batch>, batch_idx: usize) -> Result<BatchOutput> {
        let Some(batch) = batch else {
            self.warning_cache.warn(
                "train dataloader yielded an empty batch. If this was on purpose, \
                 ignore this warning",
            );
            return Ok(BatchOutput::skipped());
        };

        self.logger.on_batch_start();
        if self.module.on_batch_start() == HookSignal::Abort {
            return Ok(BatchOutput::aborted());
        }
        if self.module.on_train_batch_start(batch, batch_idx) == HookSignal::Abort {
            return Ok(BatchOutput::aborted());
        }

        self.reset();
        self.remaining_splits = self.tbptt_split(batch).into_iter().enumerate().collect();
        while !self.done() {
            self.advance(batch_idx)?;
        }
        self.restarting = false;

        // release the queue and hand the collected outputs to the caller
        self.remaining_splits = VecDeque::new();
        let step_outputs = std::mem::take(&mut self.batch_outputs);
        Ok(BatchOutput { signal: LoopSignal::Completed, step_outputs })
    }

    /// Whether all splits of the current batch have been processed
    pub fn done(&self) -> bool {
        self.remaining_splits.is_empty()
    }

    /// Index of the split currently (or last) processed
    pub fn split_idx(&self) -> Option<usize> {
        self.split_idx
    }

    /// Whether the current batch index falls inside an accumulation window
    pub fn should_accumulate(&self, batch_idx: usize) -> bool {
        (batch_idx + 1) % self.config.accumulate_grad_batches != 0
    }

    /// Snapshot of the optimization progress counters
    pub fn progress(&self) -> OptimizationProgress {
        *self.progress.borrow()
    }

    /// Install a progress snapshot and arm restart skipping
    ///
    /// On the next run, optimizer indices below the snapshot's
    /// `optimizer_idx` are skipped for the split being resumed.
    pub fn restore_progress(&mut self, progress: OptimizationProgress) {
        log::debug!("restoring optimization progress at optimizer_idx {}", progress.optimizer_idx);
        *self.progress.borrow_mut() = progress;
        self.restarting = true;
    }

    /// Whether the loop will resume from restored progress
    pub fn is_restarting(&self) -> bool {
        self.restarting
    }

    /// Skip the backward (and zero-grad) parts of built closures
    pub fn set_skip_backward(&mut self, skip: bool) {
        self.skip_backward = skip;
    }

    /// Whether backward is currently skipped
    pub fn skip_backward(&self) -> bool {
        self.skip_backward
    }

    /// Reset per-batch state: hidden carry-over and output buffers
    fn reset(&mut self) {
        *self.hiddens.borrow_mut() = None;
        let slots = if self.module.automatic_optimization() { self.optimizers.len() } else { 1 };
        self.batch_outputs = vec![Vec::new(); slots];
        self.split_idx = None;
    }

    /// Process the next split in FIFO order
    fn advance(&mut self, batch_idx: usize) -> Result<()> {
        let Some((split_idx, split)) = self.remaining_splits.pop_front() else {
            return Ok(());
        };
        self.split_idx = Some(split_idx);
        self.logger.on_train_split_start(batch_idx, split_idx, &split);

        if self.module.automatic_optimization() {
            for (opt_idx, optimizer) in self.get_active_optimizers(batch_idx) {
                if self.restarting && opt_idx < self.progress.borrow().optimizer_idx {
                    continue;
                }
                self.progress.borrow_mut().optimizer_idx = opt_idx;

                let result =
                    self.run_optimization(batch_idx, &split, Some(opt_idx), Some(&optimizer))?;
                if let Some(result) = result {
                    if let Some(outputs) = self.batch_outputs.get_mut(opt_idx) {
                        outputs.push(result);
                    }
                }
            }
        } else if let Some(result) = self.run_optimization(batch_idx, &split, None, None)? {
            if let Some(outputs) = self.batch_outputs.first_mut() {
                outputs.push(result);
            }
        }

        // restart skipping applies only to the split being resumed
        self.restarting = false;
        Ok(())
    }

    /// Compute the ordered split sequence for the batch
    ///
    /// Identity unless truncated BPTT is configured, in which case the
    /// split is delegated to the module. Always yields at least one split.
    fn tbptt_split(&self, batch: &Batch) -> Vec<Batch> {
        let steps = self.config.truncated_bptt_steps;
        if steps == 0 {
            return vec![batch.clone()];
        }
        let splits = profiled(&*self.profiler, "tbptt_split_batch", || {
            self.module.tbptt_split_batch(batch, steps)
        });
        if splits.is_empty() {
            vec![batch.clone()]
        } else {
            splits
        }
    }

    /// Fold a produced loss into the running loss tracker
    pub(crate) fn update_running_loss(&mut self, current_loss: Option<f32>) {
        if self.module.automatic_optimization() {
            if let Some(loss) = current_loss {
                self.running_loss.accumulate(loss);
            }
        }
        self.running_loss.fold_into_window(self.config.accumulate_grad_batches as f32);
    }

    pub(crate) fn module(&self) -> &dyn TrainingModule {
        &*self.module
    }

    pub(crate) fn config(&self) -> &LoopConfig {
        &self.config
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal collaborator stack for unit tests

    use super::*;
    use crate::closure::Closure;
    use crate::config::ClipAlgorithm;
    use crate::logging::NoopLogger;
    use crate::module::{MetricCollection, StepArgs, StepOutput};
    use crate::profiler::NoopProfiler;

    pub struct ConstantLossModule {
        pub automatic: bool,
    }

    impl TrainingModule for ConstantLossModule {
        fn automatic_optimization(&self) -> bool {
            self.automatic
        }

        fn training_step(&self, args: StepArgs<'_>) -> Result<StepOutput> {
            if self.automatic {
                Ok(StepOutput::Loss {
                    loss: 1.0 + args.batch_idx as f32,
                    metrics: MetricCollection::new(),
                    hiddens: None,
                })
            } else {
                Ok(StepOutput::Metrics { metrics: MetricCollection::new(), hiddens: None })
            }
        }
    }

    pub struct NullAccelerator;

    impl Accelerator for NullAccelerator {
        fn backward(&self, _loss: f32, _opt_idx: usize) -> Result<()> {
            Ok(())
        }

        fn zero_grad(&self, _epoch: usize, _batch_idx: usize, _opt_idx: usize) {}

        fn clip_gradients(&self, _opt_idx: usize, _clip_val: f32, _algorithm: ClipAlgorithm) {}
    }

    pub struct NullOptimizer;

    impl Optimizer for NullOptimizer {
        fn step(&mut self, closure: &mut Closure) -> Result<()> {
            closure.run()?;
            Ok(())
        }
    }

    pub fn loop_with(n_optimizers: usize, config: LoopConfig) -> TrainingBatchLoop {
        let optimizers: Vec<Rc<RefCell<dyn Optimizer>>> = (0..n_optimizers)
            .map(|_| Rc::new(RefCell::new(NullOptimizer)) as Rc<RefCell<dyn Optimizer>>)
            .collect();
        TrainingBatchLoop::new(
            Rc::new(ConstantLossModule { automatic: true }),
            Rc::new(NullAccelerator),
            Rc::new(NoopLogger),
            Rc::new(NoopProfiler),
            optimizers,
            config,
        )
        .expect("valid test configuration")
    }

    pub fn batch_of(rows: usize) -> Batch {
        Batch::new(ndarray::Array2::zeros((rows, 2)), ndarray::Array2::zeros((rows, 1)))
    }
}
