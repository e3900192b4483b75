//! Training module collaborator trait
//!
//! The module owns the per-step computation: the forward step, batch
//! splitting for truncated BPTT, optimizer parameter toggling, and the
//! hook callbacks the loop fires around a batch. All methods take `&self`
//! so that hooks may re-enter the module (an optimizer stepping a closure
//! invokes the forward step while the module is already borrowed);
//! implementations keep mutable state behind interior mutability.

use std::collections::BTreeMap;

use ndarray::Array1;

use crate::batch::Batch;
use crate::closure::Closure;
use crate::error::Result;
use crate::optim::LoggedOptimizer;

/// Carry-over state threaded between sequential splits (e.g. RNN state)
pub type HiddenState = Array1<f32>;

/// Loggable metrics produced by one training step
pub type MetricCollection = BTreeMap<String, f32>;

/// Outcome of a batch-level hook
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HookSignal {
    /// Proceed with the batch
    #[default]
    Continue,
    /// Abort the batch run immediately
    Abort,
}

/// Arguments assembled for one forward step
#[derive(Debug)]
pub struct StepArgs<'a> {
    /// The current batch split
    pub batch: &'a Batch,
    /// Index of the enclosing batch
    pub batch_idx: usize,
    /// Active optimizer index; `None` under manual optimization
    pub opt_idx: Option<usize>,
    /// Hidden state produced by the previous split, if any
    pub hiddens: Option<HiddenState>,
}

/// Build the argument bundle passed to the forward step
pub fn build_step_args<'a>(
    batch: &'a Batch,
    batch_idx: usize,
    opt_idx: Option<usize>,
    hiddens: Option<HiddenState>,
) -> StepArgs<'a> {
    StepArgs { batch, batch_idx, opt_idx, hiddens }
}

/// Output of one forward step
#[derive(Clone, Debug)]
pub enum StepOutput {
    /// Loss to minimize plus auxiliary metrics and optional hidden state
    Loss {
        loss: f32,
        metrics: MetricCollection,
        hiddens: Option<HiddenState>,
    },
    /// Metrics without a loss; only valid under manual optimization
    Metrics {
        metrics: MetricCollection,
        hiddens: Option<HiddenState>,
    },
    /// Skip optimization for this split/optimizer; a valid outcome
    Skip,
}

/// Device and precision flags forwarded to the optimizer-step hook
#[derive(Clone, Copy, Debug, Default)]
pub struct StepFlags {
    /// Native mixed precision with loss scaling is active
    pub using_native_amp: bool,
    /// The active optimizer evaluates its closure more than once
    pub using_multi_eval: bool,
}

/// Collaborator contract for the model being trained
pub trait TrainingModule {
    /// Whether the loop drives optimization (zero-grad, backward, step)
    ///
    /// When `false` the module performs its own optimization inside
    /// `training_step` and the loop only executes the closure.
    fn automatic_optimization(&self) -> bool {
        true
    }

    /// Run the forward computation for one split
    fn training_step(&self, args: StepArgs<'_>) -> Result<StepOutput>;

    /// Hook that may transform the step output before it is processed
    fn training_step_end(&self, output: StepOutput) -> Result<StepOutput> {
        Ok(output)
    }

    /// Split a batch into ordered sequence chunks for truncated BPTT
    fn tbptt_split_batch(&self, batch: &Batch, steps: usize) -> Vec<Batch> {
        batch.split_rows(steps)
    }

    /// Restrict trainable parameters to the given optimizer's scope
    fn toggle_optimizer(&self, _opt_idx: usize) {}

    /// Restore full trainable-parameter scope
    fn untoggle_optimizer(&self, _opt_idx: usize) {}

    /// Fired before any split processing; `Abort` cancels the batch
    fn on_batch_start(&self) -> HookSignal {
        HookSignal::Continue
    }

    /// Fired after `on_batch_start` with the batch; `Abort` cancels
    fn on_train_batch_start(&self, _batch: &Batch, _batch_idx: usize) -> HookSignal {
        HookSignal::Continue
    }

    /// Fired just before gradients are zeroed for the given optimizer
    fn on_before_zero_grad(&self, _opt_idx: usize) {}

    /// Per-parameter gradient norms for tracking; keyed by parameter name
    fn grad_norm(&self, _norm_type: f32) -> MetricCollection {
        MetricCollection::new()
    }

    /// Perform the optimizer step
    ///
    /// The closure computes the forward pass and gradients; some
    /// optimizers evaluate it internally (possibly more than once). The
    /// default delegates to the wrapped optimizer's own step.
    fn optimizer_step(
        &self,
        _epoch: usize,
        _batch_idx: usize,
        optimizer: &mut LoggedOptimizer<'_>,
        _opt_idx: usize,
        closure: &mut Closure,
        _flags: StepFlags,
    ) -> Result<()> {
        optimizer.step(closure)
    }
}
