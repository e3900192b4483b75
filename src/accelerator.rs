//! Hardware acceleration backend collaborator
//!
//! The backend physically executes forward, backward, zeroing, and
//! clipping. The loop treats every call as blocking; any device-side
//! asynchrony is the backend's concern.

use crate::config::ClipAlgorithm;
use crate::error::Result;
use crate::module::{StepArgs, StepOutput, TrainingModule};

/// Collaborator executing tensor work for the loop
pub trait Accelerator {
    /// Dispatch the forward step to the module on the device
    fn training_step(&self, module: &dyn TrainingModule, args: StepArgs<'_>) -> Result<StepOutput> {
        module.training_step(args)
    }

    /// Fired right after the forward step (e.g. device barriers)
    fn post_training_step(&self) {}

    /// Back-propagate through the loss for the given optimizer
    fn backward(&self, loss: f32, opt_idx: usize) -> Result<()>;

    /// Zero all gradients owned by the given optimizer
    fn zero_grad(&self, epoch: usize, batch_idx: usize, opt_idx: usize);

    /// Clip gradients of the given optimizer's parameters
    fn clip_gradients(&self, opt_idx: usize, clip_val: f32, algorithm: ClipAlgorithm);

    /// Stop synchronizing gradients across distributed replicas
    fn suspend_parallel_sync(&self) {}

    /// Resume cross-replica gradient synchronization
    fn resume_parallel_sync(&self) {}
}

/// Scope guard suppressing distributed gradient sync while accumulating
///
/// Synchronization resumes when the guard drops, so the cross-replica
/// reduce happens only on the step that actually updates parameters.
pub struct BlockedSync<'a> {
    accelerator: &'a dyn Accelerator,
}

impl<'a> BlockedSync<'a> {
    /// Suspend sync until the returned guard is dropped
    pub fn new(accelerator: &'a dyn Accelerator) -> Self {
        accelerator.suspend_parallel_sync();
        Self { accelerator }
    }
}

impl Drop for BlockedSync<'_> {
    fn drop(&mut self) {
        self.accelerator.resume_parallel_sync();
    }
}
