//! Deferred, memoized optimization closure
//!
//! Bundles the step function with optional zero-grad and backward parts
//! into a single invokable unit an optimizer can call. The first
//! invocation computes and caches the result; repeat invocations return
//! the cached value without re-running the step.

use std::rc::Rc;

use crate::error::Result;
use crate::module::MetricCollection;
use crate::profiler::{profiled, Profiler};

/// Result of one closure execution
///
/// `loss` is the detached, accumulation-scaled loss kept for display;
/// `closure_loss` is the value fed to backward. Both are `None` under
/// manual optimization or when the step chose to skip.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClosureResult {
    /// Loss value passed to the backward function
    pub closure_loss: Option<f32>,
    /// Detached copy of the scaled loss, for display/tracking
    pub loss: Option<f32>,
    /// Loggable metrics produced by the step
    pub metrics: MetricCollection,
}

/// Step part of a closure; `None` result signals "skip optimization"
pub type StepFn = Box<dyn FnMut() -> Result<Option<ClosureResult>>>;
/// Zero-grad part; present only at accumulation-window boundaries
pub type ZeroGradFn = Box<dyn FnMut()>;
/// Backward part; absent under manual optimization or skip-backward
pub type BackwardFn = Box<dyn FnMut(f32) -> Result<()>>;

/// Memoizing deferred computation handed to the optimizer step
pub struct Closure {
    step_fn: StepFn,
    zero_grad_fn: Option<ZeroGradFn>,
    backward_fn: Option<BackwardFn>,
    profiler: Rc<dyn Profiler>,
    // Some(None) records a completed run whose step chose to skip
    result: Option<Option<ClosureResult>>,
}

impl Closure {
    /// Assemble a closure from its parts
    pub fn new(
        step_fn: StepFn,
        zero_grad_fn: Option<ZeroGradFn>,
        backward_fn: Option<BackwardFn>,
        profiler: Rc<dyn Profiler>,
    ) -> Self {
        Self { step_fn, zero_grad_fn, backward_fn, profiler, result: None }
    }

    /// Whether the zero-grad part is present
    pub fn has_zero_grad(&self) -> bool {
        self.zero_grad_fn.is_some()
    }

    /// Whether the backward part is present
    pub fn has_backward(&self) -> bool {
        self.backward_fn.is_some()
    }

    /// Execute zero-grad, step, and backward in order
    ///
    /// Returns the loss fed to backward, if any. A second invocation does
    /// not re-run the step; the memoized loss is returned instead. When
    /// the step yields no result (skip signal), backward is not invoked.
    pub fn run(&mut self) -> Result<Option<f32>> {
        if self.result.is_none() {
            if let Some(zero_grad) = self.zero_grad_fn.as_mut() {
                profiled(&*self.profiler, "zero_grad", || zero_grad());
            }
            let step_output = (self.step_fn)()?;
            if let Some(result) = &step_output {
                if let (Some(loss), Some(backward)) =
                    (result.closure_loss, self.backward_fn.as_mut())
                {
                    profiled(&*self.profiler, "backward", || backward(loss))?;
                }
            }
            self.result = Some(step_output);
        }
        Ok(self.cached().and_then(|r| r.closure_loss))
    }

    /// The memoized result, if the closure has run and did not skip
    pub fn result(&self) -> Option<&ClosureResult> {
        self.cached()
    }

    /// Consume the closure, yielding the memoized result
    pub fn into_result(self) -> Option<ClosureResult> {
        self.result.flatten()
    }

    fn cached(&self) -> Option<&ClosureResult> {
        self.result.as_ref().and_then(|r| r.as_ref())
    }
}
