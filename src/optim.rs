//! Loop-facing optimizer contract
//!
//! The loop never touches parameters directly; it hands each optimizer a
//! closure that computes the forward pass and gradients, and the
//! optimizer decides when (and how often) to evaluate it.

use std::cell::RefCell;

use crate::closure::Closure;
use crate::error::Result;
use crate::profiler::{profiled, Profiler};

/// How an optimizer consumes its closure
///
/// Checked against the mixed-precision backend at step time; declared as
/// a capability so no runtime type inspection is needed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EvalStyle {
    /// One closure evaluation per step
    #[default]
    Single,
    /// Multiple closure evaluations per step (line-search style)
    MultiEval,
}

/// Optimization algorithm driven by the batch loop
pub trait Optimizer {
    /// Perform one optimization step, evaluating the closure as needed
    fn step(&mut self, closure: &mut Closure) -> Result<()>;

    /// Closure evaluation capability of this algorithm
    fn eval_style(&self) -> EvalStyle {
        EvalStyle::Single
    }

    /// Name for diagnostics
    fn name(&self) -> &str {
        "optimizer"
    }
}

/// Logging-aware adapter wrapped around the raw optimizer for one step
///
/// Profiles the step (closure evaluations included) under
/// `optimizer_step_and_closure_{idx}`.
pub struct LoggedOptimizer<'a> {
    inner: &'a RefCell<dyn Optimizer>,
    profiler: &'a dyn Profiler,
    opt_idx: usize,
}

impl<'a> LoggedOptimizer<'a> {
    /// Wrap an optimizer for a single step invocation
    pub fn new(
        inner: &'a RefCell<dyn Optimizer>,
        profiler: &'a dyn Profiler,
        opt_idx: usize,
    ) -> Self {
        Self { inner, profiler, opt_idx }
    }

    /// Index of the wrapped optimizer
    pub fn opt_idx(&self) -> usize {
        self.opt_idx
    }

    /// Step the wrapped optimizer under a profiled phase
    pub fn step(&mut self, closure: &mut Closure) -> Result<()> {
        let action = format!("optimizer_step_and_closure_{}", self.opt_idx);
        profiled(self.profiler, &action, || self.inner.borrow_mut().step(closure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::ClosureResult;
    use crate::module::MetricCollection;
    use crate::profiler::RecordingProfiler;
    use std::rc::Rc;

    struct CountingOptimizer {
        evals_per_step: usize,
    }

    impl Optimizer for CountingOptimizer {
        fn step(&mut self, closure: &mut Closure) -> Result<()> {
            for _ in 0..self.evals_per_step {
                closure.run()?;
            }
            Ok(())
        }

        fn eval_style(&self) -> EvalStyle {
            if self.evals_per_step > 1 {
                EvalStyle::MultiEval
            } else {
                EvalStyle::Single
            }
        }
    }

    fn loss_closure() -> Closure {
        Closure::new(
            Box::new(|| {
                Ok(Some(ClosureResult {
                    closure_loss: Some(1.0),
                    loss: Some(1.0),
                    metrics: MetricCollection::new(),
                }))
            }),
            None,
            None,
            Rc::new(crate::profiler::NoopProfiler),
        )
    }

    #[test]
    fn test_logged_optimizer_profiles_step() {
        let optimizer: Rc<RefCell<dyn Optimizer>> =
            Rc::new(RefCell::new(CountingOptimizer { evals_per_step: 1 }));
        let profiler = RecordingProfiler::new();

        let mut closure = loss_closure();
        let mut logged = LoggedOptimizer::new(optimizer.as_ref(), &profiler, 3);
        logged.step(&mut closure).unwrap();

        assert_eq!(profiler.count("optimizer_step_and_closure_3"), 1);
        assert_eq!(logged.opt_idx(), 3);
    }

    #[test]
    fn test_multi_eval_reuses_memoized_closure() {
        let optimizer: Rc<RefCell<dyn Optimizer>> =
            Rc::new(RefCell::new(CountingOptimizer { evals_per_step: 3 }));

        let mut closure = loss_closure();
        let profiler = RecordingProfiler::new();
        let mut logged = LoggedOptimizer::new(optimizer.as_ref(), &profiler, 0);
        logged.step(&mut closure).unwrap();

        // three evaluations, one memoized result
        assert_eq!(closure.result().unwrap().loss, Some(1.0));
    }

    #[test]
    fn test_default_eval_style_is_single() {
        struct Plain;
        impl Optimizer for Plain {
            fn step(&mut self, _closure: &mut Closure) -> Result<()> {
                Ok(())
            }
        }
        assert_eq!(Plain.eval_style(), EvalStyle::Single);
        assert_eq!(Plain.name(), "optimizer");
    }
}
