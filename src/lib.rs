//! Single-batch training loop execution
//!
//! This crate orchestrates everything that happens inside one training
//! batch of a deep-learning loop:
//! - Batch splitting for truncated backpropagation through time
//! - Forward step dispatch through an accelerator backend
//! - Multi-optimizer scheduling with frequency-based rotation
//! - Gradient accumulation windows with zero/clip at the boundaries
//! - Deferred, memoized optimization closures
//! - Running loss tracking for display
//!
//! The model, accelerator, logger, and profiler are collaborators
//! expressed as traits; the loop is a pure in-process control-flow
//! engine between them.
//!
//! # Example
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use tanda::{LoopConfig, NoopLogger, NoopProfiler, Optimizer, TrainingBatchLoop};
//!
//! # fn collaborators() -> (Rc<dyn tanda::TrainingModule>, Rc<dyn tanda::Accelerator>, Rc<RefCell<dyn Optimizer>>) { todo!() }
//! let (module, accelerator, optimizer) = collaborators();
//! let mut batch_loop = TrainingBatchLoop::new(
//!     module,
//!     accelerator,
//!     Rc::new(NoopLogger),
//!     Rc::new(NoopProfiler),
//!     vec![optimizer],
//!     LoopConfig::default(),
//! )
//! .unwrap();
//!
//! // driven once per batch by the outer epoch loop
//! // let output = batch_loop.run(Some(&batch), batch_idx)?;
//! ```

pub mod accelerator;
pub mod batch;
pub mod batch_loop;
pub mod closure;
pub mod config;
pub mod error;
pub mod logging;
pub mod module;
pub mod optim;
pub mod profiler;
pub mod progress;
pub mod running_loss;

pub use accelerator::{Accelerator, BlockedSync};
pub use batch::Batch;
pub use batch_loop::{BatchOutput, LoopSignal, TrainingBatchLoop};
pub use closure::{Closure, ClosureResult};
pub use config::{AmpBackend, ClipAlgorithm, LoopConfig};
pub use error::{LoopError, Result};
pub use logging::{LoggerConnector, NoopLogger, WarningCache};
pub use module::{
    build_step_args, HiddenState, HookSignal, MetricCollection, StepArgs, StepFlags, StepOutput,
    TrainingModule,
};
pub use optim::{EvalStyle, LoggedOptimizer, Optimizer};
pub use profiler::{NoopProfiler, Profiler, RecordingProfiler};
pub use progress::{OptimizationProgress, OptimizerProgress, ReadyCompletedTracker};
pub use running_loss::RunningLoss;
