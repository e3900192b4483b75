//! Logging collaborator and warn-once cache

use std::cell::RefCell;
use std::collections::HashSet;

use crate::batch::Batch;
use crate::module::MetricCollection;

/// Collaborator notified of batch/split boundaries and gradient norms
pub trait LoggerConnector {
    /// A new batch is starting
    fn on_batch_start(&self) {}

    /// A split is about to be processed
    fn on_train_split_start(&self, _batch_idx: usize, _split_idx: usize, _split: &Batch) {}

    /// Gradient norms computed after a completed accumulation window
    fn log_grad_norms(&self, _norms: &MetricCollection) {}
}

/// Logger that discards all notifications
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLogger;

impl LoggerConnector for NoopLogger {}

/// Emits each distinct warning message at most once per instance
#[derive(Debug, Default)]
pub struct WarningCache {
    seen: RefCell<HashSet<String>>,
}

impl WarningCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Warn through the `log` facade unless this message was seen before
    pub fn warn(&self, message: &str) {
        if self.seen.borrow_mut().insert(message.to_string()) {
            log::warn!("{message}");
        }
    }

    /// Whether the message has been emitted already
    pub fn contains(&self, message: &str) -> bool {
        self.seen.borrow().contains(message)
    }
}
