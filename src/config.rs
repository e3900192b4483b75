//! Batch loop configuration

use crate::error::{LoopError, Result};
use serde::{Deserialize, Serialize};

/// Gradient clipping algorithm applied at accumulation boundaries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipAlgorithm {
    /// Clip by global norm
    Norm,
    /// Clip element-wise by value
    Value,
}

/// Mixed-precision backend the accelerator runs under
///
/// Tagged explicitly so optimizer compatibility can be checked without
/// inspecting the optimizer's concrete type at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmpBackend {
    /// Full precision, no scaling
    None,
    /// Native automatic mixed precision with loss scaling
    Native,
    /// External mixed-precision library
    Apex,
}

/// Configuration for a single-batch training loop
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Number of batches over which gradients accumulate before a step
    pub accumulate_grad_batches: usize,

    /// Per-optimizer step frequencies; empty means every optimizer runs
    /// once per split
    pub optimizer_frequencies: Vec<usize>,

    /// Gradient clipping threshold; 0.0 disables clipping
    pub gradient_clip_val: f32,

    /// Algorithm used when `gradient_clip_val` is non-zero
    pub gradient_clip_algorithm: ClipAlgorithm,

    /// Norm order for gradient-norm tracking; `None` disables tracking
    pub track_grad_norm: Option<f32>,

    /// Gradient norms are logged every this many global steps
    pub log_every_n_steps: usize,

    /// Fail the run when a stepped loss is NaN/Inf
    pub terminate_on_non_finite: bool,

    /// Number of time steps per truncated-BPTT split; 0 disables splitting
    pub truncated_bptt_steps: usize,

    /// Mixed-precision backend in effect
    pub amp_backend: AmpBackend,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            accumulate_grad_batches: 1,
            optimizer_frequencies: Vec::new(),
            gradient_clip_val: 0.0,
            gradient_clip_algorithm: ClipAlgorithm::Norm,
            track_grad_norm: None,
            log_every_n_steps: 50,
            terminate_on_non_finite: false,
            truncated_bptt_steps: 0,
            amp_backend: AmpBackend::None,
        }
    }
}

impl LoopConfig {
    /// Validate configuration invariants
    pub fn validate(&self) -> Result<()> {
        if self.accumulate_grad_batches == 0 {
            return Err(LoopError::Misconfiguration(
                "accumulate_grad_batches must be at least 1".to_string(),
            ));
        }
        if self.optimizer_frequencies.iter().any(|&f| f == 0) {
            return Err(LoopError::Misconfiguration(
                "optimizer frequencies must be positive".to_string(),
            ));
        }
        if self.log_every_n_steps == 0 {
            return Err(LoopError::Misconfiguration(
                "log_every_n_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
