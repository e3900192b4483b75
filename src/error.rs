//! Loop error types

use thiserror::Error;

/// Errors surfaced by the batch loop
///
/// Skip conditions (absent batch, aborted hooks, skipped optimization) are
/// not errors; they are represented as signal values in the loop output.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Invalid configuration or step output shape; fatal, no retry
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// Loss became NaN/Inf while the non-finite safeguard is enabled
    #[error("loss is not finite: {loss}")]
    NonFiniteLoss { loss: f32 },
}

/// Result type for loop operations
pub type Result<T> = std::result::Result<T, LoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_error_display() {
        let err = LoopError::Misconfiguration("bad frequencies".to_string());
        assert!(format!("{}", err).contains("misconfiguration"));
        assert!(format!("{}", err).contains("bad frequencies"));

        let err = LoopError::NonFiniteLoss { loss: f32::NAN };
        assert!(format!("{}", err).contains("not finite"));
    }
}
