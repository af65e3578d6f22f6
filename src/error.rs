//! Error types for the scatha recovery engine.
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are
//! terminal: recovery either completes with a full snapshot or fails with
//! one of these variants, never with a partial result.

use thiserror::Error;

/// Main error type for recovery operations.
#[derive(Debug, Error)]
pub enum ScathaError {
    /// The loaded image failed eager validation.
    #[error("malformed image: {reason}")]
    MalformedImage { reason: String },

    /// A phase exceeded the configured time budget.
    #[error("budget exceeded in {phase} after {elapsed_ms}ms")]
    BudgetExceeded { phase: &'static str, elapsed_ms: u64 },

    /// The image targets an architecture the decoder cannot handle.
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Snapshot serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ScathaError {
    fn from(err: serde_json::Error) -> Self {
        ScathaError::Serialization(err.to_string())
    }
}

/// Result type alias for recovery operations.
pub type Result<T> = std::result::Result<T, ScathaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ScathaError::MalformedImage {
            reason: "no loaded ranges".to_string(),
        };
        assert_eq!(err.to_string(), "malformed image: no loaded ranges");

        let err = ScathaError::BudgetExceeded {
            phase: "fixpoint",
            elapsed_ms: 4200,
        };
        assert_eq!(err.to_string(), "budget exceeded in fixpoint after 4200ms");
    }

    #[test]
    fn serde_json_error_converts() {
        let bad = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: ScathaError = bad.into();
        assert!(matches!(err, ScathaError::Serialization(_)));
    }
}
