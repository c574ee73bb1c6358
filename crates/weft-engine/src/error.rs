//! Error types for the execution engine.
//!
//! The variants follow the engine's error taxonomy: transport and conflict
//! errors are retryable; validation, expression, and timeout errors fail the
//! task or invocation they belong to; aborts are terminal decisions; internal
//! errors surface to the controller and count against its error budget.

/// The result type used throughout weft-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend or a runtime was unreachable.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An optimistic append failed because the expected sequence did not
    /// match; re-read and retry.
    #[error("sequence conflict on {aggregate}: expected {expected}, actual {actual}")]
    Conflict {
        /// The aggregate the append targeted.
        aggregate: String,
        /// The sequence the caller expected to write.
        expected: u64,
        /// The sequence the log actually holds.
        actual: u64,
    },

    /// The backend is temporarily down; retry with backoff.
    #[error("backend unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The event or operation is invalid for the aggregate's current state.
    #[error("precondition failed: {message}")]
    FailedPrecondition {
        /// Description of the violated precondition.
        message: String,
    },

    /// A spec was malformed.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// An expression failed to evaluate against its scope.
    #[error("failed to evaluate '{expression}': {message}")]
    ExpressionEval {
        /// The expression source text.
        expression: String,
        /// Description of the evaluation failure.
        message: String,
    },

    /// An expression referenced a binding the scope does not provide.
    #[error("unknown binding '{binding}' in '{expression}'")]
    UnknownBinding {
        /// The root binding that was not found.
        binding: String,
        /// The expression source text.
        expression: String,
    },

    /// A deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The scheduler or a user aborted the invocation.
    #[error("aborted: {reason}")]
    Aborted {
        /// Human-readable abort reason.
        reason: String,
    },

    /// The requested entity does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of what was missing.
        what: String,
    },

    /// An engine invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// An error from weft-core primitives.
    #[error(transparent)]
    Core(#[from] weft_core::Error),
}

impl Error {
    /// Creates a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new precondition error.
    #[must_use]
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a new abort error.
    #[must_use]
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Returns true if the operation may be retried (transport, conflict,
    /// and availability failures).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Conflict { .. } | Self::Unavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::transport("down").is_retryable());
        assert!(Error::Conflict {
            aggregate: "invocation/x".into(),
            expected: 3,
            actual: 4,
        }
        .is_retryable());
        assert!(Error::Unavailable {
            message: "maintenance".into()
        }
        .is_retryable());
    }

    #[test]
    fn non_retryable_kinds() {
        assert!(!Error::validation("bad spec").is_retryable());
        assert!(!Error::DeadlineExceeded.is_retryable());
        assert!(!Error::aborted("user cancel").is_retryable());
        assert!(!Error::internal("invariant").is_retryable());
    }

    #[test]
    fn deadline_display_matches_reason() {
        assert_eq!(Error::DeadlineExceeded.to_string(), "deadline exceeded");
    }

    #[test]
    fn core_errors_convert() {
        let core = weft_core::Error::serialization("boom");
        let err: Error = core.into();
        assert!(err.to_string().contains("boom"));
    }
}
