//! Error types shared across weft crates.

/// The result type used throughout weft-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of the parse failure.
        message: String,
    },

    /// A function reference could not be parsed.
    #[error("invalid function reference '{reference}': {message}")]
    InvalidFunctionRef {
        /// The offending reference string.
        reference: String,
        /// Description of the parse failure.
        message: String,
    },

    /// An expression source string could not be parsed into a selector.
    #[error("failed to parse expression '{expression}': {message}")]
    ExpressionParse {
        /// The expression source text.
        expression: String,
        /// Description of the parse failure.
        message: String,
    },

    /// A value could not be serialized or deserialized.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl Error {
    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_display() {
        let err = Error::InvalidId {
            message: "not a ulid".into(),
        };
        assert!(err.to_string().contains("invalid identifier"));
    }

    #[test]
    fn expression_parse_display_carries_source() {
        let err = Error::ExpressionParse {
            expression: "$.Tasks.".into(),
            message: "trailing dot".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("$.Tasks."));
        assert!(msg.contains("trailing dot"));
    }
}
