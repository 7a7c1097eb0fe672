//! Error types for the Sonar data model

use thiserror::Error;

/// Errors raised while parsing or validating model values
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("Unknown level: {0}")]
    UnknownLevel(String),

    #[error("Invalid redaction pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<postcard::Error> for ModelError {
    fn from(e: postcard::Error) -> Self {
        ModelError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            ModelError::Deserialization(e.to_string())
        } else {
            ModelError::Serialization(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelError::InvalidVersion("1.x".into());
        assert_eq!(err.to_string(), "Invalid version string: 1.x");

        let err = ModelError::InvalidPattern {
            pattern: "(".into(),
            reason: "unclosed group".into(),
        };
        assert!(err.to_string().contains("unclosed group"));
    }

    #[test]
    fn test_json_syntax_error_is_deserialization() {
        let err: ModelError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert!(matches!(err, ModelError::Deserialization(_)));
    }
}
