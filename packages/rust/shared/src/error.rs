//! Error types for ConceptForge.
//!
//! Library crates use [`ConceptForgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all ConceptForge operations.
#[derive(Debug, thiserror::Error)]
pub enum ConceptForgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Extraction precondition failure (missing course fields, session
    /// conflicts, unknown course/session ids).
    #[error("extraction error: {message}")]
    Extraction { message: String },

    /// Concept validation error (uniqueness or shape violations).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// LLM provider error: timeout, malformed response, retries exhausted.
    /// `operation` names the call site (e.g. "extract_concepts").
    #[error("llm error during {operation}: {message}")]
    Llm { operation: String, message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ConceptForgeError>;

impl ConceptForgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an extraction precondition error.
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an LLM error tagged with the failing operation.
    pub fn llm(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Llm {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ConceptForgeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ConceptForgeError::extraction("course has no notes");
        assert!(err.to_string().contains("course has no notes"));

        let err = ConceptForgeError::llm("extract_concepts", "timed out after 30s");
        assert_eq!(
            err.to_string(),
            "llm error during extract_concepts: timed out after 30s"
        );
    }
}
