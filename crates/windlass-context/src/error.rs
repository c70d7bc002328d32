//! Error types for context sizing and selection

use thiserror::Error;

/// Context engine error type
///
/// Exceeding the token budget is not an error: it is reported through the
/// `budget_exceeded` flag on `WindowSize` and `SelectionReport`.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Template rendering failed: {0}")]
    Render(String),

    #[error("Message {index} has {count} images but this model supports at most {limit} per message")]
    UnsupportedMultiImage {
        index: usize,
        count: usize,
        limit: usize,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<std::fmt::Error> for ContextError {
    fn from(err: std::fmt::Error) -> Self {
        Self::Render(err.to_string())
    }
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;
