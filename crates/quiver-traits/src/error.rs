//! Error types for trait operations.

use thiserror::Error;

/// Common error type for trait operations.
#[derive(Debug, Error)]
pub enum TraitError {
    /// Resource already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Parse/deserialization error
    #[error("parse error: {0}")]
    ParseError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for TraitError {
    fn from(e: serde_json::Error) -> Self {
        TraitError::SerializationError(e.to_string())
    }
}
