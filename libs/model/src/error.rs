//! Error types for model parsing.

use thiserror::Error;

/// Errors that can occur when decoding service updates.
#[derive(Debug, Error, Clone)]
pub enum ModelError {
    /// The update could not be decoded.
    #[error("malformed service update: {0}")]
    Malformed(String),

    /// The update names no service.
    #[error("service update is missing a name")]
    MissingName,

    /// An instance in the update is unusable.
    #[error("invalid instance {name:?}: {reason}")]
    InvalidInstance { name: String, reason: String },
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Malformed(err.to_string())
    }
}
