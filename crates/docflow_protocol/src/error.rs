//! Error types for the protocol layer.

use crate::state::State;
use thiserror::Error;

/// Protocol operation result type.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A transition not present in the adjacency table. Always a bug.
    #[error("Invalid transition for unit {unit}: {from} -> {to}")]
    InvalidTransition { unit: String, from: State, to: State },

    /// Manifest schema problem (missing version, unknown major, bad shape)
    #[error("Schema error: {0}")]
    Schema(String),

    /// Configuration could not be parsed or is out of range
    #[error("Config error: {0}")]
    Config(String),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, ProtocolError::InvalidTransition { .. })
    }
}
