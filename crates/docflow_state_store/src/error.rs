//! Error types for the manifest store.

use docflow_protocol::ProtocolError;
use thiserror::Error;

/// Store operation result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Manifest store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No manifest at the unit location
    #[error("Manifest not found: {0}")]
    NotFound(String),

    /// Manifest exists but cannot be used (corrupt, wrong version, wrong unit)
    #[error("Manifest schema error: {0}")]
    Schema(String),

    /// File referenced by an update is not part of the unit
    #[error("Unknown file in unit {unit}: {file}")]
    UnknownFile { unit: String, file: String },

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Lifecycle violation surfaced while mutating a manifest
    #[error(transparent)]
    Protocol(ProtocolError),
}

impl StoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Unreadable or mismatched manifests; callers treat these as anomalies.
    pub fn is_schema(&self) -> bool {
        matches!(self, StoreError::Schema(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<ProtocolError> for StoreError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Schema(msg) => StoreError::Schema(msg),
            ProtocolError::Serialization(e) => StoreError::Schema(e.to_string()),
            ProtocolError::Io(e) => StoreError::Io(e),
            other => StoreError::Protocol(other),
        }
    }
}
