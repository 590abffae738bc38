//! Orchestrator errors.

use docflow_protocol::ProtocolError;
use docflow_state_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A lifecycle invariant was violated. Aborts the batch.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Batch accounting does not add up
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Target directory already holds a different unit
    #[error("Location collision for unit {unit}: {path}")]
    Collision { unit: String, path: String },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Fatal errors stop the whole batch instead of one unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidTransition(_) | PipelineError::Integrity(_)
        )
    }
}

impl From<ProtocolError> for PipelineError {
    fn from(e: ProtocolError) -> Self {
        if e.is_invalid_transition() {
            PipelineError::InvalidTransition(e.to_string())
        } else {
            PipelineError::Protocol(e)
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Protocol(p) => p.into(),
            StoreError::Io(io) => PipelineError::Io(io),
            other => PipelineError::Store(other),
        }
    }
}
