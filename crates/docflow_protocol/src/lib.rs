//! Docflow protocol: canonical types shared by every crate.
//!
//! Holds the unit lifecycle vocabulary (states, cycles, file kinds, routes,
//! quarantine categories), the versioned manifest schema, the transition
//! table, the storage layout and pipeline configuration.

pub mod config;
pub mod defaults;
pub mod error;
pub mod idempotency;
pub mod ids;
pub mod layout;
pub mod manifest;
pub mod state;
pub mod transitions;
pub mod types;

pub use config::{BreakerConfig, ConverterConfig, ExtractorConfig, PipelineConfig, RetryConfig};
pub use error::{ProtocolError, Result};
pub use idempotency::{bytes_checksum, file_checksum, unit_fingerprint};
pub use ids::{BatchId, CorrelationId, IdParseError, UnitId};
pub use layout::{Layout, UnitRef};
pub use manifest::{
    ClassificationRecord, ErrorRecord, FileClassification, FileEntry, Manifest, MergeRecord,
    ProcessingSection, QuarantineRecord, SourceRecord, StateTraceEntry, Transformation,
    MANIFEST_SCHEMA_VERSION,
};
pub use state::{Cycle, State, StateKind};
pub use transitions::{StateMachine, TransitionTable};
pub use types::{
    ExceptionCategory, FileCategory, FileKind, MixedPolicy, OperationKind, Outcome, Route,
};
