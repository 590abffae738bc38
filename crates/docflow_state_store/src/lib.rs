//! Docflow state store: per-unit manifest persistence.
//!
//! The manifest is the single source of truth for a unit. This crate owns
//! reading it (with schema checks and migration), writing it atomically,
//! serializing mutations per unit, and the unit's audit log.

pub mod audit;
pub mod error;
pub mod files;
pub mod locks;
pub mod store;

pub use audit::{append_event, read_events, AuditEvent, AuditEventType};
pub use error::{Result, StoreError};
pub use files::list_unit_files;
pub use locks::UnitLocks;
pub use store::{manifest_path, write_atomic, ManifestStore, TransformationUpdate};
