//! Docflow repair engines.
//!
//! Detection of true file kinds plus the three repairs a unit can need:
//! archive extraction, legacy office conversion and name normalization.
//! Engines only touch the unit directory they are given and describe every
//! change in the unit's manifest.

pub mod cancel;
pub mod converter;
pub mod detect;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod normalizer;

pub use cancel::CancellationToken;
pub use converter::{
    ConversionRequest, ConversionTool, Converter, ConverterPool, SlotLease, SofficeTool,
};
pub use detect::{detect_path, Detection};
pub use engine::{supersede, RepairEngine, RepairResult};
pub use error::{RepairError, Result};
pub use extractor::Extractor;
pub use normalizer::{normalized_name, Normalizer};
