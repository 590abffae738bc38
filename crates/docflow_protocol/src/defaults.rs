//! Canonical default values shared by the orchestrator and repair engines.

pub const DEFAULT_MAX_CYCLES: u8 = 3;
pub const DEFAULT_DATA_ROOT: &str = "./data";
pub const DATA_DIR_ENV: &str = "DOCFLOW_DATA_DIR";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const AUDIT_LOG_FILE_NAME: &str = "audit.log.jsonl";
/// Hidden directory inside a unit holding inputs replaced by a repair.
pub const SUPERSEDED_DIR_NAME: &str = ".superseded";

// Converter
pub const DEFAULT_CONVERTER_BINARY: &str = "soffice";
pub const DEFAULT_CONVERTER_SLOTS: usize = 2;
pub const DEFAULT_CONVERSION_TIMEOUT_SECS: u64 = 300;

// Extractor
pub const DEFAULT_MAX_ARCHIVE_MEMBERS: usize = 1000;
pub const DEFAULT_MAX_UNPACKED_BYTES: u64 = 500 * 1024 * 1024;
pub const DEFAULT_MAX_COMPRESSION_RATIO: u64 = 100;
pub const DEFAULT_MAX_EXTRACTION_DEPTH: usize = 10;

// Retry
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

// Circuit breaker
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 60;
