//! Pipeline configuration.

use crate::defaults::*;
use crate::error::{ProtocolError, Result};
use crate::layout::Layout;
use crate::state::Cycle;
use crate::types::MixedPolicy;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the storage namespaces
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Optional run date; partitions the layout under `<data_root>/<date>/`
    #[serde(default)]
    pub date: Option<NaiveDate>,

    /// Classify → repair iterations before a unit is quarantined
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u8,

    /// Number of worker threads driving units
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Handling of units whose files disagree on route family
    #[serde(default)]
    pub mixed_policy: MixedPolicy,

    #[serde(default)]
    pub converter: ConverterConfig,

    #[serde(default)]
    pub extractor: ExtractorConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Office converter executable
    #[serde(default = "default_converter_binary")]
    pub binary: String,

    /// Concurrent converter instances, each with its own profile directory
    #[serde(default = "default_converter_slots")]
    pub slots: usize,

    #[serde(default = "default_conversion_timeout")]
    pub timeout_secs: u64,

    /// Where slot profiles live; defaults to a directory under the data root
    #[serde(default)]
    pub profile_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "default_max_members")]
    pub max_members: usize,

    /// Total declared uncompressed size across all members
    #[serde(default = "default_max_unpacked_bytes")]
    pub max_unpacked_bytes: u64,

    /// Total uncompressed size divided by archive size
    #[serde(default = "default_max_ratio")]
    pub max_compression_ratio: u64,

    /// Archives inside this many levels of extraction output are refused
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_breaker_cooldown")]
    pub cooldown_secs: u64,
}

fn default_data_root() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_ROOT))
}

fn default_max_cycles() -> u8 {
    DEFAULT_MAX_CYCLES
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

fn default_converter_binary() -> String {
    DEFAULT_CONVERTER_BINARY.to_string()
}

fn default_converter_slots() -> usize {
    DEFAULT_CONVERTER_SLOTS
}

fn default_conversion_timeout() -> u64 {
    DEFAULT_CONVERSION_TIMEOUT_SECS
}

fn default_max_members() -> usize {
    DEFAULT_MAX_ARCHIVE_MEMBERS
}

fn default_max_unpacked_bytes() -> u64 {
    DEFAULT_MAX_UNPACKED_BYTES
}

fn default_max_ratio() -> u64 {
    DEFAULT_MAX_COMPRESSION_RATIO
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_EXTRACTION_DEPTH
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}

fn default_retry_initial_delay() -> u64 {
    DEFAULT_RETRY_INITIAL_DELAY_MS
}

fn default_retry_max_delay() -> u64 {
    DEFAULT_RETRY_MAX_DELAY_MS
}

fn default_retry_multiplier() -> f64 {
    DEFAULT_RETRY_MULTIPLIER
}

fn default_breaker_threshold() -> u32 {
    DEFAULT_BREAKER_THRESHOLD
}

fn default_breaker_cooldown() -> u64 {
    DEFAULT_BREAKER_COOLDOWN_SECS
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            binary: default_converter_binary(),
            slots: default_converter_slots(),
            timeout_secs: default_conversion_timeout(),
            profile_root: None,
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_members: default_max_members(),
            max_unpacked_bytes: default_max_unpacked_bytes(),
            max_compression_ratio: default_max_ratio(),
            max_depth: default_max_depth(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_delay_ms: default_retry_initial_delay(),
            max_delay_ms: default_retry_max_delay(),
            multiplier: default_retry_multiplier(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            cooldown_secs: default_breaker_cooldown(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            date: None,
            max_cycles: default_max_cycles(),
            workers: default_workers(),
            mixed_policy: MixedPolicy::default(),
            converter: ConverterConfig::default(),
            extractor: ExtractorConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl ConverterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig =
            toml::from_str(&content).map_err(|e| ProtocolError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ProtocolError::config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_cycles == 0 {
            return Err(ProtocolError::config("max_cycles must be at least 1"));
        }
        if self.workers == 0 {
            return Err(ProtocolError::config("workers must be at least 1"));
        }
        if self.converter.slots == 0 {
            return Err(ProtocolError::config("converter.slots must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ProtocolError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ProtocolError::config("retry.multiplier must be >= 1.0"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ProtocolError::config(
                "breaker.failure_threshold must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn max_cycles(&self) -> Cycle {
        Cycle::new(self.max_cycles).unwrap_or(Cycle::FIRST)
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.data_root, self.date)
    }

    /// Root directory for converter slot profiles.
    pub fn converter_profile_root(&self) -> PathBuf {
        self.converter
            .profile_root
            .clone()
            .unwrap_or_else(|| self.data_root.join(".converter_profiles"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_cycles, 3);
        assert!(config.workers > 0);
        assert_eq!(config.converter.timeout_secs, 300);
        assert_eq!(config.extractor.max_members, 1000);
        assert_eq!(config.extractor.max_depth, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.mixed_policy, MixedPolicy::Ambiguous);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            data_root = "/srv/docs"
            date = "2025-01-31"
            mixed_policy = "accept"

            [converter]
            slots = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.data_root, PathBuf::from("/srv/docs"));
        assert_eq!(config.converter.slots, 4);
        assert_eq!(config.converter.binary, "soffice");
        assert_eq!(config.mixed_policy, MixedPolicy::Accept);
        assert_eq!(
            config.layout().input_dir(),
            PathBuf::from("/srv/docs/2025-01-31/Input")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("docflow.toml");
        let mut config = PipelineConfig::default();
        config.data_root = dir.path().join("data");
        config.max_cycles = 2;
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.max_cycles(), Cycle::new(2).unwrap());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "max_cycles = 0\n").unwrap();
        assert!(matches!(
            PipelineConfig::load(&path).unwrap_err(),
            ProtocolError::Config(_)
        ));
    }
}
