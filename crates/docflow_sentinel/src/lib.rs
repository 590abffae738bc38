//! Docflow Sentinel library
//!
//! The unit lifecycle orchestrator: classification, cycle bounding, error
//! policy and circuit breakers, quarantine routing, merging and the batch
//! driver tying them together.

pub mod circuit_breaker;
pub mod classifier;
pub mod cycle_manager;
pub mod error;
pub mod error_policy;
pub mod inventory;
pub mod merger;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod quarantine;
pub mod unit_io;
pub mod validator;

pub use circuit_breaker::{
    Admission, BreakerState, CircuitBreaker, CircuitBreakers, CircuitOpen, Clock, ManualClock,
    SystemClock,
};
pub use classifier::{Classifier, Decision, Target};
pub use cycle_manager::{AfterRepair, CycleManager, RepairAdmission};
pub use error::{PipelineError, Result};
pub use error_policy::{ErrorAction, ErrorKind, ErrorPolicy, Execution, Sleeper, ThreadSleeper};
pub use inventory::{Inventory, Misplaced, UnitRecord};
pub use merger::{MergeCollision, MergeReport, Merger};
pub use metrics::{MetricsRecorder, MetricsSnapshot, NoopMetrics, PipelineMetrics};
pub use monitor::{Monitor, StatusReport};
pub use pipeline::{BatchReport, Pipeline, Position, RunReport, UnitOutcome};
pub use quarantine::QuarantineRouter;
pub use validator::{UnitValidation, ValidationIssue, Validator};

use anyhow::Context;
use docflow_protocol::defaults::DATA_DIR_ENV;
use docflow_protocol::PipelineConfig;
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
#[command(
    name = "docflow-sentinel",
    about = "Drive document units through classification, repair and merge"
)]
pub struct SentinelArgs {
    /// Pipeline configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root of the storage namespaces (overrides the config file)
    #[arg(long, env = DATA_DIR_ENV)]
    pub data_root: Option<PathBuf>,

    /// Run date partition, YYYY-MM-DD
    #[arg(long)]
    pub date: Option<chrono::NaiveDate>,

    /// Number of worker threads (overrides the config file)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Only run the merger
    #[arg(long)]
    pub merge_only: bool,

    /// Print the layout status and exit
    #[arg(long, conflicts_with = "merge_only")]
    pub status: bool,

    /// Debug output on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

impl SentinelArgs {
    /// Configuration file (or defaults) with command line overrides applied.
    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(root) = &self.data_root {
            config.data_root = root.clone();
        }
        if let Some(date) = self.date {
            config.date = Some(date);
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_args_override_config() {
        let args = SentinelArgs::parse_from([
            "docflow-sentinel",
            "--data-root",
            "/srv/docflow",
            "--date",
            "2024-03-01",
            "--workers",
            "8",
        ]);
        let config = args.pipeline_config().unwrap();
        assert_eq!(config.data_root, PathBuf::from("/srv/docflow"));
        assert_eq!(config.workers, 8);
        assert_eq!(
            config.layout().root(),
            std::path::Path::new("/srv/docflow/2024-03-01")
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        let args = SentinelArgs::parse_from(["docflow-sentinel", "--workers", "0"]);
        assert!(args.pipeline_config().is_err());
    }
}
