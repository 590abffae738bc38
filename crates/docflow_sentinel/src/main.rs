//! Docflow Sentinel
//!
//! Runs one batch over a data root: ingest `Input/`, drive every unit to a
//! resting point, merge, report.
//!
//! Usage:
//!     docflow-sentinel --data-root /srv/docflow --date 2024-03-01 --workers 4

use anyhow::Context;
use clap::Parser;
use docflow_logging::{init_logging, LogConfig};
use docflow_sentinel::{Pipeline, PipelineMetrics, SentinelArgs};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let args = SentinelArgs::parse();
    init_logging(LogConfig {
        app_name: "docflow-sentinel",
        verbose: args.verbose,
        log_dir: None,
    })?;

    let config = args.pipeline_config()?;
    tracing::info!("Starting Docflow Sentinel");
    tracing::info!("  Data root: {}", config.layout().root().display());
    tracing::info!("  Max cycles: {}", config.max_cycles);
    tracing::info!("  Workers: {}", config.workers);

    let metrics = Arc::new(PipelineMetrics::new());
    let pipeline = Pipeline::new(config)
        .context("Failed to set up pipeline")?
        .with_metrics(metrics.clone());

    if args.status {
        let status = pipeline.status().context("Failed to read layout status")?;
        println!("{}", status.summary());
        return Ok(());
    }

    let report = pipeline.run(args.merge_only).context("Batch aborted")?;
    if let Some(batch) = &report.batch {
        tracing::info!("{}", batch.summary());
    }
    tracing::info!("{}", report.merge.summary());
    tracing::info!("{}", metrics.snapshot().summary());

    if !report.merge.is_clean() {
        anyhow::bail!(
            "merge finished with {} collisions and {} errors",
            report.merge.collisions.len(),
            report.merge.errors.len()
        );
    }
    Ok(())
}
