//! Metrics for observability.
//!
//! The pipeline reports through the [`MetricsRecorder`] trait so tests and
//! embedders can swap in their own collector. [`PipelineMetrics`] keeps
//! lock-free counters and renders them as a summary line or in Prometheus
//! exposition format; [`NoopMetrics`] discards everything.

use docflow_protocol::{ExceptionCategory, OperationKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Sink for pipeline events. Implementations must be cheap and never fail.
pub trait MetricsRecorder: Send + Sync {
    fn unit_ingested(&self);
    fn unit_classified(&self);
    fn repair_started(&self, op: OperationKind);
    fn repair_succeeded(&self, op: OperationKind);
    fn repair_failed(&self, op: OperationKind);
    fn repair_retried(&self, op: OperationKind);
    fn circuit_rejected(&self, op: OperationKind);
    fn unit_quarantined(&self, category: ExceptionCategory);
    fn unit_merged(&self);
    fn merge_collision(&self);
    fn record_unit_time(&self, start: Instant);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn unit_ingested(&self) {}
    fn unit_classified(&self) {}
    fn repair_started(&self, _op: OperationKind) {}
    fn repair_succeeded(&self, _op: OperationKind) {}
    fn repair_failed(&self, _op: OperationKind) {}
    fn repair_retried(&self, _op: OperationKind) {}
    fn circuit_rejected(&self, _op: OperationKind) {}
    fn unit_quarantined(&self, _category: ExceptionCategory) {}
    fn unit_merged(&self) {}
    fn merge_collision(&self) {}
    fn record_unit_time(&self, _start: Instant) {}
}

/// Counters for one repair operation.
#[derive(Debug, Default)]
struct OperationCounters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
}

/// Pipeline metrics - all fields are atomic for thread-safe access
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    units_ingested: AtomicU64,
    units_classified: AtomicU64,
    units_quarantined: AtomicU64,
    units_merged: AtomicU64,
    merge_collisions: AtomicU64,
    quarantined_by_category: [AtomicU64; 8],
    operations: [OperationCounters; 3],
    // cumulative microseconds for averaging
    unit_time_us: AtomicU64,
    units_timed: AtomicU64,
}

fn op_index(op: OperationKind) -> usize {
    match op {
        OperationKind::Convert => 0,
        OperationKind::Extract => 1,
        OperationKind::Normalize => 2,
    }
}

fn category_index(category: ExceptionCategory) -> usize {
    ExceptionCategory::ALL
        .iter()
        .position(|c| *c == category)
        .unwrap_or(0)
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn op(&self, op: OperationKind) -> &OperationCounters {
        &self.operations[op_index(op)]
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let ops = OperationKind::ALL.map(|op| {
            let c = self.op(op);
            OperationSnapshot {
                operation: op,
                started: c.started.load(Ordering::Relaxed),
                succeeded: c.succeeded.load(Ordering::Relaxed),
                failed: c.failed.load(Ordering::Relaxed),
                retried: c.retried.load(Ordering::Relaxed),
                rejected: c.rejected.load(Ordering::Relaxed),
            }
        });
        let quarantined_by_category = ExceptionCategory::ALL.map(|category| {
            (
                category,
                self.quarantined_by_category[category_index(category)].load(Ordering::Relaxed),
            )
        });
        MetricsSnapshot {
            units_ingested: self.units_ingested.load(Ordering::Relaxed),
            units_classified: self.units_classified.load(Ordering::Relaxed),
            units_quarantined: self.units_quarantined.load(Ordering::Relaxed),
            units_merged: self.units_merged.load(Ordering::Relaxed),
            merge_collisions: self.merge_collisions.load(Ordering::Relaxed),
            quarantined_by_category: quarantined_by_category.to_vec(),
            operations: ops.to_vec(),
            unit_time_us: self.unit_time_us.load(Ordering::Relaxed),
            units_timed: self.units_timed.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            r#"# HELP docflow_units_ingested_total Units picked up from the input namespace
# TYPE docflow_units_ingested_total counter
docflow_units_ingested_total {}

# HELP docflow_units_classified_total Classification passes completed
# TYPE docflow_units_classified_total counter
docflow_units_classified_total {}

# HELP docflow_units_merged_total Units moved into the ready namespace
# TYPE docflow_units_merged_total counter
docflow_units_merged_total {}

# HELP docflow_merge_collisions_total Merge attempts refused because the output already belonged to another unit
# TYPE docflow_merge_collisions_total counter
docflow_merge_collisions_total {}

# HELP docflow_unit_time_microseconds_total Cumulative per-unit processing time in microseconds
# TYPE docflow_unit_time_microseconds_total counter
docflow_unit_time_microseconds_total {}

# HELP docflow_units_quarantined_total Units placed into an exception bucket
# TYPE docflow_units_quarantined_total counter
"#,
            s.units_ingested, s.units_classified, s.units_merged, s.merge_collisions, s.unit_time_us,
        );
        for (category, count) in &s.quarantined_by_category {
            out.push_str(&format!(
                "docflow_units_quarantined_total{{category=\"{}\"}} {}\n",
                category.dir_name(),
                count
            ));
        }
        out.push_str(
            "\n# HELP docflow_repairs_total Repair attempts by operation and outcome\n\
             # TYPE docflow_repairs_total counter\n",
        );
        for op in &s.operations {
            for (outcome, count) in [
                ("started", op.started),
                ("succeeded", op.succeeded),
                ("failed", op.failed),
                ("retried", op.retried),
                ("rejected", op.rejected),
            ] {
                out.push_str(&format!(
                    "docflow_repairs_total{{operation=\"{}\",outcome=\"{}\"}} {}\n",
                    op.operation, outcome, count
                ));
            }
        }
        out
    }
}

impl MetricsRecorder for PipelineMetrics {
    #[inline]
    fn unit_ingested(&self) {
        self.units_ingested.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn unit_classified(&self) {
        self.units_classified.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn repair_started(&self, op: OperationKind) {
        self.op(op).started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn repair_succeeded(&self, op: OperationKind) {
        self.op(op).succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn repair_failed(&self, op: OperationKind) {
        self.op(op).failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn repair_retried(&self, op: OperationKind) {
        self.op(op).retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn circuit_rejected(&self, op: OperationKind) {
        self.op(op).rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn unit_quarantined(&self, category: ExceptionCategory) {
        self.units_quarantined.fetch_add(1, Ordering::Relaxed);
        self.quarantined_by_category[category_index(category)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn unit_merged(&self) {
        self.units_merged.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn merge_collision(&self) {
        self.merge_collisions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record per-unit timing in microseconds
    #[inline]
    fn record_unit_time(&self, start: Instant) {
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.unit_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
        self.units_timed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters of one repair operation at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSnapshot {
    pub operation: OperationKind,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub rejected: u64,
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub units_ingested: u64,
    pub units_classified: u64,
    pub units_quarantined: u64,
    pub units_merged: u64,
    pub merge_collisions: u64,
    pub quarantined_by_category: Vec<(ExceptionCategory, u64)>,
    pub operations: Vec<OperationSnapshot>,
    pub unit_time_us: u64,
    pub units_timed: u64,
}

impl MetricsSnapshot {
    pub fn operation(&self, op: OperationKind) -> Option<&OperationSnapshot> {
        self.operations.iter().find(|o| o.operation == op)
    }

    /// Calculate average per-unit processing time in milliseconds
    pub fn avg_unit_time_ms(&self) -> f64 {
        if self.units_timed == 0 {
            0.0
        } else {
            (self.unit_time_us as f64 / self.units_timed as f64) / 1000.0
        }
    }

    /// Share of ingested units that were merged, in percent.
    pub fn merged_pct(&self) -> f64 {
        percent(self.units_merged, self.units_ingested)
    }

    /// Share of ingested units that were quarantined, in percent.
    pub fn quarantined_pct(&self) -> f64 {
        percent(self.units_quarantined, self.units_ingested)
    }

    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        let repairs: Vec<String> = self
            .operations
            .iter()
            .map(|o| format!("{} {}/{}", o.operation, o.succeeded, o.started))
            .collect();
        format!(
            "Units: {} ingested, {} merged ({:.1}%), {} quarantined ({:.1}%) | \
             Repairs: {} | Avg unit: {:.2}ms",
            self.units_ingested,
            self.units_merged,
            self.merged_pct(),
            self.units_quarantined,
            self.quarantined_pct(),
            repairs.join(", "),
            self.avg_unit_time_ms(),
        )
    }
}

pub(crate) fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
