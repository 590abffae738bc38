//! Quarantine router.
//!
//! Places terminally failed or anomalous units into
//! `Exceptions/Cycle_<n>/<Category>/<unit>`. The bucket is a pure function
//! of category and cycle; the manifest records why the unit landed there.

use crate::error::Result;
use crate::error_policy::ErrorPolicy;
use crate::metrics::MetricsRecorder;
use crate::unit_io::{audit, move_unit};
use chrono::Utc;
use docflow_protocol::{
    CorrelationId, Cycle, ExceptionCategory, Layout, QuarantineRecord, State, StateMachine,
    UnitRef,
};
use docflow_state_store::{AuditEvent, AuditEventType, ManifestStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

pub struct QuarantineRouter {
    layout: Layout,
    machine: StateMachine,
    policy: ErrorPolicy,
    metrics: Arc<dyn MetricsRecorder>,
}

impl QuarantineRouter {
    pub fn new(
        layout: Layout,
        machine: StateMachine,
        policy: ErrorPolicy,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            layout,
            machine,
            policy,
            metrics,
        }
    }

    /// Bucket directory for `(category, cycle)`.
    pub fn route(&self, category: ExceptionCategory, cycle: Cycle) -> PathBuf {
        self.layout.exception_dir(category, cycle)
    }

    /// Record the quarantine, move the unit to `EXCEPTION_<cycle>` and into
    /// its bucket.
    ///
    /// The manifest is saved before the move, so a crash in between leaves a
    /// unit whose manifest already says where it belongs.
    pub fn quarantine(
        &self,
        store: &ManifestStore,
        unit: &UnitRef,
        category: ExceptionCategory,
        cycle: Cycle,
        reason: &str,
        correlation_id: &CorrelationId,
    ) -> Result<UnitRef> {
        let target = State::Exception(cycle);
        let (before, last_error) = store.update(unit, |manifest| {
            let before = manifest.state;
            manifest.processing.quarantine = Some(QuarantineRecord {
                category,
                cycle,
                reason: reason.to_string(),
                at: Utc::now(),
                errors: manifest.processing.errors.clone(),
            });
            self.machine.transition(manifest, target, reason)?;
            let last_error = manifest.processing.errors.last().map(|e| e.message.clone());
            Ok((before, last_error))
        })?;

        let dest = self.route(category, cycle).join(unit.id.as_str());
        let moved = move_unit(unit, &dest)?;

        warn!(
            unit = %unit.id,
            category = %category,
            cycle = %cycle,
            reason,
            error = last_error.as_deref().unwrap_or("-"),
            "Unit quarantined"
        );
        audit(
            &self.policy,
            &moved.dir,
            AuditEvent::new(unit.id.clone(), AuditEventType::Quarantine, correlation_id.clone())
                .states(before, target)
                .details(json!({
                    "category": category.as_str(),
                    "cycle": cycle.get(),
                    "reason": reason,
                })),
        )?;
        self.metrics.unit_quarantined(category);
        Ok(moved)
    }
}
