//! Merger / reconciler.
//!
//! Collects every merge-ready unit (the direct set and each cycle's
//! processed set) into `Ready/<route>/<unit>`. Each unit is copied to
//! `Ready/.staging`, finalized there (merge record, READY), renamed into
//! place and only then retired from its source. The output identity is the
//! unit id across every route: a unit already present anywhere in Ready with
//! the same fingerprint is reported as such, a different unit with the same
//! id is a collision and is never overwritten.

use crate::error::{PipelineError, Result};
use crate::error_policy::ErrorPolicy;
use crate::metrics::MetricsRecorder;
use crate::unit_io::{audit, copy_dir_all};
use chrono::Utc;
use docflow_protocol::{
    unit_fingerprint, CorrelationId, Layout, Manifest, MergeRecord, Route, State, StateMachine,
    UnitId, UnitRef,
};
use docflow_state_store::{AuditEvent, AuditEventType, ManifestStore};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Two distinct units claiming one unit id in Ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCollision {
    pub unit: UnitId,
    pub source: PathBuf,
    pub existing: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct MergeReport {
    pub merged: Vec<UnitId>,
    pub already_present: Vec<UnitId>,
    pub collisions: Vec<MergeCollision>,
    /// Source directory and what went wrong with it.
    pub errors: Vec<(PathBuf, String)>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.collisions.is_empty() && self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Merge: {} merged, {} already present, {} collisions, {} errors",
            self.merged.len(),
            self.already_present.len(),
            self.collisions.len(),
            self.errors.len()
        )
    }
}

enum Outcome {
    Merged,
    AlreadyPresent,
    Collision(PathBuf),
}

pub struct Merger {
    layout: Layout,
    machine: StateMachine,
    policy: ErrorPolicy,
    metrics: Arc<dyn MetricsRecorder>,
}

impl Merger {
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

    /// Merge every unit found under the labelled source directories.
    pub fn collect(
        &self,
        store: &ManifestStore,
        sources: &[(String, PathBuf)],
        correlation_id: &CorrelationId,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut claimed: BTreeMap<UnitId, PathBuf> = BTreeMap::new();

        for (label, source_dir) in sources {
            let units = match child_dirs(source_dir) {
                Ok(units) => units,
                Err(e) => {
                    report.errors.push((source_dir.clone(), e.to_string()));
                    continue;
                }
            };
            for dir in units {
                let unit = match UnitRef::from_dir(&dir) {
                    Ok(unit) => unit,
                    Err(e) => {
                        report.errors.push((dir, e.to_string()));
                        continue;
                    }
                };
                match self.merge_unit(store, &unit, label, &mut claimed, correlation_id) {
                    Ok(Outcome::Merged) => report.merged.push(unit.id),
                    Ok(Outcome::AlreadyPresent) => report.already_present.push(unit.id),
                    Ok(Outcome::Collision(existing)) => {
                        report.collisions.push(MergeCollision {
                            unit: unit.id,
                            source: dir,
                            existing,
                        });
                    }
                    Err(e) => {
                        error!(unit = %unit.id, source = %dir.display(), error = %e, "Merge failed");
                        report.errors.push((dir, e.to_string()));
                    }
                }
            }
        }

        self.count_resident(store, &mut report);
        info!("{}", report.summary());
        report
    }

    fn merge_unit(
        &self,
        store: &ManifestStore,
        unit: &UnitRef,
        label: &str,
        claimed: &mut BTreeMap<UnitId, PathBuf>,
        correlation_id: &CorrelationId,
    ) -> Result<Outcome> {
        let manifest = store.load(unit)?;
        if !manifest.state.is_merge_ready() {
            return Err(PipelineError::Integrity(format!(
                "unit {} in merge set has state {}",
                unit.id, manifest.state
            )));
        }
        let route = manifest.processing.route.ok_or_else(|| {
            PipelineError::Integrity(format!("unit {} has no route recorded", unit.id))
        })?;
        let fingerprint = unit_fingerprint(&manifest);
        let dest = self.layout.ready_dir(route).join(unit.id.as_str());

        if let Some(existing) = claimed.get(&unit.id) {
            return Ok(self.collision(unit, existing));
        }
        if let Some(existing) = self.resident(&unit.id) {
            let resident = store.load(&UnitRef::new(unit.id.clone(), &existing))?;
            if resident_fingerprint(&resident) == fingerprint {
                debug!(unit = %unit.id, dest = %existing.display(), "Unit already merged, retiring source");
                fs::remove_dir_all(&unit.dir)?;
                claimed.insert(unit.id.clone(), existing);
                return Ok(Outcome::AlreadyPresent);
            }
            return Ok(self.collision(unit, &existing));
        }

        let staging = self
            .layout
            .staging_dir()
            .join(format!("{}.{}", unit.id, Uuid::new_v4()));
        let result = self.stage_and_commit(store, unit, &staging, &dest, route, fingerprint, label);
        if result.is_err() && staging.exists() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %e, "Failed to clean up staging directory");
            }
        }
        let before = result?;

        fs::remove_dir_all(&unit.dir)?;
        claimed.insert(unit.id.clone(), dest.clone());
        audit(
            &self.policy,
            &dest,
            AuditEvent::new(unit.id.clone(), AuditEventType::Merge, correlation_id.clone())
                .states(before, State::Ready)
                .details(json!({ "route": route.as_str(), "source": label })),
        )?;
        self.metrics.unit_merged();
        info!(unit = %unit.id, route = %route, source = label, "Unit merged");
        Ok(Outcome::Merged)
    }

    /// Copy into staging, finalize the staged manifest and rename into place.
    #[allow(clippy::too_many_arguments)]
    fn stage_and_commit(
        &self,
        store: &ManifestStore,
        unit: &UnitRef,
        staging: &Path,
        dest: &Path,
        route: Route,
        fingerprint: String,
        label: &str,
    ) -> Result<State> {
        copy_dir_all(&unit.dir, staging)?;
        let staged = UnitRef::new(unit.id.clone(), staging);
        let before = store.update(&staged, |manifest| {
            let before = manifest.state;
            manifest.processing.merge = Some(MergeRecord {
                at: Utc::now(),
                route,
                fingerprint,
                source: label.to_string(),
            });
            self.machine
                .transition(manifest, State::Ready, &format!("merged from {}", label))?;
            Ok(before)
        })?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(staging, dest)?;
        Ok(before)
    }

    /// Where a unit with this id already rests in Ready, whatever its route.
    fn resident(&self, id: &UnitId) -> Option<PathBuf> {
        Route::ALL
            .into_iter()
            .map(|route| self.layout.ready_dir(route).join(id.as_str()))
            .find(|dir| dir.is_dir())
    }

    fn collision(&self, unit: &UnitRef, dest: &Path) -> Outcome {
        warn!(
            unit = %unit.id,
            source = %unit.dir.display(),
            existing = %dest.display(),
            "Merge collision, leaving source in place"
        );
        self.metrics.merge_collision();
        Outcome::Collision(dest.to_path_buf())
    }

    /// Count READY units that were merged by an earlier run.
    fn count_resident(&self, store: &ManifestStore, report: &mut MergeReport) {
        let mut seen: BTreeSet<UnitId> = report
            .merged
            .iter()
            .chain(report.already_present.iter())
            .cloned()
            .collect();

        for route in Route::ALL {
            let Ok(dirs) = child_dirs(&self.layout.ready_dir(route)) else {
                continue;
            };
            for dir in dirs {
                let Ok(unit) = UnitRef::from_dir(&dir) else {
                    continue;
                };
                if seen.contains(&unit.id) {
                    continue;
                }
                match store.load(&unit) {
                    Ok(m) if m.state == State::Ready => {
                        seen.insert(unit.id.clone());
                        report.already_present.push(unit.id);
                    }
                    Ok(m) => warn!(unit = %unit.id, state = %m.state, "Non-READY unit in Ready"),
                    Err(e) => warn!(unit = %unit.id, error = %e, "Unreadable manifest in Ready"),
                }
            }
        }
    }
}

fn resident_fingerprint(manifest: &Manifest) -> String {
    manifest
        .processing
        .merge
        .as_ref()
        .map(|m| m.fingerprint.clone())
        .unwrap_or_else(|| unit_fingerprint(manifest))
}

/// Non-hidden child directories, sorted by name. A missing parent is empty.
pub(crate) fn child_dirs(parent: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        dirs.push(entry.path());
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use docflow_protocol::Cycle;

    fn c(n: u8) -> Cycle {
        Cycle::new(n).unwrap()
    }

    fn merge_ready(layout: &Layout, store: &ManifestStore, id: &str, content: &[u8]) -> UnitRef {
        let dir = layout.merge_direct_dir().join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("doc.pdf"), content).unwrap();
        let unit = UnitRef::new(UnitId::parse(id).unwrap(), &dir);
        let machine = StateMachine::new(c(3));
        store.create(&unit, c(3), None).unwrap();
        store
            .update(&unit, |m| {
                machine.transition(m, State::Classified(c(1)), "t")?;
                machine.transition(m, State::MergedDirect, "t")?;
                m.processing.route = Some(Route::PdfText);
                Ok(())
            })
            .unwrap();
        unit
    }

    /// A unit converted in cycle 1 and merge-ready in cycle 2.
    fn processed_ready(
        layout: &Layout,
        store: &ManifestStore,
        id: &str,
        content: &[u8],
        route: Route,
    ) -> UnitRef {
        let dir = layout.merge_processed_dir(c(2)).join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("doc.docx"), content).unwrap();
        let unit = UnitRef::new(UnitId::parse(id).unwrap(), &dir);
        let machine = StateMachine::new(c(3));
        store.create(&unit, c(3), None).unwrap();
        store
            .update(&unit, |m| {
                machine.transition(m, State::Classified(c(1)), "t")?;
                machine.transition(m, State::PendingConvert(c(1)), "t")?;
                machine.transition(m, State::Classified(c(2)), "t")?;
                machine.transition(m, State::MergedProcessed(c(2)), "t")?;
                m.processing.route = Some(route);
                Ok(())
            })
            .unwrap();
        unit
    }

    fn merger(layout: &Layout) -> Merger {
        Merger::new(
            layout.clone(),
            StateMachine::new(c(3)),
            ErrorPolicy::default(),
            Arc::new(NoopMetrics),
        )
    }

    #[test]
    fn test_collect_merges_and_retires_source() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = Layout::new(tmp.path(), None);
        let store = ManifestStore::new();
        let unit = merge_ready(&layout, &store, "U1", b"%PDF-1.4 /Font");

        let report = merger(&layout).collect(
            &store,
            &layout.merge_sources(c(3)),
            &CorrelationId::new(),
        );
        assert_eq!(report.merged.len(), 1);
        assert!(report.is_clean());
        assert!(!unit.dir.exists());

        let dest = layout.ready_dir(Route::PdfText).join("U1");
        let manifest = store.load(&UnitRef::new(unit.id.clone(), &dest)).unwrap();
        assert_eq!(manifest.state, State::Ready);
        assert_eq!(manifest.processing.merge.unwrap().source, "direct");
        assert!(child_dirs(&layout.staging_dir()).unwrap().is_empty());
    }

    #[test]
    fn test_rerun_reports_already_present() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = Layout::new(tmp.path(), None);
        let store = ManifestStore::new();
        merge_ready(&layout, &store, "U1", b"%PDF-1.4 /Font");
        let m = merger(&layout);
        let sources = layout.merge_sources(c(3));

        m.collect(&store, &sources, &CorrelationId::new());
        let again = m.collect(&store, &sources, &CorrelationId::new());
        assert!(again.merged.is_empty());
        assert_eq!(again.already_present.len(), 1);
        assert_eq!(child_dirs(&layout.ready_dir(Route::PdfText)).unwrap().len(), 1);
    }

    #[test]
    fn test_different_unit_with_same_identity_collides() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = Layout::new(tmp.path(), None);
        let store = ManifestStore::new();
        let m = merger(&layout);
        let sources = layout.merge_sources(c(3));

        merge_ready(&layout, &store, "U1", b"%PDF-1.4 first");
        m.collect(&store, &sources, &CorrelationId::new());
        let second = merge_ready(&layout, &store, "U1", b"%PDF-1.4 second");

        let report = m.collect(&store, &sources, &CorrelationId::new());
        assert_eq!(report.collisions.len(), 1);
        assert!(second.dir.exists());
        let dest = layout.ready_dir(Route::PdfText).join("U1");
        assert_eq!(fs::read(dest.join("doc.pdf")).unwrap(), b"%PDF-1.4 first");
    }

    #[test]
    fn test_same_id_on_two_routes_merges_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = Layout::new(tmp.path(), None);
        let store = ManifestStore::new();
        merge_ready(&layout, &store, "U1", b"%PDF-1.4 direct");
        let processed = processed_ready(&layout, &store, "U1", b"PK docx", Route::Docx);

        let report = merger(&layout).collect(
            &store,
            &layout.merge_sources(c(3)),
            &CorrelationId::new(),
        );
        assert_eq!(report.merged.len(), 1);
        assert_eq!(report.collisions.len(), 1);
        assert_eq!(report.collisions[0].source, processed.dir);
        assert!(processed.dir.exists());

        let homes: Vec<Route> = Route::ALL
            .into_iter()
            .filter(|r| layout.ready_dir(*r).join("U1").exists())
            .collect();
        assert_eq!(homes, vec![Route::PdfText]);
    }

    #[test]
    fn test_same_unit_resident_under_other_route_is_already_present() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = Layout::new(tmp.path(), None);
        let store = ManifestStore::new();
        let m = merger(&layout);
        let sources = layout.merge_sources(c(3));

        merge_ready(&layout, &store, "U1", b"%PDF-1.4 same");
        m.collect(&store, &sources, &CorrelationId::new());

        // identical content resurfacing in a processed set under another route
        let again = processed_ready(&layout, &store, "U1", b"%PDF-1.4 same", Route::Docx);
        fs::rename(again.dir.join("doc.docx"), again.dir.join("doc.pdf")).unwrap();
        store
            .update(&again, |m| {
                m.files[0].current_name = "doc.pdf".to_string();
                m.files[0].original_name = "doc.pdf".to_string();
                Ok(())
            })
            .unwrap();

        let report = m.collect(&store, &sources, &CorrelationId::new());
        assert!(report.merged.is_empty());
        assert!(report.collisions.is_empty());
        assert_eq!(report.already_present, vec![again.id.clone()]);
        assert!(!again.dir.exists());
        assert!(!layout.ready_dir(Route::Docx).join("U1").exists());
    }
}
