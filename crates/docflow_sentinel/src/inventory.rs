//! Layout-wide inventory rebuilt from manifests alone.
//!
//! Used to resume after a crash and to feed the monitor. The scan never
//! mutates anything; it reports what it finds, including units present in
//! more than one namespace, units whose directory disagrees with their
//! manifest and units failing validation.

use crate::merger::child_dirs;
use crate::validator::{ValidationIssue, Validator};
use docflow_protocol::{Cycle, ExceptionCategory, Layout, State, UnitId, UnitRef};
use docflow_state_store::ManifestStore;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use tracing::{debug, warn};

/// One unit directory found during a scan.
#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub unit: UnitRef,
    /// `None` when there is no manifest yet or it cannot be read.
    pub state: Option<State>,
    pub category: Option<ExceptionCategory>,
    /// Why the manifest could not be read.
    pub error: Option<String>,
    /// Integrity problems of a readable manifest against its directory.
    pub issues: Vec<ValidationIssue>,
}

impl UnitRecord {
    /// Deposited but never ingested.
    pub fn is_fresh(&self) -> bool {
        self.state.is_none() && self.error.is_none()
    }

    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// Still owes the pipeline work: not terminal and not waiting for merge.
    pub fn needs_processing(&self) -> bool {
        match self.state {
            Some(state) => !state.is_terminal() && !state.is_merge_ready(),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Misplaced {
    pub unit: UnitId,
    pub found: PathBuf,
    pub expected: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct Inventory {
    pub units: Vec<UnitRecord>,
    /// Unit ids found in more than one directory.
    pub duplicates: BTreeMap<UnitId, Vec<PathBuf>>,
    pub misplaced: Vec<Misplaced>,
    /// Leftovers of interrupted merges under `Ready/.staging`.
    pub stale_staging: Vec<PathBuf>,
}

impl Inventory {
    pub fn scan(layout: &Layout, store: &ManifestStore, max_cycles: Cycle) -> io::Result<Self> {
        let mut inventory = Inventory::default();
        let mut seen: BTreeMap<UnitId, Vec<PathBuf>> = BTreeMap::new();
        let validator = Validator::new();

        for parent in layout.unit_parents(max_cycles) {
            for dir in child_dirs(&parent)? {
                let unit = match UnitRef::from_dir(&dir) {
                    Ok(unit) => unit,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "Skipping directory with invalid unit id");
                        continue;
                    }
                };
                seen.entry(unit.id.clone()).or_default().push(dir.clone());
                inventory.units.push(Self::inspect(
                    layout,
                    store,
                    &validator,
                    unit,
                    &mut inventory.misplaced,
                ));
            }
        }

        inventory.duplicates = seen.into_iter().filter(|(_, dirs)| dirs.len() > 1).collect();
        for (id, dirs) in &inventory.duplicates {
            warn!(unit = %id, copies = dirs.len(), "Unit found in more than one place");
        }

        let staging = layout.staging_dir();
        if staging.is_dir() {
            for entry in std::fs::read_dir(&staging)? {
                inventory.stale_staging.push(entry?.path());
            }
            inventory.stale_staging.sort();
        }

        debug!(
            units = inventory.units.len(),
            duplicates = inventory.duplicates.len(),
            misplaced = inventory.misplaced.len(),
            invalid = inventory.invalid().count(),
            "Inventory scan complete"
        );
        Ok(inventory)
    }

    fn inspect(
        layout: &Layout,
        store: &ManifestStore,
        validator: &Validator,
        unit: UnitRef,
        misplaced: &mut Vec<Misplaced>,
    ) -> UnitRecord {
        if !store.exists(&unit) {
            return UnitRecord {
                unit,
                state: None,
                category: None,
                error: None,
                issues: Vec::new(),
            };
        }
        match store.load(&unit) {
            Ok(manifest) => {
                if let Some(expected) = layout.location_for(&manifest) {
                    if expected != unit.dir {
                        warn!(
                            unit = %unit.id,
                            state = %manifest.state,
                            found = %unit.dir.display(),
                            expected = %expected.display(),
                            "Unit directory disagrees with manifest"
                        );
                        misplaced.push(Misplaced {
                            unit: unit.id.clone(),
                            found: unit.dir.clone(),
                            expected,
                        });
                    }
                }
                let issues = validator.validate_unit(&unit, &manifest).issues;
                UnitRecord {
                    unit,
                    state: Some(manifest.state),
                    category: manifest.processing.quarantine.map(|q| q.category),
                    error: None,
                    issues,
                }
            }
            Err(e) => UnitRecord {
                unit,
                state: None,
                category: None,
                error: Some(e.to_string()),
                issues: Vec::new(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units that still need the pipeline, in scan order.
    pub fn pending(&self) -> Vec<UnitRef> {
        self.units
            .iter()
            .filter(|r| r.needs_processing())
            .map(|r| r.unit.clone())
            .collect()
    }

    /// Units whose manifest and directory disagree.
    pub fn invalid(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.iter().filter(|r| !r.is_valid())
    }

    pub fn is_consistent(&self) -> bool {
        self.duplicates.is_empty() && self.misplaced.is_empty() && self.invalid().next().is_none()
    }
}
