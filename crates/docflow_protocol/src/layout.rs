//! Storage namespace layout.
//!
//! Where a unit lives is a pure function of its state (plus quarantine
//! category or route where the state needs one). Rescanning the layout and
//! reading manifests is enough to reconstruct pipeline state.

use crate::ids::UnitId;
use crate::manifest::Manifest;
use crate::state::{Cycle, State};
use crate::types::{ExceptionCategory, OperationKind, Route};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

pub const INPUT_DIR: &str = "Input";
pub const PROCESSING_DIR: &str = "Processing";
pub const MERGE_DIR: &str = "Merge";
pub const EXCEPTIONS_DIR: &str = "Exceptions";
pub const READY_DIR: &str = "Ready";
pub const STAGING_DIR: &str = ".staging";
pub const DIRECT_DIR: &str = "Direct";

/// A unit and the directory it currently lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitRef {
    pub id: UnitId,
    pub dir: PathBuf,
}

impl UnitRef {
    pub fn new(id: UnitId, dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            dir: dir.into(),
        }
    }

    /// Derive the unit id from the directory name.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Result<Self, crate::ids::IdParseError> {
        let dir = dir.into();
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let id = UnitId::parse(&name)?;
        Ok(Self { id, dir })
    }

    /// Same unit, new directory.
    pub fn moved_to(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            id: self.id.clone(),
            dir: dir.into(),
        }
    }
}

impl std::fmt::Display for UnitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.dir.display())
    }
}

/// Resolved directory layout for one data root (optionally date-partitioned).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(data_root: impl Into<PathBuf>, date: Option<NaiveDate>) -> Self {
        let data_root = data_root.into();
        let root = match date {
            Some(d) => data_root.join(d.format("%Y-%m-%d").to_string()),
            None => data_root,
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR)
    }

    pub fn processing_dir(&self, op: OperationKind, cycle: Cycle) -> PathBuf {
        self.root
            .join(PROCESSING_DIR)
            .join(format!("Processing_{}", cycle))
            .join(op.dir_name())
    }

    pub fn merge_direct_dir(&self) -> PathBuf {
        self.root.join(MERGE_DIR).join(DIRECT_DIR)
    }

    pub fn merge_processed_dir(&self, cycle: Cycle) -> PathBuf {
        self.root.join(MERGE_DIR).join(format!("Processed_{}", cycle))
    }

    pub fn exception_dir(&self, category: ExceptionCategory, cycle: Cycle) -> PathBuf {
        self.root
            .join(EXCEPTIONS_DIR)
            .join(format!("Cycle_{}", cycle))
            .join(category.dir_name())
    }

    pub fn ready_root(&self) -> PathBuf {
        self.root.join(READY_DIR)
    }

    pub fn ready_dir(&self, route: Route) -> PathBuf {
        self.ready_root().join(route.as_str())
    }

    /// Scratch area for merges in flight; never scanned as a namespace.
    pub fn staging_dir(&self) -> PathBuf {
        self.ready_root().join(STAGING_DIR)
    }

    /// Directory a unit in `state` rests in, `None` for transient states.
    ///
    /// `CLASSIFIED_n` is transient: the unit stays where it was until the
    /// recorded decision is acted on.
    pub fn location(
        &self,
        unit: &UnitId,
        state: State,
        category: Option<ExceptionCategory>,
        route: Option<Route>,
    ) -> Option<PathBuf> {
        let parent = match state {
            State::Raw => self.input_dir(),
            State::Classified(_) => return None,
            State::PendingConvert(c) => self.processing_dir(OperationKind::Convert, c),
            State::PendingExtract(c) => self.processing_dir(OperationKind::Extract, c),
            State::PendingNormalize(c) => self.processing_dir(OperationKind::Normalize, c),
            State::MergedDirect => self.merge_direct_dir(),
            State::MergedProcessed(c) => self.merge_processed_dir(c),
            State::Exception(c) => {
                self.exception_dir(category.unwrap_or(ExceptionCategory::Anomaly), c)
            }
            State::Ready => self.ready_dir(route.unwrap_or(Route::Mixed)),
        };
        Some(parent.join(unit.as_str()))
    }

    /// [`Layout::location`] driven by a manifest's own records.
    pub fn location_for(&self, manifest: &Manifest) -> Option<PathBuf> {
        let category = manifest.processing.quarantine.as_ref().map(|q| q.category);
        self.location(
            &manifest.unit_id,
            manifest.state,
            category,
            manifest.processing.route,
        )
    }

    /// Merger source sets: the direct set, then every cycle's processed set.
    pub fn merge_sources(&self, max_cycles: Cycle) -> Vec<(String, PathBuf)> {
        let mut sources = vec![("direct".to_string(), self.merge_direct_dir())];
        for n in 1..=max_cycles.get() {
            if let Ok(c) = Cycle::new(n) {
                sources.push((format!("processed_{}", c), self.merge_processed_dir(c)));
            }
        }
        sources
    }

    /// Every directory whose children are unit directories.
    pub fn unit_parents(&self, max_cycles: Cycle) -> Vec<PathBuf> {
        let mut dirs = vec![self.input_dir()];
        for n in 1..=max_cycles.get() {
            let Ok(c) = Cycle::new(n) else { continue };
            for op in OperationKind::ALL {
                dirs.push(self.processing_dir(op, c));
            }
            for category in ExceptionCategory::ALL {
                dirs.push(self.exception_dir(category, c));
            }
        }
        dirs.extend(self.merge_sources(max_cycles).into_iter().map(|(_, d)| d));
        for route in Route::ALL {
            dirs.push(self.ready_dir(route));
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(n: u8) -> Cycle {
        Cycle::new(n).unwrap()
    }

    #[test]
    fn test_location_is_deterministic() {
        let layout = Layout::new("/data", None);
        let unit = UnitId::parse("U1").unwrap();
        assert_eq!(
            layout.location(&unit, State::Raw, None, None).unwrap(),
            PathBuf::from("/data/Input/U1")
        );
        assert_eq!(
            layout
                .location(&unit, State::PendingConvert(c(2)), None, None)
                .unwrap(),
            PathBuf::from("/data/Processing/Processing_2/Convert/U1")
        );
        assert_eq!(
            layout
                .location(
                    &unit,
                    State::Exception(c(3)),
                    Some(ExceptionCategory::ConversionFailed),
                    None
                )
                .unwrap(),
            PathBuf::from("/data/Exceptions/Cycle_3/ConversionFailed/U1")
        );
        assert_eq!(
            layout
                .location(&unit, State::Ready, None, Some(Route::PdfText))
                .unwrap(),
            PathBuf::from("/data/Ready/pdf_text/U1")
        );
        assert!(layout
            .location(&unit, State::Classified(c(1)), None, None)
            .is_none());
    }

    #[test]
    fn test_date_partition() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 17).unwrap();
        let layout = Layout::new("/data", Some(date));
        assert_eq!(layout.input_dir(), PathBuf::from("/data/2025-03-17/Input"));
    }

    #[test]
    fn test_merge_sources_cover_every_cycle() {
        let layout = Layout::new("/d", None);
        let sources = layout.merge_sources(c(3));
        let names: Vec<&str> = sources.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["direct", "processed_1", "processed_2", "processed_3"]);
    }

    #[test]
    fn test_unit_parents_are_distinct() {
        let layout = Layout::new("/d", None);
        let parents = layout.unit_parents(c(2));
        let unique: std::collections::HashSet<_> = parents.iter().collect();
        assert_eq!(unique.len(), parents.len());
        assert!(!parents.contains(&layout.staging_dir()));
    }
}
