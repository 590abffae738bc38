//! Unit classification.
//!
//! Looks at what every active file really is and decides where the unit
//! goes next: straight to merge, to one repair engine, or to quarantine.
//! The decision is a pure function of the detected files and the mixed-unit
//! policy; persisting it and moving the unit is the pipeline's job.

use chrono::Utc;
use docflow_protocol::{
    file_checksum, ClassificationRecord, ExceptionCategory, FileCategory, FileClassification,
    FileEntry, Manifest, MixedPolicy, OperationKind, Route, State,
};
use docflow_state_store::list_unit_files;
use docflow_worker::{detect_path, normalized_name};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Where the classifier sends a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Merge,
    Repair(OperationKind),
    Quarantine(ExceptionCategory),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub target: Target,
    pub route: Option<Route>,
    pub reason: String,
    pub files: Vec<FileClassification>,
}

impl Decision {
    /// Manifest record of this decision once the target state is known.
    pub fn record(&self, manifest: &Manifest, target_state: State) -> ClassificationRecord {
        ClassificationRecord {
            cycle: manifest.current_cycle,
            at: Utc::now(),
            route: self.route,
            target: target_state,
            category: match self.target {
                Target::Quarantine(category) => Some(category),
                _ => None,
            },
            reason: self.reason.clone(),
            files: self.files.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    mixed_policy: MixedPolicy,
}

impl Classifier {
    pub fn new(mixed_policy: MixedPolicy) -> Self {
        Self { mixed_policy }
    }

    pub fn mixed_policy(&self) -> MixedPolicy {
        self.mixed_policy
    }

    /// Add files present on disk but unknown to the manifest.
    ///
    /// Returns the number of entries added. Manifest entries whose file has
    /// vanished are reported but kept; they fail detection and push the unit
    /// to Ambiguous.
    pub fn sync_inventory(&self, dir: &Path, manifest: &mut Manifest) -> std::io::Result<usize> {
        let on_disk = list_unit_files(dir)?;
        let known: BTreeSet<String> = manifest
            .active_files()
            .map(|f| f.current_name.clone())
            .collect();

        let mut added = 0;
        for name in &on_disk {
            if known.contains(name) {
                continue;
            }
            let path = dir.join(name);
            let size = fs::metadata(&path)?.len();
            manifest
                .files
                .push(FileEntry::new(name.clone(), file_checksum(&path)?, size));
            debug!(unit = %manifest.unit_id, file = %name, "Inventoried new file");
            added += 1;
        }

        let on_disk: BTreeSet<&String> = on_disk.iter().collect();
        for missing in known.iter().filter(|n| !on_disk.contains(n)) {
            warn!(unit = %manifest.unit_id, file = %missing, "File in manifest is missing on disk");
        }
        Ok(added)
    }

    /// Detect every active file and refresh its kind and processing flag.
    pub fn detect_files(&self, dir: &Path, manifest: &mut Manifest) -> Vec<FileClassification> {
        let unit = manifest.unit_id.clone();
        manifest
            .active_files_mut()
            .map(|entry| {
                let (kind, needs_processing, detail) =
                    match detect_path(&dir.join(&entry.current_name)) {
                        Ok(d) => (d.kind, d.needs_processing, d.detail),
                        Err(e) => {
                            warn!(unit = %unit, file = %entry.current_name, error = %e, "Detection failed");
                            (
                                docflow_protocol::FileKind::Unknown,
                                false,
                                Some(format!("detection failed: {}", e)),
                            )
                        }
                    };
                entry.kind = kind;
                entry.needs_processing = needs_processing;

                let mut category = kind.base_category();
                if category == FileCategory::Direct
                    && normalized_name(&entry.current_name, kind).is_some()
                {
                    category = FileCategory::Normalize;
                }
                FileClassification {
                    name: entry.current_name.clone(),
                    kind,
                    category,
                    needs_processing,
                    detail,
                }
            })
            .collect()
    }

    /// Classify the unit in `dir`, refreshing the manifest's file records.
    pub fn classify(&self, dir: &Path, manifest: &mut Manifest) -> std::io::Result<Decision> {
        self.sync_inventory(dir, manifest)?;
        let files = self.detect_files(dir, manifest);
        let decision = self.decide(files);
        info!(
            unit = %manifest.unit_id,
            cycle = %manifest.current_cycle,
            target = ?decision.target,
            route = ?decision.route,
            "Classified unit"
        );
        Ok(decision)
    }

    /// Decide from per-file classifications alone.
    pub fn decide(&self, files: Vec<FileClassification>) -> Decision {
        let names_in = |category: FileCategory| -> Vec<&str> {
            files
                .iter()
                .filter(|f| f.category == category)
                .map(|f| f.name.as_str())
                .collect()
        };

        let (target, route, reason) = {
            let unknown = names_in(FileCategory::Unknown);
            let special = names_in(FileCategory::Special);
            let usable = files
                .iter()
                .filter(|f| f.category != FileCategory::Empty)
                .count();

            if !unknown.is_empty() {
                (
                    Target::Quarantine(ExceptionCategory::Ambiguous),
                    None,
                    format!("undetermined content: {}", unknown.join(", ")),
                )
            } else if usable == 0 {
                (
                    Target::Quarantine(ExceptionCategory::Empty),
                    None,
                    "no usable files".to_string(),
                )
            } else if !special.is_empty() {
                (
                    Target::Quarantine(ExceptionCategory::Special),
                    None,
                    format!("unsupported files: {}", special.join(", ")),
                )
            } else if let Some((op, names)) = [
                (OperationKind::Extract, FileCategory::Extract),
                (OperationKind::Convert, FileCategory::Convert),
                (OperationKind::Normalize, FileCategory::Normalize),
            ]
            .into_iter()
            .map(|(op, category)| (op, names_in(category)))
            .find(|(_, names)| !names.is_empty())
            {
                (
                    Target::Repair(op),
                    None,
                    format!("{} needed: {}", op, names.join(", ")),
                )
            } else {
                self.route_direct(&files)
            }
        };

        Decision {
            target,
            route,
            reason,
            files,
        }
    }

    /// Every remaining file is directly consumable; pick the unit route.
    fn route_direct(&self, files: &[FileClassification]) -> (Target, Option<Route>, String) {
        let routes: Vec<Route> = files
            .iter()
            .filter_map(|f| f.kind.route(f.needs_processing))
            .collect();
        let families: BTreeSet<Route> = routes.iter().map(|r| r.family()).collect();

        match families.len() {
            0 => (
                Target::Quarantine(ExceptionCategory::Empty),
                None,
                "no routable files".to_string(),
            ),
            1 => {
                // a scanned page anywhere makes the whole family need OCR
                let route = if routes.contains(&Route::PdfScan) {
                    Route::PdfScan
                } else {
                    routes[0]
                };
                (Target::Merge, Some(route), format!("all files route to {}", route))
            }
            _ => {
                let list = families
                    .iter()
                    .map(|r| r.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                match self.mixed_policy {
                    MixedPolicy::Ambiguous => (
                        Target::Quarantine(ExceptionCategory::Ambiguous),
                        None,
                        format!("mixed unit not resolvable by repair: {}", list),
                    ),
                    MixedPolicy::Mixed => (
                        Target::Quarantine(ExceptionCategory::Mixed),
                        None,
                        format!("mixed unit: {}", list),
                    ),
                    MixedPolicy::Accept => (
                        Target::Merge,
                        Some(Route::Mixed),
                        format!("mixed unit accepted: {}", list),
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_protocol::{Cycle, FileKind, UnitId};
    use tempfile::TempDir;

    fn file(name: &str, kind: FileKind) -> FileClassification {
        let mut category = kind.base_category();
        if category == FileCategory::Direct && normalized_name(name, kind).is_some() {
            category = FileCategory::Normalize;
        }
        FileClassification {
            name: name.to_string(),
            kind,
            category,
            needs_processing: kind.is_image(),
            detail: None,
        }
    }

    fn decide(policy: MixedPolicy, files: Vec<FileClassification>) -> Decision {
        Classifier::new(policy).decide(files)
    }

    #[test]
    fn test_direct_pdf_merges() {
        let d = decide(MixedPolicy::Ambiguous, vec![file("a.pdf", FileKind::Pdf)]);
        assert_eq!(d.target, Target::Merge);
        assert_eq!(d.route, Some(Route::PdfText));
    }

    #[test]
    fn test_repair_priority() {
        let d = decide(
            MixedPolicy::Ambiguous,
            vec![
                file("a.doc", FileKind::Doc),
                file("b.zip", FileKind::Zip),
                file("c.docx", FileKind::Pdf),
            ],
        );
        assert_eq!(d.target, Target::Repair(OperationKind::Extract));

        let d = decide(
            MixedPolicy::Ambiguous,
            vec![file("a.doc", FileKind::Doc), file("c.docx", FileKind::Pdf)],
        );
        assert_eq!(d.target, Target::Repair(OperationKind::Convert));

        let d = decide(MixedPolicy::Ambiguous, vec![file("c.docx", FileKind::Pdf)]);
        assert_eq!(d.target, Target::Repair(OperationKind::Normalize));
    }

    #[test]
    fn test_quarantine_categories() {
        assert_eq!(
            decide(MixedPolicy::Ambiguous, vec![file("a.pdf", FileKind::Empty)]).target,
            Target::Quarantine(ExceptionCategory::Empty)
        );
        assert_eq!(
            decide(MixedPolicy::Ambiguous, vec![]).target,
            Target::Quarantine(ExceptionCategory::Empty)
        );
        assert_eq!(
            decide(
                MixedPolicy::Ambiguous,
                vec![file("a.pdf", FileKind::Pdf), file("a.pdf.p7s", FileKind::Signature)]
            )
            .target,
            Target::Quarantine(ExceptionCategory::Special)
        );
        // unknown wins over anything repairable
        assert_eq!(
            decide(
                MixedPolicy::Ambiguous,
                vec![file("x.bin", FileKind::Unknown), file("a.doc", FileKind::Doc)]
            )
            .target,
            Target::Quarantine(ExceptionCategory::Ambiguous)
        );
    }

    #[test]
    fn test_mixed_policy() {
        let mixed = || vec![file("a.pdf", FileKind::Pdf), file("b.xlsx", FileKind::Xlsx)];
        assert_eq!(
            decide(MixedPolicy::Ambiguous, mixed()).target,
            Target::Quarantine(ExceptionCategory::Ambiguous)
        );
        assert_eq!(
            decide(MixedPolicy::Mixed, mixed()).target,
            Target::Quarantine(ExceptionCategory::Mixed)
        );
        let accepted = decide(MixedPolicy::Accept, mixed());
        assert_eq!(accepted.target, Target::Merge);
        assert_eq!(accepted.route, Some(Route::Mixed));
    }

    #[test]
    fn test_scanned_and_text_pdf_share_a_family() {
        let mut scan = file("scan.pdf", FileKind::Pdf);
        scan.needs_processing = true;
        let d = decide(MixedPolicy::Ambiguous, vec![file("a.pdf", FileKind::Pdf), scan]);
        assert_eq!(d.target, Target::Merge);
        assert_eq!(d.route, Some(Route::PdfScan));
    }

    #[test]
    fn test_empty_file_rides_along() {
        let d = decide(
            MixedPolicy::Ambiguous,
            vec![file("a.pdf", FileKind::Pdf), file("blank.txt", FileKind::Empty)],
        );
        assert_eq!(d.target, Target::Merge);
    }

    #[test]
    fn test_classify_syncs_inventory_and_detects() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("Input").join("U1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.pdf"), b"%PDF-1.7\n/Font\n%%EOF").unwrap();
        let mut manifest = Manifest::new(UnitId::parse("U1").unwrap(), Cycle::FIRST);

        let d = Classifier::new(MixedPolicy::Ambiguous)
            .classify(&dir, &mut manifest)
            .unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].kind, FileKind::Pdf);
        assert_eq!(d.target, Target::Merge);

        // classification is idempotent
        let again = Classifier::new(MixedPolicy::Ambiguous)
            .classify(&dir, &mut manifest)
            .unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(again.target, d.target);
        assert_eq!(again.files, d.files);
    }
}
