//! File name normalization: make the extension tell the truth.

use crate::cancel::CancellationToken;
use crate::engine::{split_ext, split_rel, transformation, unique_rel, RepairEngine, RepairResult};
use crate::error::{RepairError, Result};
use docflow_protocol::{Cycle, FileKind, Manifest, OperationKind, Outcome};
use std::fs;
use std::path::Path;
use tracing::info;

const TOOL_NAME: &str = "rename";

fn is_known_extension(ext: &str) -> bool {
    FileKind::ALL
        .iter()
        .any(|k| k.accepted_extensions().iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

/// The name a file of `kind` should carry, or `None` when `rel` is fine.
///
/// A wrong known extension is replaced, a missing or unknown one gets the
/// canonical extension appended, and a stacked known extension
/// (`scan.jpg.pdf`) is dropped. Applying the result again yields `None`.
pub fn normalized_name(rel: &str, kind: FileKind) -> Option<String> {
    let canonical = kind.canonical_extension()?;
    let (parent, name) = split_rel(rel);
    let (stem, ext) = split_ext(name);

    let base = match ext {
        Some(ext) if kind.matches_extension(Some(ext)) => {
            match split_ext(stem) {
                (inner, Some(inner_ext)) if is_known_extension(inner_ext) => {
                    return Some(format!("{}{}.{}", parent, inner, ext));
                }
                _ => return None,
            }
        }
        Some(ext) if is_known_extension(ext) => stem,
        _ => name,
    };
    Some(format!("{}{}.{}", parent, base, canonical))
}

/// Renames files whose extension disagrees with their content.
#[derive(Debug, Clone, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }
}

impl RepairEngine for Normalizer {
    fn operation(&self) -> OperationKind {
        OperationKind::Normalize
    }

    fn tool(&self) -> &str {
        TOOL_NAME
    }

    fn apply(
        &self,
        dir: &Path,
        manifest: &mut Manifest,
        cycle: Cycle,
        cancel: &CancellationToken,
    ) -> Result<RepairResult> {
        let renames: Vec<(String, FileKind, String)> = manifest
            .active_files()
            .filter_map(|f| {
                normalized_name(&f.current_name, f.kind)
                    .map(|target| (f.current_name.clone(), f.kind, target))
            })
            .collect();

        let mut result = RepairResult::default();
        for (rel, kind, wanted) in renames {
            if cancel.is_cancelled() {
                return Err(RepairError::Cancelled("normalization".to_string()));
            }
            let new_rel = unique_rel(dir, &wanted, |n| manifest.file_by_current_name(n).is_some());
            fs::rename(dir.join(&rel), dir.join(&new_rel))?;
            if let Some(entry) = manifest.file_by_current_name_mut(&rel) {
                entry.record(transformation(
                    OperationKind::Normalize,
                    cycle,
                    TOOL_NAME,
                    (&rel, kind),
                    (&new_rel, Some(kind)),
                    Outcome::Success,
                ));
            }
            info!(unit = %manifest.unit_id, from = %rel, to = %new_rel, "Renamed");
            result.files_changed += 1;
            result.notes.push(format!("{} -> {}", rel, new_rel));
        }
        Ok(result)
    }
}
