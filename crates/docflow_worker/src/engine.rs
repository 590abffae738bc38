//! Repair engine contract and the file helpers every engine shares.

use crate::cancel::CancellationToken;
use crate::error::Result;
use chrono::Utc;
use docflow_protocol::defaults::SUPERSEDED_DIR_NAME;
use docflow_protocol::{Cycle, FileKind, Manifest, OperationKind, Outcome, Transformation};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What an engine did to a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairResult {
    /// Number of manifest files whose content or name changed.
    pub files_changed: usize,
    pub notes: Vec<String>,
}

impl RepairResult {
    pub fn is_noop(&self) -> bool {
        self.files_changed == 0
    }
}

/// A repair operation applied to one unit directory.
///
/// Engines mutate the manifest in memory to match what they did on disk,
/// one file at a time, so a failure part way through still leaves the
/// manifest describing the directory. The caller persists it either way.
/// Applying an engine to a unit it has nothing to do for is a no-op, which
/// makes retries safe.
pub trait RepairEngine: Send + Sync {
    fn operation(&self) -> OperationKind;

    /// Tool name recorded in transformations.
    fn tool(&self) -> &str;

    fn apply(
        &self,
        dir: &Path,
        manifest: &mut Manifest,
        cycle: Cycle,
        cancel: &CancellationToken,
    ) -> Result<RepairResult>;
}

/// Build a transformation record stamped now.
pub fn transformation(
    operation: OperationKind,
    cycle: Cycle,
    tool: &str,
    from: (&str, FileKind),
    to: (&str, Option<FileKind>),
    outcome: Outcome,
) -> Transformation {
    Transformation {
        operation,
        cycle,
        from_kind: Some(from.1),
        to_kind: to.1,
        from_name: from.0.to_string(),
        to_name: to.0.to_string(),
        tool: tool.to_string(),
        at: Utc::now(),
        outcome,
    }
}

/// Split a unit-relative path into its parent prefix ("" or "a/b/") and file name.
pub fn split_rel(rel: &str) -> (&str, &str) {
    match rel.rfind('/') {
        Some(i) => (&rel[..=i], &rel[i + 1..]),
        None => ("", rel),
    }
}

/// Split a file name into stem and extension (without the dot, case kept).
///
/// A leading dot is part of the stem.
pub fn split_ext(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(i) if i + 1 == name.len() => (name, None),
        Some(i) => (&name[..i], Some(&name[i + 1..])),
    }
}

/// First free unit-relative name derived from `rel` by suffixing the stem
/// with `_1`, `_2`, ...
pub fn unique_rel(dir: &Path, rel: &str, taken: impl Fn(&str) -> bool) -> String {
    let free = |candidate: &str| !taken(candidate) && !dir.join(candidate).exists();
    if free(rel) {
        return rel.to_string();
    }
    let (parent, name) = split_rel(rel);
    let (stem, ext) = split_ext(name);
    let mut n = 1;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{}{}_{}.{}", parent, stem, n, ext),
            None => format!("{}{}_{}", parent, stem, n),
        };
        if free(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Move a replaced file under the unit's hidden superseded area.
///
/// Returns the new unit-relative path. Superseded files are kept for audit
/// and never reach the merge output.
pub fn supersede(dir: &Path, rel: &str) -> io::Result<String> {
    let target_rel = unique_rel(dir, &format!("{}/{}", SUPERSEDED_DIR_NAME, rel), |_| false);
    let target = dir.join(&target_rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(dir.join(rel), &target)?;
    Ok(target_rel)
}

/// Remove a scratch directory, ignoring it if absent.
pub fn remove_scratch(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Absolute form of `path` relative to the process working directory.
pub fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_helpers() {
        assert_eq!(split_rel("a/b/c.pdf"), ("a/b/", "c.pdf"));
        assert_eq!(split_rel("c.pdf"), ("", "c.pdf"));
        assert_eq!(split_ext("c.tar.gz"), ("c.tar", Some("gz")));
        assert_eq!(split_ext("README"), ("README", None));
        assert_eq!(split_ext(".profile"), (".profile", None));
        assert_eq!(split_ext("trailing."), ("trailing.", None));
    }

    #[test]
    fn test_unique_rel_skips_existing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.pdf"), b"x").unwrap();
        assert_eq!(unique_rel(tmp.path(), "a.pdf", |_| false), "a_1.pdf");
        assert_eq!(unique_rel(tmp.path(), "a.pdf", |n| n == "a_1.pdf"), "a_2.pdf");
        assert_eq!(unique_rel(tmp.path(), "b.pdf", |_| false), "b.pdf");
    }

    #[test]
    fn test_supersede_moves_under_hidden_dir() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/old.doc"), b"x").unwrap();
        let rel = supersede(tmp.path(), "sub/old.doc").unwrap();
        assert_eq!(rel, ".superseded/sub/old.doc");
        assert!(tmp.path().join(&rel).exists());
        assert!(!tmp.path().join("sub/old.doc").exists());
    }
}
