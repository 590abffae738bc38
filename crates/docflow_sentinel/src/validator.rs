//! Unit integrity checks.
//!
//! A manifest is trusted by everything downstream, so the validator checks
//! it against the unit directory it describes: the state trace must replay
//! through the transition table, and every active file must exist with the
//! checksum the manifest recorded. Validation only reads.

use docflow_protocol::{file_checksum, Manifest, State, StateMachine, UnitId, UnitRef};
use docflow_state_store::list_unit_files;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

/// One way a unit disagrees with its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// Consecutive trace entries the transition table does not allow.
    IllegalTransition { step: usize, from: State, to: State },
    /// The recorded state is not where the trace ends.
    StateNotTraced { state: State, traced: Option<State> },
    MissingFile { name: String },
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    /// A file on disk the manifest does not account for.
    UntrackedFile { name: String },
    Unreadable { name: String, error: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::IllegalTransition { step, from, to } => {
                write!(f, "illegal transition {} -> {} at trace step {}", from, to, step)
            }
            ValidationIssue::StateNotTraced { state, traced } => match traced {
                Some(traced) => write!(f, "state {} but trace ends at {}", state, traced),
                None => write!(f, "state {} with an empty trace", state),
            },
            ValidationIssue::MissingFile { name } => write!(f, "missing file {}", name),
            ValidationIssue::ChecksumMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch for {}: manifest {}, actual {}",
                name, expected, actual
            ),
            ValidationIssue::UntrackedFile { name } => write!(f, "untracked file {}", name),
            ValidationIssue::Unreadable { name, error } => {
                write!(f, "cannot read {}: {}", name, error)
            }
        }
    }
}

/// Outcome of validating one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitValidation {
    pub unit: UnitId,
    pub issues: Vec<ValidationIssue>,
}

impl UnitValidation {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Check `manifest` against the directory of `unit`.
    pub fn validate_unit(&self, unit: &UnitRef, manifest: &Manifest) -> UnitValidation {
        let mut issues = replay_trace(manifest);

        let mut tracked = BTreeSet::new();
        for file in manifest.active_files() {
            tracked.insert(file.current_name.as_str());
            let path = unit.dir.join(&file.current_name);
            if !path.is_file() {
                issues.push(ValidationIssue::MissingFile {
                    name: file.current_name.clone(),
                });
                continue;
            }
            match file_checksum(&path) {
                Ok(actual) if actual == file.checksum => {}
                Ok(actual) => issues.push(ValidationIssue::ChecksumMismatch {
                    name: file.current_name.clone(),
                    expected: file.checksum.clone(),
                    actual,
                }),
                Err(e) => issues.push(ValidationIssue::Unreadable {
                    name: file.current_name.clone(),
                    error: e.to_string(),
                }),
            }
        }

        match list_unit_files(&unit.dir) {
            Ok(on_disk) => issues.extend(
                on_disk
                    .into_iter()
                    .filter(|name| !tracked.contains(name.as_str()))
                    .map(|name| ValidationIssue::UntrackedFile { name }),
            ),
            Err(e) => issues.push(ValidationIssue::Unreadable {
                name: unit.dir.display().to_string(),
                error: e.to_string(),
            }),
        }

        if issues.is_empty() {
            debug!(unit = %unit.id, "Unit valid");
        } else {
            for issue in &issues {
                warn!(unit = %unit.id, issue = %issue, "Unit failed validation");
            }
        }
        UnitValidation {
            unit: unit.id.clone(),
            issues,
        }
    }
}

/// Walk the trace pairwise through the table the unit was created with.
fn replay_trace(manifest: &Manifest) -> Vec<ValidationIssue> {
    let machine = StateMachine::new(manifest.max_cycles);
    let mut issues: Vec<ValidationIssue> = manifest
        .state_trace
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| !machine.can_transition(pair[0].state, pair[1].state))
        .map(|(i, pair)| ValidationIssue::IllegalTransition {
            step: i + 1,
            from: pair[0].state,
            to: pair[1].state,
        })
        .collect();

    let traced = manifest.state_trace.last().map(|e| e.state);
    if traced != Some(manifest.state) {
        issues.push(ValidationIssue::StateNotTraced {
            state: manifest.state,
            traced,
        });
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_protocol::{Cycle, StateTraceEntry};
    use docflow_state_store::ManifestStore;
    use std::fs;
    use tempfile::TempDir;

    fn c(n: u8) -> Cycle {
        Cycle::new(n).unwrap()
    }

    fn unit_with(tmp: &TempDir, files: &[(&str, &[u8])]) -> (UnitRef, Manifest) {
        let unit = UnitRef::new(UnitId::parse("V1").unwrap(), tmp.path().join("V1"));
        fs::create_dir_all(&unit.dir).unwrap();
        for (name, body) in files {
            fs::write(unit.dir.join(name), body).unwrap();
        }
        let manifest = ManifestStore::new().create(&unit, c(3), None).unwrap();
        (unit, manifest)
    }

    #[test]
    fn test_untouched_unit_is_valid() {
        let tmp = TempDir::new().unwrap();
        let (unit, mut manifest) = unit_with(&tmp, &[("a.pdf", b"%PDF-1.4"), ("b.txt", b"b")]);
        StateMachine::new(c(3))
            .transition(&mut manifest, State::Classified(c(1)), "t")
            .unwrap();

        let result = Validator::new().validate_unit(&unit, &manifest);
        assert!(result.is_valid(), "{:?}", result.issues);
    }

    #[test]
    fn test_tampered_and_missing_files_are_reported() {
        let tmp = TempDir::new().unwrap();
        let (unit, manifest) = unit_with(&tmp, &[("a.pdf", b"%PDF-1.4"), ("b.txt", b"b")]);
        fs::write(unit.dir.join("a.pdf"), b"%PDF-1.4 edited").unwrap();
        fs::remove_file(unit.dir.join("b.txt")).unwrap();
        fs::write(unit.dir.join("stowaway.bin"), b"?").unwrap();

        let issues = Validator::new().validate_unit(&unit, &manifest).issues;
        assert_eq!(issues.len(), 3);
        assert!(matches!(&issues[0], ValidationIssue::ChecksumMismatch { name, .. } if name == "a.pdf"));
        assert_eq!(
            issues[1],
            ValidationIssue::MissingFile {
                name: "b.txt".to_string()
            }
        );
        assert_eq!(
            issues[2],
            ValidationIssue::UntrackedFile {
                name: "stowaway.bin".to_string()
            }
        );
    }

    #[test]
    fn test_trace_is_replayed_through_the_table() {
        let tmp = TempDir::new().unwrap();
        let (unit, mut manifest) = unit_with(&tmp, &[("a.pdf", b"%PDF-1.4")]);
        let now = chrono::Utc::now();
        // RAW straight to READY skips classification and merge
        manifest.state_trace.push(StateTraceEntry {
            state: State::Ready,
            at: now,
            reason: "forged".to_string(),
        });
        manifest.state = State::Ready;

        let issues = Validator::new().validate_unit(&unit, &manifest).issues;
        assert_eq!(
            issues,
            vec![ValidationIssue::IllegalTransition {
                step: 1,
                from: State::Raw,
                to: State::Ready,
            }]
        );
    }

    #[test]
    fn test_state_must_match_end_of_trace() {
        let tmp = TempDir::new().unwrap();
        let (unit, mut manifest) = unit_with(&tmp, &[("a.pdf", b"%PDF-1.4")]);
        manifest.state = State::MergedDirect;

        let issues = Validator::new().validate_unit(&unit, &manifest).issues;
        assert_eq!(
            issues,
            vec![ValidationIssue::StateNotTraced {
                state: State::MergedDirect,
                traced: Some(State::Raw),
            }]
        );
        assert!(issues[0].to_string().contains("trace ends at RAW"));
    }

    #[test]
    fn test_superseded_files_are_not_checked() {
        let tmp = TempDir::new().unwrap();
        let (unit, mut manifest) = unit_with(&tmp, &[("memo.doc", b"legacy")]);
        fs::create_dir_all(unit.dir.join(".superseded")).unwrap();
        fs::rename(unit.dir.join("memo.doc"), unit.dir.join(".superseded/memo.doc")).unwrap();
        manifest.files[0].superseded = true;

        assert!(Validator::new().validate_unit(&unit, &manifest).is_valid());
    }
}
