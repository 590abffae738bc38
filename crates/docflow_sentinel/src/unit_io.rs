//! Moving, copying and journaling unit directories.

use crate::error::{PipelineError, Result};
use crate::error_policy::{ErrorAction, ErrorKind, ErrorPolicy};
use docflow_protocol::UnitRef;
use docflow_state_store::{append_event, AuditEvent};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Rename a unit directory to `dest`. Never overwrites.
pub fn move_unit(unit: &UnitRef, dest: &Path) -> Result<UnitRef> {
    if unit.dir == dest {
        return Ok(unit.clone());
    }
    if dest.exists() {
        return Err(PipelineError::Collision {
            unit: unit.id.to_string(),
            path: dest.display().to_string(),
        });
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&unit.dir, dest)?;
    debug!(unit = %unit.id, from = %unit.dir.display(), to = %dest.display(), "Moved unit");
    Ok(unit.moved_to(dest))
}

/// Recursively copy `src` into the not yet existing `dest`, hidden files included.
pub fn copy_dir_all(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            PipelineError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| PipelineError::Io(std::io::Error::other(e.to_string())))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Append to the unit's audit log.
///
/// A failed append is a metadata error and the policy decides its fate; the
/// manifest stays authoritative either way.
pub fn audit(policy: &ErrorPolicy, dir: &Path, event: AuditEvent) -> Result<()> {
    let Err(e) = append_event(dir, &event) else {
        return Ok(());
    };
    match policy.decide(ErrorKind::Metadata, None, 1) {
        ErrorAction::Skip => {
            warn!(
                unit = %event.unit_id,
                event = event.event_type.as_str(),
                error = %e,
                "Audit append failed, continuing"
            );
            Ok(())
        }
        _ => Err(e.into()),
    }
}
