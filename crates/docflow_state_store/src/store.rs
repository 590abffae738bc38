//! Filesystem manifest store.
//!
//! Each unit directory holds one `manifest.json`. Writes go through a temp
//! file, fsync and rename, so a reader never sees a torn manifest and a
//! crash leaves either the old or the new version.

use crate::error::{Result, StoreError};
use crate::files::list_unit_files;
use crate::locks::UnitLocks;
use chrono::Utc;
use docflow_protocol::defaults::MANIFEST_FILE_NAME;
use docflow_protocol::{
    file_checksum, Cycle, FileEntry, Manifest, SourceRecord, Transformation, UnitRef,
};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A transformation to record against one file, with its post-transform
/// content identity when the content changed.
#[derive(Debug, Clone)]
pub struct TransformationUpdate {
    /// Current name of the file before the transformation.
    pub file: String,
    pub transformation: Transformation,
    pub checksum: Option<String>,
    pub size: Option<u64>,
}

/// Durable per-unit manifest storage.
#[derive(Debug, Default)]
pub struct ManifestStore {
    locks: UnitLocks,
}

pub fn manifest_path(unit_dir: &Path) -> PathBuf {
    unit_dir.join(MANIFEST_FILE_NAME)
}

/// Write `bytes` to `target` atomically (temp file, fsync, rename).
pub fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "target has no parent"))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manifest".to_string());
    let unique_id = format!(
        "{}.{:?}.{}",
        std::process::id(),
        std::thread::current().id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    );
    let unique_id: String = unique_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.')
        .collect();
    let temp_path = dir.join(format!(".{}.{}.tmp", name, unique_id));

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, target)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locks(&self) -> &UnitLocks {
        &self.locks
    }

    pub fn exists(&self, unit: &UnitRef) -> bool {
        manifest_path(&unit.dir).is_file()
    }

    /// Read and validate a unit's manifest, migrating older schemas.
    pub fn load(&self, unit: &UnitRef) -> Result<Manifest> {
        let path = manifest_path(&unit.dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::not_found(path.display().to_string()));
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(StoreError::schema(format!(
                    "{}: not valid UTF-8",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let manifest = Manifest::from_json(&text)
            .map_err(|e| StoreError::schema(format!("{}: {}", path.display(), e)))?;
        if manifest.unit_id != unit.id {
            return Err(StoreError::schema(format!(
                "{}: manifest belongs to unit {}, expected {}",
                path.display(),
                manifest.unit_id,
                unit.id
            )));
        }
        Ok(manifest)
    }

    /// Persist a manifest atomically.
    pub fn save(&self, unit: &UnitRef, manifest: &Manifest) -> Result<()> {
        let text = manifest.to_json_pretty()?;
        write_atomic(&manifest_path(&unit.dir), text.as_bytes())?;
        debug!(unit = %unit.id, state = %manifest.state, "Saved manifest");
        Ok(())
    }

    /// Locked load → mutate → save. Nothing is written if `f` fails.
    pub fn update<T>(
        &self,
        unit: &UnitRef,
        f: impl FnOnce(&mut Manifest) -> Result<T>,
    ) -> Result<T> {
        self.locks.with_lock(&unit.id, || {
            let mut manifest = self.load(unit)?;
            let value = f(&mut manifest)?;
            manifest.updated_at = Utc::now();
            self.save(unit, &manifest)?;
            Ok(value)
        })
    }

    /// Record a transformation against one file as a single logical step.
    pub fn append_transformation(&self, unit: &UnitRef, update: TransformationUpdate) -> Result<()> {
        self.update(unit, |manifest| {
            let unit_name = manifest.unit_id.to_string();
            let entry = manifest
                .file_by_current_name_mut(&update.file)
                .ok_or_else(|| StoreError::UnknownFile {
                    unit: unit_name,
                    file: update.file.clone(),
                })?;
            entry.record(update.transformation);
            if let Some(checksum) = update.checksum {
                entry.checksum = checksum;
            }
            if let Some(size) = update.size {
                entry.size = size;
            }
            Ok(())
        })
    }

    /// Create the RAW manifest for a freshly deposited unit.
    ///
    /// Idempotent: an existing manifest is loaded and returned unchanged.
    pub fn create(
        &self,
        unit: &UnitRef,
        max_cycles: Cycle,
        source: Option<SourceRecord>,
    ) -> Result<Manifest> {
        self.locks.with_lock(&unit.id, || {
            if self.exists(unit) {
                return self.load(unit);
            }
            let mut manifest = Manifest::new(unit.id.clone(), max_cycles);
            manifest.source = source;
            for name in list_unit_files(&unit.dir)? {
                let path = unit.dir.join(&name);
                let size = fs::metadata(&path)?.len();
                let checksum = file_checksum(&path)?;
                manifest.files.push(FileEntry::new(name, checksum, size));
            }
            self.save(unit, &manifest)?;
            info!(unit = %unit.id, files = manifest.files.len(), "Created manifest");
            Ok(manifest)
        })
    }

    /// Move an unreadable manifest aside so a fresh one can be written.
    ///
    /// The original bytes are kept as a hidden file in the unit directory.
    pub fn set_aside_corrupt(&self, unit: &UnitRef) -> Result<Option<PathBuf>> {
        let path = manifest_path(&unit.dir);
        if !path.exists() {
            return Ok(None);
        }
        let aside = unit.dir.join(format!(
            ".manifest.corrupt.{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.f")
        ));
        fs::rename(&path, &aside)?;
        warn!(unit = %unit.id, path = %aside.display(), "Set aside unreadable manifest");
        Ok(Some(aside))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_protocol::{OperationKind, Outcome, State, UnitId};
    use tempfile::TempDir;

    fn unit_in(tmp: &TempDir, id: &str) -> UnitRef {
        let dir = tmp.path().join("Input").join(id);
        fs::create_dir_all(&dir).unwrap();
        UnitRef::new(UnitId::parse(id).unwrap(), dir)
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let unit = unit_in(&tmp, "U1");
        assert!(ManifestStore::new().load(&unit).unwrap_err().is_not_found());
    }

    #[test]
    fn test_create_inventories_files() {
        let tmp = TempDir::new().unwrap();
        let unit = unit_in(&tmp, "U1");
        fs::write(unit.dir.join("a.pdf"), b"%PDF-1.4").unwrap();
        fs::write(unit.dir.join("b.txt"), b"hi").unwrap();

        let store = ManifestStore::new();
        let m = store.create(&unit, Cycle::new(3).unwrap(), None).unwrap();
        assert_eq!(m.state, State::Raw);
        assert_eq!(m.files.len(), 2);
        assert_eq!(m.files[0].current_name, "a.pdf");
        assert_eq!(m.files[0].size, 8);
        assert!(m.files[0].checksum.starts_with("sha256:"));

        // second call returns the stored manifest
        let again = store.create(&unit, Cycle::new(3).unwrap(), None).unwrap();
        assert_eq!(again, m);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let unit = unit_in(&tmp, "U1");
        let store = ManifestStore::new();
        let m = Manifest::new(unit.id.clone(), Cycle::new(3).unwrap());
        store.save(&unit, &m).unwrap();
        store.save(&unit, &m).unwrap();

        let names: Vec<String> = fs::read_dir(&unit.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![MANIFEST_FILE_NAME.to_string()]);
    }

    #[test]
    fn test_corrupt_manifest_is_schema_error() {
        let tmp = TempDir::new().unwrap();
        let unit = unit_in(&tmp, "U1");
        fs::write(manifest_path(&unit.dir), "{ not json").unwrap();
        let store = ManifestStore::new();
        assert!(store.load(&unit).unwrap_err().is_schema());

        let aside = store.set_aside_corrupt(&unit).unwrap().unwrap();
        assert!(aside.exists());
        assert!(!store.exists(&unit));
    }

    #[test]
    fn test_foreign_manifest_is_schema_error() {
        let tmp = TempDir::new().unwrap();
        let unit = unit_in(&tmp, "U1");
        let other = Manifest::new(UnitId::parse("U2").unwrap(), Cycle::FIRST);
        fs::write(manifest_path(&unit.dir), other.to_json_pretty().unwrap()).unwrap();
        let err = ManifestStore::new().load(&unit).unwrap_err();
        assert!(err.to_string().contains("belongs to unit U2"));
    }

    #[test]
    fn test_update_is_not_saved_on_error() {
        let tmp = TempDir::new().unwrap();
        let unit = unit_in(&tmp, "U1");
        let store = ManifestStore::new();
        store.create(&unit, Cycle::new(3).unwrap(), None).unwrap();

        let res: Result<()> = store.update(&unit, |m| {
            m.current_cycle = Cycle::new(2).unwrap();
            Err(StoreError::schema("boom"))
        });
        assert!(res.is_err());
        assert_eq!(store.load(&unit).unwrap().current_cycle, Cycle::FIRST);
    }

    #[test]
    fn test_append_transformation() {
        let tmp = TempDir::new().unwrap();
        let unit = unit_in(&tmp, "U1");
        fs::write(unit.dir.join("a.doc"), b"old").unwrap();
        let store = ManifestStore::new();
        store.create(&unit, Cycle::new(3).unwrap(), None).unwrap();

        store
            .append_transformation(
                &unit,
                TransformationUpdate {
                    file: "a.doc".into(),
                    transformation: Transformation {
                        operation: OperationKind::Convert,
                        cycle: Cycle::FIRST,
                        from_kind: None,
                        to_kind: None,
                        from_name: "a.doc".into(),
                        to_name: "a.docx".into(),
                        tool: "soffice".into(),
                        at: Utc::now(),
                        outcome: Outcome::Success,
                    },
                    checksum: Some("sha256:new".into()),
                    size: Some(3),
                },
            )
            .unwrap();

        let m = store.load(&unit).unwrap();
        assert_eq!(m.files[0].current_name, "a.docx");
        assert_eq!(m.files[0].checksum, "sha256:new");
        assert_eq!(m.files[0].transformations.len(), 1);

        let err = store
            .append_transformation(
                &unit,
                TransformationUpdate {
                    file: "missing.doc".into(),
                    transformation: m.files[0].transformations[0].clone(),
                    checksum: None,
                    size: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownFile { .. }));
    }
}
