//! Versioned unit manifest.
//!
//! Schema `3.x` is current. Schema `2.x` manifests (free-form JSON with a
//! `state_machine` section and suffix-less pending states) are migrated on
//! read by [`Manifest::from_value`]; anything else is a schema error.

use crate::error::{ProtocolError, Result};
use crate::ids::UnitId;
use crate::state::{Cycle, State};
use crate::types::{ExceptionCategory, FileCategory, FileKind, OperationKind, Outcome, Route};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version written by this crate.
pub const MANIFEST_SCHEMA_VERSION: &str = "3.0";

/// Major schema versions [`Manifest::from_value`] can read.
pub const SUPPORTED_SCHEMA_MAJORS: [u32; 2] = [2, 3];

/// Optional link to the record the unit was downloaded for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub protocol_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTraceEntry {
    pub state: State,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

/// One transformation applied to a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    pub operation: OperationKind,
    pub cycle: Cycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_kind: Option<FileKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_kind: Option<FileKind>,
    pub from_name: String,
    pub to_name: String,
    pub tool: String,
    pub at: DateTime<Utc>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub original_name: String,
    /// Path relative to the unit directory.
    pub current_name: String,
    pub kind: FileKind,
    /// Lacks an extractable text layer (scanned PDF, raster image).
    #[serde(default)]
    pub needs_processing: bool,
    /// `sha256:<hex>` of the current content; empty when not yet computed.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub size: u64,
    /// Replaced by a transformation and moved out of the active set.
    #[serde(default, skip_serializing_if = "is_false")]
    pub superseded: bool,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl FileEntry {
    pub fn new(name: impl Into<String>, checksum: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        Self {
            original_name: name.clone(),
            current_name: name,
            kind: FileKind::Unknown,
            needs_processing: false,
            checksum: checksum.into(),
            size,
            superseded: false,
            transformations: Vec::new(),
        }
    }

    /// Record a successful transformation and move `current_name` forward.
    pub fn record(&mut self, transformation: Transformation) {
        if transformation.outcome == Outcome::Success {
            self.current_name = transformation.to_name.clone();
            if let Some(kind) = transformation.to_kind {
                self.kind = kind;
            }
        }
        self.transformations.push(transformation);
    }
}

/// Per-file part of a classification decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileClassification {
    pub name: String,
    pub kind: FileKind,
    pub category: FileCategory,
    #[serde(default)]
    pub needs_processing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Persisted classifier decision. Written before the unit is moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub cycle: Cycle,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    /// Target state the decision leads to.
    pub target: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ExceptionCategory>,
    pub reason: String,
    pub files: Vec<FileClassification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub cycle: Cycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationKind>,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub category: ExceptionCategory,
    pub cycle: Cycle,
    pub reason: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub at: DateTime<Utc>,
    pub route: Route,
    /// Content fingerprint of the merged unit.
    pub fingerprint: String,
    /// Source namespace the unit was collected from.
    pub source: String,
}

/// Route/category decisions and error history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<QuarantineRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeRecord>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    /// Free-form annotations (legacy fields, operator notes).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// Persisted representation of a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub unit_id: UnitId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRecord>,
    pub state: State,
    pub current_cycle: Cycle,
    pub max_cycles: Cycle,
    pub state_trace: Vec<StateTraceEntry>,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub processing: ProcessingSection,
}

impl Manifest {
    /// Fresh manifest in state RAW, cycle 1.
    pub fn new(unit_id: UnitId, max_cycles: Cycle) -> Self {
        let now = Utc::now();
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            unit_id,
            created_at: now,
            updated_at: now,
            source: None,
            state: State::Raw,
            current_cycle: Cycle::FIRST,
            max_cycles,
            state_trace: vec![StateTraceEntry {
                state: State::Raw,
                at: now,
                reason: "ingested".to_string(),
            }],
            files: Vec::new(),
            processing: ProcessingSection::default(),
        }
    }

    /// Files that are part of the unit's current content.
    pub fn active_files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|f| !f.superseded)
    }

    pub fn active_files_mut(&mut self) -> impl Iterator<Item = &mut FileEntry> {
        self.files.iter_mut().filter(|f| !f.superseded)
    }

    pub fn file_by_current_name(&self, name: &str) -> Option<&FileEntry> {
        self.active_files().find(|f| f.current_name == name)
    }

    pub fn file_by_current_name_mut(&mut self, name: &str) -> Option<&mut FileEntry> {
        self.active_files_mut().find(|f| f.current_name == name)
    }

    pub fn push_error(&mut self, error: ErrorRecord) {
        self.processing.errors.push(error);
        self.updated_at = Utc::now();
    }

    /// Number of transformations recorded across all files.
    pub fn transformation_count(&self) -> usize {
        self.files.iter().map(|f| f.transformations.len()).sum()
    }

    /// True if the unit never went through a repair engine.
    pub fn is_pristine(&self) -> bool {
        !self
            .state_trace
            .iter()
            .any(|e| e.state.is_pending_repair())
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse manifest text of any supported schema version.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode a manifest, migrating older schemas.
    pub fn from_value(value: Value) -> Result<Self> {
        let version = value
            .get("schema_version")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::schema("manifest has no schema_version"))?;
        match schema_major(version)? {
            3 => Ok(serde_json::from_value(value)?),
            2 => migrate_v2(&value),
            major => Err(ProtocolError::schema(format!(
                "unsupported manifest schema {} (major {}, supported {:?})",
                version, major, SUPPORTED_SCHEMA_MAJORS
            ))),
        }
    }
}

fn schema_major(version: &str) -> Result<u32> {
    version
        .split('.')
        .next()
        .and_then(|m| m.trim().parse::<u32>().ok())
        .ok_or_else(|| ProtocolError::schema(format!("malformed schema_version '{}'", version)))
}

// ============================================================================
// v2 migration
// ============================================================================

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let text = value?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// v2 used suffix-less pending/merged names and a couple of extra terminals.
fn legacy_state(name: &str, cycle: Cycle) -> Result<State> {
    if let Ok(state) = name.parse::<State>() {
        return Ok(state);
    }
    match name {
        "PENDING_CONVERT" => Ok(State::PendingConvert(cycle)),
        "PENDING_EXTRACT" => Ok(State::PendingExtract(cycle)),
        "PENDING_NORMALIZE" => Ok(State::PendingNormalize(cycle)),
        "MERGED_PROCESSED" => Ok(State::MergedProcessed(cycle)),
        "READY_FOR_DOCLING" => Ok(State::Ready),
        "MERGER_SKIPPED" => Ok(State::Exception(cycle)),
        other => Err(ProtocolError::schema(format!(
            "v2 state '{}' has no current equivalent",
            other
        ))),
    }
}

fn migrate_v2(value: &Value) -> Result<Manifest> {
    let unit_id = value
        .get("unit_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::schema("v2 manifest has no unit_id"))?;
    let unit_id =
        UnitId::parse(unit_id).map_err(|e| ProtocolError::schema(format!("v2 manifest: {}", e)))?;

    let processing = value.get("processing");
    let cycle_of = |key: &str, default: u8| -> Cycle {
        processing
            .and_then(|p| p.get(key))
            .and_then(Value::as_u64)
            .and_then(|n| u8::try_from(n).ok())
            .and_then(|n| Cycle::new(n).ok())
            .unwrap_or_else(|| Cycle::new(default).unwrap_or(Cycle::FIRST))
    };
    let current_cycle = cycle_of("current_cycle", 1);
    let max_cycles = cycle_of("max_cycles", crate::defaults::DEFAULT_MAX_CYCLES).max(current_cycle);

    let now = Utc::now();
    let created_at = parse_time(value.get("created_at")).unwrap_or(now);
    let updated_at = parse_time(value.get("updated_at")).unwrap_or(created_at);

    let machine = value.get("state_machine");
    let state_name = machine
        .and_then(|m| m.get("current_state"))
        .and_then(Value::as_str)
        .unwrap_or("RAW");
    let state = legacy_state(state_name, current_cycle)?;

    let mut state_trace = Vec::new();
    if let Some(trace) = machine
        .and_then(|m| m.get("state_trace"))
        .and_then(Value::as_array)
    {
        for entry in trace {
            let Some(name) = entry.as_str() else {
                return Err(ProtocolError::schema("v2 state_trace entry is not a string"));
            };
            state_trace.push(StateTraceEntry {
                state: legacy_state(name, current_cycle)?,
                at: updated_at,
                reason: "migrated from schema 2".to_string(),
            });
        }
    }
    if state_trace.last().map(|e| e.state) != Some(state) {
        state_trace.push(StateTraceEntry {
            state,
            at: updated_at,
            reason: "migrated from schema 2".to_string(),
        });
    }

    let mut files = Vec::new();
    if let Some(list) = value.get("files").and_then(Value::as_array) {
        for f in list {
            let original = f
                .get("original_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let current = f
                .get("current_name")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(original.as_str())
                .to_string();
            if current.is_empty() {
                return Err(ProtocolError::schema("v2 file entry without a name"));
            }
            let kind = f
                .get("detected_type")
                .and_then(Value::as_str)
                .and_then(|t| t.parse::<FileKind>().ok())
                .unwrap_or(FileKind::Unknown);
            let mut entry = FileEntry::new(current, "", 0);
            entry.original_name = if original.is_empty() {
                entry.current_name.clone()
            } else {
                original
            };
            entry.kind = kind;
            entry.needs_processing = f.get("needs_ocr").and_then(Value::as_bool).unwrap_or(false);
            if let Some(ops) = f.get("transformations").and_then(Value::as_array) {
                for op in ops {
                    if let Some(t) = migrate_v2_transformation(op, current_cycle, updated_at) {
                        entry.transformations.push(t);
                    }
                }
            }
            files.push(entry);
        }
    }

    let mut section = ProcessingSection {
        route: processing
            .and_then(|p| p.get("route"))
            .and_then(Value::as_str)
            .and_then(|r| r.parse::<Route>().ok()),
        ..ProcessingSection::default()
    };
    for key in ["final_cluster", "final_reason"] {
        if let Some(v) = processing.and_then(|p| p.get(key)) {
            if !v.is_null() && v.as_str() != Some("") {
                section.extra.insert(key.to_string(), v.clone());
            }
        }
    }
    if state_name == "MERGER_SKIPPED" {
        section.quarantine = Some(QuarantineRecord {
            category: ExceptionCategory::Mixed,
            cycle: current_cycle,
            reason: "skipped by merger (schema 2)".to_string(),
            at: updated_at,
            errors: Vec::new(),
        });
    }

    let source = value
        .get("protocol_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|id| SourceRecord {
            protocol_id: id.to_string(),
            protocol_date: value
                .get("protocol_date")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            urls: value
                .get("source")
                .and_then(|s| s.get("urls"))
                .and_then(Value::as_array)
                .map(|urls| {
                    urls.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        });

    Ok(Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
        unit_id,
        created_at,
        updated_at,
        source,
        state,
        current_cycle,
        max_cycles,
        state_trace,
        files,
        processing: section,
    })
}

fn migrate_v2_transformation(
    op: &Value,
    default_cycle: Cycle,
    default_time: DateTime<Utc>,
) -> Option<Transformation> {
    let operation = op.get("type")?.as_str()?.parse::<OperationKind>().ok()?;
    let cycle = op
        .get("cycle")
        .and_then(Value::as_u64)
        .and_then(|n| u8::try_from(n).ok())
        .and_then(|n| Cycle::new(n).ok())
        .unwrap_or(default_cycle);
    let text = |key: &str| {
        op.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let from = text("from");
    let to = text("to");
    Some(Transformation {
        operation,
        cycle,
        from_kind: from.parse().ok(),
        to_kind: to.parse().ok(),
        from_name: from,
        to_name: to,
        tool: text("tool"),
        at: parse_time(op.get("timestamp")).unwrap_or(default_time),
        outcome: Outcome::Success,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(id: &str) -> UnitId {
        UnitId::parse(id).unwrap()
    }

    #[test]
    fn test_new_manifest_is_raw() {
        let m = Manifest::new(unit("U1"), Cycle::new(3).unwrap());
        assert_eq!(m.state, State::Raw);
        assert_eq!(m.current_cycle, Cycle::FIRST);
        assert_eq!(m.state_trace.len(), 1);
        assert!(m.is_pristine());
        assert_eq!(m.schema_version, MANIFEST_SCHEMA_VERSION);
    }

    #[test]
    fn test_v3_roundtrip_through_value() {
        let mut m = Manifest::new(unit("U1"), Cycle::new(3).unwrap());
        m.files.push(FileEntry::new("a.pdf", "sha256:00", 10));
        let text = m.to_json_pretty().unwrap();
        let back = Manifest::from_json(&text).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_missing_version_is_schema_error() {
        let err = Manifest::from_value(json!({"unit_id": "U1"})).unwrap_err();
        assert!(matches!(err, ProtocolError::Schema(_)));
    }

    #[test]
    fn test_unknown_major_is_schema_error() {
        let err = Manifest::from_value(json!({"schema_version": "9.1", "unit_id": "U1"}))
            .unwrap_err();
        assert!(err.to_string().contains("unsupported manifest schema"));
        let err = Manifest::from_value(json!({"schema_version": "x", "unit_id": "U1"}))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Schema(_)));
    }

    #[test]
    fn test_v2_migration() {
        let v2 = json!({
            "schema_version": "2.0",
            "unit_id": "UNIT_abc",
            "protocol_id": "P-77",
            "protocol_date": "2024-05-01",
            "files": [{
                "original_name": "scan.doc",
                "current_name": "scan.docx",
                "detected_type": "docx",
                "needs_ocr": false,
                "transformations": [{
                    "type": "convert", "from": "doc", "to": "docx",
                    "tool": "libreoffice", "cycle": 1,
                    "timestamp": "2024-05-01T10:00:00Z"
                }]
            }],
            "processing": {"current_cycle": 2, "max_cycles": 3, "route": "docx", "final_cluster": "docx"},
            "state_machine": {
                "current_state": "MERGED_PROCESSED",
                "state_trace": ["RAW", "CLASSIFIED_1", "PENDING_CONVERT", "CLASSIFIED_2", "MERGED_PROCESSED"]
            },
            "created_at": "2024-05-01T09:00:00Z",
            "updated_at": "2024-05-01T10:05:00Z"
        });

        let m = Manifest::from_value(v2).unwrap();
        assert_eq!(m.schema_version, MANIFEST_SCHEMA_VERSION);
        assert_eq!(m.unit_id.as_str(), "UNIT_abc");
        assert_eq!(m.current_cycle, Cycle::new(2).unwrap());
        assert_eq!(m.state, State::MergedProcessed(Cycle::new(2).unwrap()));
        assert_eq!(m.state_trace.len(), 5);
        assert_eq!(m.files[0].kind, FileKind::Docx);
        assert_eq!(m.files[0].transformations[0].operation, OperationKind::Convert);
        assert_eq!(m.processing.route, Some(Route::Docx));
        assert_eq!(m.source.as_ref().unwrap().protocol_id, "P-77");
        assert!(m.processing.extra.contains_key("final_cluster"));
    }

    #[test]
    fn test_v2_unknown_state_is_schema_error() {
        let v2 = json!({
            "schema_version": "2.0",
            "unit_id": "U1",
            "state_machine": {"current_state": "LIMBO"}
        });
        assert!(matches!(
            Manifest::from_value(v2).unwrap_err(),
            ProtocolError::Schema(_)
        ));
    }

    #[test]
    fn test_record_transformation_moves_name_forward() {
        let mut f = FileEntry::new("a.doc", "sha256:1", 5);
        f.kind = FileKind::Doc;
        f.record(Transformation {
            operation: OperationKind::Convert,
            cycle: Cycle::FIRST,
            from_kind: Some(FileKind::Doc),
            to_kind: Some(FileKind::Docx),
            from_name: "a.doc".into(),
            to_name: "a.docx".into(),
            tool: "soffice".into(),
            at: Utc::now(),
            outcome: Outcome::Success,
        });
        assert_eq!(f.current_name, "a.docx");
        assert_eq!(f.kind, FileKind::Docx);
        assert_eq!(f.original_name, "a.doc");
    }
}
