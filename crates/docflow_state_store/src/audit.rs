//! Per-unit append-only audit log (`audit.log.jsonl`).
//!
//! One JSON object per line. The log travels with the unit directory, so a
//! quarantined or merged unit carries its full history.

use crate::error::Result;
use chrono::{DateTime, Utc};
use docflow_protocol::defaults::AUDIT_LOG_FILE_NAME;
use docflow_protocol::{CorrelationId, State, UnitId};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Ingest,
    Classification,
    Transition,
    Operation,
    Error,
    Quarantine,
    Merge,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Ingest => "ingest",
            AuditEventType::Classification => "classification",
            AuditEventType::Transition => "transition",
            AuditEventType::Operation => "operation",
            AuditEventType::Error => "error",
            AuditEventType::Quarantine => "quarantine",
            AuditEventType::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub unit_id: UnitId,
    pub event_type: AuditEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_before: Option<State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_after: Option<State>,
}

impl AuditEvent {
    pub fn new(unit_id: UnitId, event_type: AuditEventType, correlation_id: CorrelationId) -> Self {
        Self {
            timestamp: Utc::now(),
            unit_id,
            event_type,
            operation: None,
            correlation_id,
            details: serde_json::Value::Null,
            state_before: None,
            state_after: None,
        }
    }

    pub fn operation(mut self, op: impl Into<String>) -> Self {
        self.operation = Some(op.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn states(mut self, before: State, after: State) -> Self {
        self.state_before = Some(before);
        self.state_after = Some(after);
        self
    }
}

/// Append one event to the unit's audit log.
pub fn append_event(unit_dir: &Path, event: &AuditEvent) -> Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(unit_dir.join(AUDIT_LOG_FILE_NAME))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Read a unit's audit log. Unparseable lines are skipped with a warning.
pub fn read_events(unit_dir: &Path) -> Result<Vec<AuditEvent>> {
    let path = unit_dir.join(AUDIT_LOG_FILE_NAME);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(std::fs::File::open(&path)?);
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(path = %path.display(), line = idx + 1, "Skipping bad audit line: {}", e),
        }
    }
    Ok(events)
}
