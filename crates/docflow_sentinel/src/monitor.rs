//! Pipeline monitor: read-only progress view over the layout.

use crate::inventory::Inventory;
use crate::metrics::percent;
use docflow_protocol::{Cycle, ExceptionCategory, Layout, StateKind};
use docflow_state_store::ManifestStore;
use std::collections::BTreeMap;
use std::io;

/// Where every unit in the layout currently stands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub total: u64,
    pub by_state: BTreeMap<StateKind, u64>,
    pub quarantined_by_category: BTreeMap<ExceptionCategory, u64>,
    /// Deposited units without a manifest yet.
    pub fresh: u64,
    pub unreadable: u64,
    pub duplicates: u64,
    pub misplaced: u64,
    /// Units whose manifest disagrees with their directory.
    pub invalid: u64,
}

impl StatusReport {
    pub fn from_inventory(inventory: &Inventory) -> Self {
        let mut report = StatusReport {
            total: inventory.len() as u64,
            duplicates: inventory.duplicates.len() as u64,
            misplaced: inventory.misplaced.len() as u64,
            invalid: inventory.invalid().count() as u64,
            ..Default::default()
        };
        for record in &inventory.units {
            match record.state {
                Some(state) => {
                    *report.by_state.entry(state.kind()).or_default() += 1;
                    if state.kind() == StateKind::Exception {
                        let category = record.category.unwrap_or(ExceptionCategory::Anomaly);
                        *report.quarantined_by_category.entry(category).or_default() += 1;
                    }
                }
                None if record.error.is_some() => report.unreadable += 1,
                None => report.fresh += 1,
            }
        }
        report
    }

    pub fn count(&self, kind: StateKind) -> u64 {
        self.by_state.get(&kind).copied().unwrap_or(0)
    }

    pub fn ready(&self) -> u64 {
        self.count(StateKind::Ready)
    }

    pub fn quarantined(&self) -> u64 {
        self.count(StateKind::Exception)
    }

    pub fn merge_ready(&self) -> u64 {
        self.count(StateKind::MergedDirect) + self.count(StateKind::MergedProcessed)
    }

    pub fn in_progress(&self) -> u64 {
        self.total - self.ready() - self.quarantined() - self.merge_ready()
    }

    pub fn ready_pct(&self) -> f64 {
        percent(self.ready(), self.total)
    }

    pub fn quarantined_pct(&self) -> f64 {
        percent(self.quarantined(), self.total)
    }

    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        let categories: Vec<String> = self
            .quarantined_by_category
            .iter()
            .map(|(c, n)| format!("{}={}", c, n))
            .collect();
        format!(
            "Status: {} units | {} ready ({:.1}%), {} awaiting merge, {} quarantined ({:.1}%) [{}], \
             {} in progress ({} fresh, {} unreadable), {} failing validation",
            self.total,
            self.ready(),
            self.ready_pct(),
            self.merge_ready(),
            self.quarantined(),
            self.quarantined_pct(),
            categories.join(", "),
            self.in_progress(),
            self.fresh,
            self.unreadable,
            self.invalid,
        )
    }
}

/// Read-only observer; never a control-flow dependency of the pipeline.
pub struct Monitor {
    layout: Layout,
    max_cycles: Cycle,
}

impl Monitor {
    pub fn new(layout: Layout, max_cycles: Cycle) -> Self {
        Self { layout, max_cycles }
    }

    pub fn status(&self, store: &ManifestStore) -> io::Result<StatusReport> {
        let inventory = Inventory::scan(&self.layout, store, self.max_cycles)?;
        Ok(StatusReport::from_inventory(&inventory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::UnitRecord;
    use crate::validator::ValidationIssue;
    use docflow_protocol::{State, UnitId, UnitRef};

    fn record(id: &str, state: Option<State>, category: Option<ExceptionCategory>) -> UnitRecord {
        UnitRecord {
            unit: UnitRef::new(UnitId::parse(id).unwrap(), format!("/data/{}", id)),
            state,
            category,
            error: None,
            issues: Vec::new(),
        }
    }

    #[test]
    fn test_status_counts() {
        let c1 = Cycle::FIRST;
        let inventory = Inventory {
            units: vec![
                record("A", Some(State::Ready), None),
                record("B", Some(State::Ready), None),
                record("C", Some(State::Exception(c1)), Some(ExceptionCategory::Empty)),
                record("D", Some(State::MergedDirect), None),
                record("E", None, None),
            ],
            ..Default::default()
        };
        let status = StatusReport::from_inventory(&inventory);
        assert_eq!(status.total, 5);
        assert_eq!(status.ready(), 2);
        assert_eq!(status.quarantined(), 1);
        assert_eq!(status.merge_ready(), 1);
        assert_eq!(status.in_progress(), 1);
        assert_eq!(status.fresh, 1);
        assert_eq!(status.quarantined_by_category[&ExceptionCategory::Empty], 1);
        assert!((status.ready_pct() - 40.0).abs() < 1e-9);
        assert!(status.summary().contains("EMPTY=1"));
        assert_eq!(status.invalid, 0);
    }

    #[test]
    fn test_status_counts_invalid_units() {
        let mut broken = record("A", Some(State::Ready), None);
        broken.issues.push(ValidationIssue::MissingFile {
            name: "a.pdf".to_string(),
        });
        let inventory = Inventory {
            units: vec![broken, record("B", Some(State::Ready), None)],
            ..Default::default()
        };
        let status = StatusReport::from_inventory(&inventory);
        assert_eq!(status.invalid, 1);
        assert_eq!(status.ready(), 2);
        assert!(status.summary().ends_with("1 failing validation"));
    }
}
