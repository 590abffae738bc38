//! Cycle bound enforcement and namespace resolution.

use docflow_protocol::{
    Cycle, ExceptionCategory, Layout, Manifest, OperationKind, Route, State, UnitId,
};
use std::path::PathBuf;
use tracing::warn;

/// Where a requested repair may go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAdmission {
    /// Hand the unit to the engine in this pending state.
    Admitted(State),
    /// The bound is reached; the unit must be quarantined instead.
    Forced {
        state: State,
        category: ExceptionCategory,
        reason: String,
    },
}

/// Where a unit goes once a repair attempt is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AfterRepair {
    Reclassify(State),
    Quarantine {
        state: State,
        category: ExceptionCategory,
    },
}

#[derive(Debug, Clone)]
pub struct CycleManager {
    max_cycles: Cycle,
    layout: Layout,
}

impl CycleManager {
    pub fn new(max_cycles: Cycle, layout: Layout) -> Self {
        Self { max_cycles, layout }
    }

    pub fn max_cycles(&self) -> Cycle {
        self.max_cycles
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The cycle after `current`, or `None` once the bound is reached.
    pub fn next_cycle(&self, current: Cycle) -> Option<Cycle> {
        current.succ().filter(|next| *next <= self.max_cycles)
    }

    /// Directory a unit with this state, category and route rests in.
    pub fn target_directory(
        &self,
        unit: &UnitId,
        state: State,
        category: Option<ExceptionCategory>,
        route: Option<Route>,
    ) -> Option<PathBuf> {
        self.layout.location(unit, state, category, route)
    }

    /// Quarantine bucket for `category` at `cycle`.
    pub fn exception_directory(&self, category: ExceptionCategory, cycle: Cycle) -> PathBuf {
        self.layout.exception_dir(category, cycle)
    }

    /// Gate a repair request for the unit's current cycle.
    ///
    /// A unit that already went through a repair in its current cycle is on
    /// its final verdict pass at the bound; another repair would need cycle
    /// N+1, so it is forced into quarantine with the category of the repair
    /// it still needed.
    pub fn admit_repair(&self, manifest: &Manifest, op: OperationKind) -> RepairAdmission {
        let cycle = manifest.current_cycle;
        let repaired_this_cycle = manifest
            .state_trace
            .iter()
            .any(|e| e.state.is_pending_repair() && e.state.cycle() == Some(cycle));

        if repaired_this_cycle || cycle > self.max_cycles {
            let reason = format!(
                "cycle bound {} reached while {} was still needed",
                self.max_cycles, op
            );
            warn!(unit = %manifest.unit_id, cycle = %cycle, operation = %op, "Cycle bound exceeded");
            return RepairAdmission::Forced {
                state: State::Exception(cycle),
                category: op.failure_category(),
                reason,
            };
        }
        RepairAdmission::Admitted(op.pending_state(cycle))
    }

    /// Next state for a unit leaving `PENDING_X_n`.
    ///
    /// Below the bound the unit moves on to the next cycle whatever the
    /// outcome. At the bound a success earns a final classification pass in
    /// the same cycle and a failure is terminal.
    pub fn after_repair(&self, op: OperationKind, cycle: Cycle, succeeded: bool) -> AfterRepair {
        match self.next_cycle(cycle) {
            Some(next) => AfterRepair::Reclassify(State::Classified(next)),
            None if succeeded => AfterRepair::Reclassify(State::Classified(cycle)),
            None => AfterRepair::Quarantine {
                state: State::Exception(cycle),
                category: op.failure_category(),
            },
        }
    }
}
