//! Transition table and state machine.
//!
//! The adjacency table is built from a short list of [`TransitionRule`]s
//! expanded over cycles `1..=max_cycles`. Nothing outside this module decides
//! whether a transition is legal.

use crate::error::{ProtocolError, Result};
use crate::manifest::{Manifest, StateTraceEntry};
use crate::state::{Cycle, State, StateKind};
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};

/// How the target state's cycle relates to the source state's cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleRel {
    /// Source is cycle-independent, target is in cycle 1.
    EnterFirst,
    /// Same cycle.
    Same,
    /// Same cycle, only when the source is in cycle 1.
    SameFromFirst,
    /// Next cycle, only while below the bound.
    Next,
    /// Same cycle, only when the source is already at the bound.
    SameAtBound,
    /// Target is cycle-independent.
    Leave,
}

/// One row of the adjacency table, before cycle expansion.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub from: StateKind,
    pub to: StateKind,
    pub rel: CycleRel,
}

const fn rule(from: StateKind, to: StateKind, rel: CycleRel) -> TransitionRule {
    TransitionRule { from, to, rel }
}

/// Lifecycle rules. Order is irrelevant.
pub const TRANSITION_RULES: &[TransitionRule] = &[
    rule(StateKind::Raw, StateKind::Classified, CycleRel::EnterFirst),
    rule(StateKind::Raw, StateKind::Exception, CycleRel::EnterFirst),
    // classification outcomes
    rule(StateKind::Classified, StateKind::Classified, CycleRel::Same),
    rule(StateKind::Classified, StateKind::PendingConvert, CycleRel::Same),
    rule(StateKind::Classified, StateKind::PendingExtract, CycleRel::Same),
    rule(StateKind::Classified, StateKind::PendingNormalize, CycleRel::Same),
    rule(StateKind::Classified, StateKind::MergedProcessed, CycleRel::Same),
    rule(StateKind::Classified, StateKind::MergedDirect, CycleRel::SameFromFirst),
    rule(StateKind::Classified, StateKind::Exception, CycleRel::Same),
    // repair outcomes
    rule(StateKind::PendingConvert, StateKind::Classified, CycleRel::Next),
    rule(StateKind::PendingExtract, StateKind::Classified, CycleRel::Next),
    rule(StateKind::PendingNormalize, StateKind::Classified, CycleRel::Next),
    rule(StateKind::PendingConvert, StateKind::Classified, CycleRel::SameAtBound),
    rule(StateKind::PendingExtract, StateKind::Classified, CycleRel::SameAtBound),
    rule(StateKind::PendingNormalize, StateKind::Classified, CycleRel::SameAtBound),
    rule(StateKind::PendingConvert, StateKind::Exception, CycleRel::Same),
    rule(StateKind::PendingExtract, StateKind::Exception, CycleRel::Same),
    rule(StateKind::PendingNormalize, StateKind::Exception, CycleRel::Same),
    // merge
    rule(StateKind::MergedDirect, StateKind::Ready, CycleRel::Leave),
    rule(StateKind::MergedProcessed, StateKind::Ready, CycleRel::Leave),
];

/// Every legal `(from, to)` pair for a given cycle bound.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    max_cycles: Cycle,
    edges: HashSet<(State, State)>,
}

impl TransitionTable {
    pub fn new(max_cycles: Cycle) -> Self {
        Self::from_rules(TRANSITION_RULES, max_cycles)
    }

    pub fn from_rules(rules: &[TransitionRule], max_cycles: Cycle) -> Self {
        let mut edges = HashSet::new();
        let cycles: Vec<Cycle> = (1..=max_cycles.get())
            .filter_map(|n| Cycle::new(n).ok())
            .collect();

        for r in rules {
            match r.rel {
                CycleRel::EnterFirst => {
                    edges.insert((
                        State::from_parts(r.from, Cycle::FIRST),
                        State::from_parts(r.to, Cycle::FIRST),
                    ));
                }
                CycleRel::Leave => {
                    if r.from.is_cycle_scoped() {
                        for &c in &cycles {
                            edges.insert((
                                State::from_parts(r.from, c),
                                State::from_parts(r.to, Cycle::FIRST),
                            ));
                        }
                    } else {
                        edges.insert((
                            State::from_parts(r.from, Cycle::FIRST),
                            State::from_parts(r.to, Cycle::FIRST),
                        ));
                    }
                }
                CycleRel::Same => {
                    for &c in &cycles {
                        edges.insert((State::from_parts(r.from, c), State::from_parts(r.to, c)));
                    }
                }
                CycleRel::SameFromFirst => {
                    edges.insert((
                        State::from_parts(r.from, Cycle::FIRST),
                        State::from_parts(r.to, Cycle::FIRST),
                    ));
                }
                CycleRel::Next => {
                    for &c in &cycles {
                        if c >= max_cycles {
                            continue;
                        }
                        if let Some(next) = c.succ() {
                            edges.insert((
                                State::from_parts(r.from, c),
                                State::from_parts(r.to, next),
                            ));
                        }
                    }
                }
                CycleRel::SameAtBound => {
                    edges.insert((
                        State::from_parts(r.from, max_cycles),
                        State::from_parts(r.to, max_cycles),
                    ));
                }
            }
        }

        Self { max_cycles, edges }
    }

    pub fn max_cycles(&self) -> Cycle {
        self.max_cycles
    }

    pub fn can_transition(&self, from: State, to: State) -> bool {
        self.edges.contains(&(from, to))
    }

    /// Legal successors of `from`, sorted.
    pub fn successors(&self, from: State) -> BTreeSet<State> {
        self.edges
            .iter()
            .filter(|(f, _)| *f == from)
            .map(|(_, t)| *t)
            .collect()
    }

    /// All states that appear in the table.
    pub fn states(&self) -> BTreeSet<State> {
        self.edges.iter().flat_map(|(f, t)| [*f, *t]).collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Validates and applies transitions to manifests.
#[derive(Debug, Clone)]
pub struct StateMachine {
    table: TransitionTable,
}

impl StateMachine {
    pub fn new(max_cycles: Cycle) -> Self {
        Self {
            table: TransitionTable::new(max_cycles),
        }
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn can_transition(&self, from: State, to: State) -> bool {
        self.table.can_transition(from, to)
    }

    /// Cycle of a state, defaulting cycle-independent states to cycle 1.
    pub fn current_cycle(state: State) -> Cycle {
        state.cycle().unwrap_or(Cycle::FIRST)
    }

    pub fn is_terminal(state: State) -> bool {
        state.is_terminal()
    }

    /// Apply `to` to the manifest: append to the trace, bump the cycle.
    ///
    /// The manifest is left untouched on error.
    pub fn transition(&self, manifest: &mut Manifest, to: State, reason: &str) -> Result<()> {
        let from = manifest.state;
        if !self.table.can_transition(from, to) {
            return Err(ProtocolError::InvalidTransition {
                unit: manifest.unit_id.to_string(),
                from,
                to,
            });
        }

        let now = Utc::now();
        manifest.state = to;
        if let Some(cycle) = to.cycle() {
            manifest.current_cycle = manifest.current_cycle.max(cycle);
        }
        manifest.state_trace.push(StateTraceEntry {
            state: to,
            at: now,
            reason: reason.to_string(),
        });
        manifest.updated_at = now;
        Ok(())
    }
}
