//! Unit lifecycle states.
//!
//! A state is either cycle-scoped (`CLASSIFIED_2`, `EXCEPTION_3`, ...) or
//! cycle-independent (`RAW`, `MERGED_DIRECT`, `READY`). The textual form is the
//! canonical persisted representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classify → repair iteration number, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Cycle(u8);

impl Cycle {
    pub const FIRST: Cycle = Cycle(1);

    pub fn new(n: u8) -> Result<Self, String> {
        if n == 0 {
            return Err("Invalid cycle: cycles are 1-based".to_string());
        }
        Ok(Self(n))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// The following cycle, without regard to any bound.
    pub fn succ(self) -> Option<Cycle> {
        self.0.checked_add(1).map(Cycle)
    }

    pub fn is_first(self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for Cycle {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Cycle::new(value)
    }
}

impl From<Cycle> for u8 {
    fn from(cycle: Cycle) -> Self {
        cycle.0
    }
}

/// State family, i.e. a state with its cycle erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKind {
    Raw,
    Classified,
    PendingConvert,
    PendingExtract,
    PendingNormalize,
    MergedDirect,
    MergedProcessed,
    Exception,
    Ready,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Raw => "RAW",
            StateKind::Classified => "CLASSIFIED",
            StateKind::PendingConvert => "PENDING_CONVERT",
            StateKind::PendingExtract => "PENDING_EXTRACT",
            StateKind::PendingNormalize => "PENDING_NORMALIZE",
            StateKind::MergedDirect => "MERGED_DIRECT",
            StateKind::MergedProcessed => "MERGED_PROCESSED",
            StateKind::Exception => "EXCEPTION",
            StateKind::Ready => "READY",
        }
    }

    /// Whether states of this family carry a cycle suffix.
    pub fn is_cycle_scoped(&self) -> bool {
        matches!(
            self,
            StateKind::Classified
                | StateKind::PendingConvert
                | StateKind::PendingExtract
                | StateKind::PendingNormalize
                | StateKind::MergedProcessed
                | StateKind::Exception
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            StateKind::PendingConvert | StateKind::PendingExtract | StateKind::PendingNormalize
        )
    }

    pub const ALL: [StateKind; 9] = [
        StateKind::Raw,
        StateKind::Classified,
        StateKind::PendingConvert,
        StateKind::PendingExtract,
        StateKind::PendingNormalize,
        StateKind::MergedDirect,
        StateKind::MergedProcessed,
        StateKind::Exception,
        StateKind::Ready,
    ];
}

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum State {
    Raw,
    Classified(Cycle),
    PendingConvert(Cycle),
    PendingExtract(Cycle),
    PendingNormalize(Cycle),
    MergedDirect,
    MergedProcessed(Cycle),
    Exception(Cycle),
    Ready,
}

impl State {
    /// Build a state from its family and cycle.
    ///
    /// The cycle is ignored for cycle-independent families.
    pub fn from_parts(kind: StateKind, cycle: Cycle) -> State {
        match kind {
            StateKind::Raw => State::Raw,
            StateKind::Classified => State::Classified(cycle),
            StateKind::PendingConvert => State::PendingConvert(cycle),
            StateKind::PendingExtract => State::PendingExtract(cycle),
            StateKind::PendingNormalize => State::PendingNormalize(cycle),
            StateKind::MergedDirect => State::MergedDirect,
            StateKind::MergedProcessed => State::MergedProcessed(cycle),
            StateKind::Exception => State::Exception(cycle),
            StateKind::Ready => State::Ready,
        }
    }

    pub fn kind(&self) -> StateKind {
        match self {
            State::Raw => StateKind::Raw,
            State::Classified(_) => StateKind::Classified,
            State::PendingConvert(_) => StateKind::PendingConvert,
            State::PendingExtract(_) => StateKind::PendingExtract,
            State::PendingNormalize(_) => StateKind::PendingNormalize,
            State::MergedDirect => StateKind::MergedDirect,
            State::MergedProcessed(_) => StateKind::MergedProcessed,
            State::Exception(_) => StateKind::Exception,
            State::Ready => StateKind::Ready,
        }
    }

    /// Cycle encoded in the state name, `None` for cycle-independent states.
    pub fn cycle(&self) -> Option<Cycle> {
        match self {
            State::Classified(c)
            | State::PendingConvert(c)
            | State::PendingExtract(c)
            | State::PendingNormalize(c)
            | State::MergedProcessed(c)
            | State::Exception(c) => Some(*c),
            State::Raw | State::MergedDirect | State::Ready => None,
        }
    }

    /// READY and every EXCEPTION_n.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Ready | State::Exception(_))
    }

    /// Awaiting the Merger.
    pub fn is_merge_ready(&self) -> bool {
        matches!(self, State::MergedDirect | State::MergedProcessed(_))
    }

    pub fn is_pending_repair(&self) -> bool {
        self.kind().is_pending()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cycle() {
            Some(cycle) => write!(f, "{}_{}", self.kind().as_str(), cycle),
            None => write!(f, "{}", self.kind().as_str()),
        }
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("Invalid state: '{}'", s);

        for kind in StateKind::ALL {
            if !kind.is_cycle_scoped() {
                if s == kind.as_str() {
                    return Ok(State::from_parts(kind, Cycle::FIRST));
                }
                continue;
            }
            let Some(rest) = s.strip_prefix(kind.as_str()) else {
                continue;
            };
            let Some(digits) = rest.strip_prefix('_') else {
                continue;
            };
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let n: u8 = digits.parse().map_err(|_| invalid())?;
            let cycle = Cycle::new(n).map_err(|_| invalid())?;
            return Ok(State::from_parts(kind, cycle));
        }

        Err(invalid())
    }
}

impl TryFrom<String> for State {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<State> for String {
    fn from(state: State) -> Self {
        state.to_string()
    }
}
