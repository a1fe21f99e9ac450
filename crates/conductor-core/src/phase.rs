//! Workflow phase state machine.
//!
//! Phases form a fixed, totally ordered sequence. The only legal move is to
//! the immediate successor; there is no skip-ahead and no jump-back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Brainstorming,
    Planning,
    Implementation,
    Review,
    Finishing,
}

impl Phase {
    /// Canonical order.
    pub const ALL: [Phase; 5] = [
        Phase::Brainstorming,
        Phase::Planning,
        Phase::Implementation,
        Phase::Review,
        Phase::Finishing,
    ];

    pub const INITIAL: Phase = Phase::Brainstorming;
    pub const FINAL: Phase = Phase::Finishing;

    pub fn ordinal(self) -> usize {
        match self {
            Phase::Brainstorming => 0,
            Phase::Planning => 1,
            Phase::Implementation => 2,
            Phase::Review => 3,
            Phase::Finishing => 4,
        }
    }

    /// The only phase reachable from `self`, if any.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Brainstorming => Some(Phase::Planning),
            Phase::Planning => Some(Phase::Implementation),
            Phase::Implementation => Some(Phase::Review),
            Phase::Review => Some(Phase::Finishing),
            Phase::Finishing => None,
        }
    }

    pub fn is_final(self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(&self) -> &str {
        match self {
            Phase::Brainstorming => "brainstorming",
            Phase::Planning => "planning",
            Phase::Implementation => "implementation",
            Phase::Review => "review",
            Phase::Finishing => "finishing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "brainstorming" | "brainstorm" => Some(Self::Brainstorming),
            "planning" | "plan" => Some(Self::Planning),
            "implementation" | "implement" => Some(Self::Implementation),
            "review" => Some(Self::Review),
            "finishing" | "finish" => Some(Self::Finishing),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted phase change, as recorded in a workflow's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub timestamp_ms: i64,
}

/// Check that `to` is the immediate successor of `from`.
pub fn validate_transition(from: Phase, to: Phase) -> Result<()> {
    match from.next() {
        None => Err(SchedulerError::AlreadyAtFinalPhase { phase: from }),
        Some(next) if next == to => Ok(()),
        Some(_) => Err(SchedulerError::InvalidTransition { from, to }),
    }
}
