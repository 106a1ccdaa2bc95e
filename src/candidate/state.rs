//! Candidate lifecycle states and the transition table
//!
//! ```text
//! pendiente ──► hipotesis ──► validado ──► (promotion, estado unchanged)
//!     │             │             │
//!     ├─────────────┴──► rechazado (terminal)
//!     └─────────────┬─────────────┴──► fusionado (terminal, via merge)
//! validado ──► pendiente   (administrative bulk revert only)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a candidate code (`estado`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateState {
    #[serde(rename = "pendiente")]
    Pending,
    #[serde(rename = "hipotesis")]
    Hypothesis,
    #[serde(rename = "validado")]
    Validated,
    #[serde(rename = "rechazado")]
    Rejected,
    #[serde(rename = "fusionado")]
    Merged,
}

/// An edge request against the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Validate,
    Reject,
    Hypothesize,
    Merge,
    /// Administrative bulk revert of validated rows.
    AdminRevert,
}

/// A transition that has no edge from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {transition} a candidate in state '{from}'")]
pub struct InvalidTransition {
    pub from: CandidateState,
    pub transition: Transition,
}

/// A state or origin label that is not part of the closed vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} label: '{label}'")]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub label: String,
}

impl CandidateState {
    pub const ALL: [CandidateState; 5] = [
        Self::Pending,
        Self::Hypothesis,
        Self::Validated,
        Self::Rejected,
        Self::Merged,
    ];

    /// States that can still be acted on from the candidate tray.
    pub const BACKLOG: [CandidateState; 2] = [Self::Pending, Self::Hypothesis];

    /// States a merge may move to `fusionado`.
    pub const MERGEABLE: [CandidateState; 3] = [Self::Pending, Self::Hypothesis, Self::Validated];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pendiente",
            Self::Hypothesis => "hipotesis",
            Self::Validated => "validado",
            Self::Rejected => "rechazado",
            Self::Merged => "fusionado",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Merged)
    }

    /// Resolve a transition against the table.
    pub fn apply(self, transition: Transition) -> Result<CandidateState, InvalidTransition> {
        use CandidateState::*;
        use Transition::*;

        let next = match (self, transition) {
            (Pending, Validate) | (Hypothesis, Validate) => Some(Validated),
            (Pending, Reject) | (Hypothesis, Reject) => Some(Rejected),
            (Pending, Hypothesize) => Some(Hypothesis),
            (Pending, Merge) | (Hypothesis, Merge) | (Validated, Merge) => Some(Merged),
            (Validated, AdminRevert) => Some(Pending),
            (Validated, Validate) | (Validated, Reject) | (Validated, Hypothesize) => None,
            (Hypothesis, Hypothesize) | (Hypothesis, AdminRevert) | (Pending, AdminRevert) => None,
            (Rejected, _) | (Merged, _) => None,
        };

        next.ok_or(InvalidTransition {
            from: self,
            transition,
        })
    }

    /// True if some transition leads from `self` to `next`.
    pub fn can_reach(self, next: CandidateState) -> bool {
        Transition::ALL
            .iter()
            .any(|t| self.apply(*t).map(|s| s == next).unwrap_or(false))
    }
}

impl Transition {
    pub const ALL: [Transition; 5] = [
        Self::Validate,
        Self::Reject,
        Self::Hypothesize,
        Self::Merge,
        Self::AdminRevert,
    ];
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Validate => "validate",
            Self::Reject => "reject",
            Self::Hypothesize => "mark as hypothesis",
            Self::Merge => "merge",
            Self::AdminRevert => "revert",
        };
        f.write_str(verb)
    }
}

impl FromStr for CandidateState {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pendiente" => Ok(Self::Pending),
            "hipotesis" => Ok(Self::Hypothesis),
            "validado" => Ok(Self::Validated),
            "rechazado" => Ok(Self::Rejected),
            "fusionado" => Ok(Self::Merged),
            _ => Err(UnknownLabel {
                kind: "estado",
                label: s.to_string(),
            }),
        }
    }
}
