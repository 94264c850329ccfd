//! Stage states, the allowed-transition table, and the stage machine.
//!
//! The transition table is data, not control flow: validity is a lookup,
//! and cascade blocking is a graph traversal over the prerequisite DAG.

mod machine;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use machine::{StageMachine, StageMachineError, TransitionRequest};

/// The state of one pipeline stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not yet attempted.
    NotStarted,

    /// Handler currently executing.
    Running,

    /// Completed successfully.
    Passed,

    /// Completed unsuccessfully; retry is allowed.
    Failed,

    /// Blocked by a failed predecessor.
    Blocked,
}

impl StageState {
    /// Wire form of the state, as recorded in `state_transition` strings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    /// Valid target states from this state. All other edges are forbidden.
    #[must_use]
    pub const fn allowed_targets(self) -> &'static [StageState] {
        match self {
            Self::NotStarted => &[Self::Running, Self::Blocked],
            Self::Running => &[Self::Passed, Self::Failed],
            Self::Failed => &[Self::Running],
            Self::Blocked => &[Self::NotStarted],
            Self::Passed => &[],
        }
    }

    /// Whether the edge `self -> target` is in the allowed-transition table.
    #[must_use]
    pub fn can_transition_to(self, target: StageState) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown stage state: {other}")),
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_allowed_edges_match_table() {
        use StageState::{Blocked, Failed, NotStarted, Passed, Running};

        assert!(NotStarted.can_transition_to(Running));
        assert!(NotStarted.can_transition_to(Blocked));
        assert!(Running.can_transition_to(Passed));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Running));
        assert!(Blocked.can_transition_to(NotStarted));
    }

    #[test]
    fn test_forbidden_edges() {
        use StageState::{Blocked, Failed, NotStarted, Passed, Running};

        assert!(!NotStarted.can_transition_to(Passed));
        assert!(!NotStarted.can_transition_to(Failed));
        assert!(!Running.can_transition_to(NotStarted));
        assert!(!Running.can_transition_to(Blocked));
        assert!(!Failed.can_transition_to(NotStarted));
        assert!(!Failed.can_transition_to(Passed));
        assert!(!Blocked.can_transition_to(Running));
        assert!(Passed.allowed_targets().is_empty());
    }

    #[test]
    fn test_wire_form_roundtrip() {
        for state in [
            StageState::NotStarted,
            StageState::Running,
            StageState::Passed,
            StageState::Failed,
            StageState::Blocked,
        ] {
            assert_eq!(state.as_str().parse::<StageState>().unwrap(), state);
        }
        assert!("limbo".parse::<StageState>().is_err());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&StageState::NotStarted).unwrap();
        assert_eq!(json, r#""not_started""#);
    }
}
