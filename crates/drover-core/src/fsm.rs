//! Opaque stage-FSM tokens shared between the engine and its controllers.
//!
//! The engine never interprets state values beyond the domain-neutral
//! terminal and failure checks here; everything stage-specific goes through
//! the controller's `stage_completed` predicate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State token from a controller's FSM alphabet. Empty means "not started".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(String);

impl State {
    /// Distinguished pre-check stage: node commands carry the check-item list.
    pub const CHECKING: &'static str = "checking";
    pub const SUCCESSFUL: &'static str = "successful";
    pub const FAILURE: &'static str = "failure";

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn successful() -> Self {
        Self::new(Self::SUCCESSFUL)
    }

    pub fn failure() -> Self {
        Self::new(Self::FAILURE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Task-terminal states make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self.0.as_str(), Self::SUCCESSFUL | Self::FAILURE)
    }

    pub fn is_failure(&self) -> bool {
        self.0 == Self::FAILURE
    }

    pub fn is_checking(&self) -> bool {
        self.0 == Self::CHECKING
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for State {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Success,
    Failure,
}

/// FSM input recorded against a node or a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl Event {
    pub fn success(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            action: Action::Success,
            error_msg: None,
        }
    }

    pub fn failure(kind: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            action: Action::Failure,
            error_msg: Some(error_msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_state_is_not_started() {
        let state = State::default();
        assert!(state.is_empty());
        assert!(!state.is_terminal());
        assert!(!state.is_failure());
    }

    #[test]
    fn test_terminal_and_failure_checks() {
        assert!(State::successful().is_terminal());
        assert!(State::failure().is_terminal());
        assert!(State::failure().is_failure());
        assert!(!State::successful().is_failure());
        assert!(!State::new("rolling").is_terminal());
    }

    #[test]
    fn test_checking_state_is_distinguished() {
        assert!(State::new(State::CHECKING).is_checking());
        assert!(!State::new("rolling").is_checking());
    }

    #[test]
    fn test_event_constructors() {
        let ok = Event::success("verify");
        assert_eq!(ok.action, Action::Success);
        assert!(ok.error_msg.is_none());

        let bad = Event::failure("TimeOut", "deadline exceeded");
        assert_eq!(bad.action, Action::Failure);
        assert_eq!(bad.error_msg.as_deref(), Some("deadline exceeded"));
    }
}
