//! Story status transitions and gate results.
//!
//! The transition table encodes the valid edges of the story lifecycle:
//!
//! ```text
//! pending      → in_progress | cancelled
//! in_progress  → blocked | review | complete | failed | cancelled
//! blocked      → in_progress | failed | cancelled
//! review       → in_progress | complete | failed
//! complete, failed, cancelled   (terminal)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StoryStatus;

/// Whether a story status transition is legal.
pub fn is_legal_transition(from: StoryStatus, to: StoryStatus) -> bool {
    use StoryStatus::*;

    matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Cancelled)
            | (InProgress, Blocked)
            | (InProgress, Review)
            | (InProgress, Complete)
            | (InProgress, Failed)
            | (InProgress, Cancelled)
            | (Blocked, InProgress)
            | (Blocked, Failed)
            | (Blocked, Cancelled)
            | (Review, InProgress)
            | (Review, Complete)
            | (Review, Failed)
    )
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Passed,
    Failed,
    Skipped,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GateStatus::Pending => "pending",
            GateStatus::Passed => "passed",
            GateStatus::Failed => "failed",
            GateStatus::Skipped => "skipped",
        }
    }
}

/// Result of executing one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub status: GateStatus,
    pub ac_passed: u32,
    pub ac_total: u32,
    pub error_message: Option<String>,
    pub metadata: Value,
}

impl GateResult {
    pub fn passed(gate: &str, ac_passed: u32, ac_total: u32) -> Self {
        Self {
            gate: gate.to_string(),
            status: GateStatus::Passed,
            ac_passed,
            ac_total,
            error_message: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn failed(gate: &str, ac_passed: u32, ac_total: u32, error: &str) -> Self {
        Self {
            gate: gate.to_string(),
            status: GateStatus::Failed,
            ac_passed,
            ac_total,
            error_message: Some(error.to_string()),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StoryStatus::*;

    #[test]
    fn test_legal_transitions() {
        assert!(is_legal_transition(Pending, InProgress));
        assert!(is_legal_transition(Pending, Cancelled));
        assert!(is_legal_transition(InProgress, Review));
        assert!(is_legal_transition(InProgress, Blocked));
        assert!(is_legal_transition(Blocked, InProgress));
        assert!(is_legal_transition(Review, Complete));
        assert!(is_legal_transition(Review, InProgress));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!is_legal_transition(Pending, Review));
        assert!(!is_legal_transition(Pending, Complete));
        assert!(!is_legal_transition(Blocked, Review));
        assert!(!is_legal_transition(Blocked, Complete));
        assert!(!is_legal_transition(Review, Cancelled));
        assert!(!is_legal_transition(Review, Blocked));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [Complete, Failed, Cancelled] {
            for target in [
                Pending, InProgress, Blocked, Review, Complete, Failed, Cancelled,
            ] {
                assert!(
                    !is_legal_transition(terminal, target),
                    "{terminal} → {target} must be illegal"
                );
            }
        }
    }

    #[test]
    fn test_gate_result_constructors() {
        let passed = GateResult::passed("gate-2", 1, 1);
        assert_eq!(passed.status, GateStatus::Passed);
        assert!(passed.error_message.is_none());

        let failed = GateResult::failed("gate-3", 1, 2, "coverage 60% < 70%");
        assert_eq!(failed.status, GateStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("coverage 60% < 70%"));
    }
}
