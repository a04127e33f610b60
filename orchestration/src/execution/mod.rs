//! Gated story execution.
//!
//! The engine drives one story through eight numbered gates, persisting
//! exactly one checkpoint in the same atomic write as every state
//! mutation so a crash-and-resume is lossless.

mod engine;
pub mod gates;
mod state_machine;

pub use engine::{CompletionUpdate, CurrentState, ExecutionContext, StoryExecutionEngine};
pub use gates::{
    build_validator, gate_config, gate_index, next_gate, self_review_validator, test_validator,
    GateConfig, GateExecutor, GATE_SEQUENCE,
};
pub use state_machine::{is_legal_transition, GateResult, GateStatus};

use crate::store::StoreError;

/// Error type for execution operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Story {story_id} already exists in session {session_id}")]
    DuplicateStory {
        session_id: String,
        story_id: String,
    },

    #[error("Invalid gate: {0}")]
    InvalidGate(String),

    #[error("No validator registered for auto-executable gate {0}")]
    MissingValidator(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for execution operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;
