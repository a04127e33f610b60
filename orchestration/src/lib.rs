//! WAVE orchestration substrate.
//!
//! The reliability core under the autonomous delivery orchestrator:
//!
//! - `pubsub`: durable append-only event streams with consumer groups,
//!   acknowledgement, pending-entry takeover, and dead-letter routing.
//! - `events`: in-process dispatch of stream events to typed handlers,
//!   plus event-driven result correlation.
//! - `store`: the embedded checkpoint store for sessions, checkpoints,
//!   and story executions, with atomic write batches.
//! - `execution`: the gated story state machine (gate-0 through gate-7).
//! - `recovery`: resume/restart/skip strategies over preserved
//!   checkpoints.
//! - `worktree`: per-domain git worktrees and integration merges.
//! - `safety`: constitutional scoring, budget tracking, emergency stop.
//! - `parallel`: dependency-aware fan-out/fan-in across domains.
//! - `monitoring`: pattern-based log issue detection.
//! - `observability`: optional span hooks.

pub mod config;
pub mod events;
pub mod execution;
pub mod monitoring;
pub mod observability;
pub mod parallel;
pub mod pubsub;
pub mod recovery;
pub mod safety;
pub mod store;
pub mod worktree;

// Re-export the stream layer
pub use pubsub::{
    ChannelManager, EventType, MemoryBroker, MessagePriority, PublishOptions, Publisher,
    StreamBroker, StreamClient, StreamEntry, StreamError, StreamResult, Subscriber, WaveMessage,
};

// Re-export event routing
pub use events::{EventDispatcher, HandlerResult, ResultWaiter, SignalHandler};

// Re-export the store
pub use store::{
    CheckpointType, SessionStatus, SharedStateStore, StateStore, StoreError, StoreResult,
    StoryExecution, StoryStatus, WaveCheckpoint, WaveSession,
};

// Re-export execution
pub use execution::{
    CompletionUpdate, ExecutionContext, ExecutionError, ExecutionResult, GateExecutor, GateResult,
    GateStatus, StoryExecutionEngine, GATE_SEQUENCE,
};

// Re-export recovery
pub use recovery::{RecoveryManager, RecoveryReport, RecoveryStrategy};

// Re-export safety
pub use safety::{
    AdvisoryModel, BudgetState, BudgetTracker, ConstitutionalChecker, EmergencyStop,
    EmergencyStopError, EscalationLevel, SafetyResult, SafetyState,
};

// Re-export the parallel executor
pub use parallel::{DomainExecutor, DomainResult, ParallelExecutor, ParallelOutcome};

// Re-export the worktree manager
pub use worktree::{DomainWorktreeInfo, DomainWorktreeManager, MergeResult, WorktreeError};

// Re-export configuration
pub use config::WaveConfig;
