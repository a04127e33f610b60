//! WAVE agent runtime.
//!
//! Long-running domain workers (planner, architect, frontend coder,
//! backend coder, quality reviewer) poll per-domain task queues, emit
//! progress signals, and run every produced artifact through the safety
//! layer. The supervisor ties the substrate together: it materializes
//! sessions and stories, drives the gated state machine, and exposes the
//! start/run/status/stop contract.

pub mod notify;
pub mod signals;
pub mod supervisor;
pub mod task_queue;
pub mod worker;

pub use notify::{LogNotifier, Notifier};
pub use signals::SignalPublisher;
pub use supervisor::{
    AutoApprover, GateApprover, Orchestrator, StartRequest, WorkflowError, WorkflowResult,
    WorkflowSession, WorkflowState, WorkflowStatus,
};
pub use task_queue::{AgentTask, SharedTaskQueue, TaskQueue, TaskResult, TaskStatus};
pub use worker::{ContentSafety, DomainWorker, TaskProcessor};
