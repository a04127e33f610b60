//! Story execution engine.
//!
//! Every state-mutating call persists the story row and exactly one
//! checkpoint in a single atomic batch; on any error the batch is
//! abandoned and nothing is visible.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::store::{
    CheckpointType, NewCheckpoint, SharedStateStore, StoryExecution, StoryStatus, WaveCheckpoint,
};

use super::gates::{gate_index, next_gate, GATE_SEQUENCE};
use super::state_machine::{is_legal_transition, GateResult, GateStatus};
use super::{ExecutionError, ExecutionResult};

/// Default retry budget per gate.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Inputs for starting a story execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_id: String,
    pub story_id: String,
    pub story_title: String,
    pub domain: String,
    pub agent: String,
    pub priority: Option<String>,
    pub story_points: Option<u32>,
    pub max_retries: u32,
    pub metadata: Value,
}

impl ExecutionContext {
    pub fn new(
        session_id: &str,
        story_id: &str,
        story_title: &str,
        domain: &str,
        agent: &str,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            story_id: story_id.to_string(),
            story_title: story_title.to_string(),
            domain: domain.to_string(),
            agent: agent.to_string(),
            priority: None,
            story_points: None,
            max_retries: DEFAULT_MAX_RETRIES,
            metadata: Value::Object(Default::default()),
        }
    }
}

/// Terminal update applied when a story completes.
#[derive(Debug, Clone, Default)]
pub struct CompletionUpdate {
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub branch_name: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub tests_passing: bool,
    pub coverage_achieved: Option<f64>,
}

/// Hydrated view of an execution plus its latest checkpoint.
#[derive(Debug, Clone)]
pub struct CurrentState {
    pub execution_id: String,
    pub story_id: String,
    pub status: StoryStatus,
    pub current_gate: String,
    pub retry_count: u32,
    pub ac_passed: u32,
    pub ac_total: u32,
    pub latest_checkpoint: Option<WaveCheckpoint>,
}

/// Drives story executions through the gated state machine.
pub struct StoryExecutionEngine {
    store: SharedStateStore,
    max_retries: u32,
}

impl StoryExecutionEngine {
    pub fn new(store: SharedStateStore) -> Self {
        Self {
            store,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    /// Start a story execution.
    ///
    /// Creates the execution row, writes the `story_start` checkpoint,
    /// and moves the story to `in_progress`. Fails if the session is
    /// unknown or the story already exists in it.
    pub fn start_execution(&self, context: ExecutionContext) -> ExecutionResult<String> {
        self.store.require_session(&context.session_id)?;

        if self
            .store
            .get_execution_by_story(&context.session_id, &context.story_id)?
            .is_some()
        {
            return Err(ExecutionError::DuplicateStory {
                session_id: context.session_id,
                story_id: context.story_id,
            });
        }

        let mut execution = StoryExecution::new(
            &context.session_id,
            &context.story_id,
            &context.story_title,
            &context.domain,
            &context.agent,
        );
        execution.priority = context.priority;
        execution.story_points = context.story_points;
        execution.metadata = context.metadata;
        execution.set_current_gate(GATE_SEQUENCE[0]);
        execution.status = StoryStatus::InProgress;
        execution.started_at = Some(Utc::now());
        execution.touch();

        let mut batch = self.store.batch();
        batch.put_execution(&execution)?;
        batch.put_checkpoint(NewCheckpoint {
            session_id: execution.session_id.clone(),
            checkpoint_type: CheckpointType::StoryStart,
            checkpoint_name: format!("Started {}", execution.story_id),
            state: json!({
                "current_gate": execution.current_gate(),
                "retry_count": 0,
                "started_at": execution.started_at,
            }),
            story_id: Some(execution.story_id.clone()),
            gate: None,
            agent_id: Some(execution.agent.clone()),
            parent_checkpoint_id: None,
        })?;
        batch.commit()?;

        info!(
            execution_id = %execution.id,
            story_id = %execution.story_id,
            domain = %execution.domain,
            "Story execution started"
        );
        Ok(execution.id)
    }

    /// Transition a story to a new status.
    ///
    /// Writes an `agent_handoff` checkpoint for transitions into review,
    /// a `manual` checkpoint otherwise.
    pub fn transition_state(
        &self,
        execution_id: &str,
        new_status: StoryStatus,
        reason: Option<&str>,
    ) -> ExecutionResult<()> {
        let mut execution = self.require_execution(execution_id)?;
        let current = execution.status;

        if !is_legal_transition(current, new_status) {
            return Err(ExecutionError::InvalidTransition {
                from: current.to_string(),
                to: new_status.to_string(),
            });
        }

        execution.status = new_status;
        match new_status {
            StoryStatus::Complete => execution.completed_at = Some(Utc::now()),
            StoryStatus::Failed => execution.failed_at = Some(Utc::now()),
            _ => {}
        }
        if let Some(reason) = reason {
            execution.set_metadata_field("last_transition_reason", json!(reason));
        }
        execution.touch();

        let checkpoint_type = if new_status == StoryStatus::Review {
            CheckpointType::AgentHandoff
        } else {
            CheckpointType::Manual
        };

        let mut batch = self.store.batch();
        batch.put_execution(&execution)?;
        batch.put_checkpoint(NewCheckpoint {
            session_id: execution.session_id.clone(),
            checkpoint_type,
            checkpoint_name: format!("Transitioned to {new_status}"),
            state: json!({
                "previous_state": current,
                "new_state": new_status,
                "reason": reason,
                "timestamp": Utc::now(),
            }),
            story_id: Some(execution.story_id.clone()),
            gate: None,
            agent_id: Some(execution.agent.clone()),
            parent_checkpoint_id: None,
        })?;
        batch.commit()?;

        debug!(execution_id, from = %current, to = %new_status, "State transition");
        Ok(())
    }

    /// Apply a gate result.
    ///
    /// A passing gate records a `gate` checkpoint and advances
    /// `current_gate`; passing `gate-7` completes the story. A failing
    /// gate records the same checkpoint with `status=failed` and either
    /// increments the retry counter or, once retries are exhausted,
    /// fails the story.
    pub fn execute_gate(
        &self,
        execution_id: &str,
        gate_result: &GateResult,
    ) -> ExecutionResult<()> {
        if gate_index(&gate_result.gate).is_none() {
            return Err(ExecutionError::InvalidGate(gate_result.gate.clone()));
        }
        if gate_result.ac_passed > gate_result.ac_total {
            return Err(ExecutionError::Store(crate::store::StoreError::Validation(
                format!(
                    "ac_passed {} exceeds ac_total {}",
                    gate_result.ac_passed, gate_result.ac_total
                ),
            )));
        }

        let mut execution = self.require_execution(execution_id)?;
        if execution.status.is_terminal() {
            return Err(ExecutionError::InvalidTransition {
                from: execution.status.to_string(),
                to: "gate execution".to_string(),
            });
        }
        execution.acceptance_criteria_passed = gate_result.ac_passed;
        execution.acceptance_criteria_total = gate_result.ac_total;

        let mut retries_exhausted = false;
        match gate_result.status {
            GateStatus::Failed => {
                if execution.retry_count >= self.max_retries {
                    retries_exhausted = true;
                    execution.status = StoryStatus::Failed;
                    execution.failed_at = Some(Utc::now());
                    execution.error_message = Some(format!(
                        "{} failed: {}",
                        gate_result.gate,
                        gate_result.error_message.as_deref().unwrap_or("unknown")
                    ));
                } else {
                    execution.retry_count += 1;
                }
            }
            GateStatus::Passed => {
                if let Some(next) = next_gate(&gate_result.gate) {
                    execution.set_current_gate(next);
                }
            }
            GateStatus::Pending | GateStatus::Skipped => {}
        }
        execution.touch();

        let mut batch = self.store.batch();
        batch.put_execution(&execution)?;
        batch.put_checkpoint(NewCheckpoint {
            session_id: execution.session_id.clone(),
            checkpoint_type: CheckpointType::Gate,
            checkpoint_name: format!("{}: {}", gate_result.gate, gate_result.status.as_str()),
            state: json!({
                "gate": gate_result.gate,
                "status": gate_result.status,
                "ac_passed": gate_result.ac_passed,
                "ac_total": gate_result.ac_total,
                "error_message": gate_result.error_message,
                "metadata": gate_result.metadata,
                "timestamp": Utc::now(),
            }),
            story_id: Some(execution.story_id.clone()),
            gate: Some(gate_result.gate.clone()),
            agent_id: Some(execution.agent.clone()),
            parent_checkpoint_id: None,
        })?;
        batch.commit()?;

        debug!(
            execution_id,
            gate = %gate_result.gate,
            status = gate_result.status.as_str(),
            retry_count = execution.retry_count,
            "Gate executed"
        );

        if retries_exhausted {
            info!(execution_id, gate = %gate_result.gate, "Retries exhausted, story failed");
        } else if gate_result.status == GateStatus::Passed
            && next_gate(&gate_result.gate).is_none()
        {
            // All gates passed.
            self.transition_state(execution_id, StoryStatus::Complete, Some("All gates passed"))?;
        }
        Ok(())
    }

    /// Mark an execution complete, recording its produced artifacts.
    pub fn complete_execution(
        &self,
        execution_id: &str,
        update: CompletionUpdate,
    ) -> ExecutionResult<()> {
        let mut execution = self.require_execution(execution_id)?;

        // Completing an already-complete story only fills in artifacts;
        // any other starting status must be a legal edge.
        if execution.status != StoryStatus::Complete
            && !is_legal_transition(execution.status, StoryStatus::Complete)
        {
            return Err(ExecutionError::InvalidTransition {
                from: execution.status.to_string(),
                to: StoryStatus::Complete.to_string(),
            });
        }

        execution.status = StoryStatus::Complete;
        execution.completed_at = Some(Utc::now());
        execution.tests_passing = update.tests_passing;
        execution.coverage_achieved = update.coverage_achieved;
        execution.files_created = update.files_created.clone();
        execution.files_modified = update.files_modified.clone();
        execution.branch_name = update.branch_name.clone();
        execution.commit_sha = update.commit_sha.clone();
        execution.pr_url = update.pr_url.clone();
        execution.touch();

        let mut batch = self.store.batch();
        batch.put_execution(&execution)?;
        batch.put_checkpoint(NewCheckpoint {
            session_id: execution.session_id.clone(),
            checkpoint_type: CheckpointType::StoryComplete,
            checkpoint_name: format!("Completed {}", execution.story_id),
            state: json!({
                "files_created": update.files_created,
                "files_modified": update.files_modified,
                "branch_name": update.branch_name,
                "commit_sha": update.commit_sha,
                "pr_url": update.pr_url,
                "tests_passing": update.tests_passing,
                "coverage_achieved": update.coverage_achieved,
                "completed_at": execution.completed_at,
            }),
            story_id: Some(execution.story_id.clone()),
            gate: None,
            agent_id: Some(execution.agent.clone()),
            parent_checkpoint_id: None,
        })?;
        batch.commit()?;

        info!(execution_id, story_id = %execution.story_id, "Story execution completed");
        Ok(())
    }

    /// Mark an execution failed with a reason.
    pub fn fail_execution(&self, execution_id: &str, error_message: &str) -> ExecutionResult<()> {
        let mut execution = self.require_execution(execution_id)?;

        execution.status = StoryStatus::Failed;
        execution.failed_at = Some(Utc::now());
        execution.error_message = Some(error_message.to_string());
        execution.touch();

        let mut batch = self.store.batch();
        batch.put_execution(&execution)?;
        batch.put_checkpoint(NewCheckpoint {
            session_id: execution.session_id.clone(),
            checkpoint_type: CheckpointType::Error,
            checkpoint_name: format!("Failed: {}", execution.story_id),
            state: json!({
                "error_message": error_message,
                "retry_count": execution.retry_count,
                "failed_at": execution.failed_at,
            }),
            story_id: Some(execution.story_id.clone()),
            gate: None,
            agent_id: Some(execution.agent.clone()),
            parent_checkpoint_id: None,
        })?;
        batch.commit()?;

        info!(execution_id, story_id = %execution.story_id, error_message, "Story execution failed");
        Ok(())
    }

    /// Hydrate an execution plus its latest checkpoint.
    pub fn current_state(&self, execution_id: &str) -> ExecutionResult<CurrentState> {
        let execution = self.require_execution(execution_id)?;
        let latest_checkpoint = self.store.latest_checkpoint(&execution.session_id)?;

        Ok(CurrentState {
            execution_id: execution.id.clone(),
            story_id: execution.story_id.clone(),
            status: execution.status,
            current_gate: execution.current_gate(),
            retry_count: execution.retry_count,
            ac_passed: execution.acceptance_criteria_passed,
            ac_total: execution.acceptance_criteria_total,
            latest_checkpoint,
        })
    }

    fn require_execution(&self, execution_id: &str) -> ExecutionResult<StoryExecution> {
        self.store
            .get_execution(execution_id)?
            .ok_or_else(|| ExecutionError::NotFound(format!("execution {execution_id}")))
    }
}
