//! Top-level workflow supervisor.
//!
//! Materializes a session and story for each request, dispatches the
//! development work (through the task queue when distributed, inline
//! otherwise), runs the safety and budget checks between phases, and
//! drives the story through the eight gates. Exposes the
//! start/run/status/stop contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use orchestration::execution::{
    gate_config, gate_index, CompletionUpdate, ExecutionContext, ExecutionError, GateConfig,
    GateExecutor, GateResult, GateStatus, StoryExecutionEngine, GATE_SEQUENCE,
};
use orchestration::parallel::{
    check_cross_domain_conflicts, ConflictSeverity, DomainExecutor, DomainResult, ParallelError,
    ParallelExecutor, ParallelOutcome,
};
use orchestration::pubsub::{EventType, PublishOptions, Publisher, StreamError};
use orchestration::recovery::RecoveryError;
use orchestration::safety::{
    emergency_stop, BudgetState, BudgetTracker, ConstitutionalChecker, EmergencyStop,
    EmergencyStopError, EscalationLevel, SafetyState,
};
use orchestration::observability::{NoopTracer, Tracer};
use orchestration::store::{SessionStatus, SharedStateStore, StoreError, StoryStatus};
use orchestration::WaveConfig;

use crate::notify::{LogNotifier, Notifier};
use crate::task_queue::{AgentTask, SharedTaskQueue, TaskResult, TaskStatus};
use crate::worker::TaskProcessor;

/// How long the supervisor waits for a dispatched task's result.
pub const RESULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for workflow operations
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Parallel(#[from] ParallelError),

    #[error(transparent)]
    EmergencyStop(#[from] EmergencyStopError),

    #[error("Task {task_id} timed out waiting for a result")]
    TaskTimeout { task_id: String },

    #[error("Safety block on story {story_id}: {detail}")]
    SafetyBlock { story_id: String, detail: String },

    #[error("Budget exceeded for story {story_id}")]
    BudgetExceeded { story_id: String },
}

/// Result type for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Inputs for starting a workflow.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub story_id: String,
    pub story_title: String,
    pub project_path: String,
    pub requirements: String,
    pub wave_number: u32,
    pub domain: String,
    pub agent: String,
    pub token_limit: u64,
    pub cost_limit_usd: f64,
}

impl StartRequest {
    pub fn new(story_id: &str, requirements: &str) -> Self {
        Self {
            story_id: story_id.to_string(),
            story_title: story_id.to_string(),
            project_path: ".".to_string(),
            requirements: requirements.to_string(),
            wave_number: 1,
            domain: "be".to_string(),
            agent: "dev".to_string(),
            token_limit: 100_000,
            cost_limit_usd: 10.0,
        }
    }
}

/// Live workflow state. Every field also lands in the most recent
/// checkpoint's payload so a crash-and-resume is lossless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub story_id: String,
    pub requirements: String,
    pub domain: String,
    pub phase: String,
    pub current_gate: String,
    pub safety: SafetyState,
    pub budget: BudgetState,
    pub code: Option<String>,
    pub files_modified: Vec<String>,
    pub build_success: bool,
    pub tests_passing: bool,
    pub coverage: f64,
    pub error: Option<String>,
}

/// Handle for one started workflow.
#[derive(Debug, Clone)]
pub struct WorkflowSession {
    pub session_id: String,
    pub execution_id: String,
    pub story_id: String,
    pub state: WorkflowState,
}

/// External view of a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub phase: String,
    pub gate: String,
    pub progress_percent: f64,
    pub is_complete: bool,
    pub error: Option<String>,
}

/// Owner-side review for the six manual gates.
#[async_trait]
pub trait GateApprover: Send + Sync {
    async fn review(&self, config: &GateConfig, state: &WorkflowState) -> GateResult;
}

/// Approves every manual gate. Used when the external reviewers signed
/// off out of band (single-operator runs, tests).
pub struct AutoApprover;

#[async_trait]
impl GateApprover for AutoApprover {
    async fn review(&self, config: &GateConfig, _state: &WorkflowState) -> GateResult {
        GateResult::passed(config.gate, config.required_ac, config.required_ac)
    }
}

/// Top-level workflow orchestrator.
pub struct Orchestrator {
    config: WaveConfig,
    store: SharedStateStore,
    engine: StoryExecutionEngine,
    queue: SharedTaskQueue,
    publisher: Arc<Publisher>,
    gates: GateExecutor,
    checker: ConstitutionalChecker,
    budget: BudgetTracker,
    estop: EmergencyStop,
    approver: Arc<dyn GateApprover>,
    /// Inline processor used when not running distributed.
    processor: Option<Arc<dyn TaskProcessor>>,
    notifier: Arc<dyn Notifier>,
    tracer: Arc<dyn Tracer>,
    result_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        config: WaveConfig,
        store: SharedStateStore,
        queue: SharedTaskQueue,
        publisher: Arc<Publisher>,
    ) -> Self {
        let estop = EmergencyStop::new(config.emergency_stop_file.clone())
            .with_publisher(Arc::clone(&publisher));
        Self {
            engine: StoryExecutionEngine::new(Arc::clone(&store))
                .with_max_retries(config.max_retries),
            store,
            queue,
            publisher,
            gates: GateExecutor::with_builtin_validators(),
            checker: ConstitutionalChecker::new(),
            budget: BudgetTracker::new(),
            estop,
            approver: Arc::new(AutoApprover),
            processor: None,
            notifier: Arc::new(LogNotifier),
            tracer: Arc::new(NoopTracer),
            config,
            result_timeout: RESULT_TIMEOUT,
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn GateApprover>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn TaskProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    pub fn engine(&self) -> &StoryExecutionEngine {
        &self.engine
    }

    pub fn emergency_stop(&self) -> &EmergencyStop {
        &self.estop
    }

    /// Create the session and story rows and write the initial
    /// checkpoint. Returns a handle for `run`/`status`/`stop`.
    pub async fn start(&self, request: StartRequest) -> WorkflowResult<WorkflowSession> {
        let mut session = self.store.create_session(
            &self.config.project,
            request.wave_number,
            request.cost_limit_usd,
        )?;
        session.status = SessionStatus::InProgress;
        session.story_count = 1;
        session.touch();
        self.store.put_session(&session)?;

        let mut context = ExecutionContext::new(
            &session.id,
            &request.story_id,
            &request.story_title,
            &request.domain,
            &request.agent,
        );
        context.max_retries = self.config.max_retries;
        context.metadata = json!({
            "requirements": request.requirements,
            "project_path": request.project_path,
        });
        let execution_id = self.engine.start_execution(context)?;

        self.publish_event(
            EventType::SessionStarted,
            json!({"project": self.config.project, "wave_number": request.wave_number}),
            &session.id,
            &request.story_id,
        )
        .await;
        self.publish_event(
            EventType::StoryStarted,
            json!({"story_id": request.story_id, "domain": request.domain}),
            &session.id,
            &request.story_id,
        )
        .await;
        self.notifier
            .notify("story.started", &json!({"story_id": request.story_id}));

        let state = WorkflowState {
            session_id: session.id.clone(),
            story_id: request.story_id.clone(),
            requirements: request.requirements.clone(),
            domain: request.domain.clone(),
            phase: "in_progress".to_string(),
            current_gate: GATE_SEQUENCE[0].to_string(),
            safety: SafetyState::default(),
            budget: BudgetState {
                tokens_used: 0,
                token_limit: request.token_limit,
                cost_usd: 0.0,
                cost_limit_usd: request.cost_limit_usd,
            },
            code: None,
            files_modified: Vec::new(),
            build_success: false,
            tests_passing: false,
            coverage: 0.0,
            error: None,
        };

        Ok(WorkflowSession {
            session_id: session.id,
            execution_id,
            story_id: request.story_id,
            state,
        })
    }

    /// Drive the workflow to completion or a recoverable stop.
    pub async fn run(&self, session: &mut WorkflowSession) -> WorkflowResult<()> {
        loop {
            if self.estop.check() {
                return self
                    .halt_for_emergency(session, &emergency_stop::reason())
                    .await;
            }

            // Development phase: produce the story's artifacts.
            let result = self.dispatch_development(session).await?;
            if !self.absorb_task_result(session, result).await? {
                // Task failure already failed the story; surface it
                // through status() rather than an error.
                return Ok(());
            }

            // Budget gate between phases.
            let budget = self.budget.check_budget(&session.state.budget, &session.story_id);
            if !budget.allowed {
                session.state.phase = "failed".to_string();
                session.state.error = Some("budget exceeded".to_string());
                self.engine
                    .fail_execution(&session.execution_id, "budget exceeded")?;
                self.finish_session(session, false).await?;
                return Err(WorkflowError::BudgetExceeded {
                    story_id: session.story_id.clone(),
                });
            }

            // Gate phase: advance until a failure sends control back to
            // development or the story reaches a terminal status.
            match self.advance_gates(session).await? {
                GatePhaseOutcome::Complete => {
                    self.complete_story(session).await?;
                    return Ok(());
                }
                GatePhaseOutcome::StoryFailed(reason) => {
                    session.state.phase = "failed".to_string();
                    session.state.error = Some(reason);
                    self.finish_session(session, false).await?;
                    return Ok(());
                }
                GatePhaseOutcome::RetryDevelopment => continue,
            }
        }
    }

    /// `{phase, gate, progress_percent, is_complete, error}` for a
    /// workflow. Progress is `gate / 8`.
    pub fn status(&self, session: &WorkflowSession) -> WorkflowResult<WorkflowStatus> {
        let current = self.engine.current_state(&session.execution_id)?;
        let gate_number = gate_index(&current.current_gate).unwrap_or(0);
        let is_complete = current.status == StoryStatus::Complete;
        let progress_percent = if is_complete {
            100.0
        } else {
            gate_number as f64 / 8.0 * 100.0
        };

        let execution = self.store.require_execution(&session.execution_id)?;
        Ok(WorkflowStatus {
            phase: current.status.to_string(),
            gate: current.current_gate,
            progress_percent,
            is_complete,
            error: execution.error_message,
        })
    }

    /// Stop a workflow: phase failed with reason "stopped by user", a
    /// pause event for any listening workers.
    pub async fn stop(&self, session: &mut WorkflowSession) -> WorkflowResult<()> {
        session.state.phase = "failed".to_string();
        session.state.error = Some("stopped by user".to_string());

        self.publish_event(
            EventType::SessionFailed,
            json!({"reason": "stopped by user", "action": "pause"}),
            &session.session_id,
            &session.story_id,
        )
        .await;
        self.engine
            .fail_execution(&session.execution_id, "stopped by user")?;
        self.finish_session(session, false).await?;
        Ok(())
    }

    /// Fan a story out over multiple domains respecting a dependency
    /// graph; results are dispatched through the task queue.
    pub async fn execute_domains(
        &self,
        session: &WorkflowSession,
        domains: &[String],
        dependencies: &std::collections::HashMap<String, Vec<String>>,
    ) -> WorkflowResult<ParallelOutcome> {
        let executor = ParallelExecutor::new(Arc::new(QueueDomainExecutor {
            queue: Arc::clone(&self.queue),
            requirements: session.state.requirements.clone(),
            result_timeout: self.result_timeout,
        }));
        let outcome = executor
            .run(domains, dependencies, &session.story_id)
            .await?;

        let conflicts = check_cross_domain_conflicts(&outcome.domain_results);
        if conflicts.has_conflicts {
            warn!(
                story_id = %session.story_id,
                conflict_type = ?conflicts.conflict_type,
                blocking = conflicts.severity == ConflictSeverity::Blocking,
                files = ?conflicts.conflicting_files.keys().collect::<Vec<_>>(),
                "Cross-domain conflicts detected"
            );
            self.notifier.notify(
                "story.conflicts",
                &json!({
                    "story_id": session.story_id,
                    "severity": conflicts.severity,
                    "files": conflicts.conflicting_files,
                }),
            );
        }
        Ok(outcome)
    }

    async fn dispatch_development(
        &self,
        session: &WorkflowSession,
    ) -> WorkflowResult<TaskResult> {
        let task = AgentTask::new(
            &session.story_id,
            &session.state.domain,
            "implement",
            json!({"requirements": session.state.requirements}),
        );
        let task_id = task.task_id.clone();

        if self.config.distributed {
            self.queue.enqueue(task);
            return self
                .queue
                .wait_for_result(&task_id, self.result_timeout)
                .await
                .ok_or(WorkflowError::TaskTimeout { task_id });
        }

        // Inline mode: run the processor directly on this task.
        let Some(processor) = &self.processor else {
            // No coder attached; the story carries only its requirements.
            return Ok(TaskResult {
                task_id,
                status: TaskStatus::Completed,
                domain: session.state.domain.clone(),
                agent_id: "inline".to_string(),
                result: json!({"status": "completed"}),
                duration_seconds: 0.0,
                safety_score: 1.0,
                error: None,
            });
        };

        let started = std::time::Instant::now();
        match processor.process_task(&task).await {
            Ok(result) => Ok(TaskResult {
                task_id,
                status: TaskStatus::Completed,
                domain: session.state.domain.clone(),
                agent_id: "inline".to_string(),
                result,
                duration_seconds: started.elapsed().as_secs_f64(),
                safety_score: 1.0,
                error: None,
            }),
            Err(e) => Ok(TaskResult {
                task_id,
                status: TaskStatus::Failed,
                domain: session.state.domain.clone(),
                agent_id: "inline".to_string(),
                result: json!({}),
                duration_seconds: started.elapsed().as_secs_f64(),
                safety_score: 1.0,
                error: Some(e.to_string()),
            }),
        }
    }

    /// Fold a task result into the workflow state, running the
    /// constitutional check on any produced content. Returns false when
    /// the task failure already terminated the story.
    async fn absorb_task_result(
        &self,
        session: &mut WorkflowSession,
        result: TaskResult,
    ) -> WorkflowResult<bool> {
        if result.status == TaskStatus::Failed {
            let reason = result.error.unwrap_or_else(|| "task failed".to_string());
            session.state.phase = "failed".to_string();
            session.state.error = Some(reason.clone());
            self.engine.fail_execution(&session.execution_id, &reason)?;
            self.finish_session(session, false).await?;
            return Ok(false);
        }

        let code = result
            .result
            .get("code")
            .or_else(|| result.result.get("content"))
            .and_then(Value::as_str)
            .map(String::from);

        if let Some(code) = &code {
            let safety = self
                .checker
                .check(code, &format!("Story: {}", session.story_id))
                .await;
            session.state.safety = SafetyState {
                violations: safety
                    .violations
                    .iter()
                    .map(|v| format!("{}: {}", v.principle_id, v.principle_name))
                    .collect(),
                constitutional_score: safety.score,
                escalation_level: safety.escalation,
                emergency_stop: safety.escalation == EscalationLevel::EStop,
            };

            if safety.escalation == EscalationLevel::EStop {
                self.estop
                    .trigger("constitutional safety violation", "safety")
                    .await;
                let detail = session.state.safety.violations.join("; ");
                session.state.phase = "failed".to_string();
                session.state.error = Some(format!("safety block: {detail}"));
                self.engine
                    .fail_execution(&session.execution_id, "emergency stop")?;
                self.finish_session(session, false).await?;
                return Err(WorkflowError::SafetyBlock {
                    story_id: session.story_id.clone(),
                    detail,
                });
            }
        }

        if result.status == TaskStatus::Blocked {
            session.state.phase = "failed".to_string();
            session.state.error = Some("blocked by safety check".to_string());
            self.engine
                .fail_execution(&session.execution_id, "blocked by safety check")?;
            self.finish_session(session, false).await?;
            return Err(WorkflowError::SafetyBlock {
                story_id: session.story_id.clone(),
                detail: "worker result blocked".to_string(),
            });
        }

        session.state.code = code;
        if let Some(files) = result.result.get("files_modified").and_then(Value::as_array) {
            session.state.files_modified = files
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
        }
        session.state.build_success = result
            .result
            .get("build_success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        session.state.tests_passing = result
            .result
            .get("tests_passing")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        session.state.coverage = result
            .result
            .get("coverage")
            .and_then(Value::as_f64)
            .unwrap_or(100.0);

        // Account the spend.
        let tokens = result
            .result
            .get("tokens")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| {
                self.budget
                    .estimate_tokens(session.state.code.as_deref().unwrap_or(""))
            });
        let (budget, _) = self.budget.track_usage(
            session.state.budget.clone(),
            tokens,
            "default",
            &session.story_id,
        );
        session.state.budget = budget;
        Ok(true)
    }

    async fn advance_gates(
        &self,
        session: &mut WorkflowSession,
    ) -> WorkflowResult<GatePhaseOutcome> {
        loop {
            let current = self.engine.current_state(&session.execution_id)?;
            match current.status {
                StoryStatus::Complete => return Ok(GatePhaseOutcome::Complete),
                StoryStatus::Failed => {
                    let execution = self.store.require_execution(&session.execution_id)?;
                    return Ok(GatePhaseOutcome::StoryFailed(
                        execution
                            .error_message
                            .unwrap_or_else(|| "story failed".to_string()),
                    ));
                }
                _ => {}
            }

            if self.estop.check() {
                return Err(EmergencyStopError {
                    reason: emergency_stop::reason(),
                }
                .into());
            }

            let gate = current.current_gate.clone();
            session.state.current_gate = gate.clone();
            let config = gate_config(&gate)
                .ok_or_else(|| ExecutionError::InvalidGate(gate.clone()))?;

            self.publish_event(
                EventType::GateStarted,
                json!({"gate_id": gate, "owner": config.owner}),
                &session.session_id,
                &session.story_id,
            )
            .await;

            let span = self.tracer.start_span(&gate);
            let mut result = if config.auto_executable {
                let context = json!({
                    "build_success": session.state.build_success,
                    "build_output": "",
                    "tests_passing": session.state.tests_passing,
                    "coverage": session.state.coverage,
                    "required_coverage": self.config.required_coverage,
                    "checklist": ["requirements", "acceptance_criteria"],
                    "required_items": ["requirements", "acceptance_criteria"],
                });
                self.gates.execute(&gate, &context)?
            } else {
                self.approver.review(config, &session.state).await
            };

            // Snapshot the live workflow state into the gate checkpoint
            // payload so a crash-and-resume loses nothing.
            if let Value::Object(map) = &mut result.metadata {
                map.insert(
                    "workflow_state".to_string(),
                    serde_json::to_value(&session.state).unwrap_or(Value::Null),
                );
            }

            let passed = result.status == GateStatus::Passed;
            self.engine.execute_gate(&session.execution_id, &result)?;
            self.tracer.end_span(span);

            let (event, payload) = if passed {
                (
                    EventType::GatePassed,
                    json!({"gate_id": gate, "result": "pass"}),
                )
            } else {
                (
                    EventType::GateFailed,
                    json!({
                        "gate_id": gate,
                        "result": "fail",
                        "error": result.error_message,
                    }),
                )
            };
            self.publish_event(event, payload, &session.session_id, &session.story_id)
                .await;

            if !passed {
                let after = self.engine.current_state(&session.execution_id)?;
                if after.status == StoryStatus::Failed {
                    let execution = self.store.require_execution(&session.execution_id)?;
                    return Ok(GatePhaseOutcome::StoryFailed(
                        execution
                            .error_message
                            .unwrap_or_else(|| "retries exhausted".to_string()),
                    ));
                }
                warn!(
                    story_id = %session.story_id,
                    gate = %gate,
                    retry = after.retry_count,
                    "Gate failed, returning to development"
                );
                return Ok(GatePhaseOutcome::RetryDevelopment);
            }
        }
    }

    async fn complete_story(&self, session: &mut WorkflowSession) -> WorkflowResult<()> {
        session.state.phase = "complete".to_string();
        session.state.current_gate = GATE_SEQUENCE[7].to_string();

        self.engine.complete_execution(
            &session.execution_id,
            CompletionUpdate {
                files_created: Vec::new(),
                files_modified: session.state.files_modified.clone(),
                branch_name: None,
                commit_sha: None,
                pr_url: None,
                tests_passing: session.state.tests_passing,
                coverage_achieved: Some(session.state.coverage),
            },
        )?;

        self.publish_event(
            EventType::StoryCompleted,
            json!({"story_id": session.story_id}),
            &session.session_id,
            &session.story_id,
        )
        .await;
        self.notifier
            .notify("story.completed", &json!({"story_id": session.story_id}));
        self.finish_session(session, true).await?;

        info!(story_id = %session.story_id, "Workflow complete");
        Ok(())
    }

    async fn halt_for_emergency(
        &self,
        session: &mut WorkflowSession,
        reason: &str,
    ) -> WorkflowResult<()> {
        session.state.phase = "failed".to_string();
        session.state.error = Some(format!("emergency stop: {reason}"));
        self.engine
            .fail_execution(&session.execution_id, "emergency stop")?;
        self.finish_session(session, false).await?;
        Err(EmergencyStopError {
            reason: reason.to_string(),
        }
        .into())
    }

    async fn finish_session(
        &self,
        session: &WorkflowSession,
        completed: bool,
    ) -> WorkflowResult<()> {
        let mut row = self.store.require_session(&session.session_id)?;
        if completed {
            row.stories_completed += 1;
            row.status = SessionStatus::Completed;
            row.completed_at = Some(chrono::Utc::now());
        } else {
            row.stories_failed += 1;
            row.status = SessionStatus::Failed;
            row.failed_at = Some(chrono::Utc::now());
        }
        row.token_count += session.state.budget.tokens_used;
        row.actual_cost_usd += session.state.budget.cost_usd;
        row.touch();
        self.store.put_session(&row)?;

        let event = if completed {
            EventType::SessionCompleted
        } else {
            EventType::SessionFailed
        };
        self.publish_event(
            event,
            json!({"session_id": session.session_id}),
            &session.session_id,
            &session.story_id,
        )
        .await;
        Ok(())
    }

    async fn publish_event(
        &self,
        event_type: EventType,
        payload: Value,
        session_id: &str,
        story_id: &str,
    ) {
        let options = PublishOptions {
            session_id: Some(session_id.to_string()),
            story_id: Some(story_id.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.publisher.publish_with(event_type, payload, options).await {
            warn!(event_type = %event_type, error = %e, "Failed to publish workflow event");
        }
    }
}

enum GatePhaseOutcome {
    Complete,
    StoryFailed(String),
    RetryDevelopment,
}

/// Dispatches one domain's work through the task queue and converts the
/// result for the parallel executor.
struct QueueDomainExecutor {
    queue: SharedTaskQueue,
    requirements: String,
    result_timeout: Duration,
}

#[async_trait]
impl DomainExecutor for QueueDomainExecutor {
    async fn execute_domain(&self, domain: &str, story_id: &str) -> DomainResult {
        let task = AgentTask::new(
            story_id,
            domain,
            "implement",
            json!({"requirements": self.requirements}),
        );
        let task_id = task.task_id.clone();
        self.queue.enqueue(task);

        let Some(result) = self.queue.wait_for_result(&task_id, self.result_timeout).await
        else {
            return DomainResult::failure(domain, "timed out waiting for result", false);
        };

        match result.status {
            TaskStatus::Completed => DomainResult {
                domain: domain.to_string(),
                success: true,
                files_modified: result
                    .result
                    .get("files_modified")
                    .and_then(Value::as_array)
                    .map(|files| {
                        files
                            .iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
                tests_passed: result
                    .result
                    .get("tests_passing")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
                budget_used: result
                    .result
                    .get("cost_usd")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                error: None,
                critical: false,
            },
            TaskStatus::Failed | TaskStatus::Blocked => DomainResult::failure(
                domain,
                result.error.as_deref().unwrap_or("task failed"),
                false,
            ),
        }
    }
}
