//! Recovery and resume for interrupted workflows.
//!
//! Determines the latest usable recovery point for a story and applies
//! one of four strategies: resume from the last checkpoint, resume from
//! a specific gate, restart from scratch, or skip the story entirely.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::execution::gates::GATE_SEQUENCE;
use crate::store::{
    CheckpointType, NewCheckpoint, SharedStateStore, StoreError, StoryStatus, WaveCheckpoint,
};

/// Error type for recovery operations
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Story {0} cannot be recovered (terminal or no checkpoints)")]
    NotRecoverable(String),

    #[error("No recovery points available for {0}")]
    NoRecoveryPoint(String),

    #[error("No checkpoint found for {gate} on story {story_id}")]
    MissingGateCheckpoint { story_id: String, gate: String },

    #[error("target_gate required for the resume_from_gate strategy")]
    MissingTargetGate,

    #[error("Invalid gate: {0}")]
    InvalidGate(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// How to bring an interrupted story back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Resume from the last checkpoint.
    ResumeFromLast,
    /// Resume from a specific gate's checkpoint.
    ResumeFromGate,
    /// Restart from the beginning.
    Restart,
    /// Skip the story (cancel it).
    Skip,
}

impl RecoveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStrategy::ResumeFromLast => "resume_from_last",
            RecoveryStrategy::ResumeFromGate => "resume_from_gate",
            RecoveryStrategy::Restart => "restart",
            RecoveryStrategy::Skip => "skip",
        }
    }
}

/// A checkpoint viewed as a potential recovery target.
#[derive(Debug, Clone)]
pub struct RecoveryPoint {
    pub checkpoint_id: String,
    pub checkpoint_type: CheckpointType,
    pub checkpoint_name: String,
    pub story_id: String,
    pub gate: Option<String>,
    pub state: Value,
    pub created_at: DateTime<Utc>,
    pub can_resume: bool,
    pub resume_reason: String,
}

/// Outcome of recovering one story.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub strategy: RecoveryStrategy,
    pub story_id: String,
    /// `resumed`, `restarted`, or `skipped`.
    pub status: &'static str,
    pub checkpoint_id: Option<String>,
    pub target_gate: Option<String>,
    pub recovery_time: std::time::Duration,
}

/// Outcome of recovering a whole session.
#[derive(Debug)]
pub struct SessionRecoveryReport {
    pub session_id: String,
    pub strategy: RecoveryStrategy,
    pub total_stories: usize,
    pub recovered: Vec<RecoveryReport>,
    pub failed: Vec<(String, String)>,
    pub recovery_time: std::time::Duration,
}

/// Per-session recovery posture for status reporting.
#[derive(Debug)]
pub struct RecoveryStatus {
    pub session_id: String,
    pub session_status: String,
    pub total_stories: usize,
    pub by_status: HashMap<String, usize>,
    pub recoverable_stories: Vec<RecoverableStory>,
    pub completed_stories: Vec<String>,
}

#[derive(Debug)]
pub struct RecoverableStory {
    pub story_id: String,
    pub current_status: StoryStatus,
    pub retry_count: u32,
    pub last_checkpoint: Option<(CheckpointType, Option<String>, DateTime<Utc>)>,
}

/// Restores interrupted story executions from their checkpoints.
pub struct RecoveryManager {
    store: SharedStateStore,
}

impl RecoveryManager {
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }

    /// All recovery points for a session, optionally scoped to a story.
    /// Most recent first.
    pub fn find_recovery_points(
        &self,
        session_id: &str,
        story_id: Option<&str>,
    ) -> RecoveryResult<Vec<RecoveryPoint>> {
        let checkpoints = match story_id {
            Some(story_id) => self.store.list_story_checkpoints(session_id, story_id, 100)?,
            None => self.store.list_checkpoints(session_id, 100)?,
        };
        Ok(checkpoints.into_iter().map(to_recovery_point).collect())
    }

    /// The most recent recovery point for a story.
    pub fn last_recovery_point(
        &self,
        session_id: &str,
        story_id: &str,
    ) -> RecoveryResult<Option<RecoveryPoint>> {
        let checkpoints = self.store.list_story_checkpoints(session_id, story_id, 1)?;
        Ok(checkpoints.into_iter().next().map(to_recovery_point))
    }

    /// A story is recoverable iff it exists, is not terminal-complete or
    /// cancelled, and has at least one checkpoint.
    pub fn can_recover(&self, session_id: &str, story_id: &str) -> RecoveryResult<bool> {
        let Some(execution) = self.store.get_execution_by_story(session_id, story_id)? else {
            return Ok(false);
        };
        if matches!(
            execution.status,
            StoryStatus::Complete | StoryStatus::Cancelled
        ) {
            return Ok(false);
        }
        let checkpoints = self.store.list_story_checkpoints(session_id, story_id, 1)?;
        Ok(!checkpoints.is_empty())
    }

    /// Recover a single story with the chosen strategy.
    pub fn recover_story(
        &self,
        session_id: &str,
        story_id: &str,
        strategy: RecoveryStrategy,
        target_gate: Option<&str>,
    ) -> RecoveryResult<RecoveryReport> {
        info!(
            session_id,
            story_id,
            strategy = strategy.as_str(),
            "Starting recovery"
        );
        let started = Instant::now();

        if !self.can_recover(session_id, story_id)? {
            warn!(session_id, story_id, "Recovery refused: story not recoverable");
            return Err(RecoveryError::NotRecoverable(story_id.to_string()));
        }

        let mut report = match strategy {
            RecoveryStrategy::ResumeFromLast => self.resume_from_last(session_id, story_id)?,
            RecoveryStrategy::ResumeFromGate => {
                let gate = target_gate.ok_or(RecoveryError::MissingTargetGate)?;
                self.resume_from_gate(session_id, story_id, gate)?
            }
            RecoveryStrategy::Restart => self.restart_story(session_id, story_id)?,
            RecoveryStrategy::Skip => self.skip_story(session_id, story_id)?,
        };

        report.recovery_time = started.elapsed();
        info!(
            session_id,
            story_id,
            strategy = strategy.as_str(),
            status = report.status,
            elapsed_ms = report.recovery_time.as_millis() as u64,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Apply one strategy to every non-terminal story of a session.
    pub fn recover_session(
        &self,
        session_id: &str,
        strategy: RecoveryStrategy,
    ) -> RecoveryResult<SessionRecoveryReport> {
        info!(session_id, strategy = strategy.as_str(), "Starting session recovery");
        let started = Instant::now();
        self.store.require_session(session_id)?;

        let executions = self.store.list_executions(session_id)?;
        let recoverable: Vec<_> = executions
            .iter()
            .filter(|execution| {
                !matches!(
                    execution.status,
                    StoryStatus::Complete | StoryStatus::Cancelled
                )
            })
            .collect();

        let mut recovered = Vec::new();
        let mut failed = Vec::new();
        for execution in &recoverable {
            match self.recover_story(session_id, &execution.story_id, strategy, None) {
                Ok(report) => recovered.push(report),
                Err(e) => {
                    warn!(
                        session_id,
                        story_id = %execution.story_id,
                        error = %e,
                        "Story recovery failed"
                    );
                    failed.push((execution.story_id.clone(), e.to_string()));
                }
            }
        }

        let report = SessionRecoveryReport {
            session_id: session_id.to_string(),
            strategy,
            total_stories: recoverable.len(),
            recovered,
            failed,
            recovery_time: started.elapsed(),
        };
        info!(
            session_id,
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            elapsed_ms = report.recovery_time.as_millis() as u64,
            "Session recovery complete"
        );
        Ok(report)
    }

    /// Recovery posture for a session: per-status counts plus the
    /// recoverable stories and their last checkpoints.
    pub fn recovery_status(&self, session_id: &str) -> RecoveryResult<RecoveryStatus> {
        let session = self.store.require_session(session_id)?;
        let executions = self.store.list_executions(session_id)?;

        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut recoverable_stories = Vec::new();
        let mut completed_stories = Vec::new();

        for execution in &executions {
            *by_status.entry(execution.status.to_string()).or_insert(0) += 1;

            if matches!(
                execution.status,
                StoryStatus::Complete | StoryStatus::Cancelled
            ) {
                completed_stories.push(execution.story_id.clone());
            } else if self.can_recover(session_id, &execution.story_id)? {
                let last = self
                    .last_recovery_point(session_id, &execution.story_id)?
                    .map(|point| (point.checkpoint_type, point.gate, point.created_at));
                recoverable_stories.push(RecoverableStory {
                    story_id: execution.story_id.clone(),
                    current_status: execution.status,
                    retry_count: execution.retry_count,
                    last_checkpoint: last,
                });
            }
        }

        Ok(RecoveryStatus {
            session_id: session_id.to_string(),
            session_status: session.status.to_string(),
            total_stories: executions.len(),
            by_status,
            recoverable_stories,
            completed_stories,
        })
    }

    fn resume_from_last(
        &self,
        session_id: &str,
        story_id: &str,
    ) -> RecoveryResult<RecoveryReport> {
        let point = self
            .find_recovery_points(session_id, Some(story_id))?
            .into_iter()
            .find(|point| point.can_resume)
            .ok_or_else(|| RecoveryError::NoRecoveryPoint(story_id.to_string()))?;

        let mut execution = self
            .store
            .get_execution_by_story(session_id, story_id)?
            .ok_or_else(|| RecoveryError::NotRecoverable(story_id.to_string()))?;

        if execution.status == StoryStatus::Failed {
            execution.status = StoryStatus::InProgress;
            execution.failed_at = None;
        }
        execution.touch();

        let mut batch = self.store.batch();
        batch.put_execution(&execution)?;
        batch.put_checkpoint(NewCheckpoint {
            session_id: session_id.to_string(),
            checkpoint_type: CheckpointType::Manual,
            checkpoint_name: format!("Recovered: {story_id}"),
            state: json!({
                "recovery_strategy": "resume_from_last",
                "recovered_from": point.checkpoint_id,
                "recovered_at": Utc::now(),
                "previous_state": point.state,
            }),
            story_id: Some(story_id.to_string()),
            gate: None,
            agent_id: None,
            parent_checkpoint_id: None,
        })?;
        batch.commit()?;

        Ok(RecoveryReport {
            strategy: RecoveryStrategy::ResumeFromLast,
            story_id: story_id.to_string(),
            status: "resumed",
            checkpoint_id: Some(point.checkpoint_id),
            target_gate: None,
            recovery_time: std::time::Duration::ZERO,
        })
    }

    fn resume_from_gate(
        &self,
        session_id: &str,
        story_id: &str,
        target_gate: &str,
    ) -> RecoveryResult<RecoveryReport> {
        if !GATE_SEQUENCE.contains(&target_gate) {
            return Err(RecoveryError::InvalidGate(target_gate.to_string()));
        }
        let gate_checkpoint = self
            .store
            .gate_checkpoint(session_id, story_id, target_gate)?
            .ok_or_else(|| RecoveryError::MissingGateCheckpoint {
                story_id: story_id.to_string(),
                gate: target_gate.to_string(),
            })?;

        let mut execution = self
            .store
            .get_execution_by_story(session_id, story_id)?
            .ok_or_else(|| RecoveryError::NotRecoverable(story_id.to_string()))?;

        if execution.status == StoryStatus::Failed {
            execution.status = StoryStatus::InProgress;
            execution.failed_at = None;
        }
        execution.set_current_gate(target_gate);
        execution.touch();

        let mut batch = self.store.batch();
        batch.put_execution(&execution)?;
        batch.put_checkpoint(NewCheckpoint {
            session_id: session_id.to_string(),
            checkpoint_type: CheckpointType::Manual,
            checkpoint_name: format!("Recovered to {target_gate}: {story_id}"),
            state: json!({
                "recovery_strategy": "resume_from_gate",
                "target_gate": target_gate,
                "recovered_at": Utc::now(),
            }),
            story_id: Some(story_id.to_string()),
            gate: Some(target_gate.to_string()),
            agent_id: None,
            parent_checkpoint_id: None,
        })?;
        batch.commit()?;

        Ok(RecoveryReport {
            strategy: RecoveryStrategy::ResumeFromGate,
            story_id: story_id.to_string(),
            status: "resumed",
            checkpoint_id: Some(gate_checkpoint.id),
            target_gate: Some(target_gate.to_string()),
            recovery_time: std::time::Duration::ZERO,
        })
    }

    fn restart_story(&self, session_id: &str, story_id: &str) -> RecoveryResult<RecoveryReport> {
        let mut execution = self
            .store
            .get_execution_by_story(session_id, story_id)?
            .ok_or_else(|| RecoveryError::NotRecoverable(story_id.to_string()))?;

        execution.status = StoryStatus::Pending;
        execution.started_at = None;
        execution.failed_at = None;
        execution.retry_count = 0;
        execution.acceptance_criteria_passed = 0;
        execution.error_message = None;
        execution.set_current_gate(GATE_SEQUENCE[0]);
        execution.set_metadata_field("restarted_at", json!(Utc::now()));
        execution.touch();

        let mut batch = self.store.batch();
        batch.put_execution(&execution)?;
        batch.put_checkpoint(NewCheckpoint {
            session_id: session_id.to_string(),
            checkpoint_type: CheckpointType::Manual,
            checkpoint_name: format!("Restarted: {story_id}"),
            state: json!({
                "recovery_strategy": "restart",
                "restarted_at": Utc::now(),
            }),
            story_id: Some(story_id.to_string()),
            gate: None,
            agent_id: None,
            parent_checkpoint_id: None,
        })?;
        batch.commit()?;

        Ok(RecoveryReport {
            strategy: RecoveryStrategy::Restart,
            story_id: story_id.to_string(),
            status: "restarted",
            checkpoint_id: None,
            target_gate: None,
            recovery_time: std::time::Duration::ZERO,
        })
    }

    fn skip_story(&self, session_id: &str, story_id: &str) -> RecoveryResult<RecoveryReport> {
        let mut execution = self
            .store
            .get_execution_by_story(session_id, story_id)?
            .ok_or_else(|| RecoveryError::NotRecoverable(story_id.to_string()))?;

        execution.status = StoryStatus::Cancelled;
        execution.set_metadata_field("skip_reason", json!("Manual skip via recovery"));
        execution.set_metadata_field("skipped_at", json!(Utc::now()));
        execution.touch();

        let mut batch = self.store.batch();
        batch.put_execution(&execution)?;
        batch.put_checkpoint(NewCheckpoint {
            session_id: session_id.to_string(),
            checkpoint_type: CheckpointType::Manual,
            checkpoint_name: format!("Skipped: {story_id}"),
            state: json!({
                "recovery_strategy": "skip",
                "skipped_at": Utc::now(),
            }),
            story_id: Some(story_id.to_string()),
            gate: None,
            agent_id: None,
            parent_checkpoint_id: None,
        })?;
        batch.commit()?;

        Ok(RecoveryReport {
            strategy: RecoveryStrategy::Skip,
            story_id: story_id.to_string(),
            status: "skipped",
            checkpoint_id: None,
            target_gate: None,
            recovery_time: std::time::Duration::ZERO,
        })
    }
}

/// Whether a checkpoint type can anchor a `resume_from_last`.
fn to_recovery_point(checkpoint: WaveCheckpoint) -> RecoveryPoint {
    let (can_resume, resume_reason) = match checkpoint.checkpoint_type {
        CheckpointType::Gate | CheckpointType::StoryStart | CheckpointType::AgentHandoff => (
            true,
            format!("Can resume from {}", checkpoint.checkpoint_type),
        ),
        CheckpointType::Error => (true, "Error checkpoint - can resume with caution".to_string()),
        CheckpointType::StoryComplete => (false, "Story already completed".to_string()),
        CheckpointType::Manual => (false, "Manual checkpoint is not a resume anchor".to_string()),
    };

    RecoveryPoint {
        checkpoint_id: checkpoint.id,
        checkpoint_type: checkpoint.checkpoint_type,
        checkpoint_name: checkpoint.checkpoint_name,
        story_id: checkpoint.story_id.unwrap_or_default(),
        gate: checkpoint.gate,
        state: checkpoint.state,
        created_at: checkpoint.created_at,
        can_resume,
        resume_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionContext, GateResult, StoryExecutionEngine};
    use crate::store::StateStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Fixture {
        store: SharedStateStore,
        engine: StoryExecutionEngine,
        recovery: RecoveryManager,
        session_id: String,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("test.db")).unwrap().shared();
        let session = store.create_session("demo", 1, 10.0).unwrap();
        Fixture {
            engine: StoryExecutionEngine::new(Arc::clone(&store)),
            recovery: RecoveryManager::new(Arc::clone(&store)),
            store,
            session_id: session.id,
            _dir: dir,
        }
    }

    fn start_story(fixture: &Fixture, story_id: &str) -> String {
        fixture
            .engine
            .start_execution(ExecutionContext::new(
                &fixture.session_id,
                story_id,
                "Some story",
                "be",
                "be-1",
            ))
            .unwrap()
    }

    #[test]
    fn test_can_recover_rules() {
        let fixture = fixture();
        // Unknown story.
        assert!(!fixture
            .recovery
            .can_recover(&fixture.session_id, "ghost")
            .unwrap());

        let execution_id = start_story(&fixture, "S-1");
        assert!(fixture
            .recovery
            .can_recover(&fixture.session_id, "S-1")
            .unwrap());

        // Completed stories are not recoverable.
        for gate in GATE_SEQUENCE {
            fixture
                .engine
                .execute_gate(&execution_id, &GateResult::passed(gate, 1, 1))
                .unwrap();
        }
        assert!(!fixture
            .recovery
            .can_recover(&fixture.session_id, "S-1")
            .unwrap());
    }

    #[test]
    fn test_resume_from_last_restores_gate_and_ac() {
        let fixture = fixture();
        let execution_id = start_story(&fixture, "S-1");

        for gate in &GATE_SEQUENCE[..5] {
            fixture
                .engine
                .execute_gate(&execution_id, &GateResult::passed(gate, 2, 3))
                .unwrap();
        }
        let pre_crash = fixture.engine.current_state(&execution_id).unwrap();
        let pre_crash_latest = fixture
            .recovery
            .last_recovery_point(&fixture.session_id, "S-1")
            .unwrap()
            .unwrap();

        fixture.engine.fail_execution(&execution_id, "crash").unwrap();

        let report = fixture
            .recovery
            .recover_story(
                &fixture.session_id,
                "S-1",
                RecoveryStrategy::ResumeFromLast,
                None,
            )
            .unwrap();
        assert_eq!(report.status, "resumed");

        let state = fixture.engine.current_state(&execution_id).unwrap();
        assert_eq!(state.status, StoryStatus::InProgress);
        assert_eq!(state.current_gate, pre_crash.current_gate);
        assert!(state.ac_passed >= pre_crash.ac_passed);

        // The recovery checkpoint names the anchor it resumed from. The
        // anchor is the error checkpoint written by the failure, which
        // postdates the pre-crash latest.
        let latest = fixture
            .store
            .latest_checkpoint(&fixture.session_id)
            .unwrap()
            .unwrap();
        assert_eq!(latest.checkpoint_type, CheckpointType::Manual);
        assert_eq!(latest.state["recovery_strategy"], "resume_from_last");
        assert!(latest.state["recovered_from"].is_string());
        assert!(latest.created_at >= pre_crash_latest.created_at);
    }

    #[test]
    fn test_resume_from_gate_rewinds_current_gate() {
        let fixture = fixture();
        let execution_id = start_story(&fixture, "S-1");
        for gate in &GATE_SEQUENCE[..5] {
            fixture
                .engine
                .execute_gate(&execution_id, &GateResult::passed(gate, 1, 1))
                .unwrap();
        }
        fixture.engine.fail_execution(&execution_id, "crash").unwrap();

        let report = fixture
            .recovery
            .recover_story(
                &fixture.session_id,
                "S-1",
                RecoveryStrategy::ResumeFromGate,
                Some("gate-2"),
            )
            .unwrap();
        assert_eq!(report.target_gate.as_deref(), Some("gate-2"));

        let state = fixture.engine.current_state(&execution_id).unwrap();
        assert_eq!(state.current_gate, "gate-2");
        assert_eq!(state.status, StoryStatus::InProgress);
    }

    #[test]
    fn test_resume_from_gate_requires_checkpoint() {
        let fixture = fixture();
        start_story(&fixture, "S-1");
        let err = fixture
            .recovery
            .recover_story(
                &fixture.session_id,
                "S-1",
                RecoveryStrategy::ResumeFromGate,
                Some("gate-5"),
            )
            .unwrap_err();
        assert!(matches!(err, RecoveryError::MissingGateCheckpoint { .. }));

        let err = fixture
            .recovery
            .recover_story(
                &fixture.session_id,
                "S-1",
                RecoveryStrategy::ResumeFromGate,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, RecoveryError::MissingTargetGate));
    }

    #[test]
    fn test_restart_zeroes_counters() {
        let fixture = fixture();
        let execution_id = start_story(&fixture, "S-1");
        for gate in &GATE_SEQUENCE[..3] {
            fixture
                .engine
                .execute_gate(&execution_id, &GateResult::passed(gate, 1, 1))
                .unwrap();
        }
        fixture.engine.fail_execution(&execution_id, "crash").unwrap();

        fixture
            .recovery
            .recover_story(&fixture.session_id, "S-1", RecoveryStrategy::Restart, None)
            .unwrap();

        let execution = fixture
            .store
            .get_execution_by_story(&fixture.session_id, "S-1")
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, StoryStatus::Pending);
        assert_eq!(execution.retry_count, 0);
        assert_eq!(execution.acceptance_criteria_passed, 0);
        assert!(execution.error_message.is_none());
        assert_eq!(execution.current_gate(), "gate-0");
        assert!(execution.metadata.get("restarted_at").is_some());
    }

    #[test]
    fn test_skip_cancels_story() {
        let fixture = fixture();
        let execution_id = start_story(&fixture, "S-1");
        fixture.engine.fail_execution(&execution_id, "crash").unwrap();

        let report = fixture
            .recovery
            .recover_story(&fixture.session_id, "S-1", RecoveryStrategy::Skip, None)
            .unwrap();
        assert_eq!(report.status, "skipped");

        let execution = fixture
            .store
            .get_execution_by_story(&fixture.session_id, "S-1")
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, StoryStatus::Cancelled);
        assert!(execution.metadata.get("skip_reason").is_some());
    }

    #[test]
    fn test_recover_session_touches_only_non_terminal() {
        let fixture = fixture();
        let failed_id = start_story(&fixture, "S-1");
        fixture.engine.fail_execution(&failed_id, "crash").unwrap();

        let done_id = start_story(&fixture, "S-2");
        for gate in GATE_SEQUENCE {
            fixture
                .engine
                .execute_gate(&done_id, &GateResult::passed(gate, 1, 1))
                .unwrap();
        }

        let report = fixture
            .recovery
            .recover_session(&fixture.session_id, RecoveryStrategy::ResumeFromLast)
            .unwrap();
        assert_eq!(report.total_stories, 1);
        assert_eq!(report.recovered.len(), 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.recovered[0].story_id, "S-1");
    }

    #[test]
    fn test_recovery_status_summarizes() {
        let fixture = fixture();
        let failed_id = start_story(&fixture, "S-1");
        fixture.engine.fail_execution(&failed_id, "crash").unwrap();
        start_story(&fixture, "S-2");

        let status = fixture.recovery.recovery_status(&fixture.session_id).unwrap();
        assert_eq!(status.total_stories, 2);
        assert_eq!(status.by_status.get("failed"), Some(&1));
        assert_eq!(status.by_status.get("in_progress"), Some(&1));
        assert_eq!(status.recoverable_stories.len(), 2);
        assert!(status.completed_stories.is_empty());
    }
}
