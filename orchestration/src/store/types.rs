//! Persisted row types for sessions, checkpoints, and story executions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a wave session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a story execution.
///
/// `Complete`, `Failed`, and `Cancelled` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Blocked,
    Review,
    Complete,
    Failed,
    Cancelled,
}

impl StoryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StoryStatus::Complete | StoryStatus::Failed | StoryStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Blocked => "blocked",
            StoryStatus::Review => "review",
            StoryStatus::Complete => "complete",
            StoryStatus::Failed => "failed",
            StoryStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of persisted checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Gate,
    StoryStart,
    StoryComplete,
    AgentHandoff,
    Error,
    Manual,
}

impl CheckpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointType::Gate => "gate",
            CheckpointType::StoryStart => "story_start",
            CheckpointType::StoryComplete => "story_complete",
            CheckpointType::AgentHandoff => "agent_handoff",
            CheckpointType::Error => "error",
            CheckpointType::Manual => "manual",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One coordinated run over a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveSession {
    pub id: String,
    pub project_name: String,
    pub wave_number: u32,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub budget_usd: f64,
    pub actual_cost_usd: f64,
    pub token_count: u64,
    pub story_count: u32,
    pub stories_completed: u32,
    pub stories_failed: u32,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WaveSession {
    pub fn new(project_name: &str, wave_number: u32, budget_usd: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_name: project_name.to_string(),
            wave_number,
            status: SessionStatus::Pending,
            started_at: Some(now),
            completed_at: None,
            failed_at: None,
            budget_usd,
            actual_cost_usd: 0.0,
            token_count: 0,
            story_count: 0,
            stories_completed: 0,
            stories_failed: 0,
            metadata: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Immutable state snapshot attached to a session, optionally to a story
/// and a gate. Append-only; forms a tree through `parent_checkpoint_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveCheckpoint {
    pub id: String,
    pub session_id: String,
    pub checkpoint_type: CheckpointType,
    pub checkpoint_name: String,
    pub story_id: Option<String>,
    pub gate: Option<String>,
    pub state: Value,
    pub agent_id: Option<String>,
    pub parent_checkpoint_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One story's execution inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryExecution {
    pub id: String,
    pub session_id: String,
    pub story_id: String,
    pub story_title: String,
    pub domain: String,
    pub agent: String,
    pub status: StoryStatus,
    pub priority: Option<String>,
    pub story_points: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub token_count: u64,
    pub cost_usd: f64,
    pub retry_count: u32,
    pub acceptance_criteria_passed: u32,
    pub acceptance_criteria_total: u32,
    pub tests_passing: bool,
    pub coverage_achieved: Option<f64>,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub branch_name: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoryExecution {
    pub fn new(
        session_id: &str,
        story_id: &str,
        story_title: &str,
        domain: &str,
        agent: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            story_id: story_id.to_string(),
            story_title: story_title.to_string(),
            domain: domain.to_string(),
            agent: agent.to_string(),
            status: StoryStatus::Pending,
            priority: None,
            story_points: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            token_count: 0,
            cost_usd: 0.0,
            retry_count: 0,
            acceptance_criteria_passed: 0,
            acceptance_criteria_total: 0,
            tests_passing: false,
            coverage_achieved: None,
            files_created: Vec::new(),
            files_modified: Vec::new(),
            branch_name: None,
            commit_sha: None,
            pr_url: None,
            error_message: None,
            metadata: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }

    /// The gate the story is currently at, tracked in metadata.
    pub fn current_gate(&self) -> String {
        self.metadata
            .get("current_gate")
            .and_then(Value::as_str)
            .unwrap_or("gate-0")
            .to_string()
    }

    /// Record the current gate in metadata.
    pub fn set_current_gate(&mut self, gate: &str) {
        if let Value::Object(map) = &mut self.metadata {
            map.insert(
                "current_gate".to_string(),
                Value::String(gate.to_string()),
            );
        }
    }

    pub fn set_metadata_field(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
