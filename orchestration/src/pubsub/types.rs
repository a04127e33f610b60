//! Message types for the WAVE event streams.
//!
//! Messages are stored as flat string-to-string field maps on the stream
//! (the broker's native entry format); the payload itself travels as JSON
//! inside the `payload` field.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{StreamError, StreamResult};

/// The closed set of WAVE event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "gate.started")]
    GateStarted,
    #[serde(rename = "gate.passed")]
    GatePassed,
    #[serde(rename = "gate.failed")]
    GateFailed,

    #[serde(rename = "story.started")]
    StoryStarted,
    #[serde(rename = "story.completed")]
    StoryCompleted,
    #[serde(rename = "story.failed")]
    StoryFailed,
    #[serde(rename = "story.blocked")]
    StoryBlocked,

    #[serde(rename = "agent.ready")]
    AgentReady,
    #[serde(rename = "agent.busy")]
    AgentBusy,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "agent.handoff")]
    AgentHandoff,

    #[serde(rename = "session.started")]
    SessionStarted,
    #[serde(rename = "session.completed")]
    SessionCompleted,
    #[serde(rename = "session.failed")]
    SessionFailed,

    #[serde(rename = "system.health")]
    HealthCheck,
    #[serde(rename = "system.emergency_stop")]
    EmergencyStop,
    #[serde(rename = "system.checkpoint")]
    CheckpointCreated,
}

impl EventType {
    /// Wire-format name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::GateStarted => "gate.started",
            EventType::GatePassed => "gate.passed",
            EventType::GateFailed => "gate.failed",
            EventType::StoryStarted => "story.started",
            EventType::StoryCompleted => "story.completed",
            EventType::StoryFailed => "story.failed",
            EventType::StoryBlocked => "story.blocked",
            EventType::AgentReady => "agent.ready",
            EventType::AgentBusy => "agent.busy",
            EventType::AgentError => "agent.error",
            EventType::AgentHandoff => "agent.handoff",
            EventType::SessionStarted => "session.started",
            EventType::SessionCompleted => "session.completed",
            EventType::SessionFailed => "session.failed",
            EventType::HealthCheck => "system.health",
            EventType::EmergencyStop => "system.emergency_stop",
            EventType::CheckpointCreated => "system.checkpoint",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gate.started" => Ok(EventType::GateStarted),
            "gate.passed" => Ok(EventType::GatePassed),
            "gate.failed" => Ok(EventType::GateFailed),
            "story.started" => Ok(EventType::StoryStarted),
            "story.completed" => Ok(EventType::StoryCompleted),
            "story.failed" => Ok(EventType::StoryFailed),
            "story.blocked" => Ok(EventType::StoryBlocked),
            "agent.ready" => Ok(EventType::AgentReady),
            "agent.busy" => Ok(EventType::AgentBusy),
            "agent.error" => Ok(EventType::AgentError),
            "agent.handoff" => Ok(EventType::AgentHandoff),
            "session.started" => Ok(EventType::SessionStarted),
            "session.completed" => Ok(EventType::SessionCompleted),
            "session.failed" => Ok(EventType::SessionFailed),
            "system.health" => Ok(EventType::HealthCheck),
            "system.emergency_stop" => Ok(EventType::EmergencyStop),
            "system.checkpoint" => Ok(EventType::CheckpointCreated),
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

/// Message priority levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Critical => "critical",
        }
    }
}

impl FromStr for MessagePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(MessagePriority::Low),
            "normal" => Ok(MessagePriority::Normal),
            "high" => Ok(MessagePriority::High),
            "critical" => Ok(MessagePriority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// A message published to a WAVE event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveMessage {
    pub event_type: EventType,
    pub payload: serde_json::Value,
    /// Agent or component that published.
    pub source: String,
    /// Project namespace for channel isolation.
    pub project: String,
    pub priority: MessagePriority,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub story_id: Option<String>,
    /// For request/response pairing.
    pub correlation_id: Option<String>,
}

impl WaveMessage {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(
        event_type: EventType,
        payload: serde_json::Value,
        source: &str,
        project: &str,
    ) -> Self {
        Self {
            event_type,
            payload,
            source: source.to_string(),
            project: project.to_string(),
            priority: MessagePriority::Normal,
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            session_id: None,
            story_id: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_story(mut self, story_id: &str) -> Self {
        self.story_id = Some(story_id.to_string());
        self
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    /// Serialize to the flat field map the broker stores.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("event_type".to_string(), self.event_type.as_str().to_string());
        fields.insert("payload".to_string(), self.payload.to_string());
        fields.insert("source".to_string(), self.source.clone());
        fields.insert("project".to_string(), self.project.clone());
        fields.insert("priority".to_string(), self.priority.as_str().to_string());
        fields.insert("message_id".to_string(), self.message_id.clone());
        fields.insert("timestamp".to_string(), self.timestamp.to_rfc3339());
        if let Some(session_id) = &self.session_id {
            fields.insert("session_id".to_string(), session_id.clone());
        }
        if let Some(story_id) = &self.story_id {
            fields.insert("story_id".to_string(), story_id.clone());
        }
        if let Some(correlation_id) = &self.correlation_id {
            fields.insert("correlation_id".to_string(), correlation_id.clone());
        }
        fields
    }

    /// Deserialize from a broker entry's field map.
    pub fn from_fields(entry_id: &str, fields: &BTreeMap<String, String>) -> StreamResult<Self> {
        let parse_err = |message: String| StreamError::Parse {
            entry_id: entry_id.to_string(),
            message,
        };

        let event_type = fields
            .get("event_type")
            .ok_or_else(|| parse_err("missing event_type".to_string()))?
            .parse::<EventType>()
            .map_err(parse_err)?;

        let payload = fields
            .get("payload")
            .map(|raw| serde_json::from_str(raw).map_err(|e| parse_err(e.to_string())))
            .transpose()?
            .unwrap_or(serde_json::Value::Null);

        let priority = fields
            .get("priority")
            .map(|raw| raw.parse::<MessagePriority>())
            .transpose()
            .map_err(parse_err)?
            .unwrap_or_default();

        let timestamp = fields
            .get("timestamp")
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| parse_err(e.to_string()))
            })
            .transpose()?
            .unwrap_or_else(Utc::now);

        Ok(Self {
            event_type,
            payload,
            source: fields.get("source").cloned().unwrap_or_default(),
            project: fields.get("project").cloned().unwrap_or_default(),
            priority,
            message_id: fields
                .get("message_id")
                .cloned()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp,
            session_id: fields.get("session_id").cloned(),
            story_id: fields.get("story_id").cloned(),
            correlation_id: fields.get("correlation_id").cloned(),
        })
    }
}

/// A raw entry read from a stream, paired with its stream id.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Broker-assigned stream id (e.g. `"1234567890-0"`).
    pub stream_id: String,
    pub message: WaveMessage,
}
