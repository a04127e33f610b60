//! Command-pattern signal handlers.
//!
//! Each handler processes one signal type and is idempotent — duplicate
//! signals produce the same result without side effects.

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::execution::gates::GATE_SEQUENCE;
use crate::pubsub::WaveMessage;

/// Result of dispatching a message to a handler.
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub success: bool,
    pub action_taken: String,
    pub data: Map<String, Value>,
    pub errors: Vec<String>,
    /// Whether the entry should be acknowledged after this handler.
    pub should_ack: bool,
}

impl HandlerResult {
    pub fn ok(action_taken: &str) -> Self {
        Self {
            success: true,
            action_taken: action_taken.to_string(),
            data: Map::new(),
            errors: Vec::new(),
            should_ack: true,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data.extend(map);
        }
        self
    }
}

/// One handler per signal type.
pub trait SignalHandler: Send + Sync {
    fn handle(&self, message: &WaveMessage) -> HandlerResult;

    fn name(&self) -> &'static str;
}

/// The gate after the given one, if any. Nothing follows `gate-7`.
pub fn next_gate(gate_id: &str) -> Option<&'static str> {
    let idx = GATE_SEQUENCE.iter().position(|g| *g == gate_id)?;
    GATE_SEQUENCE.get(idx + 1).copied()
}

fn payload_str<'a>(message: &'a WaveMessage, key: &str, default: &'a str) -> &'a str {
    message.payload.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// WHEN a gate completes THEN advance to the next gate.
pub struct GateCompleteHandler;

impl SignalHandler for GateCompleteHandler {
    fn handle(&self, message: &WaveMessage) -> HandlerResult {
        let gate_id = payload_str(message, "gate_id", "unknown");
        let result = payload_str(message, "result", "unknown");
        let story_id = message
            .story_id
            .as_deref()
            .unwrap_or_else(|| payload_str(message, "story_id", "unknown"));

        info!(gate_id, story_id, result, "Gate completed");

        HandlerResult::ok(&format!("gate_advance:{gate_id}")).with_data(json!({
            "gate_id": gate_id,
            "result": result,
            "story_id": story_id,
            "next_gate": next_gate(gate_id),
        }))
    }

    fn name(&self) -> &'static str {
        "GateCompleteHandler"
    }
}

/// WHEN an agent errors THEN retry, escalating after exhaustion.
pub struct AgentErrorHandler {
    max_retries: u32,
}

impl AgentErrorHandler {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl Default for AgentErrorHandler {
    fn default() -> Self {
        Self::new(3)
    }
}

impl SignalHandler for AgentErrorHandler {
    fn handle(&self, message: &WaveMessage) -> HandlerResult {
        let agent_id = message.source.as_str();
        let error = payload_str(message, "error", "unknown error");
        let retry_count = message
            .payload
            .get("retry_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        if retry_count < self.max_retries {
            warn!(
                agent_id,
                attempt = retry_count + 1,
                max = self.max_retries,
                error,
                "Agent error, retrying"
            );
            HandlerResult::ok(&format!("retry:{agent_id}:attempt_{}", retry_count + 1)).with_data(
                json!({
                    "agent_id": agent_id,
                    "retry_count": retry_count + 1,
                    "max_retries": self.max_retries,
                    "should_retry": true,
                }),
            )
        } else {
            error!(
                agent_id,
                max = self.max_retries,
                error,
                "Agent exceeded max retries, escalating"
            );
            HandlerResult::ok(&format!("escalate:{agent_id}")).with_data(json!({
                "agent_id": agent_id,
                "retry_count": retry_count,
                "should_retry": false,
                "escalated": true,
            }))
        }
    }

    fn name(&self) -> &'static str {
        "AgentErrorHandler"
    }
}

/// WHEN an agent reports blocked THEN pause it for escalation.
pub struct AgentBlockedHandler;

impl SignalHandler for AgentBlockedHandler {
    fn handle(&self, message: &WaveMessage) -> HandlerResult {
        let agent_id = message.source.as_str();
        let reason = payload_str(message, "reason", "unknown");
        let blocked_by = payload_str(message, "blocked_by", "unknown");

        warn!(agent_id, reason, blocked_by, "Agent blocked");

        HandlerResult::ok(&format!("pause:{agent_id}")).with_data(json!({
            "agent_id": agent_id,
            "reason": reason,
            "blocked_by": blocked_by,
            "paused": true,
        }))
    }

    fn name(&self) -> &'static str {
        "AgentBlockedHandler"
    }
}

/// WHEN a session pause is requested THEN pause gracefully.
pub struct SessionPauseHandler;

impl SignalHandler for SessionPauseHandler {
    fn handle(&self, message: &WaveMessage) -> HandlerResult {
        let session_id = message
            .session_id
            .as_deref()
            .unwrap_or_else(|| payload_str(message, "session_id", "unknown"));
        let reason = payload_str(message, "reason", "manual pause");

        info!(session_id, reason, "Session pausing");

        HandlerResult::ok(&format!("session_pause:{session_id}")).with_data(json!({
            "session_id": session_id,
            "reason": reason,
            "paused": true,
        }))
    }

    fn name(&self) -> &'static str {
        "SessionPauseHandler"
    }
}

/// WHEN an emergency stop arrives THEN halt immediately.
pub struct EmergencyStopHandler;

impl SignalHandler for EmergencyStopHandler {
    fn handle(&self, message: &WaveMessage) -> HandlerResult {
        let reason = payload_str(message, "reason", "emergency stop triggered");

        error!(source = %message.source, reason, "EMERGENCY STOP");

        HandlerResult::ok("emergency_stop").with_data(json!({
            "reason": reason,
            "source": message.source,
            "halted": true,
        }))
    }

    fn name(&self) -> &'static str {
        "EmergencyStopHandler"
    }
}
