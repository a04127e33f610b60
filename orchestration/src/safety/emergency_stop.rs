//! Process-wide emergency stop.
//!
//! A latch shared by every worker in the process, triggered by any of:
//! a marker file at a configured path, a message on the emergency
//! channel, an API call, or a safety check escalating to e-stop. Workers
//! check the latch every time they leave a blocking call. Clearing
//! requires an explicit call plus marker removal; trigger/clear history
//! is preserved.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::pubsub::{ChannelManager, EventType, MessagePriority, PublishOptions, Publisher};

/// Emergency broadcast channel, outside any project namespace.
pub const EMERGENCY_STOP_CHANNEL: &str = "wave:emergency";

/// Default marker-file path.
pub const DEFAULT_STOP_FILE: &str = ".claude/EMERGENCY-STOP";

/// Raised when the latch is set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Emergency stop active: {reason}")]
pub struct EmergencyStopError {
    pub reason: String,
}

/// Record of one trigger or clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopEvent {
    pub triggered_at: DateTime<Utc>,
    pub reason: String,
    /// `file`, `stream`, `api`, or `safety`.
    pub source: String,
    pub cleared_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StopState {
    active: bool,
    reason: String,
    history: Vec<EmergencyStopEvent>,
}

fn state() -> &'static Mutex<StopState> {
    static STATE: OnceLock<Mutex<StopState>> = OnceLock::new();
    STATE.get_or_init(|| Mutex::new(StopState::default()))
}

fn lock() -> std::sync::MutexGuard<'static, StopState> {
    state().lock().unwrap_or_else(|e| e.into_inner())
}

/// Whether the process-wide latch is set. Cheap; called on every exit
/// from a blocking call.
pub fn is_active() -> bool {
    lock().active
}

/// The reason for the active stop, empty when clear.
pub fn reason() -> String {
    lock().reason.clone()
}

fn activate(reason: &str, source: &str) {
    let mut state = lock();
    if state.active {
        return;
    }
    state.active = true;
    state.reason = reason.to_string();
    state.history.push(EmergencyStopEvent {
        triggered_at: Utc::now(),
        reason: reason.to_string(),
        source: source.to_string(),
        cleared_at: None,
    });
    error!(reason, source, "EMERGENCY STOP triggered");
}

/// Emergency-stop control around the shared latch.
///
/// Instances are cheap handles; the latch itself is process-wide.
pub struct EmergencyStop {
    stop_file: PathBuf,
    publisher: Option<std::sync::Arc<Publisher>>,
}

impl EmergencyStop {
    pub fn new(stop_file: impl Into<PathBuf>) -> Self {
        Self {
            stop_file: stop_file.into(),
            publisher: None,
        }
    }

    /// Attach a publisher so triggers broadcast on the global channel.
    pub fn with_publisher(mut self, publisher: std::sync::Arc<Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn stop_file(&self) -> &Path {
        &self.stop_file
    }

    /// Check the latch, then the marker file.
    pub fn check(&self) -> bool {
        if is_active() {
            return true;
        }
        self.check_file()
    }

    /// Check whether the marker file exists, latching if it does.
    pub fn check_file(&self) -> bool {
        if !self.stop_file.exists() {
            return false;
        }
        let content = std::fs::read_to_string(&self.stop_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "File trigger".to_string());
        activate(&content, "file");
        true
    }

    /// Trip the latch: set state, write the marker file, broadcast.
    pub async fn trigger(&self, reason: &str, source: &str) {
        activate(reason, source);
        self.write_stop_file(reason);
        self.broadcast(reason).await;
    }

    /// Clear the latch and remove the marker file. History keeps the
    /// cleared event with its timestamp.
    pub fn clear(&self) {
        {
            let mut state = lock();
            if let Some(last) = state.history.last_mut() {
                if last.cleared_at.is_none() {
                    last.cleared_at = Some(Utc::now());
                }
            }
            state.active = false;
            state.reason.clear();
        }
        if self.stop_file.exists() {
            if let Err(e) = std::fs::remove_file(&self.stop_file) {
                warn!(error = %e, "Failed to remove emergency-stop marker file");
            }
        }
        info!("Emergency stop cleared");
    }

    /// Current latch status.
    pub fn status(&self) -> serde_json::Value {
        let state = lock();
        let last = state.history.last();
        json!({
            "active": state.active,
            "reason": state.reason,
            "triggered_at": last.map(|e| e.triggered_at),
            "source": last.map(|e| e.source.clone()),
            "file_exists": self.stop_file.exists(),
        })
    }

    /// Full trigger/clear history.
    pub fn history(&self) -> Vec<EmergencyStopEvent> {
        lock().history.clone()
    }

    fn write_stop_file(&self, reason: &str) {
        if let Some(parent) = self.stop_file.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "Failed to create emergency-stop directory");
                return;
            }
        }
        let body = format!("{reason}\nTriggered: {}", Utc::now().to_rfc3339());
        if let Err(e) = std::fs::write(&self.stop_file, body) {
            warn!(error = %e, "Failed to write emergency-stop marker file");
        }
    }

    async fn broadcast(&self, reason: &str) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let options = PublishOptions {
            channel: Some(ChannelManager::global_system()),
            priority: MessagePriority::Critical,
            ..Default::default()
        };
        if let Err(e) = publisher
            .publish_with(
                EventType::EmergencyStop,
                json!({"reason": reason, "action": "HALT"}),
                options,
            )
            .await
        {
            warn!(error = %e, "Failed to broadcast emergency stop");
        }
        // Best-effort copy on the dedicated emergency channel.
        let options = PublishOptions {
            channel: Some(EMERGENCY_STOP_CHANNEL.to_string()),
            priority: MessagePriority::Critical,
            ..Default::default()
        };
        if let Err(e) = publisher
            .publish_with(
                EventType::EmergencyStop,
                json!({"reason": reason, "action": "HALT"}),
                options,
            )
            .await
        {
            warn!(error = %e, "Failed to publish on emergency channel");
        }
    }
}

