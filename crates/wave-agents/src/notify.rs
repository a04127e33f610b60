//! Fire-and-forget notification capability.
//!
//! Outbound notification transports (chat, webhooks) live behind this
//! trait. Implementations must never propagate failures; an
//! observability outage never halts execution.

use serde_json::Value;
use tracing::info;

/// Fire-and-forget notifier.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &str, fields: &Value);
}

/// Notifier that writes to the log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &str, fields: &Value) {
        info!(event, fields = %fields, "notification");
    }
}

/// Notifier that drops everything.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: &str, _fields: &Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notifiers_are_infallible() {
        LogNotifier.notify("story.completed", &json!({"story_id": "S-1"}));
        NoopNotifier.notify("story.completed", &json!({"story_id": "S-1"}));
    }
}
