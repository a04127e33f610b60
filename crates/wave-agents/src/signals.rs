//! Agent-side signal emission.
//!
//! Every worker embeds a [`SignalPublisher`]: ready/busy/error signals,
//! gate outcomes, and a periodic progress heartbeat on a spawned task.
//! All publishing is non-blocking; broker failures are logged and
//! swallowed so a degraded broker never stops an agent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use orchestration::pubsub::{EventType, MessagePriority, PublishOptions, Publisher};

/// Seconds between progress heartbeats while a task is running.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct Heartbeat {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

/// Publishes agent lifecycle signals and heartbeats.
///
/// Built with `publisher = None` for graceful degradation: every emit
/// becomes a logged no-op.
pub struct SignalPublisher {
    publisher: Option<Arc<Publisher>>,
    agent_id: String,
    domain: String,
    session_id: String,
    publish_count: AtomicU64,
    heartbeat: Mutex<Option<Heartbeat>>,
    heartbeat_interval: Duration,
}

impl SignalPublisher {
    pub fn new(publisher: Option<Arc<Publisher>>, agent_id: &str, domain: &str) -> Self {
        Self {
            publisher,
            agent_id: agent_id.to_string(),
            domain: domain.to_string(),
            session_id: Uuid::new_v4().to_string(),
            publish_count: AtomicU64::new(0),
            heartbeat: Mutex::new(None),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Total signals published.
    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::SeqCst)
    }

    /// Publish agent ready.
    pub async fn signal_ready(&self) {
        self.safe_publish(
            EventType::AgentReady,
            json!({
                "agent_id": self.agent_id,
                "domain": self.domain,
                "status": "ready",
            }),
            None,
            MessagePriority::Normal,
        )
        .await;
    }

    /// Publish agent busy on a story.
    pub async fn signal_busy(&self, story_id: &str) {
        self.safe_publish(
            EventType::AgentBusy,
            json!({
                "agent_id": self.agent_id,
                "domain": self.domain,
                "status": "busy",
            }),
            Some(story_id),
            MessagePriority::Normal,
        )
        .await;
    }

    /// Publish an agent error.
    pub async fn signal_error(&self, error: &str, story_id: &str, retry_count: u32) {
        self.safe_publish(
            EventType::AgentError,
            json!({
                "error": error,
                "retry_count": retry_count,
                "agent_id": self.agent_id,
                "domain": self.domain,
            }),
            Some(story_id),
            MessagePriority::High,
        )
        .await;
    }

    /// Publish a gate pass.
    pub async fn signal_gate_complete(&self, gate_id: &str, result: &str, story_id: &str) {
        self.safe_publish(
            EventType::GatePassed,
            json!({
                "gate_id": gate_id,
                "result": result,
                "agent_id": self.agent_id,
                "domain": self.domain,
            }),
            Some(story_id),
            MessagePriority::Normal,
        )
        .await;
    }

    /// Publish a gate failure.
    pub async fn signal_gate_failed(&self, gate_id: &str, error: &str, story_id: &str) {
        self.safe_publish(
            EventType::GateFailed,
            json!({
                "gate_id": gate_id,
                "error": error,
                "agent_id": self.agent_id,
                "domain": self.domain,
            }),
            Some(story_id),
            MessagePriority::High,
        )
        .await;
    }

    /// Publish a progress signal.
    pub async fn signal_progress(&self, story_id: &str, detail: &str) {
        self.safe_publish(
            EventType::HealthCheck,
            json!({
                "agent_id": self.agent_id,
                "domain": self.domain,
                "detail": detail,
                "type": "progress",
            }),
            Some(story_id),
            MessagePriority::Low,
        )
        .await;
    }

    /// Start the periodic progress heartbeat for a story.
    ///
    /// At most one heartbeat task runs per publisher; starting again
    /// while one runs is a no-op. The publisher is shared with the
    /// heartbeat task, so call through an `Arc` clone.
    pub fn start_heartbeat(self: Arc<Self>, story_id: &str) {
        let mut slot = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let token = stop.clone();
        let publisher = Arc::clone(&self);
        let story_id = story_id.to_string();
        let interval = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        publisher.signal_progress(&story_id, "heartbeat").await;
                    }
                }
            }
        });
        *slot = Some(Heartbeat { handle, stop });
    }

    /// Stop the heartbeat task, if any.
    pub fn stop_heartbeat(&self) {
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop.cancel();
            heartbeat.handle.abort();
        }
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    async fn safe_publish(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        story_id: Option<&str>,
        priority: MessagePriority,
    ) {
        let Some(publisher) = &self.publisher else {
            debug!(agent_id = %self.agent_id, event_type = %event_type, "Signals disabled, skipping");
            return;
        };

        let options = PublishOptions {
            session_id: Some(self.session_id.clone()),
            story_id: story_id.map(String::from),
            priority,
            ..Default::default()
        };
        match publisher.publish_with(event_type, payload, options).await {
            Ok(stream_id) => {
                self.publish_count.fetch_add(1, Ordering::SeqCst);
                debug!(
                    event_type = %event_type,
                    agent_id = %self.agent_id,
                    stream_id = %stream_id,
                    "Signal published"
                );
            }
            Err(e) => {
                warn!(
                    event_type = %event_type,
                    agent_id = %self.agent_id,
                    error = %e,
                    "Failed to publish signal, continuing"
                );
            }
        }
    }
}

impl Drop for SignalPublisher {
    fn drop(&mut self) {
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop.cancel();
            heartbeat.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestration::pubsub::{MemoryBroker, StreamBroker, StreamClient};

    fn fixture() -> (Arc<MemoryBroker>, Arc<SignalPublisher>) {
        let broker = MemoryBroker::new().shared();
        let client =
            StreamClient::new(Arc::clone(&broker) as _, "redis://localhost:6379/0").shared();
        let publisher = Publisher::new(client, "demo", "BE-1").unwrap().shared();
        let signals = SignalPublisher::new(Some(publisher), "BE-1", "be").shared();
        (broker, signals)
    }

    #[tokio::test]
    async fn test_lifecycle_signals_land_on_signals_channel() {
        let (broker, signals) = fixture();
        signals.signal_ready().await;
        signals.signal_busy("S-1").await;
        signals.signal_error("boom", "S-1", 1).await;
        signals.signal_gate_complete("gate-2", "pass", "S-1").await;

        assert_eq!(broker.xlen("wave:signals:demo").await.unwrap(), 4);
        assert_eq!(signals.publish_count(), 4);
    }

    #[tokio::test]
    async fn test_degraded_mode_swallows_publishes() {
        let signals = SignalPublisher::new(None, "BE-1", "be");
        signals.signal_ready().await;
        signals.signal_error("boom", "S-1", 0).await;
        assert_eq!(signals.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_broker_outage_does_not_propagate() {
        let (broker, signals) = fixture();
        broker.set_healthy(false);
        // Must not panic or error.
        signals.signal_busy("S-1").await;
        assert_eq!(signals.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_emits_progress() {
        let broker = MemoryBroker::new().shared();
        let client =
            StreamClient::new(Arc::clone(&broker) as _, "redis://localhost:6379/0").shared();
        let publisher = Publisher::new(client, "demo", "BE-1").unwrap().shared();
        let signals = SignalPublisher::new(Some(publisher), "BE-1", "be")
            .with_heartbeat_interval(Duration::from_millis(20))
            .shared();

        Arc::clone(&signals).start_heartbeat("S-1");
        assert!(signals.heartbeat_running());
        // Starting twice is a no-op.
        Arc::clone(&signals).start_heartbeat("S-1");

        tokio::time::sleep(Duration::from_millis(120)).await;
        signals.stop_heartbeat();
        assert!(!signals.heartbeat_running());

        // Let any in-flight beat land before sampling the stream.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let beats = broker.xlen("wave:signals:demo").await.unwrap();
        assert!(beats >= 2, "expected at least 2 heartbeats, got {beats}");

        // No more beats after stop.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(broker.xlen("wave:signals:demo").await.unwrap(), beats);
    }
}
