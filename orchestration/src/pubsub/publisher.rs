//! Event publisher — appends WAVE messages to streams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::channels::ChannelManager;
use super::client::StreamClient;
use super::types::{EventType, MessagePriority, WaveMessage};
use super::StreamResult;

/// Max entries per stream before the oldest are trimmed.
pub const DEFAULT_MAX_STREAM_LEN: usize = 10_000;

/// Optional routing and correlation fields for a publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Target channel; defaults to the project signals channel.
    pub channel: Option<String>,
    pub session_id: Option<String>,
    pub story_id: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: MessagePriority,
}

/// Publishes WAVE events to streams with durable, ordered delivery.
pub struct Publisher {
    client: Arc<StreamClient>,
    channels: ChannelManager,
    project: String,
    source: String,
    max_stream_len: usize,
    publish_count: AtomicU64,
}

impl Publisher {
    pub fn new(client: Arc<StreamClient>, project: &str, source: &str) -> StreamResult<Self> {
        let channels = ChannelManager::new(project)?;
        Ok(Self {
            client,
            project: channels.project().to_string(),
            channels,
            source: source.to_string(),
            max_stream_len: DEFAULT_MAX_STREAM_LEN,
            publish_count: AtomicU64::new(0),
        })
    }

    pub fn with_max_stream_len(mut self, max_stream_len: usize) -> Self {
        self.max_stream_len = max_stream_len;
        self
    }

    /// Create a shared reference to this publisher.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    /// Total messages published by this publisher.
    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::SeqCst)
    }

    /// Publish an event to the default signals channel.
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> StreamResult<String> {
        self.publish_with(event_type, payload, PublishOptions::default())
            .await
    }

    /// Publish an event with explicit routing/correlation options.
    pub async fn publish_with(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> StreamResult<String> {
        let mut message = WaveMessage::new(event_type, payload, &self.source, &self.project)
            .with_priority(options.priority);
        message.session_id = options.session_id;
        message.story_id = options.story_id;
        message.correlation_id = options.correlation_id;

        let channel = options.channel.unwrap_or_else(|| self.channels.signals());
        self.publish_message(message, &channel).await
    }

    /// Publish a pre-built message to a channel.
    pub async fn publish_message(
        &self,
        message: WaveMessage,
        channel: &str,
    ) -> StreamResult<String> {
        let fields = message.to_fields();
        let stream_id = self
            .client
            .execute_with_retry(|| {
                let fields = fields.clone();
                async move {
                    self.client
                        .broker()
                        .xadd(channel, fields, self.max_stream_len)
                        .await
                }
            })
            .await?;

        self.publish_count.fetch_add(1, Ordering::SeqCst);
        debug!(
            event_type = %message.event_type,
            channel,
            stream_id = %stream_id,
            "Published event"
        );
        Ok(stream_id)
    }

    /// Publish multiple messages to one channel in a single pipeline pass.
    pub async fn publish_batch(
        &self,
        messages: Vec<WaveMessage>,
        channel: Option<&str>,
    ) -> StreamResult<Vec<String>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let signals = self.channels.signals();
        let target = channel.unwrap_or(&signals);

        let mut ids = Vec::with_capacity(messages.len());
        for message in &messages {
            let id = self
                .client
                .broker()
                .xadd(target, message.to_fields(), self.max_stream_len)
                .await?;
            ids.push(id);
        }
        self.publish_count
            .fetch_add(messages.len() as u64, Ordering::SeqCst);
        debug!(count = messages.len(), channel = target, "Batch published");
        Ok(ids)
    }

    /// Publish directly to an agent's channel.
    pub async fn publish_to_agent(
        &self,
        agent_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
        mut options: PublishOptions,
    ) -> StreamResult<String> {
        options.channel = Some(self.channels.agent(agent_id));
        self.publish_with(event_type, payload, options).await
    }

    /// Publish to a gate-specific channel.
    pub async fn publish_gate_event(
        &self,
        gate: &str,
        event_type: EventType,
        payload: serde_json::Value,
        mut options: PublishOptions,
    ) -> StreamResult<String> {
        options.channel = Some(self.channels.gate(gate));
        self.publish_with(event_type, payload, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::broker::{MemoryBroker, StreamBroker};
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn publisher() -> (Arc<MemoryBroker>, Publisher) {
        let broker = MemoryBroker::new().shared();
        let client =
            StreamClient::new(Arc::clone(&broker) as _, "redis://localhost:6379/0").shared();
        let publisher = Publisher::new(client, "demo", "test-source").unwrap();
        (broker, publisher)
    }

    #[tokio::test]
    async fn test_publish_defaults_to_signals_channel() {
        let (broker, publisher) = publisher();
        publisher
            .publish(EventType::StoryStarted, json!({"story_id": "S-1"}))
            .await
            .unwrap();
        assert_eq!(broker.xlen("wave:signals:demo").await.unwrap(), 1);
        assert_eq!(publisher.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_to_agent_selects_agent_channel() {
        let (broker, publisher) = publisher();
        publisher
            .publish_to_agent(
                "be-1",
                EventType::AgentReady,
                json!({}),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(broker.xlen("wave:agent:demo:be-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_gate_event_selects_gate_channel() {
        let (broker, publisher) = publisher();
        publisher
            .publish_gate_event(
                "gate-2",
                EventType::GatePassed,
                json!({"gate_id": "gate-2"}),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(broker.xlen("wave:gate:demo:gate-2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_batch() {
        let (broker, publisher) = publisher();
        let messages = (0..3)
            .map(|n| {
                WaveMessage::new(
                    EventType::HealthCheck,
                    json!({"n": n}),
                    "test-source",
                    "demo",
                )
            })
            .collect();
        let ids = publisher.publish_batch(messages, None).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(broker.xlen("wave:signals:demo").await.unwrap(), 3);
        assert_eq!(publisher.publish_count(), 3);
    }

    #[tokio::test]
    async fn test_published_order_is_read_order() {
        let (broker, publisher) = publisher();
        publisher
            .publish(EventType::GateStarted, json!({"n": 1}))
            .await
            .unwrap();
        publisher
            .publish(EventType::GatePassed, json!({"n": 2}))
            .await
            .unwrap();

        broker
            .xgroup_create("wave:signals:demo", "g")
            .await
            .unwrap();
        let entries = broker
            .xreadgroup("wave:signals:demo", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(entries.len() >= 2);
        assert_eq!(entries[0].fields["event_type"], "gate.started");
        assert_eq!(entries[1].fields["event_type"], "gate.passed");
    }
}
