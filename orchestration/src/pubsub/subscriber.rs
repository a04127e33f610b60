//! Consumer-group subscriber with acknowledgement, pending-entry
//! redelivery, and dead-letter routing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::safety::emergency_stop;

use super::channels::ChannelManager;
use super::client::StreamClient;
use super::types::{EventType, StreamEntry, WaveMessage};
use super::{StreamError, StreamResult};

/// Default blocking window for a consumer-group read.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(5);

/// Default max entries to read per call.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Pending entries idle longer than this are claimable by other consumers.
pub const PENDING_CLAIM_MIN_IDLE: Duration = Duration::from_secs(30);

/// Cap on the dead-letter queue stream.
pub const DLQ_MAX_LEN: usize = 1_000;

/// Outcome a listen handler reports for one entry.
pub type HandlerOutcome = Result<bool, Box<dyn std::error::Error + Send + Sync>>;

/// Subscribes to WAVE event streams through a consumer group.
///
/// Each subscriber carries a unique consumer name within its group; the
/// broker delivers every entry to at most one consumer per group, in
/// stream order. Unacknowledged entries stay pending and can be claimed
/// by a surviving consumer after [`PENDING_CLAIM_MIN_IDLE`].
pub struct Subscriber {
    client: Arc<StreamClient>,
    channels: ChannelManager,
    group: String,
    consumer: String,
    block: Duration,
    batch_size: usize,
    running: AtomicBool,
    processed_count: AtomicU64,
}

impl Subscriber {
    pub fn new(
        client: Arc<StreamClient>,
        project: &str,
        group: &str,
        consumer: &str,
    ) -> StreamResult<Self> {
        Ok(Self {
            client,
            channels: ChannelManager::new(project)?,
            group: group.to_string(),
            consumer: consumer.to_string(),
            block: DEFAULT_BLOCK,
            batch_size: DEFAULT_BATCH_SIZE,
            running: AtomicBool::new(false),
            processed_count: AtomicU64::new(0),
        })
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    /// Total entries acknowledged by this subscriber.
    pub fn processed_count(&self) -> u64 {
        self.processed_count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Idempotently create the consumer group, creating the stream if
    /// absent. New groups start at id `"0"` so they see history.
    pub async fn ensure_group(&self, channel: &str) -> StreamResult<()> {
        self.client.broker().xgroup_create(channel, &self.group).await?;
        debug!(group = %self.group, channel, "Consumer group ensured");
        Ok(())
    }

    /// Read new entries through the consumer group.
    ///
    /// Blocks up to `block` (default 5 s) when nothing is available.
    /// Entries that fail to parse are logged and skipped, never returned.
    pub async fn read(
        &self,
        channel: Option<&str>,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> StreamResult<Vec<StreamEntry>> {
        let signals = self.channels.signals();
        let target = channel.unwrap_or(&signals);
        self.ensure_group(target).await?;

        if emergency_stop::is_active() {
            return Err(StreamError::EmergencyStop(emergency_stop::reason()));
        }

        let raw = self
            .client
            .broker()
            .xreadgroup(
                target,
                &self.group,
                &self.consumer,
                count.unwrap_or(self.batch_size),
                block.unwrap_or(self.block),
            )
            .await?;

        Ok(self.parse_entries(raw))
    }

    /// Acknowledge processed entries. Returns the number acknowledged.
    pub async fn ack(&self, channel: &str, stream_ids: &[String]) -> StreamResult<usize> {
        if stream_ids.is_empty() {
            return Ok(0);
        }
        let acked = self
            .client
            .broker()
            .xack(channel, &self.group, stream_ids)
            .await?;
        self.processed_count.fetch_add(acked as u64, Ordering::SeqCst);
        Ok(acked)
    }

    /// Claim pending entries idle at least `min_idle` from any consumer
    /// in the group. This is the crash-takeover primitive.
    pub async fn read_pending(
        &self,
        channel: Option<&str>,
        min_idle: Duration,
        count: Option<usize>,
    ) -> StreamResult<Vec<StreamEntry>> {
        let signals = self.channels.signals();
        let target = channel.unwrap_or(&signals);

        let raw = self
            .client
            .broker()
            .xautoclaim(
                target,
                &self.group,
                &self.consumer,
                min_idle,
                count.unwrap_or(self.batch_size),
            )
            .await?;

        Ok(self.parse_entries(raw))
    }

    /// Number of delivered-but-unacknowledged entries for this group.
    pub async fn pending_count(&self, channel: Option<&str>) -> StreamResult<usize> {
        let signals = self.channels.signals();
        let target = channel.unwrap_or(&signals);
        self.client.broker().xpending_count(target, &self.group).await
    }

    /// Run the read-dispatch-ack loop until [`stop`](Self::stop) is called.
    ///
    /// Entries outside `event_filter` are acknowledged and skipped. If the
    /// handler returns an error the entry is diverted to the project DLQ
    /// and acknowledged so it is never redelivered to this group.
    pub async fn listen<F>(
        &self,
        channel: Option<&str>,
        event_filter: Option<&[EventType]>,
        mut handler: F,
    ) -> StreamResult<()>
    where
        F: FnMut(&StreamEntry) -> HandlerOutcome,
    {
        let signals = self.channels.signals();
        let target = channel.unwrap_or(&signals).to_string();
        self.ensure_group(&target).await?;
        self.running.store(true, Ordering::SeqCst);

        info!(
            group = %self.group,
            consumer = %self.consumer,
            channel = %target,
            "Subscriber listening"
        );

        while self.running.load(Ordering::SeqCst) {
            if emergency_stop::is_active() {
                self.running.store(false, Ordering::SeqCst);
                return Err(StreamError::EmergencyStop(emergency_stop::reason()));
            }

            let entries = match self.read(Some(&target), None, None).await {
                Ok(entries) => entries,
                Err(e) if e.is_connection() => {
                    warn!("Connection lost in listen loop, attempting reconnect");
                    if !self.client.reconnect().await {
                        error!("Reconnection failed, stopping listener");
                        self.running.store(false, Ordering::SeqCst);
                        return Err(e);
                    }
                    self.ensure_group(&target).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            for entry in entries {
                if let Some(filter) = event_filter {
                    if !filter.contains(&entry.message.event_type) {
                        self.ack(&target, &[entry.stream_id.clone()]).await?;
                        continue;
                    }
                }

                match handler(&entry) {
                    Ok(true) => {
                        self.ack(&target, &[entry.stream_id.clone()]).await?;
                    }
                    Ok(false) => {
                        // Handler declined; leave pending for redelivery.
                    }
                    Err(e) => {
                        error!(
                            stream_id = %entry.stream_id,
                            error = %e,
                            "Handler error, diverting to DLQ"
                        );
                        self.send_to_dlq(&entry, &e.to_string()).await;
                        self.ack(&target, &[entry.stream_id.clone()]).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop the listen loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(group = %self.group, consumer = %self.consumer, "Subscriber stopping");
    }

    fn parse_entries(&self, raw: Vec<super::broker::RawEntry>) -> Vec<StreamEntry> {
        raw.into_iter()
            .filter_map(|entry| match WaveMessage::from_fields(&entry.id, &entry.fields) {
                Ok(message) => Some(StreamEntry {
                    stream_id: entry.id,
                    message,
                }),
                Err(e) => {
                    warn!(error = %e, "Failed to parse stream entry");
                    None
                }
            })
            .collect()
    }

    async fn send_to_dlq(&self, entry: &StreamEntry, error: &str) {
        let dlq = self.channels.dead_letter();
        let mut fields = entry.message.to_fields();
        fields.insert("dlq_error".to_string(), error.to_string());
        fields.insert("dlq_original_id".to_string(), entry.stream_id.clone());

        if let Err(e) = self.client.broker().xadd(&dlq, fields, DLQ_MAX_LEN).await {
            error!(error = %e, "Failed to send entry to DLQ");
        }
    }
}
