//! Stream broker capability and in-process implementation.
//!
//! [`StreamBroker`] mirrors the append-only stream commands of the target
//! broker (add with approximate trim, consumer-group create/read/ack,
//! idle-claim, length) so a networked engine can be swapped in without
//! touching publishers or subscribers. [`MemoryBroker`] implements the
//! full semantics in process: per-group delivery cursors, per-entry
//! pending ownership with idle clocks, at-most-one-consumer-per-group
//! delivery, and approximate length trimming.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use super::{StreamError, StreamResult};

/// Flat string-to-string entry fields, stored in deterministic order.
pub type FieldMap = BTreeMap<String, String>;

/// A raw stream entry as returned by the broker.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub id: String,
    pub fields: FieldMap,
}

/// Narrow capability over the broker's stream commands.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> StreamResult<()>;

    /// Append an entry, trimming the stream to approximately `maxlen`.
    /// Returns the assigned entry id.
    async fn xadd(&self, channel: &str, fields: FieldMap, maxlen: usize) -> StreamResult<String>;

    /// Idempotently create a consumer group starting at id `"0"`,
    /// creating the stream if absent.
    async fn xgroup_create(&self, channel: &str, group: &str) -> StreamResult<()>;

    /// Read up to `count` new entries for `consumer` in `group`, blocking
    /// up to `block` when the stream has nothing new. Delivered entries
    /// become pending for the consumer until acknowledged.
    async fn xreadgroup(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<RawEntry>>;

    /// Acknowledge entries, removing them from the group's pending set.
    /// Returns the number of entries actually acknowledged.
    async fn xack(&self, channel: &str, group: &str, ids: &[String]) -> StreamResult<usize>;

    /// Claim up to `count` pending entries idle at least `min_idle` from
    /// any consumer in the group, transferring ownership to `consumer`.
    async fn xautoclaim(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StreamResult<Vec<RawEntry>>;

    /// Current stream length.
    async fn xlen(&self, channel: &str) -> StreamResult<usize>;

    /// Number of pending (delivered, unacknowledged) entries for a group.
    async fn xpending_count(&self, channel: &str, group: &str) -> StreamResult<usize>;
}

/// Shared reference to a broker.
pub type SharedBroker = Arc<dyn StreamBroker>;

// Approximate trim: allow the stream to overshoot the cap by this many
// entries before trimming back down to exactly `maxlen`.
const TRIM_SLACK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: i64,
    seq: u64,
}

impl EntryId {
    fn render(&self) -> String {
        format!("{}-{}", self.ms, self.seq)
    }

    fn parse(raw: &str) -> Option<Self> {
        let (ms, seq) = raw.split_once('-')?;
        Some(Self {
            ms: ms.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    id: EntryId,
    fields: FieldMap,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Group {
    /// Last entry id delivered to any consumer in this group.
    cursor: Option<EntryId>,
    /// Delivered-but-unacknowledged entries, keyed by entry id.
    pending: HashMap<String, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: VecDeque<StoredEntry>,
    groups: HashMap<String, Group>,
    last_id: Option<EntryId>,
}

impl Stream {
    fn next_id(&mut self) -> EntryId {
        let now_ms = Utc::now().timestamp_millis();
        let id = match self.last_id {
            Some(last) if now_ms <= last.ms => EntryId {
                ms: last.ms,
                seq: last.seq + 1,
            },
            _ => EntryId { ms: now_ms, seq: 0 },
        };
        self.last_id = Some(id);
        id
    }
}

/// In-process stream broker with consumer-group semantics.
pub struct MemoryBroker {
    streams: Mutex<HashMap<String, Stream>>,
    arrivals: Notify,
    healthy: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
            healthy: AtomicBool::new(true),
        }
    }

    /// Create a shared reference to this broker.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Simulate a broker outage (and recovery) for resilience tests.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check_healthy(&self) -> StreamResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StreamError::Connection("broker unreachable".to_string()))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Stream>> {
        // Mutex poisoning only happens if a holder panicked; recover the data.
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Collect new entries past the group cursor, marking them pending.
    fn take_new_entries(
        streams: &mut HashMap<String, Stream>,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<RawEntry>> {
        let stream = streams
            .get_mut(channel)
            .ok_or_else(|| StreamError::UnknownGroup {
                channel: channel.to_string(),
                group: group.to_string(),
            })?;

        // Split borrow: read entries while mutating the group.
        let entries = &stream.entries;
        let group_state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| StreamError::UnknownGroup {
                channel: channel.to_string(),
                group: group.to_string(),
            })?;

        let mut delivered = Vec::new();
        for entry in entries.iter() {
            if delivered.len() >= count {
                break;
            }
            if group_state.cursor.is_some_and(|cursor| entry.id <= cursor) {
                continue;
            }
            group_state.cursor = Some(entry.id);
            group_state.pending.insert(
                entry.id.render(),
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            delivered.push(RawEntry {
                id: entry.id.render(),
                fields: entry.fields.clone(),
            });
        }
        Ok(delivered)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn ping(&self) -> StreamResult<()> {
        self.check_healthy()
    }

    async fn xadd(&self, channel: &str, fields: FieldMap, maxlen: usize) -> StreamResult<String> {
        self.check_healthy()?;
        let id = {
            let mut streams = self.lock();
            let stream = streams.entry(channel.to_string()).or_default();
            let id = stream.next_id();
            stream.entries.push_back(StoredEntry { id, fields });

            if stream.entries.len() > maxlen + TRIM_SLACK {
                while stream.entries.len() > maxlen {
                    stream.entries.pop_front();
                }
            }
            id
        };
        self.arrivals.notify_waiters();
        Ok(id.render())
    }

    async fn xgroup_create(&self, channel: &str, group: &str) -> StreamResult<()> {
        self.check_healthy()?;
        let mut streams = self.lock();
        let stream = streams.entry(channel.to_string()).or_default();
        stream.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn xreadgroup(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<RawEntry>> {
        let deadline = Instant::now() + block;
        loop {
            self.check_healthy()?;
            // Register for wakeups before checking so an add between the
            // check and the await still wakes us.
            let notified = self.arrivals.notified();
            {
                let mut streams = self.lock();
                let delivered =
                    Self::take_new_entries(&mut streams, channel, group, consumer, count)?;
                if !delivered.is_empty() {
                    return Ok(delivered);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn xack(&self, channel: &str, group: &str, ids: &[String]) -> StreamResult<usize> {
        self.check_healthy()?;
        let mut streams = self.lock();
        let Some(stream) = streams.get_mut(channel) else {
            return Ok(0);
        };
        let Some(group_state) = stream.groups.get_mut(group) else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn xautoclaim(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StreamResult<Vec<RawEntry>> {
        self.check_healthy()?;
        let mut streams = self.lock();
        let Some(stream) = streams.get_mut(channel) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = stream.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimable: Vec<String> = group_state
            .pending
            .iter()
            .filter(|(_, pending)| pending.delivered_at.elapsed() >= min_idle)
            .map(|(id, _)| id.clone())
            .collect();
        claimable.sort_by_key(|id| EntryId::parse(id));
        claimable.truncate(count);

        let mut claimed = Vec::new();
        for id in claimable {
            let Some(entry_id) = EntryId::parse(&id) else {
                continue;
            };
            match stream.entries.iter().find(|entry| entry.id == entry_id) {
                Some(entry) => {
                    let pending = group_state
                        .pending
                        .get_mut(&id)
                        .expect("claimable id came from the pending set");
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = Instant::now();
                    pending.delivery_count += 1;
                    claimed.push(RawEntry {
                        id,
                        fields: entry.fields.clone(),
                    });
                }
                None => {
                    // Entry was trimmed out from under the pending set.
                    group_state.pending.remove(&id);
                }
            }
        }
        Ok(claimed)
    }

    async fn xlen(&self, channel: &str) -> StreamResult<usize> {
        self.check_healthy()?;
        let streams = self.lock();
        Ok(streams.get(channel).map_or(0, |s| s.entries.len()))
    }

    async fn xpending_count(&self, channel: &str, group: &str) -> StreamResult<usize> {
        self.check_healthy()?;
        let streams = self.lock();
        Ok(streams
            .get(channel)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: u32) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("n".to_string(), n.to_string());
        map
    }

    #[tokio::test]
    async fn test_add_preserves_order() {
        let broker = MemoryBroker::new();
        broker.xgroup_create("s", "g").await.unwrap();
        broker.xadd("s", fields(1), 100).await.unwrap();
        broker.xadd("s", fields(2), 100).await.unwrap();

        let entries = broker
            .xreadgroup("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fields["n"], "1");
        assert_eq!(entries[1].fields["n"], "2");
        assert!(entries[0].id < entries[1].id);
    }

    #[tokio::test]
    async fn test_group_partitions_entries() {
        let broker = MemoryBroker::new();
        broker.xgroup_create("s", "g").await.unwrap();
        broker.xadd("s", fields(1), 100).await.unwrap();
        broker.xadd("s", fields(2), 100).await.unwrap();

        let a = broker
            .xreadgroup("s", "g", "a", 1, Duration::ZERO)
            .await
            .unwrap();
        let b = broker
            .xreadgroup("s", "g", "b", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].id, b[0].id);
    }

    #[tokio::test]
    async fn test_each_group_sees_all_entries() {
        let broker = MemoryBroker::new();
        broker.xgroup_create("s", "g1").await.unwrap();
        broker.xgroup_create("s", "g2").await.unwrap();
        broker.xadd("s", fields(1), 100).await.unwrap();

        let g1 = broker
            .xreadgroup("s", "g1", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        let g2 = broker
            .xreadgroup("s", "g2", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(g1.len(), 1);
        assert_eq!(g2.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_removes_pending() {
        let broker = MemoryBroker::new();
        broker.xgroup_create("s", "g").await.unwrap();
        broker.xadd("s", fields(1), 100).await.unwrap();

        let entries = broker
            .xreadgroup("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(broker.xpending_count("s", "g").await.unwrap(), 1);

        let acked = broker
            .xack("s", "g", &[entries[0].id.clone()])
            .await
            .unwrap();
        assert_eq!(acked, 1);
        assert_eq!(broker.xpending_count("s", "g").await.unwrap(), 0);

        // Double ack is a no-op.
        let acked = broker
            .xack("s", "g", &[entries[0].id.clone()])
            .await
            .unwrap();
        assert_eq!(acked, 0);
    }

    #[tokio::test]
    async fn test_autoclaim_respects_min_idle() {
        let broker = MemoryBroker::new();
        broker.xgroup_create("s", "g").await.unwrap();
        broker.xadd("s", fields(1), 100).await.unwrap();
        broker
            .xreadgroup("s", "g", "dead-consumer", 10, Duration::ZERO)
            .await
            .unwrap();

        // Too fresh to claim.
        let claimed = broker
            .xautoclaim("s", "g", "b", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());

        // Idle threshold of zero claims immediately.
        let claimed = broker
            .xautoclaim("s", "g", "b", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // The entry now belongs to "b"; acking removes it for good.
        broker.xack("s", "g", &[claimed[0].id.clone()]).await.unwrap();
        let claimed = broker
            .xautoclaim("s", "g", "b", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_add() {
        let broker = MemoryBroker::new().shared();
        broker.xgroup_create("s", "g").await.unwrap();

        let reader = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .xreadgroup("s", "g", "c", 10, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.xadd("s", fields(1), 100).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_read_timeout_returns_empty() {
        let broker = MemoryBroker::new();
        broker.xgroup_create("s", "g").await.unwrap();
        let entries = broker
            .xreadgroup("s", "g", "c", 10, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_trim_is_approximate_but_bounded() {
        let broker = MemoryBroker::new();
        for n in 0..500 {
            broker.xadd("s", fields(n), 100).await.unwrap();
        }
        let len = broker.xlen("s").await.unwrap();
        // May exceed the cap briefly, never by orders of magnitude.
        assert!(len >= 100);
        assert!(len <= 100 + TRIM_SLACK);
    }

    #[tokio::test]
    async fn test_unhealthy_broker_reports_connection_error() {
        let broker = MemoryBroker::new();
        broker.set_healthy(false);
        let err = broker.ping().await.unwrap_err();
        assert!(err.is_connection());
        let err = broker.xadd("s", fields(1), 100).await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_group_create_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.xgroup_create("s", "g").await.unwrap();
        broker.xadd("s", fields(1), 100).await.unwrap();
        // Re-creating must not reset the cursor or pending set.
        broker
            .xreadgroup("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        broker.xgroup_create("s", "g").await.unwrap();
        assert_eq!(broker.xpending_count("s", "g").await.unwrap(), 1);
        let entries = broker
            .xreadgroup("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }
}
