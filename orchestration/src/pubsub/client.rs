//! Managed broker connection with reconnection and retry.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::broker::SharedBroker;
use super::{StreamError, StreamResult};

/// Maximum reconnection attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Base delay for the first reconnection attempt.
pub const BASE_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Cap on the exponential backoff delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Managed stream client.
///
/// Wraps a [`StreamBroker`] with connection state, exponential-backoff
/// reconnection (`0.1 * 2^(n-1)` seconds capped at 5 s, with 0-50 %
/// jitter), and a retry wrapper that transparently reconnects once when
/// an operation fails with a connection error.
pub struct StreamClient {
    broker: SharedBroker,
    url: String,
    max_reconnect_attempts: u32,
    connected: AtomicBool,
    reconnect_count: AtomicU32,
}

impl StreamClient {
    pub fn new(broker: SharedBroker, url: &str) -> Self {
        Self {
            broker,
            url: url.to_string(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            connected: AtomicBool::new(false),
            reconnect_count: AtomicU32::new(0),
        }
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Create a shared reference to this client.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The broker URL this client was configured with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The underlying broker capability.
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// How many reconnection attempts the last recovery took.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// Establish the connection, retrying with backoff on failure.
    pub async fn connect(&self) -> StreamResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        match self.broker.ping().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                self.reconnect_count.store(0, Ordering::SeqCst);
                info!(url = %self.url, "Connected to stream broker");
                Ok(())
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Initial broker connection failed");
                self.attempt_reconnect().await
            }
        }
    }

    /// Drop the connection state.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Whether the broker currently answers a ping.
    pub async fn ping(&self) -> bool {
        match self.broker.ping().await {
            Ok(()) => true,
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Force a fresh connection. Returns true on success.
    pub async fn reconnect(&self) -> bool {
        self.disconnect();
        self.connect().await.is_ok()
    }

    /// Run an operation, reconnecting and retrying once on connection loss.
    pub async fn execute_with_retry<T, F, Fut>(&self, op: F) -> StreamResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StreamResult<T>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_connection() => {
                warn!(url = %self.url, "Connection lost, attempting reconnect");
                if self.reconnect().await {
                    op().await
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn attempt_reconnect(&self) -> StreamResult<()> {
        for attempt in 1..=self.max_reconnect_attempts {
            let delay = backoff_delay(attempt);
            info!(
                attempt,
                max = self.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnection attempt"
            );
            tokio::time::sleep(delay).await;

            match self.broker.ping().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    self.reconnect_count.store(attempt, Ordering::SeqCst);
                    info!(attempt, "Reconnected to stream broker");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnection attempt failed");
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        Err(StreamError::Connection(format!(
            "failed to connect after {} attempts",
            self.max_reconnect_attempts
        )))
    }
}

/// Exponential backoff delay with jitter for a 1-based attempt number.
///
/// `base * 2^(n-1)` capped at [`MAX_RECONNECT_DELAY`], plus 0-50 % jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = BASE_RECONNECT_DELAY
        .saturating_mul(1 << exp)
        .min(MAX_RECONNECT_DELAY);
    // Jitter from a time-seeded hash; the 0-50 % spread matters, not the
    // quality of the randomness.
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(attempt as u64);
    let fraction = (seed % 1000) as f64 / 1000.0;
    base + base.mul_f64(fraction * 0.5)
}
