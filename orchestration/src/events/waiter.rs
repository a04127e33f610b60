//! Event-driven result correlation.
//!
//! Callers register an expectation for a task id, block on [`wait`], and
//! are woken the moment [`notify`] delivers the result. No polling.
//!
//! [`wait`]: ResultWaiter::wait
//! [`notify`]: ResultWaiter::notify

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

struct Slot<T> {
    notify: Arc<Notify>,
    result: Option<T>,
}

/// Blocks callers until a matching result arrives.
pub struct ResultWaiter<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Clone> ResultWaiter<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<T>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register expectation for a task result.
    pub fn expect(&self, task_id: &str) {
        let mut slots = self.lock();
        slots.entry(task_id.to_string()).or_insert_with(|| Slot {
            notify: Arc::new(Notify::new()),
            result: None,
        });
    }

    /// Deliver a result, waking any waiter for that id.
    ///
    /// A result for an unexpected id is stored so a late `expect`+`wait`
    /// still finds it.
    pub fn notify(&self, task_id: &str, result: T) {
        let mut slots = self.lock();
        let slot = slots.entry(task_id.to_string()).or_insert_with(|| Slot {
            notify: Arc::new(Notify::new()),
            result: None,
        });
        slot.result = Some(result);
        slot.notify.notify_waiters();
    }

    /// Wait for a task result, up to `timeout`. Returns `None` on timeout
    /// or if no expectation was registered and no result ever arrives.
    ///
    /// The slot is consumed on success or timeout.
    pub async fn wait(&self, task_id: &str, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            // Arm the wakeup before checking the slot so a notify between
            // the check and the await is not lost.
            let notify = {
                let mut slots = self.lock();
                let slot = slots.get_mut(task_id)?;
                if let Some(result) = slot.result.take() {
                    slots.remove(task_id);
                    return Some(result);
                }
                Arc::clone(&slot.notify)
            };
            let notified = notify.notified();

            {
                let mut slots = self.lock();
                if let Some(slot) = slots.get_mut(task_id) {
                    if let Some(result) = slot.result.take() {
                        slots.remove(task_id);
                        return Some(result);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.clear(task_id);
                return None;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
            if Instant::now() >= deadline {
                // One last check before giving up.
                let mut slots = self.lock();
                if let Some(slot) = slots.get_mut(task_id) {
                    if let Some(result) = slot.result.take() {
                        slots.remove(task_id);
                        return Some(result);
                    }
                }
                slots.remove(task_id);
                return None;
            }
        }
    }

    /// Wait for several task results within one overall deadline.
    ///
    /// Returns whatever arrived in time, keyed by task id.
    pub async fn wait_multiple(
        &self,
        task_ids: &[String],
        timeout: Duration,
    ) -> HashMap<String, T> {
        let deadline = Instant::now() + timeout;
        let mut results = HashMap::new();
        for task_id in task_ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if let Some(result) = self.wait(task_id, remaining).await {
                results.insert(task_id.clone(), result);
            }
        }
        results
    }

    /// Remove a pending expectation.
    pub fn clear(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    /// Number of pending expectations.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

impl<T: Clone> Default for ResultWaiter<T> {
    fn default() -> Self {
        Self::new()
    }
}
