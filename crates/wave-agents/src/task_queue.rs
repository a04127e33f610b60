//! Per-domain task queues with result correlation.
//!
//! One FIFO per domain tag plus a results map keyed by task id.
//! `enqueue` never blocks; `dequeue` blocks up to its timeout; results
//! wake any caller blocked in `wait_for_result`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use orchestration::events::ResultWaiter;
use orchestration::safety::emergency_stop;
use orchestration::safety::EmergencyStopError;

/// Terminal status of a task result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
    Blocked,
}

/// A unit of work handed to a domain worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: String,
    pub story_id: String,
    pub domain: String,
    pub action: String,
    pub payload: Value,
    pub submitted_at: DateTime<Utc>,
    pub attempt: u32,
    pub deadline: Option<DateTime<Utc>>,
}

impl AgentTask {
    pub fn new(story_id: &str, domain: &str, action: &str, payload: Value) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            story_id: story_id.to_string(),
            domain: domain.to_string(),
            action: action.to_string(),
            payload,
            submitted_at: Utc::now(),
            attempt: 0,
            deadline: None,
        }
    }
}

/// A worker's answer for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub domain: String,
    pub agent_id: String,
    pub result: Value,
    pub duration_seconds: f64,
    pub safety_score: f64,
    pub error: Option<String>,
}

struct ClaimedTask {
    task: AgentTask,
    worker_id: String,
    claimed_at: Instant,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<AgentTask>>,
    /// Dequeued but not yet claimed, keyed by task id.
    dequeued: HashMap<String, AgentTask>,
    /// Claimed by a worker, keyed by task id.
    in_progress: HashMap<String, ClaimedTask>,
    results: HashMap<String, TaskResult>,
}

/// Shared reference to a [`TaskQueue`].
pub type SharedTaskQueue = Arc<TaskQueue>;

/// FIFO task queues, one per domain, with a result channel.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    arrivals: Notify,
    waiter: ResultWaiter<TaskResult>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
            waiter: ResultWaiter::new(),
        }
    }

    pub fn shared(self) -> SharedTaskQueue {
        Arc::new(self)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a task for its domain. Never blocks.
    pub fn enqueue(&self, task: AgentTask) {
        self.waiter.expect(&task.task_id);
        {
            let mut state = self.lock();
            debug!(task_id = %task.task_id, domain = %task.domain, "Task enqueued");
            state
                .queues
                .entry(task.domain.clone())
                .or_default()
                .push_back(task);
        }
        self.arrivals.notify_waiters();
    }

    /// Dequeue the next task for a domain, blocking up to `timeout`.
    ///
    /// A zero timeout returns immediately. Honors the emergency-stop
    /// latch before every resumption.
    pub async fn dequeue(
        &self,
        domain: &str,
        timeout: Duration,
    ) -> Result<Option<AgentTask>, EmergencyStopError> {
        let deadline = Instant::now() + timeout;
        loop {
            if emergency_stop::is_active() {
                return Err(EmergencyStopError {
                    reason: emergency_stop::reason(),
                });
            }

            let notified = self.arrivals.notified();
            {
                let mut state = self.lock();
                if let Some(task) = state
                    .queues
                    .get_mut(domain)
                    .and_then(|queue| queue.pop_front())
                {
                    state.dequeued.insert(task.task_id.clone(), task.clone());
                    return Ok(Some(task));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Record that a worker claimed a task.
    pub fn mark_in_progress(&self, task_id: &str, worker_id: &str) {
        let mut state = self.lock();
        if let Some(task) = state.dequeued.remove(task_id) {
            state.in_progress.insert(
                task_id.to_string(),
                ClaimedTask {
                    task,
                    worker_id: worker_id.to_string(),
                    claimed_at: Instant::now(),
                },
            );
        }
    }

    /// Post a result, releasing the claim and waking any waiter.
    pub fn submit_result(&self, result: TaskResult) {
        let task_id = result.task_id.clone();
        {
            let mut state = self.lock();
            state.dequeued.remove(&task_id);
            state.in_progress.remove(&task_id);
            state.results.insert(task_id.clone(), result.clone());
        }
        debug!(task_id = %task_id, status = ?result.status, "Task result submitted");
        self.waiter.notify(&task_id, result);
    }

    /// Drop a claimed task without posting a result (emergency abandon).
    pub fn abandon(&self, task_id: &str) {
        let mut state = self.lock();
        state.dequeued.remove(task_id);
        state.in_progress.remove(task_id);
    }

    /// Take a stored result, if the task already finished.
    pub fn take_result(&self, task_id: &str) -> Option<TaskResult> {
        self.lock().results.remove(task_id)
    }

    /// Block until the task's result arrives, up to `timeout`.
    pub async fn wait_for_result(&self, task_id: &str, timeout: Duration) -> Option<TaskResult> {
        self.waiter.wait(task_id, timeout).await
    }

    /// Wait for several results within one overall deadline.
    pub async fn wait_for_results(
        &self,
        task_ids: &[String],
        timeout: Duration,
    ) -> HashMap<String, TaskResult> {
        self.waiter.wait_multiple(task_ids, timeout).await
    }

    /// Tasks waiting in a domain's queue.
    pub fn queue_depth(&self, domain: &str) -> usize {
        self.lock().queues.get(domain).map_or(0, VecDeque::len)
    }

    /// Tasks currently claimed by workers.
    pub fn in_progress_count(&self) -> usize {
        self.lock().in_progress.len()
    }

    /// The worker holding a task, if claimed.
    pub fn claim_holder(&self, task_id: &str) -> Option<String> {
        self.lock()
            .in_progress
            .get(task_id)
            .map(|claim| claim.worker_id.clone())
    }

    /// Claimed tasks held longer than `max_age`.
    pub fn stale_claims(&self, max_age: Duration) -> Vec<AgentTask> {
        self.lock()
            .in_progress
            .values()
            .filter(|claim| claim.claimed_at.elapsed() > max_age)
            .map(|claim| claim.task.clone())
            .collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(domain: &str) -> AgentTask {
        AgentTask::new("S-1", domain, "implement", json!({"requirements": "do it"}))
    }

    #[tokio::test]
    async fn test_fifo_per_domain() {
        let queue = TaskQueue::new();
        let first = task("be");
        let second = task("be");
        let other = task("fe");
        queue.enqueue(first.clone());
        queue.enqueue(second.clone());
        queue.enqueue(other.clone());

        let got = queue.dequeue("be", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(got.task_id, first.task_id);
        let got = queue.dequeue("be", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(got.task_id, second.task_id);
        let got = queue.dequeue("fe", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(got.task_id, other.task_id);
    }

    #[tokio::test]
    async fn test_zero_timeout_returns_immediately() {
        let queue = TaskQueue::new();
        let started = Instant::now();
        let got = queue.dequeue("be", Duration::ZERO).await.unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = TaskQueue::new().shared();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue("be", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.enqueue(task("be"));

        let got = waiter.await.unwrap().unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn test_claim_and_result_flow() {
        let queue = TaskQueue::new();
        let submitted = task("qa");
        let task_id = submitted.task_id.clone();
        queue.enqueue(submitted);

        let got = queue.dequeue("qa", Duration::ZERO).await.unwrap().unwrap();
        queue.mark_in_progress(&got.task_id, "QA-1");
        assert_eq!(queue.in_progress_count(), 1);
        assert_eq!(queue.claim_holder(&task_id).as_deref(), Some("QA-1"));

        queue.submit_result(TaskResult {
            task_id: task_id.clone(),
            status: TaskStatus::Completed,
            domain: "qa".to_string(),
            agent_id: "QA-1".to_string(),
            result: json!({"status": "completed"}),
            duration_seconds: 1.2,
            safety_score: 1.0,
            error: None,
        });

        assert_eq!(queue.in_progress_count(), 0);
        let result = queue
            .wait_for_result(&task_id, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_waiter_blocks_until_result() {
        let queue = TaskQueue::new().shared();
        let submitted = task("be");
        let task_id = submitted.task_id.clone();
        queue.enqueue(submitted);

        let blocked = {
            let queue = Arc::clone(&queue);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                queue
                    .wait_for_result(&task_id, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.submit_result(TaskResult {
            task_id: task_id.clone(),
            status: TaskStatus::Failed,
            domain: "be".to_string(),
            agent_id: "BE-1".to_string(),
            result: json!({}),
            duration_seconds: 0.1,
            safety_score: 1.0,
            error: Some("boom".to_string()),
        });

        let result = blocked.await.unwrap().unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_abandon_drops_claim_without_result() {
        let queue = TaskQueue::new();
        let submitted = task("be");
        let task_id = submitted.task_id.clone();
        queue.enqueue(submitted);

        queue.dequeue("be", Duration::ZERO).await.unwrap().unwrap();
        queue.mark_in_progress(&task_id, "BE-1");
        queue.abandon(&task_id);

        assert_eq!(queue.in_progress_count(), 0);
        assert!(queue
            .wait_for_result(&task_id, Duration::from_millis(30))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_queue_depth() {
        let queue = TaskQueue::new();
        assert_eq!(queue.queue_depth("be"), 0);
        queue.enqueue(task("be"));
        queue.enqueue(task("be"));
        assert_eq!(queue.queue_depth("be"), 2);
        assert_eq!(queue.queue_depth("fe"), 0);
    }
}
