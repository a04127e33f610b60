//! Domain worker base.
//!
//! A worker is an infinite poll loop over its domain queue: publish
//! busy, heartbeat while processing, run the produced content through
//! the safety check, post the result, publish ready. An uncaught
//! processing error becomes a `failed` result plus an `agent.error`
//! signal. Shutdown is graceful: the current task finishes before the
//! loop exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchestration::safety::emergency_stop;

use crate::signals::SignalPublisher;
use crate::task_queue::{AgentTask, SharedTaskQueue, TaskResult, TaskStatus};

/// How long one dequeue poll blocks before looping.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Safety score below this rewrites the result to `blocked`.
pub const BLOCK_THRESHOLD: f64 = 0.85;

// Always dangerous regardless of domain.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    "drop table",
    "drop database",
    "eval(",
    "exec(",
    "__import__",
    "subprocess.call",
    "os.system",
];

// Dangerous in frontend output but legitimately needed by backend
// coders (config, auth, crypto, service integrations).
const FE_ONLY_DANGEROUS: &[&str] = &["process.env", "password", "private_key", "api_key"];

const WARN_PATTERNS: &[&str] = &["todo:", "fixme:", "hack:", "console.log", "print("];

/// Content-level safety scoring applied to worker output.
///
/// Scores in `[0, 1]`; critical findings cost 0.3 each, warnings 0.05.
#[derive(Debug, Clone)]
pub struct ContentSafety {
    block_threshold: f64,
    domain: String,
}

impl ContentSafety {
    pub fn new(domain: &str) -> Self {
        Self {
            block_threshold: BLOCK_THRESHOLD,
            domain: domain.to_lowercase(),
        }
    }

    pub fn with_block_threshold(mut self, threshold: f64) -> Self {
        self.block_threshold = threshold;
        self
    }

    pub fn block_threshold(&self) -> f64 {
        self.block_threshold
    }

    /// Score content, returning `(score, violations)`.
    pub fn score(&self, content: &str) -> (f64, Vec<String>) {
        if content.is_empty() {
            return (1.0, Vec::new());
        }

        let lower = content.to_lowercase();
        let mut violations = Vec::new();

        for pattern in DANGEROUS_PATTERNS {
            if lower.contains(pattern) {
                violations.push(format!("CRITICAL: Found dangerous pattern '{pattern}'"));
            }
        }
        if self.domain != "be" {
            for pattern in FE_ONLY_DANGEROUS {
                if lower.contains(pattern) {
                    violations.push(format!("CRITICAL: Found dangerous pattern '{pattern}'"));
                }
            }
        }
        for pattern in WARN_PATTERNS {
            if lower.contains(pattern) {
                violations.push(format!("WARN: Found pattern '{pattern}'"));
            }
        }

        let critical = violations.iter().filter(|v| v.starts_with("CRITICAL")).count();
        let warnings = violations.iter().filter(|v| v.starts_with("WARN")).count();
        let score = (1.0 - critical as f64 * 0.3 - warnings as f64 * 0.05).clamp(0.0, 1.0);
        (score, violations)
    }

    /// Whether content passes the block threshold.
    pub fn is_safe(&self, content: &str) -> (bool, f64, Vec<String>) {
        let (score, violations) = self.score(content);
        (score >= self.block_threshold, score, violations)
    }
}

/// Domain-specific task logic plugged into a [`DomainWorker`].
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Execute the task, returning a result payload. The payload should
    /// carry a `status` field plus any produced `code` or `content`.
    async fn process_task(&self, task: &AgentTask) -> anyhow::Result<Value>;
}

/// Long-running poller for one domain.
pub struct DomainWorker {
    domain: String,
    agent_id: String,
    full_id: String,
    queue: SharedTaskQueue,
    signals: Arc<SignalPublisher>,
    processor: Arc<dyn TaskProcessor>,
    safety: ContentSafety,
    shutdown: CancellationToken,
    tasks_processed: AtomicU64,
    poll_timeout: Duration,
}

impl DomainWorker {
    pub fn new(
        domain: &str,
        agent_id: &str,
        queue: SharedTaskQueue,
        signals: Arc<SignalPublisher>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        let domain = domain.to_lowercase();
        let full_id = format!("{}-{agent_id}", domain.to_uppercase());
        Self {
            safety: ContentSafety::new(&domain),
            domain,
            agent_id: agent_id.to_string(),
            full_id,
            queue,
            signals,
            processor,
            shutdown: CancellationToken::new(),
            tasks_processed: AtomicU64::new(0),
            poll_timeout: POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed.load(Ordering::SeqCst)
    }

    /// Token that stops the loop after the current task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Main worker loop. Returns when shut down or when the emergency
    /// latch trips.
    pub async fn run(&self) {
        info!(
            domain = %self.domain,
            agent_id = %self.agent_id,
            threshold = self.safety.block_threshold(),
            "Worker starting"
        );
        self.signals.signal_ready().await;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let task = match self.queue.dequeue(&self.domain, self.poll_timeout).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    warn!(domain = %self.domain, reason = %e.reason, "Emergency stop, worker exiting");
                    break;
                }
            };

            self.handle_task(task).await;
        }

        info!(
            domain = %self.domain,
            agent_id = %self.agent_id,
            processed = self.tasks_processed(),
            "Worker stopped"
        );
    }

    async fn handle_task(&self, task: AgentTask) {
        info!(
            task_id = %task.task_id,
            story_id = %task.story_id,
            action = %task.action,
            "Received task"
        );

        self.queue.mark_in_progress(&task.task_id, &self.full_id);
        self.signals.signal_busy(&task.story_id).await;
        Arc::clone(&self.signals).start_heartbeat(&task.story_id);

        let started = Instant::now();
        let outcome = self.processor.process_task(&task).await;
        let duration = started.elapsed();

        // A tripped latch after processing means abandon, not report.
        if emergency_stop::is_active() {
            self.signals.stop_heartbeat();
            self.queue.abandon(&task.task_id);
            warn!(task_id = %task.task_id, "Emergency stop, abandoning task without result");
            return;
        }

        match outcome {
            Ok(mut result) => {
                let (status, safety_score, violations) = self.apply_safety(&mut result);
                self.queue.submit_result(TaskResult {
                    task_id: task.task_id.clone(),
                    status,
                    domain: self.domain.clone(),
                    agent_id: self.full_id.clone(),
                    result,
                    duration_seconds: duration.as_secs_f64(),
                    safety_score,
                    error: (status == TaskStatus::Blocked)
                        .then(|| "Failed constitutional safety check".to_string()),
                });
                if !violations.is_empty() {
                    for violation in &violations {
                        warn!(task_id = %task.task_id, violation = %violation, "Safety finding");
                    }
                }
                info!(
                    task_id = %task.task_id,
                    duration_s = duration.as_secs_f64(),
                    safety_score,
                    "Task finished"
                );
                self.tasks_processed.fetch_add(1, Ordering::SeqCst);
                self.signals.stop_heartbeat();
                self.signals.signal_ready().await;
            }
            Err(e) => {
                self.signals.stop_heartbeat();
                self.signals
                    .signal_error(&e.to_string(), &task.story_id, task.attempt)
                    .await;
                self.queue.submit_result(TaskResult {
                    task_id: task.task_id.clone(),
                    status: TaskStatus::Failed,
                    domain: self.domain.clone(),
                    agent_id: self.full_id.clone(),
                    result: json!({}),
                    duration_seconds: duration.as_secs_f64(),
                    safety_score: 1.0,
                    error: Some(e.to_string()),
                });
                warn!(task_id = %task.task_id, error = %e, "Task processing failed");
            }
        }
    }

    /// Score produced content; below the threshold the result becomes
    /// `blocked` with the violations attached.
    fn apply_safety(&self, result: &mut Value) -> (TaskStatus, f64, Vec<String>) {
        let content = result
            .get("code")
            .or_else(|| result.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if content.is_empty() {
            set_field(result, "safety_score", json!(1.0));
            set_field(result, "safety_violations", json!([]));
            return (TaskStatus::Completed, 1.0, Vec::new());
        }

        let (safe, score, violations) = self.safety.is_safe(&content);
        set_field(result, "safety_score", json!(score));
        set_field(result, "safety_violations", json!(violations));

        if !safe {
            warn!(score, "SAFETY BLOCK: Score below threshold");
            set_field(result, "status", json!("blocked"));
            set_field(
                result,
                "error",
                json!("Failed constitutional safety check"),
            );
            return (TaskStatus::Blocked, score, violations);
        }
        (TaskStatus::Completed, score, violations)
    }
}

fn set_field(value: &mut Value, key: &str, field: Value) {
    if let Value::Object(map) = value {
        map.insert(key.to_string(), field);
    }
}
