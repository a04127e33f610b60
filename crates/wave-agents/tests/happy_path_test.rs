//! Single-domain happy path through the whole workflow: all gates pass,
//! the story completes, the checkpoint trail is intact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestration::pubsub::{MemoryBroker, Publisher, StreamClient};
use orchestration::store::{CheckpointType, StateStore, StoryStatus};
use orchestration::{WaveConfig, GATE_SEQUENCE};
use serde_json::{json, Value};
use tempfile::TempDir;

use wave_agents::signals::SignalPublisher;
use wave_agents::supervisor::{Orchestrator, StartRequest};
use wave_agents::task_queue::{AgentTask, TaskQueue};
use wave_agents::worker::{DomainWorker, TaskProcessor};

struct ScriptedCoder;

#[async_trait]
impl TaskProcessor for ScriptedCoder {
    async fn process_task(&self, _task: &AgentTask) -> anyhow::Result<Value> {
        Ok(json!({
            "status": "completed",
            "code": "export async function login(req, res) { return res.json({ ok: 1 }) }",
            "files_modified": ["src/routes/login.ts"],
            "build_success": true,
            "tests_passing": true,
            "coverage": 92.0,
            "tokens": 5000,
        }))
    }
}

struct Harness {
    orchestrator: Orchestrator,
    broker: Arc<MemoryBroker>,
    queue: wave_agents::task_queue::SharedTaskQueue,
    _dir: TempDir,
}

fn harness(distributed: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state.db")).unwrap().shared();
    let broker = MemoryBroker::new().shared();
    let client =
        StreamClient::new(Arc::clone(&broker) as _, "redis://localhost:6379/0").shared();
    let publisher = Publisher::new(client, "happy", "orchestrator")
        .unwrap()
        .shared();
    let queue = TaskQueue::new().shared();

    let config = WaveConfig {
        project: "happy".to_string(),
        distributed,
        emergency_stop_file: dir.path().join("EMERGENCY-STOP"),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config, store, Arc::clone(&queue), publisher)
        .with_processor(Arc::new(ScriptedCoder))
        .with_result_timeout(Duration::from_secs(10));

    Harness {
        orchestrator,
        broker,
        queue,
        _dir: dir,
    }
}

fn start_request() -> StartRequest {
    StartRequest {
        story_id: "AUTH-001".to_string(),
        story_title: "Add login API".to_string(),
        project_path: ".".to_string(),
        requirements: "Add login API".to_string(),
        wave_number: 1,
        domain: "be".to_string(),
        agent: "be-dev".to_string(),
        token_limit: 100_000,
        cost_limit_usd: 10.0,
    }
}

#[tokio::test]
async fn inline_happy_path_passes_all_gates() {
    let harness = harness(false);
    let mut session = harness.orchestrator.start(start_request()).await.unwrap();

    harness.orchestrator.run(&mut session).await.unwrap();

    let status = harness.orchestrator.status(&session).unwrap();
    assert!(status.is_complete);
    assert_eq!(status.phase, "complete");
    assert_eq!(status.progress_percent, 100.0);
    assert!(status.error.is_none());

    let store = harness.orchestrator.store();

    // Eight gate checkpoints, in order gate-0 .. gate-7, all passed.
    let gates: Vec<(String, String)> = store
        .list_checkpoints_by_type(&session.session_id, CheckpointType::Gate, 100)
        .unwrap()
        .into_iter()
        .rev()
        .map(|checkpoint| {
            (
                checkpoint.gate.clone().unwrap(),
                checkpoint.state["status"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(gates.len(), 8);
    for (index, (gate, outcome)) in gates.iter().enumerate() {
        assert_eq!(gate, GATE_SEQUENCE[index]);
        assert_eq!(outcome, "passed");
    }

    // Final story_complete checkpoint with the produced artifacts.
    let completions = store
        .list_checkpoints_by_type(&session.session_id, CheckpointType::StoryComplete, 10)
        .unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(
        completions[0].state["files_modified"],
        json!(["src/routes/login.ts"])
    );

    let execution = store
        .get_execution_by_story(&session.session_id, "AUTH-001")
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, StoryStatus::Complete);
    assert!(execution.tests_passing);

    // Session stayed inside its budget and was marked completed.
    let session_row = store.require_session(&session.session_id).unwrap();
    assert!(session_row.actual_cost_usd <= 10.0);
    assert_eq!(session_row.stories_completed, 1);
    assert_eq!(session_row.stories_failed, 0);
}

#[tokio::test]
async fn distributed_happy_path_runs_through_a_worker() {
    let harness = harness(true);

    let signals = SignalPublisher::new(None, "BE-1", "be").shared();
    let worker = Arc::new(
        DomainWorker::new(
            "be",
            "1",
            Arc::clone(&harness.queue),
            signals,
            Arc::new(ScriptedCoder),
        )
        .with_poll_timeout(Duration::from_millis(50)),
    );
    let shutdown = worker.shutdown_token();
    let worker_handle = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    let mut session = harness.orchestrator.start(start_request()).await.unwrap();
    harness.orchestrator.run(&mut session).await.unwrap();

    let status = harness.orchestrator.status(&session).unwrap();
    assert!(status.is_complete);
    assert_eq!(worker.tasks_processed(), 1);

    shutdown.cancel();
    worker_handle.await.unwrap();
}

#[tokio::test]
async fn workflow_events_reach_the_signals_channel() {
    use orchestration::pubsub::StreamBroker;

    let harness = harness(false);
    let mut session = harness.orchestrator.start(start_request()).await.unwrap();
    harness.orchestrator.run(&mut session).await.unwrap();

    // session.started, story.started, gate events, story.completed,
    // session.completed all landed on the project signals channel.
    let published = harness.broker.xlen("wave:signals:happy").await.unwrap();
    assert!(
        published >= 8 + 4,
        "expected story/session plus gate events, saw {published}"
    );
}

#[tokio::test]
async fn stop_fails_story_with_user_reason() {
    let harness = harness(false);
    let mut session = harness.orchestrator.start(start_request()).await.unwrap();

    harness.orchestrator.stop(&mut session).await.unwrap();

    let status = harness.orchestrator.status(&session).unwrap();
    assert_eq!(status.phase, "failed");
    assert!(!status.is_complete);
    assert_eq!(status.error.as_deref(), Some("stopped by user"));
}
