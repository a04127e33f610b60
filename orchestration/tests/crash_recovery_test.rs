//! Crash-and-resume behavior of the execution engine and recovery
//! manager, including the recovery-time contract.

use std::sync::Arc;
use std::time::{Duration, Instant};

use orchestration::execution::{ExecutionContext, GateResult, StoryExecutionEngine, GATE_SEQUENCE};
use orchestration::recovery::{RecoveryManager, RecoveryStrategy};
use orchestration::store::{CheckpointType, SharedStateStore, StateStore, StoryStatus};
use tempfile::tempdir;

struct Fixture {
    store: SharedStateStore,
    engine: StoryExecutionEngine,
    recovery: RecoveryManager,
    session_id: String,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.db")).unwrap().shared();
    let session = store.create_session("demo", 1, 10.0).unwrap();
    Fixture {
        engine: StoryExecutionEngine::new(Arc::clone(&store)),
        recovery: RecoveryManager::new(Arc::clone(&store)),
        store,
        session_id: session.id,
        _dir: dir,
    }
}

fn run_to_gate(fixture: &Fixture, story_id: &str, gates: usize) -> String {
    let execution_id = fixture
        .engine
        .start_execution(ExecutionContext::new(
            &fixture.session_id,
            story_id,
            "Crash test story",
            "be",
            "be-1",
        ))
        .unwrap();
    for gate in &GATE_SEQUENCE[..gates] {
        fixture
            .engine
            .execute_gate(&execution_id, &GateResult::passed(gate, 3, 3))
            .unwrap();
    }
    execution_id
}

/// Crash at gate-5, then resume_from_last: the pre-crash gate and AC
/// counters survive, recovery finishes well under five seconds, and the
/// recovery checkpoint names the anchor it resumed from.
#[test]
fn crash_at_gate_five_resumes_in_under_five_seconds() {
    let fixture = fixture();
    let execution_id = run_to_gate(&fixture, "AUTH-001", 5);

    let pre_crash = fixture.engine.current_state(&execution_id).unwrap();
    assert_eq!(pre_crash.current_gate, "gate-5");
    assert_eq!(pre_crash.ac_passed, 3);

    fixture.engine.fail_execution(&execution_id, "crash").unwrap();
    let pre_recovery_latest = fixture
        .store
        .latest_checkpoint(&fixture.session_id)
        .unwrap()
        .unwrap();
    let checkpoints_before = fixture.store.checkpoint_count(&fixture.session_id).unwrap();

    let started = Instant::now();
    let report = fixture
        .recovery
        .recover_story(
            &fixture.session_id,
            "AUTH-001",
            RecoveryStrategy::ResumeFromLast,
            None,
        )
        .unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_secs(5),
        "recovery took {elapsed:?}"
    );
    assert_eq!(report.status, "resumed");

    let state = fixture.engine.current_state(&execution_id).unwrap();
    assert_eq!(state.status, StoryStatus::InProgress);
    assert_eq!(state.current_gate, "gate-5");
    assert!(state.ac_passed >= pre_crash.ac_passed);

    // No checkpoints were lost; exactly one manual recovery checkpoint
    // was added, and it names the pre-recovery latest as its anchor.
    let checkpoints_after = fixture.store.checkpoint_count(&fixture.session_id).unwrap();
    assert_eq!(checkpoints_after, checkpoints_before + 1);

    let recovery_checkpoint = fixture
        .store
        .latest_checkpoint(&fixture.session_id)
        .unwrap()
        .unwrap();
    assert_eq!(recovery_checkpoint.checkpoint_type, CheckpointType::Manual);
    assert_eq!(
        recovery_checkpoint.state["recovery_strategy"],
        "resume_from_last"
    );
    assert_eq!(
        recovery_checkpoint.state["recovered_from"],
        pre_recovery_latest.id.as_str()
    );
}

/// A story with all eight gate checkpoints still recovers in bounded
/// time after a restart strategy.
#[test]
fn full_gate_history_recovers_quickly() {
    let fixture = fixture();
    let execution_id = run_to_gate(&fixture, "AUTH-002", 7);
    fixture.engine.fail_execution(&execution_id, "crash").unwrap();

    let started = Instant::now();
    fixture
        .recovery
        .recover_story(
            &fixture.session_id,
            "AUTH-002",
            RecoveryStrategy::Restart,
            None,
        )
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let state = fixture.engine.current_state(&execution_id).unwrap();
    assert_eq!(state.status, StoryStatus::Pending);
    assert_eq!(state.current_gate, "gate-0");
    assert_eq!(state.retry_count, 0);
}

/// Session-wide recovery of three interrupted stories completes in
/// under five seconds total.
#[test]
fn session_recovery_of_three_stories_is_bounded() {
    let fixture = fixture();
    for (story, gates) in [("S-1", 2), ("S-2", 4), ("S-3", 6)] {
        let execution_id = run_to_gate(&fixture, story, gates);
        fixture.engine.fail_execution(&execution_id, "crash").unwrap();
    }

    let started = Instant::now();
    let report = fixture
        .recovery
        .recover_session(&fixture.session_id, RecoveryStrategy::ResumeFromLast)
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    assert_eq!(report.total_stories, 3);
    assert_eq!(report.recovered.len(), 3);
    assert!(report.failed.is_empty());

    for story in ["S-1", "S-2", "S-3"] {
        let execution = fixture
            .store
            .get_execution_by_story(&fixture.session_id, story)
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, StoryStatus::InProgress);
    }
}

/// Checkpoint timestamps never move backwards across the crash, the
/// failure, and the recovery.
#[test]
fn checkpoint_history_is_append_only() {
    let fixture = fixture();
    let execution_id = run_to_gate(&fixture, "AUTH-003", 4);
    fixture.engine.fail_execution(&execution_id, "crash").unwrap();
    fixture
        .recovery
        .recover_story(
            &fixture.session_id,
            "AUTH-003",
            RecoveryStrategy::ResumeFromLast,
            None,
        )
        .unwrap();

    let checkpoints = fixture.store.list_checkpoints(&fixture.session_id, 100).unwrap();
    // list_checkpoints is most-recent-first.
    for window in checkpoints.windows(2) {
        assert!(window[0].created_at >= window[1].created_at);
    }
}

/// Recovery preserves gate ordering: the gate checkpoints observed
/// after recovery are exactly the pre-crash sequence.
#[test]
fn gate_checkpoints_survive_recovery_in_order() {
    let fixture = fixture();
    let execution_id = run_to_gate(&fixture, "AUTH-004", 5);
    fixture.engine.fail_execution(&execution_id, "crash").unwrap();
    fixture
        .recovery
        .recover_story(
            &fixture.session_id,
            "AUTH-004",
            RecoveryStrategy::ResumeFromLast,
            None,
        )
        .unwrap();

    let gates: Vec<String> = fixture
        .store
        .list_checkpoints_by_type(&fixture.session_id, CheckpointType::Gate, 100)
        .unwrap()
        .into_iter()
        .rev()
        .filter_map(|checkpoint| checkpoint.gate)
        .collect();
    assert_eq!(
        gates,
        GATE_SEQUENCE[..5]
            .iter()
            .map(|g| g.to_string())
            .collect::<Vec<_>>()
    );
}
