//! WAVE agents CLI.
//!
//! `start` runs one story end to end; `status` reports a stored story's
//! phase and progress; `stop` fails it with "stopped by user"; `worker`
//! runs a long-lived domain worker against the shared queue;
//! `emergency-stop` trips or clears the global latch.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use orchestration::pubsub::{MemoryBroker, Publisher, StreamClient};
use orchestration::recovery::{RecoveryManager, RecoveryStrategy};
use orchestration::store::StateStore;
use orchestration::WaveConfig;
use wave_agents::signals::SignalPublisher;
use wave_agents::supervisor::{Orchestrator, StartRequest, WorkflowSession};
use wave_agents::task_queue::{AgentTask, TaskQueue};
use wave_agents::worker::{DomainWorker, TaskProcessor};

#[derive(Parser)]
#[command(name = "wave-agents", about = "WAVE autonomous delivery orchestrator")]
struct Cli {
    /// Durable store directory.
    #[arg(long, env = "DATABASE_URL", default_value = ".wave/state")]
    state_path: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a story workflow and run it to completion or stop.
    Start {
        #[arg(long)]
        story_id: String,
        #[arg(long, default_value = ".")]
        project_path: String,
        #[arg(long)]
        requirements: String,
        #[arg(long, default_value_t = 1)]
        wave_number: u32,
        #[arg(long, default_value = "be")]
        domain: String,
        #[arg(long, default_value_t = 100_000)]
        token_limit: u64,
        #[arg(long, default_value_t = 10.0)]
        cost_limit_usd: f64,
    },
    /// Report a story's phase, gate, and progress.
    Status {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        story_id: String,
    },
    /// Stop a story with reason "stopped by user".
    Stop {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        story_id: String,
    },
    /// Recover interrupted stories from their checkpoints.
    Recover {
        #[arg(long)]
        session_id: String,
        /// Recover one story; omitted recovers every non-terminal story.
        #[arg(long)]
        story_id: Option<String>,
        #[arg(long, value_enum, default_value = "resume-from-last")]
        strategy: RecoveryStrategyArg,
        /// Target gate for the resume-from-gate strategy.
        #[arg(long)]
        target_gate: Option<String>,
    },
    /// Run a domain worker loop.
    Worker {
        #[arg(long)]
        domain: String,
        #[arg(long, default_value = "1")]
        agent_id: String,
    },
    /// Trip or clear the process-wide emergency stop.
    EmergencyStop {
        #[arg(long, default_value = "operator request")]
        reason: String,
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum RecoveryStrategyArg {
    ResumeFromLast,
    ResumeFromGate,
    Restart,
    Skip,
}

impl From<RecoveryStrategyArg> for RecoveryStrategy {
    fn from(arg: RecoveryStrategyArg) -> Self {
        match arg {
            RecoveryStrategyArg::ResumeFromLast => RecoveryStrategy::ResumeFromLast,
            RecoveryStrategyArg::ResumeFromGate => RecoveryStrategy::ResumeFromGate,
            RecoveryStrategyArg::Restart => RecoveryStrategy::Restart,
            RecoveryStrategyArg::Skip => RecoveryStrategy::Skip,
        }
    }
}

/// Placeholder coder used when no model-backed processor is wired in:
/// echoes the requirements as completed work.
struct EchoProcessor;

#[async_trait]
impl TaskProcessor for EchoProcessor {
    async fn process_task(&self, task: &AgentTask) -> Result<Value> {
        Ok(json!({
            "status": "completed",
            "content": task.payload.get("requirements").cloned().unwrap_or_default(),
            "tests_passing": true,
            "coverage": 100.0,
        }))
    }
}

fn build_orchestrator(config: WaveConfig, state_path: &str) -> Result<Orchestrator> {
    let store = StateStore::open(state_path)
        .with_context(|| format!("opening state store at {state_path}"))?
        .shared();
    let broker = MemoryBroker::new().shared();
    let client = StreamClient::new(broker as _, &config.redis_url).shared();
    let publisher = Publisher::new(client, &config.project, "orchestrator")?.shared();
    let queue = TaskQueue::new().shared();
    Ok(Orchestrator::new(config, store, queue, publisher)
        .with_processor(Arc::new(EchoProcessor)))
}

fn load_session(
    orchestrator: &Orchestrator,
    session_id: &str,
    story_id: &str,
) -> Result<WorkflowSession> {
    let execution = orchestrator
        .store()
        .get_execution_by_story(session_id, story_id)?
        .with_context(|| format!("no story {story_id} in session {session_id}"))?;

    let requirements = execution
        .metadata
        .get("requirements")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let state = wave_agents::supervisor::WorkflowState {
        session_id: session_id.to_string(),
        story_id: story_id.to_string(),
        requirements,
        domain: execution.domain.clone(),
        phase: execution.status.to_string(),
        current_gate: execution.current_gate(),
        safety: Default::default(),
        budget: Default::default(),
        code: None,
        files_modified: execution.files_modified.clone(),
        build_success: true,
        tests_passing: execution.tests_passing,
        coverage: execution.coverage_achieved.unwrap_or(0.0),
        error: execution.error_message.clone(),
    };
    Ok(WorkflowSession {
        session_id: session_id.to_string(),
        execution_id: execution.id,
        story_id: story_id.to_string(),
        state,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = WaveConfig::from_env();

    match cli.command {
        Command::Start {
            story_id,
            project_path,
            requirements,
            wave_number,
            domain,
            token_limit,
            cost_limit_usd,
        } => {
            let orchestrator = build_orchestrator(config, &cli.state_path)?;
            let request = StartRequest {
                story_title: story_id.clone(),
                story_id,
                project_path,
                requirements,
                wave_number,
                domain,
                agent: "dev".to_string(),
                token_limit,
                cost_limit_usd,
            };
            let mut session = orchestrator.start(request).await?;
            info!(session_id = %session.session_id, story_id = %session.story_id, "Workflow started");

            let run_result = orchestrator.run(&mut session).await;
            let status = orchestrator.status(&session)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            run_result?;
        }
        Command::Status {
            session_id,
            story_id,
        } => {
            let orchestrator = build_orchestrator(config, &cli.state_path)?;
            let session = load_session(&orchestrator, &session_id, &story_id)?;
            let status = orchestrator.status(&session)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Stop {
            session_id,
            story_id,
        } => {
            let orchestrator = build_orchestrator(config, &cli.state_path)?;
            let mut session = load_session(&orchestrator, &session_id, &story_id)?;
            orchestrator.stop(&mut session).await?;
            let status = orchestrator.status(&session)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Recover {
            session_id,
            story_id,
            strategy,
            target_gate,
        } => {
            let store = StateStore::open(&cli.state_path)
                .with_context(|| format!("opening state store at {}", cli.state_path))?
                .shared();
            let recovery = RecoveryManager::new(store);
            match story_id {
                Some(story_id) => {
                    let report = recovery.recover_story(
                        &session_id,
                        &story_id,
                        strategy.into(),
                        target_gate.as_deref(),
                    )?;
                    println!("{}: {}", report.story_id, report.status);
                }
                None => {
                    let report = recovery.recover_session(&session_id, strategy.into())?;
                    println!(
                        "recovered {} of {} stories ({} failed)",
                        report.recovered.len(),
                        report.total_stories,
                        report.failed.len()
                    );
                    for (story_id, error) in &report.failed {
                        println!("  {story_id}: {error}");
                    }
                }
            }
        }
        Command::Worker { domain, agent_id } => {
            let broker = MemoryBroker::new().shared();
            let client = StreamClient::new(broker as _, &config.redis_url).shared();
            let publisher =
                Publisher::new(client, &config.project, &format!("{domain}-{agent_id}"))?
                    .shared();
            let queue = TaskQueue::new().shared();
            let signals = SignalPublisher::new(
                Some(publisher),
                &format!("{}-{agent_id}", domain.to_uppercase()),
                &domain,
            )
            .shared();
            let worker = Arc::new(DomainWorker::new(
                &domain,
                &agent_id,
                queue,
                signals,
                Arc::new(EchoProcessor),
            ));

            let shutdown = worker.shutdown_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received, finishing current task");
                    shutdown.cancel();
                }
            });
            worker.run().await;
        }
        Command::EmergencyStop { reason, clear } => {
            let estop = orchestration::safety::EmergencyStop::new(config.emergency_stop_file);
            if clear {
                estop.clear();
                println!("emergency stop cleared");
            } else {
                estop.trigger(&reason, "api").await;
                println!("emergency stop triggered: {reason}");
            }
        }
    }
    Ok(())
}
