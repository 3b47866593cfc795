use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::traits::{ApprovalDecision, StaticAgentDirectory};
use weft_core::types::{EventType, HandoffStatus, StateScope, WorkflowExecution};
use weft_core::{WeftConfig, WorkflowDefinition};
use weft_engine::{
    CommandAgentExecutor, ExecutionControl, Services, WorkflowExecutor, WorkflowValidator,
};
use weft_store::{EventQuery, JsonlMirror};

#[derive(Parser)]
#[command(name = "weft", version, about = "Multi-agent workflow orchestration")]
struct Cli {
    /// Path to config file (defaults to ~/.weft/config.toml)
    #[arg(short, long, env = "WEFT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition without running it
    Validate {
        /// Workflow definition (.toml or .json)
        file: PathBuf,
    },
    /// Execute a workflow definition
    Run {
        /// Workflow definition (.toml or .json)
        file: PathBuf,
        /// Workflow input as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Continue a paused or interrupted execution
    Resume {
        /// Workflow definition the execution was started from
        file: PathBuf,
        /// Execution to resume
        execution_id: String,
        /// Approve the pending manual step with this JSON output
        #[arg(long, conflicts_with = "reject")]
        approve: Option<String>,
        /// Reject the pending manual step with a reason
        #[arg(long)]
        reject: Option<String>,
    },
    /// Show the latest snapshot of an execution
    Status {
        execution_id: String,
    },
    /// Inspect the dead-letter queue
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Inspect registered handoffs
    Handoffs {
        #[command(subcommand)]
        action: HandoffAction,
    },
    /// Query the event log
    Events {
        /// Only events with this correlation (execution) id
        #[arg(long)]
        correlation: Option<String>,
        /// Only events of this type (e.g. step_failed)
        #[arg(long = "type")]
        event_type: Option<String>,
        /// Only events for this agent
        #[arg(long)]
        agent: Option<String>,
        /// RFC 3339 lower bound, inclusive
        #[arg(long)]
        since: Option<String>,
        /// RFC 3339 upper bound, inclusive
        #[arg(long)]
        until: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Rebuild an execution's step outcomes from its events
    Replay {
        execution_id: String,
    },
    /// Inspect the state repository
    States {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List failed tasks, newest first
    List {
        #[arg(long)]
        agent: Option<String>,
        /// Filter by whether the last error was retryable (true or false)
        #[arg(long)]
        retryable: Option<bool>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Remove a failed task
    Remove {
        task_id: String,
    },
}

#[derive(Subcommand)]
enum HandoffAction {
    /// List handoffs in creation order
    List {
        #[arg(long)]
        execution: Option<String>,
        /// pending, accepted, in_progress, complete, rejected, failed
        #[arg(long)]
        status: Option<String>,
    },
    /// Count handoffs by status
    Stats {
        #[arg(long)]
        execution: Option<String>,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// List stored states, most recently updated first
    List {
        /// agent or workflow
        #[arg(long)]
        scope: Option<String>,
    },
    /// List the retained versions of a state
    Versions {
        state_id: String,
    },
    /// Re-hash a stored version and compare it with its checksum
    Verify {
        state_id: String,
        version: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(WeftConfig::default_path);
    let config = WeftConfig::load_or_default(&config_path)?;
    if config_path.exists() {
        info!(path = %config_path.display(), "Loaded config");
    }

    let agents = Arc::new(CommandAgentExecutor::from_config(&config.agents));
    let discovery = Arc::new(StaticAgentDirectory::new(config.agents.agent_ids()));
    let services = Arc::new(Services::open(&config, agents, discovery)?);

    match cli.command {
        Commands::Validate { file } => {
            let definition = load_definition(&file)?;
            let errors = WorkflowValidator::new(services.discovery.clone()).validate(&definition);
            if errors.is_empty() {
                println!(
                    "{} v{}: valid ({} phases, {} steps)",
                    definition.id,
                    definition.version(),
                    definition.phases.len(),
                    definition.all_steps().len()
                );
            } else {
                println!("{} v{}: {} error(s)", definition.id, definition.version(), errors.len());
                for e in &errors {
                    println!("  - {}", e);
                }
                std::process::exit(1);
            }
        }
        Commands::Run { file, input } => {
            let definition = load_definition(&file)?;
            let input: serde_json::Value = serde_json::from_str(&input)?;
            let executor = WorkflowExecutor::new(services.clone());
            let control = ExecutionControl::new();
            let mirror = start_mirror(&config, &services).await;
            spawn_interrupt_handler(&control);

            let result = executor
                .execute_with_control(&definition, input, control)
                .await;
            stop_mirror(mirror).await;
            let execution = result?;
            print_execution(&execution);
            exit_for(&execution);
        }
        Commands::Resume {
            file,
            execution_id,
            approve,
            reject,
        } => {
            let definition = load_definition(&file)?;
            let decision = match (approve, reject) {
                (Some(output), _) => Some(ApprovalDecision::Approved {
                    output: serde_json::from_str(&output)?,
                }),
                (None, Some(reason)) => Some(ApprovalDecision::Rejected { reason }),
                (None, None) => None,
            };
            let executor = WorkflowExecutor::new(services.clone());
            let control = ExecutionControl::new();
            let mirror = start_mirror(&config, &services).await;
            spawn_interrupt_handler(&control);

            let result = executor
                .resume_with_decision(&definition, &execution_id, decision, control)
                .await;
            stop_mirror(mirror).await;
            let execution = result?;
            print_execution(&execution);
            exit_for(&execution);
        }
        Commands::Status { execution_id } => {
            let executor = WorkflowExecutor::new(services);
            match executor.load_execution(&execution_id)? {
                Some(execution) => print_execution(&execution),
                None => {
                    eprintln!("No execution '{}' found.", execution_id);
                    std::process::exit(1);
                }
            }
        }
        Commands::Dlq { action } => match action {
            DlqAction::List {
                agent,
                retryable,
                limit,
            } => {
                let tasks = services.dead_letters.get_failed_tasks(
                    agent.as_deref(),
                    retryable,
                    Some(limit),
                )?;
                if tasks.is_empty() {
                    println!("Dead-letter queue is empty.");
                }
                for task in &tasks {
                    println!(
                        "{}  agent={} category={} attempts={} retryable={} at {}",
                        task.task_id,
                        task.agent_id,
                        task.error.category,
                        task.attempts,
                        task.can_retry,
                        task.failed_at.to_rfc3339()
                    );
                    println!("    {}", truncate(&task.error.message, 160));
                }
            }
            DlqAction::Remove { task_id } => {
                if services.dead_letters.remove_task(&task_id)? {
                    println!("Removed {}", task_id);
                } else {
                    println!("No failed task '{}'.", task_id);
                }
            }
        },
        Commands::Handoffs { action } => match action {
            HandoffAction::List { execution, status } => {
                let status = status
                    .as_deref()
                    .map(str::parse::<HandoffStatus>)
                    .transpose()?;
                let records = services.handoffs.get_handoffs(execution.as_deref(), status)?;
                if records.is_empty() {
                    println!("No handoffs.");
                }
                for h in &records {
                    println!(
                        "{}  {} -> {}{}  [{}] {}",
                        h.handoff_id,
                        h.from_agent,
                        h.to_agent,
                        h.to_step
                            .as_deref()
                            .map(|s| format!(" ({})", s))
                            .unwrap_or_default(),
                        h.status,
                        h.kind.as_str()
                    );
                    println!("    {}", truncate(&h.work_summary, 160));
                }
            }
            HandoffAction::Stats { execution } => {
                let stats = services.handoffs.get_handoff_stats(execution.as_deref())?;
                println!("Handoffs: {}", stats.total);
                for (status, count) in &stats.by_status {
                    println!("  {:<12} {}", format!("{}:", status), count);
                }
            }
        },
        Commands::Events {
            correlation,
            event_type,
            agent,
            since,
            until,
            limit,
        } => {
            let query = EventQuery {
                correlation_id: correlation,
                event_type: event_type.as_deref().map(str::parse::<EventType>).transpose()?,
                agent_id: agent,
                since: since.as_deref().map(parse_time).transpose()?,
                until: until.as_deref().map(parse_time).transpose()?,
                limit: Some(limit),
            };
            for event in services.events.query(&query)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::Replay { execution_id } => {
            let summary = services.events.replay(&execution_id)?;
            if summary.event_count == 0 {
                eprintln!("No events for '{}'.", execution_id);
                std::process::exit(1);
            }
            println!(
                "{} ({}): {} events, status {}",
                summary.correlation_id,
                summary.workflow_id.as_deref().unwrap_or("-"),
                summary.event_count,
                summary
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".into())
            );
            for step in &summary.steps {
                println!(
                    "  {:<20} {:<12} attempts={}{}{}",
                    step.step_id,
                    step.status.as_str(),
                    step.attempts,
                    step.duration_ms
                        .map(|ms| format!(" {}ms", ms))
                        .unwrap_or_default(),
                    step.last_error
                        .as_deref()
                        .map(|e| format!("  error: {}", truncate(e, 120)))
                        .unwrap_or_default()
                );
            }
        }
        Commands::States { action } => match action {
            StateAction::List { scope } => {
                let scope = scope.as_deref().map(str::parse::<StateScope>).transpose()?;
                for s in services.state.list_states(scope)? {
                    println!(
                        "{:<48} {:<9} v{:<4} {:>8}B{} {}",
                        s.state_id,
                        s.scope.as_str(),
                        s.version,
                        s.size_bytes,
                        if s.has_backup { " [backup]" } else { "" },
                        s.updated_at.to_rfc3339()
                    );
                }
            }
            StateAction::Versions { state_id } => {
                let versions = services.state.list_versions(&state_id)?;
                if versions.is_empty() {
                    println!("No versions for '{}'.", state_id);
                }
                for v in versions {
                    println!("v{}", v);
                }
            }
            StateAction::Verify { state_id, version } => {
                match services.state.verify_state(&state_id, version)? {
                    Some(true) => println!("{} v{}: checksum ok", state_id, version),
                    Some(false) => {
                        println!("{} v{}: checksum MISMATCH", state_id, version);
                        std::process::exit(1);
                    }
                    None => {
                        println!("{} v{}: not found", state_id, version);
                        std::process::exit(1);
                    }
                }
            }
        },
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let definition = WorkflowDefinition::load(path)?;
    info!(path = %path.display(), workflow_id = %definition.id, "Loaded workflow definition");
    Ok(definition)
}

fn parse_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Cancel the execution on Ctrl-C. The current step finishes first.
fn spawn_interrupt_handler(control: &ExecutionControl) {
    let control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current step");
            control.cancel();
        }
    });
}

struct MirrorHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Start the JSONL mirror if `[event_log] jsonl_dir` is set.
async fn start_mirror(config: &WeftConfig, services: &Services) -> Option<MirrorHandle> {
    let dir = config.jsonl_dir()?;
    let bus = services.events.bus()?.clone();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(JsonlMirror::new(dir).run(bus.clone(), cancel.clone()));

    // Wait for the subscription so the first events are not missed.
    for _ in 0..100 {
        if bus.receiver_count() > 0 || task.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Some(MirrorHandle { cancel, task })
}

async fn stop_mirror(mirror: Option<MirrorHandle>) {
    if let Some(m) = mirror {
        m.cancel.cancel();
        m.task.await.ok();
    }
}

fn print_execution(execution: &WorkflowExecution) {
    println!(
        "Execution {} ({} v{}): {}",
        execution.execution_id,
        execution.workflow_id,
        execution.workflow_version,
        execution.status
    );
    if let Some(ms) = execution.duration_ms() {
        println!("Duration: {}ms", ms);
    }
    if let Some(ref e) = execution.error {
        println!("Error: {}", e);
    }
    for phase in &execution.phases {
        println!("  [{}] {}", phase.status, phase.phase_id);
        for step in &phase.steps {
            let mut line = format!("    {:<20} {:<12}", step.step_id, step.status.as_str());
            if let Some(ms) = step.duration_ms {
                line.push_str(&format!(" {}ms", ms));
            }
            if step.retry_count > 0 {
                line.push_str(&format!(" retries={}", step.retry_count));
            }
            if let Some(ref e) = step.error {
                line.push_str(&format!("  error: {}", truncate(e, 120)));
            }
            println!("{}", line);
        }
    }
}

/// Non-zero exit for anything but a completed run. Paused runs exit 2 so
/// scripts can tell them apart from failures.
fn exit_for(execution: &WorkflowExecution) {
    use weft_core::types::ExecutionStatus;
    match execution.status {
        ExecutionStatus::Completed => {}
        ExecutionStatus::Paused => {
            println!(
                "Resume with: weft resume <file> {} [--approve JSON | --reject REASON]",
                execution.execution_id
            );
            std::process::exit(2);
        }
        _ => std::process::exit(1),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
