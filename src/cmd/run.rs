//! Epic execution: `forgeflow run <epic>`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::{Emoji, style};
use tokio::sync::broadcast::error::RecvError;

use forgeflow::backlog::GhBacklogClient;
use forgeflow::checkout::GitWorktreeProvider;
use forgeflow::config::FlowConfig;
use forgeflow::models::{Execution, ExecutionStatus, TaskStatus};
use forgeflow::orchestrator::{Dependencies, ExecutionEvent, Orchestrator};
use forgeflow::pool::AgentPool;
use forgeflow::protocol::ProtocolGate;
use forgeflow::protocol::builtin::{EvidenceTruth, IndexedReferences, PatternRules};
use forgeflow::quality::CommandQualityCheckpoint;
use forgeflow::workers::register_builtin_workers;

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[STOP] ");
static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>] ");
static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!] ");

fn build_orchestrator(config: &FlowConfig) -> Result<Orchestrator> {
    let toml = &config.toml;
    let pool = AgentPool::new(toml.pool_config());
    register_builtin_workers(&pool, &toml.claude_cmd(), toml.pool.initial_instances)
        .context("Failed to register worker types")?;

    let gate = ProtocolGate::new(
        Arc::new(EvidenceTruth::new(toml.protocols.truth_threshold)),
        Arc::new(IndexedReferences::new()),
        Arc::new(PatternRules::new(toml.protocols.rules.clone())),
    )
    .with_policy(toml.gate_policy());

    let deps = Dependencies {
        backlog: Arc::new(GhBacklogClient::new(&config.project_dir)),
        checkouts: Arc::new(
            GitWorktreeProvider::new(&config.project_dir, toml.project.base_branch.clone())
                .with_worktree_dir(toml.project.worktree_dir.clone()),
        ),
        quality: Arc::new(CommandQualityCheckpoint::new(
            toml.quality.commands.clone(),
            Duration::from_secs(toml.quality.timeout_secs),
        )),
        gate: Arc::new(gate),
        pool,
    };
    Ok(Orchestrator::with_patterns(
        deps,
        toml.orchestrator_config(),
        toml.pattern_registry(),
    ))
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::ExecutionStarted { .. } => {}
        ExecutionEvent::TaskStarted {
            issue_number,
            worker_type,
            worker_id,
            ..
        } => println!(
            "{}#{} {} {}",
            RUNNING,
            issue_number,
            style(worker_type).cyan(),
            style(format!("({})", worker_id)).dim()
        ),
        ExecutionEvent::TaskProgress {
            task_id,
            progress,
            message,
            execution_progress,
            ..
        } => println!(
            "    {} {:>3}% {}  {}",
            style(short(task_id)).dim(),
            progress,
            message,
            style(format!("[epic {}%]", execution_progress)).dim()
        ),
        ExecutionEvent::TaskCompleted {
            task_id,
            duration_ms,
            ..
        } => println!(
            "{}{} {}",
            CHECK,
            short(task_id),
            style(format!("({}s)", duration_ms.unwrap_or(0) / 1000)).dim()
        ),
        ExecutionEvent::TaskFailed { task_id, error, .. } => println!(
            "{}{} {}: {}",
            CROSS,
            short(task_id),
            style(&error.kind).red(),
            error.message
        ),
        ExecutionEvent::TaskStopped { task_id, .. } => println!("{}{}", STOP, short(task_id)),
        ExecutionEvent::ProtocolViolation {
            task_id, violation, ..
        } => println!(
            "{}{} {} {}: {}",
            WARN,
            short(task_id),
            style(violation.severity).yellow(),
            violation.rule,
            violation.message
        ),
        ExecutionEvent::ExecutionFinished { .. } => {}
    }
}

fn short(id: &str) -> &str {
    &id[..id.floor_char_boundary(8)]
}

fn print_summary(execution: &Execution) {
    let status = match execution.status {
        ExecutionStatus::Completed => style(execution.status).green(),
        ExecutionStatus::Running => style(execution.status).cyan(),
        _ => style(execution.status).red(),
    };
    println!();
    println!(
        "Execution {} {} ({}%)",
        style(&execution.id).bold(),
        status,
        execution.progress
    );
    println!(
        "  completed: {}  failed: {}  stopped: {}",
        execution.count(TaskStatus::Completed),
        execution.count(TaskStatus::Failed),
        execution.count(TaskStatus::Stopped)
    );
    if let Some(report) = &execution.protocol_report {
        println!(
            "  protocol violations: {} ({} critical, {} error, {} warning)",
            report.summary.total, report.summary.critical, report.summary.error, report.summary.warning
        );
    }
}

pub async fn cmd_run(project_dir: PathBuf, epic: &str, json: bool) -> Result<()> {
    let config = FlowConfig::new(project_dir)?;
    for warning in config.validate() {
        eprintln!("{} {}", style("warning:").yellow(), warning);
    }

    let orchestrator = build_orchestrator(&config)?;
    let mut events = orchestrator.subscribe_all();
    let started = orchestrator
        .start(epic)
        .await
        .with_context(|| format!("Failed to start epic {}", epic))?;

    if !json {
        println!(
            "{} {} with pattern {} ({} tasks)",
            style("Running").bold(),
            style(&started.work_item_title).yellow(),
            style(&started.pattern).cyan(),
            started.tasks.len()
        );
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted; stopping execution {}", started.id);
                orchestrator.stop(&started.id).await;
            }
            received = events.recv() => match received {
                Ok(event) if event.execution_id() == started.id => {
                    if json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        print_event(&event);
                    }
                    if matches!(event, ExecutionEvent::ExecutionFinished { .. }) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("{} {} events not shown", style("warning:").yellow(), skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let finished = orchestrator.wait(&started.id).await;
    let execution = finished.unwrap_or(started);
    orchestrator.pool().shutdown();
    if !json {
        print_summary(&execution);
    }

    if execution.status != ExecutionStatus::Completed {
        bail!("Execution {} finished {}", execution.id, execution.status);
    }
    Ok(())
}
