//! The drive loop: one supervisor per execution, one driver per task.
//!
//! A driver runs its task through acquire → checkout → protocol setup →
//! execute → quality → protocol post-checks, then always releases the
//! worker. Its outcome is discarded if the task was stopped meanwhile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::Shared;
use super::state::{ExecutionHandle, FinishedTask};
use crate::models::{Checkout, TaskContext, TaskError, TaskErrorKind, TaskStatus};
use crate::pool::{ProgressReporter, WorkerLease};
use crate::protocol::{CheckContext, ProtocolKind, Severity, Violation};

const COMMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Admit tasks in order under the execution's parallelism limit and the
/// pool's global ceiling, wait for all of them, then make the terminal
/// transition.
pub(super) async fn supervise(shared: Arc<Shared>, handle: Arc<ExecutionHandle>) {
    let execution_id = handle.id();
    let slots = Arc::new(Semaphore::new(handle.max_parallel));
    let mut drivers = JoinSet::new();
    let mut spawned = HashMap::new();

    // both permits are taken here, in task order; `None` admission means
    // the pool was shut down and the driver fails the task
    for task_id in handle.task_ids() {
        let slot = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = handle.cancel.cancelled() => break,
        };
        let admitted = tokio::select! {
            permit = shared.pool.admission().acquire_owned() => permit.ok(),
            _ = handle.cancel.cancelled() => break,
        };
        let abort = drivers.spawn(drive_task(
            shared.clone(),
            handle.clone(),
            task_id.clone(),
            slot,
            admitted,
        ));
        spawned.insert(abort.id(), task_id);
    }

    while let Some(joined) = drivers.join_next_with_id().await {
        let Err(join_err) = joined else {
            continue;
        };
        let Some(task_id) = spawned.get(&join_err.id()) else {
            continue;
        };
        error!(
            execution_id = %execution_id,
            task_id = %task_id,
            "Task driver panicked: {}",
            join_err
        );
        let failure = TaskError::new(
            TaskErrorKind::AgentExecution,
            format!("Task driver panicked: {}", join_err),
        );
        let Some(finished) = handle.finish_task(
            task_id,
            Err(failure),
            shared.config.cleanup_checkouts,
            &shared.events,
        ) else {
            continue;
        };
        let elapsed = finished
            .duration_ms
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
            .unwrap_or_default();
        shared
            .pool
            .update_metrics(&finished.worker_type, false, elapsed);
        if let Some(checkout) = &finished.checkout {
            cleanup_checkout(&shared, checkout).await;
        }
    }

    let report = shared.gate.report(&execution_id);
    let status = handle.finalize(report, &shared.events);
    info!(execution_id = %execution_id, status = %status, "Execution finished");
    handle.notify_finished();
}

async fn drive_task(
    shared: Arc<Shared>,
    handle: Arc<ExecutionHandle>,
    task_id: String,
    _slot: OwnedSemaphorePermit,
    admitted: Option<OwnedSemaphorePermit>,
) {
    // stopped while queued
    let Some(ctx) = handle.task_context(&task_id) else {
        return;
    };
    let Some(_admitted) = admitted else {
        let failure = TaskError::new(TaskErrorKind::ResourceExhausted, "Worker pool is shut down");
        fail(&shared, &handle, &ctx, failure);
        return;
    };

    let lease = match shared.pool.acquire(&ctx.worker_type, &ctx.task_id).await {
        Ok(lease) => lease,
        Err(e) => {
            let failure = TaskError::new(TaskErrorKind::ResourceExhausted, e.to_string());
            fail(&shared, &handle, &ctx, failure);
            return;
        }
    };
    if !handle.mark_running(&ctx.task_id, lease.instance_id(), &shared.events) {
        debug!(task_id = %ctx.task_id, "Task stopped before it started");
        return;
    }

    let started = Instant::now();
    let outcome = run_task(&shared, &handle, &ctx, &lease).await;
    let success = outcome.is_ok();
    lease.release(success);

    if let Err(e) = &outcome {
        warn!(
            execution_id = %ctx.execution_id,
            task_id = %ctx.task_id,
            kind = %e.kind,
            "Task failed: {}",
            e.message
        );
    }

    let Some(finished) = handle.finish_task(
        &ctx.task_id,
        outcome,
        shared.config.cleanup_checkouts,
        &shared.events,
    ) else {
        debug!(task_id = %ctx.task_id, "Discarding outcome of stopped task");
        return;
    };
    shared
        .pool
        .update_metrics(&ctx.worker_type, success, started.elapsed());

    if let Some(checkout) = &finished.checkout {
        cleanup_checkout(&shared, checkout).await;
    }
    if shared.config.comment_on_completion {
        post_comment(&shared, &ctx, &finished).await;
    }
}

fn fail(shared: &Shared, handle: &ExecutionHandle, ctx: &TaskContext, failure: TaskError) {
    warn!(
        execution_id = %ctx.execution_id,
        task_id = %ctx.task_id,
        worker_type = %ctx.worker_type,
        "Task could not start: {}",
        failure.message
    );
    handle.finish_task(&ctx.task_id, Err(failure), false, &shared.events);
}

async fn run_task(
    shared: &Shared,
    handle: &Arc<ExecutionHandle>,
    ctx: &TaskContext,
    lease: &WorkerLease,
) -> Result<(), TaskError> {
    let config = &shared.config;

    let checkout = match timeout(config.checkout_timeout, shared.checkouts.provision(ctx)).await {
        Err(_) => return Err(timed_out("Checkout provisioning", config.checkout_timeout)),
        Ok(Err(e)) => return Err(TaskError::new(TaskErrorKind::Checkout, format!("{:#}", e))),
        Ok(Ok(checkout)) => checkout,
    };
    if !handle.attach_checkout(&ctx.task_id, &checkout) {
        cleanup_checkout(shared, &checkout).await;
        return Err(stopped());
    }

    setup_protocols(shared, handle, ctx, &checkout).await?;
    if ctx.cancel.is_cancelled() {
        return Err(stopped());
    }

    let reporter = progress_reporter(shared, handle, &ctx.task_id);
    let output = match timeout(
        config.worker_timeout,
        lease.worker().execute(ctx, &checkout, reporter),
    )
    .await
    {
        Err(_) => return Err(timed_out("Worker", config.worker_timeout)),
        Ok(Err(e)) => {
            return Err(TaskError::new(TaskErrorKind::AgentExecution, format!("{:#}", e)));
        }
        Ok(Ok(output)) => output,
    };
    if ctx.cancel.is_cancelled() {
        return Err(stopped());
    }

    let quality = match timeout(config.quality_timeout, shared.quality.validate(&checkout)).await {
        Err(_) => Err(timed_out("Quality checkpoint", config.quality_timeout)),
        Ok(Err(e)) => Err(TaskError::new(
            TaskErrorKind::QualityGate,
            format!("Quality checkpoint could not run: {:#}", e),
        )),
        Ok(Ok(report)) if report.passed => Ok(()),
        Ok(Ok(report)) => Err(TaskError::quality_gate(report.issues)),
    };

    // post-checks run whatever the quality outcome; the first failure wins
    let check_ctx = CheckContext::for_task(&ctx.execution_id, &ctx.task_id, &checkout.path);
    let protocol = match timeout(
        config.protocol_timeout,
        shared.gate.post_check(&check_ctx, &output),
    )
    .await
    {
        Err(_) => Err(timed_out("Protocol post-check", config.protocol_timeout)),
        Ok(Err(e)) => Err(gate_failure(
            shared,
            handle,
            ctx,
            "check-failed",
            format!("Protocol checks could not be evaluated: {:#}", e),
        )),
        Ok(Ok(outcome)) => {
            for violation in &outcome.violations {
                handle.record_violation(&ctx.task_id, violation.clone(), &shared.events);
            }
            match outcome.critical {
                Some(critical) => Err(TaskError::protocol(critical)),
                None => Ok(()),
            }
        }
    };

    quality.and(protocol)
}

/// One-time protocol setup for the execution, rooted at the first task's
/// checkout. A failed setup is retried by the next task.
async fn setup_protocols(
    shared: &Shared,
    handle: &ExecutionHandle,
    ctx: &TaskContext,
    checkout: &Checkout,
) -> Result<(), TaskError> {
    let limit = shared.config.protocol_timeout;
    handle
        .gate_setup
        .get_or_try_init(|| async {
            let setup_ctx = CheckContext::for_execution(&ctx.execution_id, &checkout.path);
            match timeout(limit, shared.gate.setup(&setup_ctx)).await {
                Err(_) => Err(timed_out("Protocol setup", limit)),
                Ok(Err(e)) => Err(gate_failure(
                    shared,
                    handle,
                    ctx,
                    "setup-failed",
                    format!("Protocol gate setup failed: {:#}", e),
                )),
                Ok(Ok(setup)) => Ok(setup),
            }
        })
        .await
        .map(|_| ())
}

/// A critical violation raised by the gate itself.
fn gate_failure(
    shared: &Shared,
    handle: &ExecutionHandle,
    ctx: &TaskContext,
    rule: &str,
    message: String,
) -> TaskError {
    let violation = Violation::new(ProtocolKind::Gate, rule, Severity::Critical, message)
        .for_task(ctx.task_id.clone());
    shared.gate.record(&ctx.execution_id, violation.clone());
    handle.record_violation(&ctx.task_id, violation.clone(), &shared.events);
    TaskError::protocol(violation)
}

fn progress_reporter(
    shared: &Shared,
    handle: &Arc<ExecutionHandle>,
    task_id: &str,
) -> ProgressReporter {
    let handle = handle.clone();
    let events = shared.events.clone();
    let task_id = task_id.to_string();
    ProgressReporter::new(move |update| {
        handle.apply_progress(&task_id, update, &events);
    })
}

fn timed_out(what: &str, limit: Duration) -> TaskError {
    TaskError::new(
        TaskErrorKind::Timeout,
        format!("{} timed out after {:?}", what, limit),
    )
}

// The task is already stopped, so this error is never recorded.
fn stopped() -> TaskError {
    TaskError::new(TaskErrorKind::AgentExecution, "Task stopped")
}

pub(super) async fn cleanup_checkout(shared: &Shared, checkout: &Checkout) {
    match timeout(
        shared.config.checkout_timeout,
        shared.checkouts.cleanup(checkout),
    )
    .await
    {
        Ok(Ok(())) => debug!(checkout = %checkout.id, "Checkout removed"),
        Ok(Err(e)) => warn!(checkout = %checkout.id, "Checkout cleanup failed: {:#}", e),
        Err(_) => warn!(checkout = %checkout.id, "Checkout cleanup timed out"),
    }
}

async fn post_comment(shared: &Shared, ctx: &TaskContext, finished: &FinishedTask) {
    let body = completion_comment(ctx, finished);
    match timeout(COMMENT_TIMEOUT, shared.backlog.comment(&finished.issue_id, &body)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(issue = %finished.issue_id, "Failed to post completion comment: {:#}", e),
        Err(_) => warn!(issue = %finished.issue_id, "Posting completion comment timed out"),
    }
}

fn completion_comment(ctx: &TaskContext, finished: &FinishedTask) -> String {
    let duration = finished
        .duration_ms
        .map(|ms| format!(" in {:.1}s", ms as f64 / 1000.0))
        .unwrap_or_default();
    match (&finished.status, &finished.error) {
        (TaskStatus::Completed, _) => format!(
            "**ForgeFlow**: `{}` completed this task{}.\n\nExecution: `{}`",
            ctx.worker_type, duration, ctx.execution_id
        ),
        (_, Some(error)) => format!(
            "**ForgeFlow**: `{}` failed this task{} ({}).\n\n{}\n\nExecution: `{}`",
            ctx.worker_type, duration, error.kind, error.message, ctx.execution_id
        ),
        _ => format!(
            "**ForgeFlow**: task finished with status {}.\n\nExecution: `{}`",
            finished.status, ctx.execution_id
        ),
    }
}
