//! Per-execution record guarded by a single lock.
//!
//! Every mutation of an execution (task transitions, progress, the terminal
//! transition) goes through [`ExecutionHandle`], and events describing the
//! mutation are emitted while the lock is held so subscribers observe them
//! in the same order the record changed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;

use super::events::{EventBus, ExecutionEvent};
use crate::models::{
    Checkout, Execution, ExecutionStatus, Task, TaskContext, TaskError, TaskStatus,
    aggregate_progress,
};
use crate::pool::ProgressUpdate;
use crate::protocol::{GateSetup, ProtocolReport, Violation};

struct ExecutionState {
    execution: Execution,
    progress_seq: HashMap<String, u64>,
}

/// What a stop left behind for the caller to clean up outside the lock.
#[derive(Debug, Default)]
pub(crate) struct StopSweep {
    /// (worker type, worker instance, task) of every task that was running.
    pub releases: Vec<(String, String, String)>,
    pub checkouts: Vec<Checkout>,
}

/// A task that reached completed/failed through its drive loop.
#[derive(Debug)]
pub(crate) struct FinishedTask {
    pub issue_id: String,
    pub status: TaskStatus,
    pub error: Option<TaskError>,
    pub duration_ms: Option<i64>,
    pub checkout: Option<Checkout>,
    pub worker_type: String,
}

pub(crate) struct ExecutionHandle {
    state: Mutex<ExecutionState>,
    pub cancel: CancellationToken,
    pub gate_setup: OnceCell<GateSetup>,
    pub max_parallel: usize,
    finished: watch::Sender<bool>,
}

impl ExecutionHandle {
    pub fn new(execution: Execution, max_parallel: usize) -> Self {
        let done = execution.is_terminal();
        let (finished, _) = watch::channel(done);
        Self {
            state: Mutex::new(ExecutionState {
                execution,
                progress_seq: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
            gate_setup: OnceCell::new(),
            max_parallel: max_parallel.max(1),
            finished,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Execution {
        self.lock().execution.clone()
    }

    pub fn id(&self) -> String {
        self.lock().execution.id.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().execution.is_terminal()
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.lock()
            .execution
            .tasks
            .iter()
            .map(|t| t.id.clone())
            .collect()
    }

    /// Context for a task that has not started yet.
    pub fn task_context(&self, task_id: &str) -> Option<TaskContext> {
        let state = self.lock();
        let execution = &state.execution;
        let task = execution.task(task_id)?;
        if task.status != TaskStatus::Pending {
            return None;
        }
        Some(TaskContext {
            execution_id: execution.id.clone(),
            task_id: task.id.clone(),
            work_item_id: task.work_item_id.clone(),
            issue_id: task.issue_id.clone(),
            issue_number: task.issue_number,
            title: task.title.clone(),
            worker_type: task.worker_type.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// pending → running with `worker_id` attached. False if the task is no
    /// longer pending (it was stopped).
    pub fn mark_running(&self, task_id: &str, worker_id: &str, events: &EventBus) -> bool {
        let mut state = self.lock();
        let execution_id = state.execution.id.clone();
        let Some(task) = task_mut(&mut state.execution, task_id) else {
            return false;
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.worker_id = Some(worker_id.to_string());
        events.emit(ExecutionEvent::TaskStarted {
            execution_id,
            task_id: task.id.clone(),
            issue_number: task.issue_number,
            worker_type: task.worker_type.clone(),
            worker_id: worker_id.to_string(),
        });
        true
    }

    /// Record the task's checkout. False if the task is no longer running,
    /// in which case the caller owns the cleanup.
    pub fn attach_checkout(&self, task_id: &str, checkout: &Checkout) -> bool {
        let mut state = self.lock();
        match task_mut(&mut state.execution, task_id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.checkout = Some(checkout.clone());
                true
            }
            _ => false,
        }
    }

    /// Apply a progress callback unless the task left running or a later
    /// update was already applied.
    pub fn apply_progress(&self, task_id: &str, update: ProgressUpdate, events: &EventBus) -> bool {
        let mut state = self.lock();
        let last = state.progress_seq.get(task_id).copied().unwrap_or(0);
        if update.seq <= last {
            return false;
        }
        let execution_id = state.execution.id.clone();
        let Some(task) = task_mut(&mut state.execution, task_id) else {
            return false;
        };
        if task.status != TaskStatus::Running {
            return false;
        }
        task.progress = update.percent.min(100);
        task.last_message = Some(update.message.clone());
        let progress = task.progress;

        state.progress_seq.insert(task_id.to_string(), update.seq);
        let execution_progress = aggregate_progress(&state.execution.tasks);
        state.execution.progress = execution_progress;
        events.emit(ExecutionEvent::TaskProgress {
            execution_id,
            task_id: task_id.to_string(),
            progress,
            message: update.message,
            execution_progress,
        });
        true
    }

    /// Record a protocol violation on a running task.
    pub fn record_violation(&self, task_id: &str, violation: Violation, events: &EventBus) {
        let mut state = self.lock();
        let execution_id = state.execution.id.clone();
        let Some(task) = task_mut(&mut state.execution, task_id) else {
            return;
        };
        if task.status != TaskStatus::Running {
            return;
        }
        task.violations.push(violation.clone());
        events.emit(ExecutionEvent::ProtocolViolation {
            execution_id,
            task_id: task_id.to_string(),
            violation,
        });
    }

    /// Move a pending or running task to completed/failed. Returns `None` if
    /// the task was already terminal (a stopped task's late outcome).
    pub fn finish_task(
        &self,
        task_id: &str,
        outcome: Result<(), TaskError>,
        take_checkout: bool,
        events: &EventBus,
    ) -> Option<FinishedTask> {
        let mut state = self.lock();
        let execution_id = state.execution.id.clone();
        let task = task_mut(&mut state.execution, task_id)?;
        if task.status.is_terminal() {
            return None;
        }

        let now = Utc::now();
        if task.started_at.is_none() {
            task.started_at = Some(now);
        }
        task.ended_at = Some(now);
        task.worker_id = None;
        let checkout = if take_checkout {
            task.checkout.take()
        } else {
            None
        };

        let event = match outcome {
            Ok(()) => {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                ExecutionEvent::TaskCompleted {
                    execution_id,
                    task_id: task_id.to_string(),
                    duration_ms: task.duration_ms(),
                }
            }
            Err(error) => {
                task.status = TaskStatus::Failed;
                task.quality_issues = error.issues.clone();
                task.error = Some(error.clone());
                ExecutionEvent::TaskFailed {
                    execution_id,
                    task_id: task_id.to_string(),
                    error,
                }
            }
        };
        let finished = FinishedTask {
            issue_id: task.issue_id.clone(),
            status: task.status,
            error: task.error.clone(),
            duration_ms: task.duration_ms(),
            checkout,
            worker_type: task.worker_type.clone(),
        };

        state.execution.progress = aggregate_progress(&state.execution.tasks);
        events.emit(event);
        Some(finished)
    }

    /// Stop every non-terminal task and the execution, capturing the
    /// protocol report as it stands. `None` if the execution had already
    /// finished.
    pub fn stop(&self, report: ProtocolReport, events: &EventBus) -> Option<StopSweep> {
        let mut state = self.lock();
        if state.execution.is_terminal() {
            return None;
        }
        let execution_id = state.execution.id.clone();
        let now = Utc::now();
        let mut sweep = StopSweep::default();

        for task in state.execution.tasks.iter_mut() {
            if task.status.is_terminal() {
                continue;
            }
            if task.status == TaskStatus::Running
                && let Some(worker_id) = task.worker_id.take()
            {
                sweep
                    .releases
                    .push((task.worker_type.clone(), worker_id, task.id.clone()));
            }
            if let Some(checkout) = task.checkout.take() {
                sweep.checkouts.push(checkout);
            }
            task.status = TaskStatus::Stopped;
            task.ended_at = Some(now);
            events.emit(ExecutionEvent::TaskStopped {
                execution_id: execution_id.clone(),
                task_id: task.id.clone(),
            });
        }

        let execution = &mut state.execution;
        execution.status = ExecutionStatus::Stopped;
        execution.protocol_report = Some(report);
        execution.metrics.completed_at = Some(now);
        execution.progress = aggregate_progress(&execution.tasks);
        events.emit(ExecutionEvent::ExecutionFinished {
            execution_id,
            status: ExecutionStatus::Stopped,
            progress: execution.progress,
        });
        Some(sweep)
    }

    /// Terminal transition once every task is terminal. A stopped execution
    /// only gains its protocol report.
    pub fn finalize(&self, report: ProtocolReport, events: &EventBus) -> ExecutionStatus {
        let mut state = self.lock();
        let execution = &mut state.execution;
        execution.protocol_report = Some(report);
        if execution.is_terminal() {
            return execution.status;
        }

        execution.status = if execution.tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        execution.metrics.completed_at = Some(Utc::now());
        execution.progress = aggregate_progress(&execution.tasks);
        events.emit(ExecutionEvent::ExecutionFinished {
            execution_id: execution.id.clone(),
            status: execution.status,
            progress: execution.progress,
        });
        execution.status
    }

    pub fn notify_finished(&self) {
        self.finished.send_replace(true);
    }

    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // the sender lives in self, so this only errors if self is gone
        let _ = rx.wait_for(|done| *done).await;
    }
}

fn task_mut<'a>(execution: &'a mut Execution, task_id: &str) -> Option<&'a mut Task> {
    execution.tasks.iter_mut().find(|t| t.id == task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChildItem, ExecutionMetrics, TaskErrorKind};

    fn handle(tasks: usize) -> ExecutionHandle {
        let tasks = (0..tasks)
            .map(|i| {
                let child = ChildItem {
                    id: i.to_string(),
                    number: i as i64,
                    title: format!("child {i}"),
                    labels: vec![],
                };
                Task::new("1", &child, "code-implementer")
            })
            .collect();
        ExecutionHandle::new(
            Execution {
                id: "exec".to_string(),
                work_item_id: "1".to_string(),
                work_item_title: "Epic".to_string(),
                status: ExecutionStatus::Running,
                pattern: "feature-development".to_string(),
                tasks,
                progress: 0,
                metrics: ExecutionMetrics {
                    started_at: Utc::now(),
                    estimated_duration_secs: 60,
                    completed_at: None,
                },
                protocol_report: None,
            },
            2,
        )
    }

    fn update(seq: u64, percent: u8) -> ProgressUpdate {
        ProgressUpdate {
            seq,
            percent,
            message: format!("at {percent}"),
        }
    }

    #[test]
    fn test_stale_progress_is_ignored() {
        let events = EventBus::new(16);
        let handle = handle(2);
        let ids = handle.task_ids();
        assert!(handle.mark_running(&ids[0], "w1", &events));

        assert!(handle.apply_progress(&ids[0], update(2, 60), &events));
        assert!(!handle.apply_progress(&ids[0], update(1, 30), &events));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.tasks[0].progress, 60);
        assert_eq!(snapshot.progress, 30);
    }

    #[test]
    fn test_progress_ignored_unless_running() {
        let events = EventBus::new(16);
        let handle = handle(1);
        let id = handle.task_ids().remove(0);
        assert!(!handle.apply_progress(&id, update(1, 40), &events));
    }

    #[test]
    fn test_late_outcome_after_stop_is_dropped() {
        let events = EventBus::new(16);
        let handle = handle(2);
        let ids = handle.task_ids();
        handle.mark_running(&ids[0], "w1", &events);

        let sweep = handle.stop(ProtocolReport::default(), &events).unwrap();
        assert_eq!(sweep.releases.len(), 1);
        assert_eq!(sweep.releases[0].1, "w1");
        assert!(handle.stop(ProtocolReport::default(), &events).is_none());

        assert!(handle.finish_task(&ids[0], Ok(()), true, &events).is_none());
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, ExecutionStatus::Stopped);
        assert!(snapshot.tasks.iter().all(|t| t.status == TaskStatus::Stopped));
        assert!(snapshot.protocol_report.is_some());
        assert!(handle.task_context(&ids[1]).is_none());
    }

    #[test]
    fn test_finalize_picks_failed_when_any_task_failed() {
        let events = EventBus::new(16);
        let handle = handle(2);
        let ids = handle.task_ids();
        handle.mark_running(&ids[0], "w1", &events);
        handle.finish_task(&ids[0], Ok(()), false, &events).unwrap();
        handle
            .finish_task(
                &ids[1],
                Err(TaskError::new(TaskErrorKind::ResourceExhausted, "no worker")),
                false,
                &events,
            )
            .unwrap();

        let status = handle.finalize(ProtocolReport::default(), &events);
        assert_eq!(status, ExecutionStatus::Failed);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.progress, 50);
        assert!(snapshot.metrics.completed_at.is_some());
        assert!(snapshot.protocol_report.is_some());
    }

    #[tokio::test]
    async fn test_wait_finished_resolves_after_notify() {
        let handle = std::sync::Arc::new(handle(1));
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_finished().await })
        };
        handle.notify_finished();
        waiter.await.unwrap();
    }
}
