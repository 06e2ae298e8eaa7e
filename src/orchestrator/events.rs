//! Execution event stream.
//!
//! One broadcast bus carries events for every execution. Consumers that care
//! about a single execution use [`ExecutionEvents`], which filters by id.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::{ExecutionStatus, TaskError};
use crate::protocol::Violation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: String,
        work_item_id: String,
        pattern: String,
        task_count: usize,
    },
    TaskStarted {
        execution_id: String,
        task_id: String,
        issue_number: i64,
        worker_type: String,
        worker_id: String,
    },
    TaskProgress {
        execution_id: String,
        task_id: String,
        progress: u8,
        message: String,
        execution_progress: u8,
    },
    TaskCompleted {
        execution_id: String,
        task_id: String,
        duration_ms: Option<i64>,
    },
    TaskFailed {
        execution_id: String,
        task_id: String,
        error: TaskError,
    },
    TaskStopped {
        execution_id: String,
        task_id: String,
    },
    ProtocolViolation {
        execution_id: String,
        task_id: String,
        violation: Violation,
    },
    ExecutionFinished {
        execution_id: String,
        status: ExecutionStatus,
        progress: u8,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::TaskStarted { execution_id, .. }
            | Self::TaskProgress { execution_id, .. }
            | Self::TaskCompleted { execution_id, .. }
            | Self::TaskFailed { execution_id, .. }
            | Self::TaskStopped { execution_id, .. }
            | Self::ProtocolViolation { execution_id, .. }
            | Self::ExecutionFinished { execution_id, .. } => execution_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskStopped { .. } => "task_stopped",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::ExecutionFinished { .. } => "execution_finished",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: ExecutionEvent) {
        // no receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, execution_id: &str) -> ExecutionEvents {
        ExecutionEvents {
            execution_id: execution_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

/// Events of one execution, in emission order.
pub struct ExecutionEvents {
    execution_id: String,
    rx: broadcast::Receiver<ExecutionEvent>,
}

impl ExecutionEvents {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Next event for this execution. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.execution_id() == self.execution_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        execution_id = %self.execution_id,
                        skipped, "Event subscriber lagged; events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Collect events until the execution finishes or the bus closes.
    pub async fn until_finished(mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            let finished = matches!(event, ExecutionEvent::ExecutionFinished { .. });
            events.push(event);
            if finished {
                break;
            }
        }
        events
    }
}
