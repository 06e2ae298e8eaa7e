use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ProtocolReport, Severity, Violation};

/// A top-level unit of backlog work (an epic). Fetched once per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// An open child issue of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildItem {
    pub id: String,
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The pool could not lease a worker of the task's type.
    ResourceExhausted,
    /// The isolated checkout could not be provisioned.
    Checkout,
    /// The quality checkpoint rejected the checkout.
    QualityGate,
    /// A protocol check failed with the given severity.
    ProtocolViolation { severity: Severity },
    /// A worker invocation or check exceeded its time limit.
    Timeout,
    /// The worker itself failed.
    AgentExecution,
}

impl TaskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceExhausted => "resource_exhausted",
            Self::Checkout => "checkout",
            Self::QualityGate => "quality_gate",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::Timeout => "timeout",
            Self::AgentExecution => "agent_execution",
        }
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding reported by the quality checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    /// The check that produced the issue (e.g. the command that failed).
    pub check: String,
    pub message: String,
}

/// Failure detail recorded on a task, rich enough to render a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(flatten)]
    pub kind: TaskErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<QualityIssue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            issues: Vec::new(),
            violations: Vec::new(),
        }
    }

    pub fn quality_gate(issues: Vec<QualityIssue>) -> Self {
        Self {
            kind: TaskErrorKind::QualityGate,
            message: format!("Quality checkpoint failed with {} issue(s)", issues.len()),
            issues,
            violations: Vec::new(),
        }
    }

    pub fn protocol(violation: Violation) -> Self {
        Self {
            kind: TaskErrorKind::ProtocolViolation {
                severity: violation.severity,
            },
            message: violation.message.clone(),
            issues: Vec::new(),
            violations: vec![violation],
        }
    }
}

/// An isolated workspace provisioned for exactly one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkout {
    pub id: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// One scheduled unit of execution: a child issue bound to a worker type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub work_item_id: String,
    pub issue_id: String,
    pub issue_number: i64,
    pub title: String,
    pub worker_type: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub error: Option<TaskError>,
    /// The busy worker instance while the task is running.
    pub worker_id: Option<String>,
    pub checkout: Option<Checkout>,
    /// Protocol violations recorded without failing the task.
    #[serde(default)]
    pub violations: Vec<Violation>,
    /// Issues from a failed quality checkpoint.
    #[serde(default)]
    pub quality_issues: Vec<QualityIssue>,
}

impl Task {
    pub fn new(work_item_id: &str, child: &ChildItem, worker_type: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            work_item_id: work_item_id.to_string(),
            issue_id: child.id.clone(),
            issue_number: child.number,
            title: child.title.clone(),
            worker_type: worker_type.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            started_at: None,
            ended_at: None,
            last_message: None,
            error: None,
            worker_id: None,
            checkout: None,
            violations: Vec::new(),
            quality_issues: Vec::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub started_at: DateTime<Utc>,
    pub estimated_duration_secs: u64,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Runtime record tracking every task spawned from one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub work_item_id: String,
    pub work_item_title: String,
    pub status: ExecutionStatus,
    pub pattern: String,
    pub tasks: Vec<Task>,
    pub progress: u8,
    pub metrics: ExecutionMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_report: Option<ProtocolReport>,
}

impl Execution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

/// Rounded arithmetic mean of task progress. An empty task list is complete.
pub fn aggregate_progress(tasks: &[Task]) -> u8 {
    if tasks.is_empty() {
        return 100;
    }
    let total: u32 = tasks.iter().map(|t| u32::from(t.progress.min(100))).sum();
    (f64::from(total) / tasks.len() as f64).round() as u8
}

/// Everything a collaborator needs to know about the task it is serving.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: String,
    pub task_id: String,
    pub work_item_id: String,
    pub issue_id: String,
    pub issue_number: i64,
    pub title: String,
    pub worker_type: String,
    /// Fired when the owning execution is stopped. Cooperative only.
    pub cancel: CancellationToken,
}
