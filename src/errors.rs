//! Typed error hierarchy for the ForgeFlow orchestrator.
//!
//! Two top-level enums cover the fallible public calls:
//! - `OrchestratorError`: failures of `Orchestrator::start`
//! - `PoolError`: failures to lease a worker from the `AgentPool`
//!
//! Per-task failures never surface as `Err`; they are classified into a
//! [`TaskErrorKind`](crate::models::TaskErrorKind) and written onto the task.

use thiserror::Error;

/// Errors returned from the orchestrator's public API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Failed to fetch work item {work_item} from backlog: {source:#}")]
    BacklogFetch {
        work_item: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Unknown worker type '{worker_type}'")]
    UnknownType { worker_type: String },

    #[error("Worker pool for '{worker_type}' exhausted ({limit} instances, all busy)")]
    Exhausted { worker_type: String, limit: usize },

    #[error("Failed to provision '{worker_type}' worker: {source:#}")]
    Provision {
        worker_type: String,
        #[source]
        source: anyhow::Error,
    },
}
