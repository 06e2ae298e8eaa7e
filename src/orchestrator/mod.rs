//! Execution orchestrator.
//!
//! `start` expands a work item into tasks and hands them to a per-execution
//! supervisor (see `drive`), which admits them in FIFO order under the
//! pattern's parallelism and the pool's global limit. The caller gets the
//! running snapshot back immediately; progress is observed via `status`,
//! `subscribe` or `wait`.

mod drive;
pub mod events;
mod state;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::backlog::BacklogClient;
use crate::checkout::CheckoutProvider;
use crate::errors::OrchestratorError;
use crate::models::{Execution, ExecutionMetrics, ExecutionStatus, Task};
use crate::patterns::{ExecutionPattern, PatternRegistry, map_worker_type};
use crate::pool::AgentPool;
use crate::protocol::ProtocolGate;
use crate::quality::QualityCheckpoint;

pub use events::{EventBus, ExecutionEvent, ExecutionEvents};
use state::ExecutionHandle;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub checkout_timeout: Duration,
    pub worker_timeout: Duration,
    pub quality_timeout: Duration,
    pub protocol_timeout: Duration,
    /// Remove a task's checkout once it completes or fails.
    pub cleanup_checkouts: bool,
    /// Post a summary comment on each child issue when its task finishes.
    pub comment_on_completion: bool,
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            checkout_timeout: Duration::from_secs(120),
            worker_timeout: Duration::from_secs(1800),
            quality_timeout: Duration::from_secs(600),
            protocol_timeout: Duration::from_secs(300),
            cleanup_checkouts: false,
            comment_on_completion: false,
            event_buffer: 1024,
        }
    }
}

/// Collaborators the orchestrator drives.
pub struct Dependencies {
    pub backlog: Arc<dyn BacklogClient>,
    pub checkouts: Arc<dyn CheckoutProvider>,
    pub quality: Arc<dyn QualityCheckpoint>,
    pub gate: Arc<ProtocolGate>,
    pub pool: AgentPool,
}

pub(crate) struct Shared {
    pub backlog: Arc<dyn BacklogClient>,
    pub checkouts: Arc<dyn CheckoutProvider>,
    pub quality: Arc<dyn QualityCheckpoint>,
    pub gate: Arc<ProtocolGate>,
    pub pool: AgentPool,
    pub events: EventBus,
    pub config: OrchestratorConfig,
    patterns: RwLock<PatternRegistry>,
    executions: DashMap<String, Arc<ExecutionHandle>>,
}

/// Cloneable handle; clones share the same registry.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(deps: Dependencies, config: OrchestratorConfig) -> Self {
        Self::with_patterns(deps, config, PatternRegistry::builtin())
    }

    pub fn with_patterns(
        deps: Dependencies,
        config: OrchestratorConfig,
        patterns: PatternRegistry,
    ) -> Self {
        let events = EventBus::new(config.event_buffer);
        Self {
            shared: Arc::new(Shared {
                backlog: deps.backlog,
                checkouts: deps.checkouts,
                quality: deps.quality,
                gate: deps.gate,
                pool: deps.pool,
                events,
                config,
                patterns: RwLock::new(patterns),
                executions: DashMap::new(),
            }),
        }
    }

    /// Fetch a work item and its children, select a pattern and start
    /// driving the resulting tasks. Returns the initial snapshot: running
    /// with progress 0, or completed immediately when no child maps to a
    /// known worker type.
    pub async fn start(&self, work_item_id: &str) -> Result<Execution, OrchestratorError> {
        let shared = &self.shared;
        let fetch_err = |source| OrchestratorError::BacklogFetch {
            work_item: work_item_id.to_string(),
            source,
        };
        let item = shared
            .backlog
            .get_work_item(work_item_id)
            .await
            .map_err(fetch_err)?;
        let children = shared
            .backlog
            .get_child_items(work_item_id)
            .await
            .map_err(fetch_err)?;

        let pattern = self.select_pattern(&item.labels);
        let known = shared.pool.available_types();
        let tasks: Vec<Task> = children
            .iter()
            .filter_map(|child| match map_worker_type(&child.labels, &known) {
                Some(worker_type) => Some(Task::new(&item.id, child, &worker_type)),
                None => {
                    debug!(
                        work_item = %item.id,
                        child = child.number,
                        labels = ?child.labels,
                        "Child has no known worker type label; skipping"
                    );
                    None
                }
            })
            .collect();

        let now = Utc::now();
        let empty = tasks.is_empty();
        let execution = Execution {
            id: uuid::Uuid::new_v4().to_string(),
            work_item_id: item.id.clone(),
            work_item_title: item.title.clone(),
            status: if empty {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Running
            },
            pattern: pattern.name.clone(),
            tasks,
            progress: if empty { 100 } else { 0 },
            metrics: ExecutionMetrics {
                started_at: now,
                estimated_duration_secs: pattern.estimated_duration_secs,
                completed_at: empty.then_some(now),
            },
            protocol_report: None,
        };
        let snapshot = execution.clone();
        let handle = Arc::new(ExecutionHandle::new(execution, pattern.max_parallel_agents));
        shared
            .executions
            .insert(snapshot.id.clone(), handle.clone());

        info!(
            execution_id = %snapshot.id,
            work_item = %snapshot.work_item_id,
            pattern = %snapshot.pattern,
            tasks = snapshot.tasks.len(),
            skipped = children.len() - snapshot.tasks.len(),
            "Execution started"
        );
        shared.events.emit(ExecutionEvent::ExecutionStarted {
            execution_id: snapshot.id.clone(),
            work_item_id: snapshot.work_item_id.clone(),
            pattern: snapshot.pattern.clone(),
            task_count: snapshot.tasks.len(),
        });

        if empty {
            shared.events.emit(ExecutionEvent::ExecutionFinished {
                execution_id: snapshot.id.clone(),
                status: ExecutionStatus::Completed,
                progress: 100,
            });
            handle.notify_finished();
            return Ok(snapshot);
        }

        tokio::spawn(drive::supervise(shared.clone(), handle));
        Ok(snapshot)
    }

    fn select_pattern(&self, labels: &[String]) -> ExecutionPattern {
        self.shared
            .patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .select(labels)
            .clone()
    }

    /// Current snapshot of an execution.
    pub fn status(&self, execution_id: &str) -> Option<Execution> {
        self.shared
            .executions
            .get(execution_id)
            .map(|h| h.value().snapshot())
    }

    /// Snapshots of every tracked execution, oldest first.
    pub fn list_executions(&self) -> Vec<Execution> {
        let mut executions: Vec<Execution> = self
            .shared
            .executions
            .iter()
            .map(|h| h.value().snapshot())
            .collect();
        executions.sort_by_key(|e| e.metrics.started_at);
        executions
    }

    /// Stop an execution: every non-terminal task becomes stopped, its worker
    /// is released and its checkout removed. Unknown or finished executions
    /// are a no-op. Workers are signalled through the task's cancellation
    /// token; an outcome that arrives afterwards is discarded.
    pub async fn stop(&self, execution_id: &str) {
        let Some(handle) = self
            .shared
            .executions
            .get(execution_id)
            .map(|h| h.value().clone())
        else {
            debug!(execution_id, "Stop requested for unknown execution");
            return;
        };

        let report = self.shared.gate.report(execution_id);
        let Some(sweep) = handle.stop(report, &self.shared.events) else {
            debug!(execution_id, "Stop requested for finished execution");
            return;
        };
        handle.cancel.cancel();
        info!(
            execution_id,
            running = sweep.releases.len(),
            checkouts = sweep.checkouts.len(),
            "Execution stopped"
        );

        for (worker_type, worker_id, task_id) in &sweep.releases {
            self.shared.pool.release_task(worker_type, worker_id, task_id);
        }
        for checkout in &sweep.checkouts {
            drive::cleanup_checkout(&self.shared, checkout).await;
        }
        handle.notify_finished();
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .shared
            .executions
            .iter()
            .map(|h| h.key().clone())
            .collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Wait until the execution is terminal and return its final snapshot.
    pub async fn wait(&self, execution_id: &str) -> Option<Execution> {
        let handle = self
            .shared
            .executions
            .get(execution_id)
            .map(|h| h.value().clone())?;
        handle.wait_finished().await;
        Some(handle.snapshot())
    }

    /// Drop a terminal execution from the registry.
    pub fn forget(&self, execution_id: &str) -> bool {
        let removed = self
            .shared
            .executions
            .remove_if(execution_id, |_, h| h.is_terminal())
            .is_some();
        if removed {
            self.shared.gate.forget(execution_id);
        } else if self.shared.executions.contains_key(execution_id) {
            warn!(execution_id, "Refusing to forget a running execution");
        }
        removed
    }

    /// Add or replace an execution pattern.
    pub fn register_pattern(&self, pattern: ExecutionPattern) {
        info!(pattern = %pattern.name, "Registered execution pattern");
        self.shared
            .patterns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(pattern);
    }

    pub fn patterns(&self) -> Vec<ExecutionPattern> {
        self.shared
            .patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .patterns()
            .cloned()
            .collect()
    }

    /// Events of one execution from now on. Earlier events are not replayed;
    /// a `subscribe_all` receiver taken before `start` sees all of them.
    pub fn subscribe(&self, execution_id: &str) -> ExecutionEvents {
        self.shared.events.subscribe(execution_id)
    }

    pub fn subscribe_all(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.shared.events.subscribe_all()
    }

    pub fn pool(&self) -> &AgentPool {
        &self.shared.pool
    }

    pub fn gate(&self) -> &Arc<ProtocolGate> {
        &self.shared.gate
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }
}
