//! Worker pool keyed by worker type.
//!
//! Instances are leased with [`AgentPool::acquire`] and handed back when the
//! returned [`WorkerLease`] is released or dropped. Release is keyed by task
//! id, so a second release for the same task is a logged no-op.

mod worker;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::errors::PoolError;

pub use worker::{Artifact, ProgressReporter, ProgressUpdate, Worker, WorkerFactory, WorkerOutput};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Extra attempts to find an idle instance before trying to grow.
    pub retry_count: u32,
    pub retry_interval: Duration,
    /// Upper bound on tasks running at once across all executions.
    pub global_concurrency: usize,
    /// Per-type instance ceiling. `None` lets a type grow without bound.
    pub max_instances_per_type: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_interval: Duration::from_millis(1000),
            global_concurrency: 8,
            max_instances_per_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub duration_ms: Option<i64>,
}

/// Snapshot of one worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub worker_type: String,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub last_active: DateTime<Utc>,
    pub current_task: Option<String>,
    pub history: Vec<TaskHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub completed: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
    pub success_rate: f64,
    pub last_active: Option<DateTime<Utc>>,
}

struct Instance {
    worker: Arc<dyn Worker>,
    record: WorkerRecord,
}

#[derive(Default)]
struct TypeSlot {
    factory: Option<Arc<dyn WorkerFactory>>,
    instances: Vec<Instance>,
    created: usize,
}

impl TypeSlot {
    fn claim_idle(&mut self, task_id: &str) -> Option<(Arc<dyn Worker>, String)> {
        let instance = self
            .instances
            .iter_mut()
            .find(|i| i.record.status == WorkerStatus::Idle)?;
        let now = Utc::now();
        instance.record.status = WorkerStatus::Busy;
        instance.record.current_task = Some(task_id.to_string());
        instance.record.last_active = now;
        instance.record.history.push(TaskHistoryEntry {
            task_id: task_id.to_string(),
            started_at: now,
            ended_at: None,
            success: None,
            duration_ms: None,
        });
        Some((instance.worker.clone(), instance.record.id.clone()))
    }

    fn add(&mut self, worker: Arc<dyn Worker>) {
        self.created += 1;
        let record = WorkerRecord {
            id: worker.id().to_string(),
            worker_type: worker.worker_type().to_string(),
            capabilities: worker.capabilities().to_vec(),
            status: WorkerStatus::Idle,
            last_active: Utc::now(),
            current_task: None,
            history: Vec::new(),
        };
        self.instances.push(Instance { worker, record });
    }

    fn spawn(&mut self, worker_type: &str) -> Result<(), PoolError> {
        let Some(factory) = self.factory.clone() else {
            return Err(PoolError::Exhausted {
                worker_type: worker_type.to_string(),
                limit: self.instances.len(),
            });
        };
        let instance_id = format!("{}-{}", worker_type, self.created + 1);
        let worker = factory
            .create(&instance_id)
            .map_err(|source| PoolError::Provision {
                worker_type: worker_type.to_string(),
                source,
            })?;
        self.add(worker);
        Ok(())
    }
}

struct PoolInner {
    config: PoolConfig,
    slots: DashMap<String, Arc<Mutex<TypeSlot>>>,
    metrics: DashMap<String, WorkerMetrics>,
    admission: Arc<Semaphore>,
}

impl PoolInner {
    fn slot(&self, worker_type: &str) -> Option<Arc<Mutex<TypeSlot>>> {
        self.slots.get(worker_type).map(|s| s.value().clone())
    }

    /// Return an instance to idle. Only succeeds when the instance is busy
    /// with exactly `task_id`.
    fn release_task(
        &self,
        worker_type: &str,
        instance_id: &str,
        task_id: &str,
        success: Option<bool>,
    ) -> bool {
        let Some(slot) = self.slot(worker_type) else {
            warn!(worker_type, instance_id, "Release for unknown worker type");
            return false;
        };
        let mut slot = lock(&slot);
        let Some(instance) = slot
            .instances
            .iter_mut()
            .find(|i| i.record.id == instance_id)
        else {
            warn!(worker_type, instance_id, task_id, "Release for unknown worker instance");
            return false;
        };

        let record = &mut instance.record;
        if record.status != WorkerStatus::Busy || record.current_task.as_deref() != Some(task_id) {
            warn!(
                worker_type,
                instance_id,
                task_id,
                status = %record.status,
                "Worker not tracked as active for this task; ignoring release"
            );
            return false;
        }

        let now = Utc::now();
        record.status = WorkerStatus::Idle;
        record.current_task = None;
        record.last_active = now;
        if let Some(entry) = record
            .history
            .iter_mut()
            .rev()
            .find(|h| h.task_id == task_id && h.ended_at.is_none())
        {
            entry.ended_at = Some(now);
            entry.success = success;
            entry.duration_ms = Some((now - entry.started_at).num_milliseconds());
        }
        debug!(worker_type, instance_id, task_id, "Worker released");
        true
    }
}

fn lock(slot: &Mutex<TypeSlot>) -> MutexGuard<'_, TypeSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A leased worker. Dropping the lease without calling
/// [`release`](WorkerLease::release) returns the worker as a failed run.
pub struct WorkerLease {
    pool: Arc<PoolInner>,
    worker: Arc<dyn Worker>,
    worker_type: String,
    instance_id: String,
    task_id: String,
    acquired_at: Instant,
    released: bool,
}

impl WorkerLease {
    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Hand the worker back. Returns false if it was already returned.
    pub fn release(mut self, success: bool) -> bool {
        self.released = true;
        self.pool
            .release_task(&self.worker_type, &self.instance_id, &self.task_id, Some(success))
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool
                .release_task(&self.worker_type, &self.instance_id, &self.task_id, Some(false));
        }
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_type", &self.worker_type)
            .field("instance_id", &self.instance_id)
            .field("task_id", &self.task_id)
            .finish()
    }
}

/// Shared, cloneable handle to the worker pool.
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

impl AgentPool {
    pub fn new(config: PoolConfig) -> Self {
        let admission = Arc::new(Semaphore::new(config.global_concurrency.max(1)));
        Self {
            inner: Arc::new(PoolInner {
                config,
                slots: DashMap::new(),
                metrics: DashMap::new(),
                admission,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Make a worker type available, pre-creating `initial` instances.
    pub fn register_factory(
        &self,
        worker_type: &str,
        factory: Arc<dyn WorkerFactory>,
        initial: usize,
    ) -> Result<(), PoolError> {
        let slot = self
            .inner
            .slots
            .entry(worker_type.to_string())
            .or_default()
            .value()
            .clone();
        let mut slot = lock(&slot);
        slot.factory = Some(factory);
        let target = match self.inner.config.max_instances_per_type {
            Some(limit) => initial.min(limit),
            None => initial,
        };
        while slot.instances.len() < target {
            slot.spawn(worker_type)?;
        }
        info!(worker_type, instances = slot.instances.len(), "Registered worker type");
        Ok(())
    }

    /// Register a pre-built instance. Its type is created if missing.
    pub fn add_worker(&self, worker: Arc<dyn Worker>) {
        let worker_type = worker.worker_type().to_string();
        let slot = self
            .inner
            .slots
            .entry(worker_type)
            .or_default()
            .value()
            .clone();
        lock(&slot).add(worker);
    }

    /// Lease an idle worker of `worker_type` for `task_id`.
    ///
    /// Retries `retry_count` times when every instance is busy, then grows
    /// the type up to its ceiling. Unknown types fail immediately.
    pub async fn acquire(&self, worker_type: &str, task_id: &str) -> Result<WorkerLease, PoolError> {
        let slot = self
            .inner
            .slot(worker_type)
            .ok_or_else(|| PoolError::UnknownType {
                worker_type: worker_type.to_string(),
            })?;

        let retries = self.inner.config.retry_count;
        for attempt in 0..=retries {
            let claimed = lock(&slot).claim_idle(task_id);
            if let Some((worker, instance_id)) = claimed {
                return Ok(self.lease(worker, worker_type, instance_id, task_id));
            }
            if attempt < retries {
                debug!(worker_type, task_id, attempt = attempt + 1, "No idle worker, retrying");
                tokio::time::sleep(self.inner.config.retry_interval).await;
            }
        }

        let claimed = {
            let mut slot = lock(&slot);
            match slot.claim_idle(task_id) {
                Some(claimed) => claimed,
                None => {
                    if let Some(limit) = self.inner.config.max_instances_per_type
                        && slot.instances.len() >= limit
                    {
                        return Err(PoolError::Exhausted {
                            worker_type: worker_type.to_string(),
                            limit,
                        });
                    }
                    slot.spawn(worker_type)?;
                    info!(worker_type, instances = slot.instances.len(), "Grew worker pool");
                    slot.claim_idle(task_id).ok_or_else(|| PoolError::Exhausted {
                        worker_type: worker_type.to_string(),
                        limit: slot.instances.len(),
                    })?
                }
            }
        };
        let (worker, instance_id) = claimed;
        Ok(self.lease(worker, worker_type, instance_id, task_id))
    }

    fn lease(
        &self,
        worker: Arc<dyn Worker>,
        worker_type: &str,
        instance_id: String,
        task_id: &str,
    ) -> WorkerLease {
        debug!(worker_type, instance_id = %instance_id, task_id, "Worker acquired");
        WorkerLease {
            pool: self.inner.clone(),
            worker,
            worker_type: worker_type.to_string(),
            instance_id,
            task_id: task_id.to_string(),
            acquired_at: Instant::now(),
            released: false,
        }
    }

    pub fn release(&self, lease: WorkerLease, success: bool) -> bool {
        lease.release(success)
    }

    /// Release by identity, for callers that no longer hold the lease.
    pub fn release_task(&self, worker_type: &str, instance_id: &str, task_id: &str) -> bool {
        self.inner.release_task(worker_type, instance_id, task_id, None)
    }

    /// Fold one finished task into the type's running metrics.
    pub fn update_metrics(&self, worker_type: &str, success: bool, duration: Duration) {
        let mut metrics = self.inner.metrics.entry(worker_type.to_string()).or_default();
        if success {
            metrics.completed += 1;
        } else {
            metrics.failed += 1;
        }
        let runs = (metrics.completed + metrics.failed) as f64;
        let millis = duration.as_secs_f64() * 1000.0;
        metrics.average_duration_ms += (millis - metrics.average_duration_ms) / runs;
        metrics.success_rate = metrics.completed as f64 / runs;
        metrics.last_active = Some(Utc::now());
    }

    pub fn mark_error(&self, instance_id: &str) -> bool {
        self.with_instance(instance_id, |record| {
            if record.status == WorkerStatus::Busy {
                warn!(instance_id, task = ?record.current_task, "Busy worker marked as errored");
            }
            record.status = WorkerStatus::Error;
            record.current_task = None;
            true
        })
    }

    pub fn recover(&self, instance_id: &str) -> bool {
        self.with_instance(instance_id, |record| {
            if record.status != WorkerStatus::Error {
                return false;
            }
            record.status = WorkerStatus::Idle;
            record.last_active = Utc::now();
            true
        })
    }

    /// Remove an instance that is not busy.
    pub fn remove(&self, instance_id: &str) -> bool {
        for entry in self.inner.slots.iter() {
            let mut slot = lock(entry.value());
            if let Some(pos) = slot.instances.iter().position(|i| i.record.id == instance_id) {
                if slot.instances[pos].record.status == WorkerStatus::Busy {
                    warn!(instance_id, "Refusing to remove busy worker");
                    return false;
                }
                slot.instances.remove(pos);
                return true;
            }
        }
        false
    }

    fn with_instance(&self, instance_id: &str, f: impl FnOnce(&mut WorkerRecord) -> bool) -> bool {
        for entry in self.inner.slots.iter() {
            let mut slot = lock(entry.value());
            if let Some(instance) = slot.instances.iter_mut().find(|i| i.record.id == instance_id) {
                return f(&mut instance.record);
            }
        }
        false
    }

    pub fn records(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<WorkerRecord> = self
            .inner
            .slots
            .iter()
            .flat_map(|entry| {
                lock(entry.value())
                    .instances
                    .iter()
                    .map(|i| i.record.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn metrics(&self) -> BTreeMap<String, WorkerMetrics> {
        self.inner
            .metrics
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn metrics_for(&self, worker_type: &str) -> Option<WorkerMetrics> {
        self.inner.metrics.get(worker_type).map(|m| m.value().clone())
    }

    pub fn available_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.slots.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn idle_count(&self, worker_type: &str) -> usize {
        self.inner.slot(worker_type).map_or(0, |slot| {
            lock(&slot)
                .instances
                .iter()
                .filter(|i| i.record.status == WorkerStatus::Idle)
                .count()
        })
    }

    pub fn instance_count(&self, worker_type: &str) -> usize {
        self.inner
            .slot(worker_type)
            .map_or(0, |slot| lock(&slot).instances.len())
    }

    /// Global admission gate shared by all executions.
    pub fn admission(&self) -> Arc<Semaphore> {
        self.inner.admission.clone()
    }

    /// Drop every instance and refuse further admissions.
    pub fn shutdown(&self) {
        self.inner.admission.close();
        for entry in self.inner.slots.iter() {
            lock(entry.value()).instances.clear();
        }
        info!("Worker pool shut down");
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("types", &self.available_types())
            .finish()
    }
}
