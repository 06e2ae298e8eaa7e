use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Checkout, TaskContext};

/// A file a worker produced or changed, relative to its checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub content: String,
}

/// What a worker hands back for the quality and protocol gates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl WorkerOutput {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            artifacts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Issue order of the update. Later updates carry larger numbers.
    pub seq: u64,
    pub percent: u8,
    pub message: String,
}

type ProgressSink = dyn Fn(ProgressUpdate) + Send + Sync;

/// Progress callback handed to [`Worker::execute`].
///
/// Cheap to clone. Every call is stamped with a sequence number at the call
/// site, so a receiver can drop updates that arrive out of order.
#[derive(Clone)]
pub struct ProgressReporter {
    seq: Arc<AtomicU64>,
    sink: Arc<ProgressSink>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        Self {
            seq: Arc::new(AtomicU64::new(0)),
            sink: Arc::new(sink),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        (self.sink)(ProgressUpdate {
            seq,
            percent: percent.min(100),
            message: message.into(),
        });
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("seq", &self.seq.load(Ordering::SeqCst))
            .finish()
    }
}

/// Something that can carry out a task inside a checkout.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &str;

    fn worker_type(&self) -> &str;

    fn capabilities(&self) -> &[String];

    /// Run the task. Implementations should watch `ctx.cancel` and return
    /// promptly once it fires.
    async fn execute(
        &self,
        ctx: &TaskContext,
        checkout: &Checkout,
        progress: ProgressReporter,
    ) -> Result<WorkerOutput>;
}

/// Creates worker instances of one type on demand.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, instance_id: &str) -> Result<Arc<dyn Worker>>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn Worker>> + Send + Sync,
{
    fn create(&self, instance_id: &str) -> Result<Arc<dyn Worker>> {
        self(instance_id)
    }
}
