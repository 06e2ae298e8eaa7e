//! Orchestrator behavior end to end, against in-memory collaborators.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use forgeflow::backlog::BacklogClient;
use forgeflow::checkout::CheckoutProvider;
use forgeflow::errors::OrchestratorError;
use forgeflow::models::{
    Checkout, ChildItem, Execution, ExecutionStatus, QualityIssue, TaskContext, TaskErrorKind,
    TaskStatus, WorkItem,
};
use forgeflow::orchestrator::{Dependencies, ExecutionEvent, Orchestrator, OrchestratorConfig};
use forgeflow::patterns::{ExecutionPattern, LabelRule, PatternRegistry};
use forgeflow::pool::{AgentPool, Artifact, PoolConfig, ProgressReporter, Worker, WorkerOutput};
use forgeflow::protocol::builtin::{EvidenceTruth, IndexedReferences, PatternRules};
use forgeflow::protocol::{ProtocolGate, Severity};
use forgeflow::quality::{QualityCheckpoint, QualityReport};

const WORKER_TYPE: &str = "code-implementer";

// =============================================================================
// Collaborators
// =============================================================================

struct Backlog {
    item: WorkItem,
    children: Vec<ChildItem>,
    unavailable: bool,
    comments: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl BacklogClient for Backlog {
    async fn get_work_item(&self, id: &str) -> Result<WorkItem> {
        if self.unavailable {
            bail!("backlog unavailable");
        }
        let mut item = self.item.clone();
        item.id = id.to_string();
        Ok(item)
    }

    async fn get_child_items(&self, _id: &str) -> Result<Vec<ChildItem>> {
        Ok(self.children.clone())
    }

    async fn comment(&self, issue_id: &str, body: &str) -> Result<()> {
        self.comments
            .lock()
            .unwrap()
            .push((issue_id.to_string(), body.to_string()));
        Ok(())
    }
}

struct TempCheckouts {
    root: PathBuf,
    broken: bool,
    provisioned: Mutex<Vec<String>>,
    cleaned: Mutex<Vec<String>>,
}

#[async_trait]
impl CheckoutProvider for TempCheckouts {
    async fn provision(&self, ctx: &TaskContext) -> Result<Checkout> {
        if self.broken {
            bail!("disk full");
        }
        let path = self.root.join(&ctx.task_id);
        tokio::fs::create_dir_all(&path).await?;
        self.provisioned.lock().unwrap().push(ctx.task_id.clone());
        Ok(Checkout {
            id: ctx.task_id.clone(),
            path,
            branch: None,
        })
    }

    async fn cleanup(&self, checkout: &Checkout) -> Result<()> {
        self.cleaned.lock().unwrap().push(checkout.id.clone());
        let _ = tokio::fs::remove_dir_all(&checkout.path).await;
        Ok(())
    }
}

struct Quality {
    passed: bool,
}

#[async_trait]
impl QualityCheckpoint for Quality {
    async fn validate(&self, _checkout: &Checkout) -> Result<QualityReport> {
        if self.passed {
            Ok(QualityReport::pass())
        } else {
            Ok(QualityReport::from_issues(vec![QualityIssue {
                check: "cargo test".to_string(),
                message: "2 tests failed".to_string(),
            }]))
        }
    }
}

// =============================================================================
// Workers
// =============================================================================

#[derive(Clone)]
enum Behavior {
    Succeed(Duration),
    Fail,
    /// Report progress, then wait for cancellation.
    Hang,
    Progress,
    Write(Vec<(&'static str, &'static str)>),
    Panic,
}

/// Watches how many workers run at once and in which order they start.
#[derive(Clone, Default)]
struct RunTracker {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<i64>>>,
}

struct Running(Arc<AtomicUsize>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RunTracker {
    fn enter(&self, issue: i64) -> Running {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(issue);
        Running(self.running.clone())
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct FakeWorker {
    id: String,
    capabilities: Vec<String>,
    behavior: Behavior,
    tracker: RunTracker,
}

#[async_trait]
impl Worker for FakeWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn worker_type(&self) -> &str {
        WORKER_TYPE
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        checkout: &Checkout,
        progress: ProgressReporter,
    ) -> Result<WorkerOutput> {
        let _running = self.tracker.enter(ctx.issue_number);
        match &self.behavior {
            Behavior::Succeed(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(WorkerOutput::summary(format!("Resolved #{}", ctx.issue_number)))
            }
            Behavior::Fail => bail!("model refused"),
            Behavior::Hang => {
                progress.report(5, "thinking");
                ctx.cancel.cancelled().await;
                bail!("cancelled")
            }
            Behavior::Progress => {
                for percent in [10, 50, 90] {
                    progress.report(percent, format!("step {}", percent));
                }
                Ok(WorkerOutput::summary("done"))
            }
            Behavior::Write(files) => {
                let mut artifacts = Vec::new();
                for (path, content) in files {
                    let full = checkout.path.join(path);
                    if let Some(parent) = full.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&full, content).await?;
                    artifacts.push(Artifact {
                        path: path.to_string(),
                        content: content.to_string(),
                    });
                }
                Ok(WorkerOutput {
                    summary: "wrote files".to_string(),
                    artifacts,
                })
            }
            Behavior::Panic => panic!("worker blew up"),
        }
    }
}

fn register_workers(pool: &AgentPool, initial: usize, behavior: Behavior, tracker: &RunTracker) {
    let tracker = tracker.clone();
    let factory = move |instance_id: &str| -> Result<Arc<dyn Worker>> {
        Ok(Arc::new(FakeWorker {
            id: instance_id.to_string(),
            capabilities: vec!["implementation".to_string()],
            behavior: behavior.clone(),
            tracker: tracker.clone(),
        }))
    };
    pool.register_factory(WORKER_TYPE, Arc::new(factory), initial)
        .unwrap();
}

// =============================================================================
// Harness
// =============================================================================

fn fast_pool() -> PoolConfig {
    PoolConfig {
        retry_count: 1,
        retry_interval: Duration::from_millis(10),
        global_concurrency: 8,
        max_instances_per_type: None,
    }
}

fn children(count: i64, labels: &[&str]) -> Vec<ChildItem> {
    (1..=count)
        .map(|n| ChildItem {
            id: (100 + n).to_string(),
            number: 100 + n,
            title: format!("Child issue {}", n),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        })
        .collect()
}

fn pattern(name: &str, label: &str, max_parallel_agents: usize) -> ExecutionPattern {
    ExecutionPattern {
        name: name.to_string(),
        description: "test pattern".to_string(),
        max_parallel_agents,
        estimated_duration_secs: 60,
        agent_types: vec![WORKER_TYPE.to_string()],
        rule: LabelRule::Any(vec![label.to_string()]),
    }
}

struct Setup {
    epic_labels: Vec<&'static str>,
    children: Vec<ChildItem>,
    pool: PoolConfig,
    initial: usize,
    behavior: Behavior,
    quality_passes: bool,
    broken_checkouts: bool,
    backlog_unavailable: bool,
    config: OrchestratorConfig,
    patterns: Vec<ExecutionPattern>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            epic_labels: vec![],
            children: children(1, &[WORKER_TYPE]),
            pool: fast_pool(),
            initial: 1,
            behavior: Behavior::Succeed(Duration::from_millis(5)),
            quality_passes: true,
            broken_checkouts: false,
            backlog_unavailable: false,
            config: OrchestratorConfig::default(),
            patterns: vec![],
        }
    }
}

struct Harness {
    orchestrator: Orchestrator,
    backlog: Arc<Backlog>,
    checkouts: Arc<TempCheckouts>,
    tracker: RunTracker,
    events: broadcast::Receiver<ExecutionEvent>,
    _dir: TempDir,
}

impl Harness {
    fn new(setup: Setup) -> Self {
        let dir = TempDir::new().unwrap();
        let tracker = RunTracker::default();
        let pool = AgentPool::new(setup.pool);
        register_workers(&pool, setup.initial, setup.behavior, &tracker);

        let backlog = Arc::new(Backlog {
            item: WorkItem {
                id: String::new(),
                title: "Epic".to_string(),
                description: String::new(),
                labels: setup.epic_labels.iter().map(|l| l.to_string()).collect(),
            },
            children: setup.children,
            unavailable: setup.backlog_unavailable,
            comments: Mutex::new(Vec::new()),
        });
        let checkouts = Arc::new(TempCheckouts {
            root: dir.path().to_path_buf(),
            broken: setup.broken_checkouts,
            provisioned: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
        });
        let gate = ProtocolGate::new(
            Arc::new(EvidenceTruth::default()),
            Arc::new(IndexedReferences::new()),
            Arc::new(PatternRules::default()),
        );

        let mut registry = PatternRegistry::builtin();
        for pattern in setup.patterns {
            registry.register(pattern);
        }
        let orchestrator = Orchestrator::with_patterns(
            Dependencies {
                backlog: backlog.clone(),
                checkouts: checkouts.clone(),
                quality: Arc::new(Quality {
                    passed: setup.quality_passes,
                }),
                gate: Arc::new(gate),
                pool,
            },
            setup.config,
            registry,
        );
        let events = orchestrator.subscribe_all();

        Self {
            orchestrator,
            backlog,
            checkouts,
            tracker,
            events,
            _dir: dir,
        }
    }

    async fn run(&self, epic: &str) -> Execution {
        let started = self.orchestrator.start(epic).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.orchestrator.wait(&started.id))
            .await
            .expect("execution should finish")
            .unwrap()
    }

    /// Events of `execution_id` until `stop_at` accepts one.
    async fn events_until(
        &mut self,
        execution_id: &str,
        stop_at: impl Fn(&ExecutionEvent, &[ExecutionEvent]) -> bool,
    ) -> Vec<ExecutionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                .await
                .expect("event should arrive")
                .unwrap();
            if event.execution_id() != execution_id {
                continue;
            }
            let done = stop_at(&event, &seen);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn idle_workers(&self) -> bool {
        let pool = self.orchestrator.pool();
        pool.idle_count(WORKER_TYPE) == pool.instance_count(WORKER_TYPE)
    }
}

fn is_finished(event: &ExecutionEvent, _: &[ExecutionEvent]) -> bool {
    matches!(event, ExecutionEvent::ExecutionFinished { .. })
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_parallel_cap_holds_and_pool_grows() {
        let harness = Harness::new(Setup {
            epic_labels: vec!["trio"],
            children: children(10, &[WORKER_TYPE]),
            initial: 2,
            behavior: Behavior::Succeed(Duration::from_millis(60)),
            patterns: vec![pattern("trio", "trio", 3)],
            ..Setup::default()
        });

        let execution = harness.run("1").await;

        assert_eq!(execution.pattern, "trio");
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.tasks.len(), 10);
        assert_eq!(execution.progress, 100);
        assert!(execution.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert!(harness.tracker.peak() <= 3, "peak {}", harness.tracker.peak());
        assert!(harness.orchestrator.pool().instance_count(WORKER_TYPE) >= 3);

        let metrics = harness.orchestrator.pool().metrics_for(WORKER_TYPE).unwrap();
        assert_eq!(metrics.completed, 10);
        assert_eq!(metrics.failed, 0);
        assert!(harness.idle_workers());
    }

    #[tokio::test]
    async fn test_no_matching_children_completes_immediately() {
        let mut harness = Harness::new(Setup {
            children: children(3, &["documentation"]),
            ..Setup::default()
        });

        let execution = harness.orchestrator.start("1").await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.tasks.is_empty());
        assert_eq!(execution.progress, 100);
        assert!(execution.metrics.completed_at.is_some());

        let events = harness.events_until(&execution.id, is_finished).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].type_name(), "execution_started");
        assert!(harness.orchestrator.wait(&execution.id).await.is_some());
    }

    #[tokio::test]
    async fn test_quality_failure_fails_task() {
        let harness = Harness::new(Setup {
            quality_passes: false,
            ..Setup::default()
        });

        let execution = harness.run("1").await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        let task = &execution.tasks[0];
        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.error.as_ref().unwrap();
        assert_eq!(error.kind, TaskErrorKind::QualityGate);
        assert_eq!(error.issues.len(), 1);
        assert_eq!(task.quality_issues[0].check, "cargo test");
        assert!(harness.idle_workers());
        assert_eq!(
            harness.orchestrator.pool().metrics_for(WORKER_TYPE).unwrap().failed,
            1
        );
    }

    #[tokio::test]
    async fn test_critical_violation_fails_task() {
        let mut harness = Harness::new(Setup {
            behavior: Behavior::Write(vec![(
                "src/config.ts",
                "export const apiKey = \"sk_live_0123456789abcdef\";\n",
            )]),
            ..Setup::default()
        });

        let started = harness.orchestrator.start("1").await.unwrap();
        let events = harness.events_until(&started.id, is_finished).await;
        let execution = harness.orchestrator.status(&started.id).unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        let task = &execution.tasks[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.as_ref().unwrap().kind,
            TaskErrorKind::ProtocolViolation {
                severity: Severity::Critical
            }
        );
        assert!(task.violations.iter().any(|v| v.rule == "no-hardcoded-secret"));
        assert!(events.iter().any(|e| e.type_name() == "protocol_violation"));

        let report = execution.protocol_report.unwrap();
        assert!(report.summary.critical >= 1);
        assert_eq!(report.protocols_active.len(), 3);
    }

    #[tokio::test]
    async fn test_stop_unknown_execution_is_a_no_op() {
        let harness = Harness::new(Setup::default());
        harness.orchestrator.stop("no-such-execution").await;
        assert!(harness.orchestrator.status("no-such-execution").is_none());
        assert!(harness.orchestrator.wait("no-such-execution").await.is_none());
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_pattern_follows_epic_labels() {
        let harness = Harness::new(Setup {
            epic_labels: vec!["Security"],
            ..Setup::default()
        });
        let execution = harness.run("1").await;
        assert_eq!(execution.pattern, "security-audit");

        let harness = Harness::new(Setup::default());
        let execution = harness.run("2").await;
        assert_eq!(execution.pattern, "feature-development");
    }

    #[tokio::test]
    async fn test_children_without_worker_type_are_skipped() {
        let mut kids = children(2, &[WORKER_TYPE]);
        kids.extend(children(1, &["question"]).into_iter().map(|mut c| {
            c.number = 999;
            c
        }));
        let harness = Harness::new(Setup {
            children: kids,
            ..Setup::default()
        });

        let execution = harness.run("1").await;
        assert_eq!(execution.tasks.len(), 2);
        assert!(execution.tasks.iter().all(|t| t.issue_number != 999));
        assert!(execution.tasks.iter().all(|t| t.worker_type == WORKER_TYPE));
    }

    #[tokio::test]
    async fn test_single_slot_runs_tasks_in_issue_order() {
        let harness = Harness::new(Setup {
            epic_labels: vec!["solo"],
            children: children(4, &[WORKER_TYPE]),
            patterns: vec![pattern("solo", "solo", 1)],
            ..Setup::default()
        });

        let execution = harness.run("1").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(harness.tracker.peak(), 1);
        assert_eq!(*harness.tracker.started.lock().unwrap(), vec![101, 102, 103, 104]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_global_admission_keeps_issue_order() {
        for _ in 0..5 {
            let harness = Harness::new(Setup {
                epic_labels: vec!["wide"],
                children: children(8, &[WORKER_TYPE]),
                pool: PoolConfig {
                    global_concurrency: 1,
                    ..fast_pool()
                },
                initial: 8,
                behavior: Behavior::Succeed(Duration::from_millis(2)),
                patterns: vec![pattern("wide", "wide", 8)],
                ..Setup::default()
            });

            let execution = harness.run("1").await;
            assert_eq!(execution.status, ExecutionStatus::Completed);
            assert_eq!(harness.tracker.peak(), 1);
            let order = harness.tracker.started.lock().unwrap().clone();
            assert_eq!(order, (101..=108).collect::<Vec<i64>>());
        }
    }

    #[tokio::test]
    async fn test_global_admission_caps_across_patterns() {
        let harness = Harness::new(Setup {
            children: children(6, &[WORKER_TYPE]),
            pool: PoolConfig {
                global_concurrency: 2,
                ..fast_pool()
            },
            behavior: Behavior::Succeed(Duration::from_millis(40)),
            ..Setup::default()
        });

        let execution = harness.run("1").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(harness.tracker.peak() <= 2, "peak {}", harness.tracker.peak());
    }

    #[tokio::test]
    async fn test_progress_events_in_order() {
        let mut harness = Harness::new(Setup {
            behavior: Behavior::Progress,
            ..Setup::default()
        });

        let started = harness.orchestrator.start("1").await.unwrap();
        let events = harness.events_until(&started.id, is_finished).await;

        let progress: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::TaskProgress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![10, 50, 90]);

        let kinds: Vec<&str> = events.iter().map(|e| e.type_name()).collect();
        let started_at = kinds.iter().position(|k| *k == "task_started").unwrap();
        let completed_at = kinds.iter().position(|k| *k == "task_completed").unwrap();
        let first_progress = kinds.iter().position(|k| *k == "task_progress").unwrap();
        assert!(started_at < first_progress && first_progress < completed_at);

        let execution = harness.orchestrator.status(&started.id).unwrap();
        assert_eq!(execution.tasks[0].progress, 100);
        assert_eq!(execution.tasks[0].last_message.as_deref(), Some("step 90"));
    }

    #[tokio::test]
    async fn test_advisory_violation_keeps_task_completed() {
        let harness = Harness::new(Setup {
            behavior: Behavior::Write(vec![("src/lib.rs", "// TODO: tidy up\npub fn f() {}\n")]),
            ..Setup::default()
        });

        let execution = harness.run("1").await;
        let task = &execution.tasks[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.violations.len(), 1);
        assert_eq!(task.violations[0].severity, Severity::Warning);
        assert_eq!(execution.protocol_report.unwrap().summary.warning, 1);
    }

    #[tokio::test]
    async fn test_unresolved_import_is_critical() {
        let harness = Harness::new(Setup {
            behavior: Behavior::Write(vec![(
                "src/app.ts",
                "import { helper } from './helpers';\n",
            )]),
            ..Setup::default()
        });

        let execution = harness.run("1").await;
        let task = &execution.tasks[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.violations.iter().any(|v| v.rule == "unresolved-reference"));
    }

    #[tokio::test]
    async fn test_forget_only_terminal_executions() {
        let harness = Harness::new(Setup {
            behavior: Behavior::Hang,
            ..Setup::default()
        });
        let started = harness.orchestrator.start("1").await.unwrap();
        assert!(!harness.orchestrator.forget(&started.id));

        harness.orchestrator.stop(&started.id).await;
        assert!(harness.orchestrator.forget(&started.id));
        assert!(harness.orchestrator.status(&started.id).is_none());
        assert!(harness.orchestrator.list_executions().is_empty());
    }

    #[tokio::test]
    async fn test_list_executions_oldest_first() {
        let harness = Harness::new(Setup::default());
        let first = harness.run("1").await;
        let second = harness.run("2").await;

        let listed: Vec<String> = harness
            .orchestrator
            .list_executions()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(listed, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_register_pattern_at_runtime() {
        let harness = Harness::new(Setup {
            epic_labels: vec!["docs"],
            ..Setup::default()
        });
        harness
            .orchestrator
            .register_pattern(pattern("docs-refresh", "docs", 2));
        assert!(
            harness
                .orchestrator
                .patterns()
                .iter()
                .any(|p| p.name == "docs-refresh")
        );

        let execution = harness.run("1").await;
        assert_eq!(execution.pattern, "docs-refresh");
    }

    #[tokio::test]
    async fn test_completion_comment_and_cleanup() {
        let harness = Harness::new(Setup {
            config: OrchestratorConfig {
                cleanup_checkouts: true,
                comment_on_completion: true,
                ..OrchestratorConfig::default()
            },
            ..Setup::default()
        });

        let execution = harness.run("1").await;
        let task = &execution.tasks[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.checkout.is_none());

        assert_eq!(*harness.checkouts.cleaned.lock().unwrap(), vec![task.id.clone()]);
        let comments = harness.backlog.comments.lock().unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].0, task.issue_id);
        assert!(comments[0].1.contains("completed"));
    }

    #[tokio::test]
    async fn test_checkouts_are_kept_by_default() {
        let harness = Harness::new(Setup::default());
        let execution = harness.run("1").await;
        assert_eq!(harness.checkouts.provisioned.lock().unwrap().len(), 1);
        assert!(harness.checkouts.cleaned.lock().unwrap().is_empty());
        assert!(execution.tasks[0].checkout.is_some());
    }
}

// =============================================================================
// Stop
// =============================================================================

mod stop {
    use super::*;

    #[tokio::test]
    async fn test_stop_marks_tasks_stopped_and_frees_workers() {
        let mut harness = Harness::new(Setup {
            children: children(3, &[WORKER_TYPE]),
            initial: 2,
            behavior: Behavior::Hang,
            epic_labels: vec!["pair"],
            patterns: vec![pattern("pair", "pair", 2)],
            ..Setup::default()
        });

        let started = harness.orchestrator.start("1").await.unwrap();
        // both admitted tasks have a checkout once they report progress
        harness
            .events_until(&started.id, |event, seen| {
                let progressed = seen
                    .iter()
                    .filter(|e| e.type_name() == "task_progress")
                    .count();
                event.type_name() == "task_progress" && progressed == 1
            })
            .await;

        harness.orchestrator.stop(&started.id).await;

        let execution = harness.orchestrator.status(&started.id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Stopped);
        assert!(execution.tasks.iter().all(|t| t.status == TaskStatus::Stopped));
        assert!(execution.protocol_report.is_some());
        assert!(harness.idle_workers());
        assert_eq!(harness.checkouts.cleaned.lock().unwrap().len(), 2);

        let events = harness.events_until(&started.id, is_finished).await;
        let stopped = events
            .iter()
            .filter(|e| e.type_name() == "task_stopped")
            .count();
        assert_eq!(stopped, 3);

        // idempotent, and late worker outcomes do not override the stop
        harness.orchestrator.stop(&started.id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let execution = harness.orchestrator.wait(&started.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Stopped);
        assert!(execution.tasks.iter().all(|t| t.status == TaskStatus::Stopped));
        assert!(harness.idle_workers());
        assert_eq!(harness.checkouts.cleaned.lock().unwrap().len(), 2);
        let metrics = harness.orchestrator.pool().metrics_for(WORKER_TYPE);
        assert!(metrics.is_none_or(|m| m.completed + m.failed == 0));
    }

    #[tokio::test]
    async fn test_wait_after_stop_carries_protocol_report() {
        let harness = Harness::new(Setup {
            behavior: Behavior::Hang,
            ..Setup::default()
        });
        let started = harness.orchestrator.start("1").await.unwrap();
        harness.orchestrator.stop(&started.id).await;

        let execution = harness.orchestrator.wait(&started.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Stopped);
        assert!(execution.protocol_report.is_some());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let harness = Harness::new(Setup {
            behavior: Behavior::Hang,
            ..Setup::default()
        });
        let a = harness.orchestrator.start("1").await.unwrap();
        let b = harness.orchestrator.start("2").await.unwrap();

        harness.orchestrator.stop_all().await;
        for id in [&a.id, &b.id] {
            let execution = harness.orchestrator.status(id).unwrap();
            assert_eq!(execution.status, ExecutionStatus::Stopped);
        }
    }

    #[tokio::test]
    async fn test_stop_after_finish_changes_nothing() {
        let harness = Harness::new(Setup::default());
        let execution = harness.run("1").await;
        harness.orchestrator.stop(&execution.id).await;
        let after = harness.orchestrator.status(&execution.id).unwrap();
        assert_eq!(after.status, ExecutionStatus::Completed);
    }
}

// =============================================================================
// Failures
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_backlog_failure_is_reported() {
        let harness = Harness::new(Setup {
            backlog_unavailable: true,
            ..Setup::default()
        });
        let err = harness.orchestrator.start("42").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::BacklogFetch { ref work_item, .. } if work_item == "42"));
        assert!(harness.orchestrator.list_executions().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_pool_fails_waiting_tasks() {
        let harness = Harness::new(Setup {
            epic_labels: vec!["trio"],
            children: children(3, &[WORKER_TYPE]),
            pool: PoolConfig {
                max_instances_per_type: Some(1),
                ..fast_pool()
            },
            behavior: Behavior::Succeed(Duration::from_millis(300)),
            patterns: vec![pattern("trio", "trio", 3)],
            ..Setup::default()
        });

        let execution = harness.run("1").await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.count(TaskStatus::Completed), 1);
        let exhausted = execution
            .tasks
            .iter()
            .filter(|t| {
                t.error
                    .as_ref()
                    .is_some_and(|e| e.kind == TaskErrorKind::ResourceExhausted)
            })
            .count();
        assert_eq!(exhausted, 2);
        assert_eq!(harness.orchestrator.pool().instance_count(WORKER_TYPE), 1);

        // acquisition failures never reach the pool metrics
        let metrics = harness.orchestrator.pool().metrics_for(WORKER_TYPE).unwrap();
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 0);
    }

    #[tokio::test]
    async fn test_worker_error_is_agent_execution() {
        let harness = Harness::new(Setup {
            behavior: Behavior::Fail,
            ..Setup::default()
        });
        let execution = harness.run("1").await;
        let error = execution.tasks[0].error.as_ref().unwrap();
        assert_eq!(error.kind, TaskErrorKind::AgentExecution);
        assert!(error.message.contains("model refused"));
        assert!(harness.idle_workers());
    }

    #[tokio::test]
    async fn test_worker_timeout_releases_worker() {
        let harness = Harness::new(Setup {
            behavior: Behavior::Hang,
            config: OrchestratorConfig {
                worker_timeout: Duration::from_millis(100),
                ..OrchestratorConfig::default()
            },
            ..Setup::default()
        });
        let execution = harness.run("1").await;
        let error = execution.tasks[0].error.as_ref().unwrap();
        assert_eq!(error.kind, TaskErrorKind::Timeout);
        assert!(harness.idle_workers());
    }

    #[tokio::test]
    async fn test_checkout_failure() {
        let harness = Harness::new(Setup {
            broken_checkouts: true,
            ..Setup::default()
        });
        let execution = harness.run("1").await;
        let error = execution.tasks[0].error.as_ref().unwrap();
        assert_eq!(error.kind, TaskErrorKind::Checkout);
        assert!(error.message.contains("disk full"));
        assert!(harness.idle_workers());
    }

    #[tokio::test]
    async fn test_worker_panic_fails_task_and_frees_worker() {
        let harness = Harness::new(Setup {
            children: children(2, &[WORKER_TYPE]),
            behavior: Behavior::Panic,
            ..Setup::default()
        });
        let execution = harness.run("1").await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        for task in &execution.tasks {
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_ref().unwrap().kind, TaskErrorKind::AgentExecution);
        }
        assert!(harness.idle_workers());

        let metrics = harness.orchestrator.pool().metrics_for(WORKER_TYPE).unwrap();
        assert_eq!(metrics.failed, 2);
        assert_eq!(metrics.completed, 0);
    }

    #[tokio::test]
    async fn test_shut_down_pool_fails_tasks() {
        let harness = Harness::new(Setup::default());
        harness.orchestrator.pool().shutdown();
        let execution = harness.run("1").await;
        let error = execution.tasks[0].error.as_ref().unwrap();
        assert_eq!(error.kind, TaskErrorKind::ResourceExhausted);
    }
}
