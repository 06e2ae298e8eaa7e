//! Protocol gate: the truth, reference and rules checkers composed into a
//! single mandatory gate around every task.
//!
//! Setup runs once per execution (the orchestrator guards it with a
//! `OnceCell`). Post-checks run once per task in a fixed order,
//! rules → references → truth, and stop at the first critical violation.

pub mod builtin;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::pool::WorkerOutput;

pub use types::{
    CheckContext, GateSetup, PostCheckOutcome, ProtocolKind, ProtocolReport, ReferenceReport,
    ReportSummary, RulesVerdict, Severity, TruthVerdict, UnresolvedReference, Violation,
};

/// Validates that a task's claimed results are backed by evidence.
#[async_trait]
pub trait TruthChecker: Send + Sync {
    /// Turn on truth blocking for the execution in `ctx`.
    async fn enable(&self, ctx: &CheckContext) -> Result<()>;

    async fn check(&self, ctx: &CheckContext, data: &serde_json::Value) -> Result<TruthVerdict>;

    /// Drop per-execution state.
    fn forget(&self, _execution_id: &str) {}
}

/// Verifies that code only references things that exist.
#[async_trait]
pub trait ReferenceChecker: Send + Sync {
    /// Build the reference index. Returns the number of indexed entries.
    async fn build_index(&self, ctx: &CheckContext) -> Result<usize>;

    async fn check(
        &self,
        code: &str,
        file: Option<&str>,
        ctx: &CheckContext,
    ) -> Result<ReferenceReport>;

    /// Drop the execution's index.
    fn forget(&self, _execution_id: &str) {}
}

/// Applies the configured rule set to produced content.
#[async_trait]
pub trait RulesChecker: Send + Sync {
    /// Load and compile rules. Returns the number of rules loaded.
    async fn load_rules(&self, ctx: &CheckContext) -> Result<usize>;

    async fn check(&self, action: &str, ctx: &CheckContext) -> Result<RulesVerdict>;
}

/// Severities the gate assigns to truth and reference failures.
#[derive(Debug, Clone, Copy)]
pub struct GatePolicy {
    pub truth_severity: Severity,
    pub reference_severity: Severity,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            truth_severity: Severity::Error,
            reference_severity: Severity::Critical,
        }
    }
}

#[derive(Default)]
struct Ledger {
    setup: Option<GateSetup>,
    violations: Vec<Violation>,
}

pub struct ProtocolGate {
    truth: Arc<dyn TruthChecker>,
    references: Arc<dyn ReferenceChecker>,
    rules: Arc<dyn RulesChecker>,
    policy: GatePolicy,
    ledgers: Mutex<HashMap<String, Ledger>>,
}

impl ProtocolGate {
    pub fn new(
        truth: Arc<dyn TruthChecker>,
        references: Arc<dyn ReferenceChecker>,
        rules: Arc<dyn RulesChecker>,
    ) -> Self {
        Self {
            truth,
            references,
            rules,
            policy: GatePolicy::default(),
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: GatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    /// Enable truth mode, build the reference index and load rules.
    pub async fn setup(&self, ctx: &CheckContext) -> Result<GateSetup> {
        self.truth
            .enable(ctx)
            .await
            .context("failed to enable truth checking")?;
        let indexed_files = self
            .references
            .build_index(ctx)
            .await
            .context("failed to build reference index")?;
        let rules_loaded = self
            .rules
            .load_rules(ctx)
            .await
            .context("failed to load rules")?;

        let setup = GateSetup {
            rules_loaded,
            indexed_files,
            truth_mode: true,
        };
        info!(
            execution_id = %ctx.execution_id,
            rules_loaded, indexed_files, "Protocol gate ready"
        );
        self.ledger(&ctx.execution_id, |ledger| ledger.setup = Some(setup.clone()));
        Ok(setup)
    }

    pub async fn check_truthfulness(
        &self,
        ctx: &CheckContext,
        data: &serde_json::Value,
    ) -> Result<TruthVerdict> {
        self.truth.check(ctx, data).await
    }

    pub async fn check_references(
        &self,
        code: &str,
        file: Option<&str>,
        ctx: &CheckContext,
    ) -> Result<ReferenceReport> {
        self.references.check(code, file, ctx).await
    }

    pub async fn check_rules(&self, action: &str, ctx: &CheckContext) -> Result<RulesVerdict> {
        self.rules.check(action, ctx).await
    }

    /// Run every protocol against a worker's output, recording the
    /// violations for the execution's report.
    pub async fn post_check(
        &self,
        ctx: &CheckContext,
        output: &WorkerOutput,
    ) -> Result<PostCheckOutcome> {
        let mut outcome = PostCheckOutcome::default();
        let result = self.evaluate(ctx, output, &mut outcome).await;

        if !outcome.violations.is_empty() {
            let recorded = outcome.violations.clone();
            self.ledger(&ctx.execution_id, |ledger| ledger.violations.extend(recorded));
        }
        result.map(|()| outcome)
    }

    async fn evaluate(
        &self,
        ctx: &CheckContext,
        output: &WorkerOutput,
        outcome: &mut PostCheckOutcome,
    ) -> Result<()> {
        let tag = |v: Violation| match &ctx.task_id {
            Some(task_id) => v.for_task(task_id.clone()),
            None => v,
        };

        // rules
        for artifact in &output.artifacts {
            let verdict = self.check_rules(&artifact.content, ctx).await?;
            for violation in verdict.violations {
                let violation = match violation.file {
                    Some(_) => violation,
                    None => violation.in_file(artifact.path.clone()),
                };
                if outcome.push(tag(violation)) {
                    return Ok(());
                }
            }
        }

        // references
        for artifact in &output.artifacts {
            let report = self
                .check_references(&artifact.content, Some(&artifact.path), ctx)
                .await?;
            for unresolved in report.unresolved {
                let mut message = format!("Unresolved reference '{}'", unresolved.reference);
                if !unresolved.suggestions.is_empty() {
                    message.push_str(&format!(
                        " (did you mean: {}?)",
                        unresolved.suggestions.join(", ")
                    ));
                }
                let violation = Violation::new(
                    ProtocolKind::References,
                    "unresolved-reference",
                    self.policy.reference_severity,
                    message,
                )
                .in_file(artifact.path.clone());
                if outcome.push(tag(violation)) {
                    return Ok(());
                }
            }
        }

        // truth
        let claims = json!({
            "summary": output.summary,
            "artifacts": output.artifacts.iter().map(|a| a.path.as_str()).collect::<Vec<_>>(),
        });
        let verdict = self.check_truthfulness(ctx, &claims).await?;
        if !verdict.passed {
            let message = verdict.reason.unwrap_or_else(|| {
                format!(
                    "Claimed results could not be verified (confidence {:.2})",
                    verdict.confidence
                )
            });
            outcome.push(tag(Violation::new(
                ProtocolKind::Truth,
                "unverified-claim",
                self.policy.truth_severity,
                message,
            )));
        }

        debug!(
            execution_id = %ctx.execution_id,
            violations = outcome.violations.len(),
            "Protocol post-check finished"
        );
        Ok(())
    }

    /// Record a violation raised outside the post-checks (e.g. a setup failure).
    pub fn record(&self, execution_id: &str, violation: Violation) {
        self.ledger(execution_id, |ledger| ledger.violations.push(violation));
    }

    /// Accumulated report for one execution.
    pub fn report(&self, execution_id: &str) -> ProtocolReport {
        let ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(ledger) = ledgers.get(execution_id) else {
            return ProtocolReport::default();
        };
        let protocols_active = if ledger.setup.is_some() {
            vec![
                ProtocolKind::Truth,
                ProtocolKind::References,
                ProtocolKind::Rules,
            ]
        } else {
            Vec::new()
        };
        ProtocolReport {
            summary: ReportSummary::from_violations(&ledger.violations),
            violations: ledger.violations.clone(),
            protocols_active,
        }
    }

    /// Drop everything recorded for an execution.
    pub fn forget(&self, execution_id: &str) {
        self.truth.forget(execution_id);
        self.references.forget(execution_id);
        self.ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id);
    }

    fn ledger(&self, execution_id: &str, f: impl FnOnce(&mut Ledger)) {
        let mut ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        f(ledgers.entry(execution_id.to_string()).or_default());
    }
}
