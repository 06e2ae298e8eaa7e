//! Verdicts, violations and reports exchanged with the protocol checkers.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Severity of a protocol violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Only critical violations fail a task; lower severities are advisory.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// The three protocols composed by the gate, plus the gate itself for
/// failures to set up or evaluate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Truth,
    References,
    Rules,
    Gate,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Truth => "truth",
            Self::References => "references",
            Self::Rules => "rules",
            Self::Gate => "gate",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub protocol: ProtocolKind,
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Violation {
    pub fn new(
        protocol: ProtocolKind,
        rule: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            rule: rule.into(),
            severity,
            message: message.into(),
            task_id: None,
            file: None,
        }
    }

    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Scope a check runs in: the execution, optionally the task, and the
/// directory whose contents the checkers may inspect.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub execution_id: String,
    pub task_id: Option<String>,
    pub root: PathBuf,
}

impl CheckContext {
    pub fn for_execution(execution_id: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            task_id: None,
            root: root.into(),
        }
    }

    pub fn for_task(execution_id: &str, task_id: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            task_id: Some(task_id.to_string()),
            root: root.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthVerdict {
    pub passed: bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub reference: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferenceReport {
    pub passed: bool,
    pub unresolved: Vec<UnresolvedReference>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RulesVerdict {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

/// Result of the one-time per-execution setup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GateSetup {
    pub rules_loaded: usize,
    pub indexed_files: usize,
    pub truth_mode: bool,
}

/// Outcome of the post-execution checks for one task.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PostCheckOutcome {
    /// Every violation found, including the critical one if any.
    pub violations: Vec<Violation>,
    /// The first critical violation; evaluation stopped there.
    pub critical: Option<Violation>,
}

impl PostCheckOutcome {
    /// Record a violation. Returns true once a critical violation is hit.
    pub(crate) fn push(&mut self, violation: Violation) -> bool {
        let blocking = violation.severity.is_blocking();
        if blocking && self.critical.is_none() {
            self.critical = Some(violation.clone());
        }
        self.violations.push(violation);
        blocking
    }

    pub fn advisory(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| !v.severity.is_blocking())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

impl ReportSummary {
    pub fn from_violations(violations: &[Violation]) -> Self {
        let mut summary = Self {
            total: violations.len(),
            ..Default::default()
        };
        for v in violations {
            match v.severity {
                Severity::Critical => summary.critical += 1,
                Severity::Error => summary.error += 1,
                Severity::Warning => summary.warning += 1,
                Severity::Info => summary.info += 1,
            }
        }
        summary
    }
}

/// End-of-execution protocol report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProtocolReport {
    pub violations: Vec<Violation>,
    pub protocols_active: Vec<ProtocolKind>,
    pub summary: ReportSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
        assert!(Severity::Critical.is_blocking());
        assert!(!Severity::Error.is_blocking());
    }

    #[test]
    fn test_severity_parse_is_case_insensitive() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warning);
        assert!("fatal".parse::<Severity>().is_err());
    }

    #[test]
    fn test_post_check_outcome_tracks_first_critical() {
        let mut outcome = PostCheckOutcome::default();
        assert!(!outcome.push(Violation::new(
            ProtocolKind::Rules,
            "no-todo",
            Severity::Warning,
            "TODO left in code"
        )));
        assert!(outcome.push(Violation::new(
            ProtocolKind::References,
            "unresolved-reference",
            Severity::Critical,
            "missing ./db"
        )));
        assert_eq!(outcome.violations.len(), 2);
        assert_eq!(outcome.critical.as_ref().unwrap().rule, "unresolved-reference");
        assert_eq!(outcome.advisory().count(), 1);
    }

    #[test]
    fn test_report_summary_counts() {
        let violations = vec![
            Violation::new(ProtocolKind::Rules, "a", Severity::Warning, "w"),
            Violation::new(ProtocolKind::Rules, "b", Severity::Warning, "w"),
            Violation::new(ProtocolKind::Truth, "c", Severity::Error, "e"),
        ];
        let summary = ReportSummary::from_violations(&violations);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.warning, 2);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.critical, 0);
    }
}
