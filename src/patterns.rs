//! Execution patterns: named strategies selected by a work item's labels.

use serde::{Deserialize, Serialize};

/// Built-in worker types, in display order.
pub const AGENT_TYPES: &[&str] = &[
    "strategic-planner",
    "system-architect",
    "code-implementer",
    "test-coverage-validator",
    "security-auditor",
    "performance-optimizer",
    "ui-ux-optimizer",
    "database-architect",
    "deployment-automation",
    "code-quality-reviewer",
    "antihallucination-validator",
];

pub const DEFAULT_PATTERN: &str = "feature-development";

/// Label predicate deciding whether a pattern applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "labels", rename_all = "snake_case")]
pub enum LabelRule {
    Always,
    Any(Vec<String>),
    All(Vec<String>),
}

impl LabelRule {
    pub fn matches(&self, labels: &[String]) -> bool {
        let has = |wanted: &String| labels.iter().any(|l| l.eq_ignore_ascii_case(wanted));
        match self {
            Self::Always => true,
            Self::Any(wanted) => wanted.iter().any(has),
            Self::All(wanted) => !wanted.is_empty() && wanted.iter().all(has),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPattern {
    pub name: String,
    pub description: String,
    pub max_parallel_agents: usize,
    pub estimated_duration_secs: u64,
    pub agent_types: Vec<String>,
    pub rule: LabelRule,
}

impl ExecutionPattern {
    fn builtin(
        name: &str,
        description: &str,
        max_parallel_agents: usize,
        estimated_hours: u64,
        agent_types: &[&str],
        rule: LabelRule,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            max_parallel_agents,
            estimated_duration_secs: estimated_hours * 3600,
            agent_types: agent_types.iter().map(|s| s.to_string()).collect(),
            rule,
        }
    }
}

fn labels(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn builtin_patterns() -> Vec<ExecutionPattern> {
    vec![
        ExecutionPattern::builtin(
            "security-audit",
            "Security review and remediation",
            2,
            2,
            &["security-auditor", "code-implementer", "test-coverage-validator"],
            LabelRule::Any(labels(&["security", "vulnerability"])),
        ),
        ExecutionPattern::builtin(
            "bug-fix-sprint",
            "Parallel bug fixing with regression tests",
            5,
            1,
            &["code-implementer", "test-coverage-validator", "code-quality-reviewer"],
            LabelRule::Any(labels(&["bug", "bugfix", "hotfix"])),
        ),
        ExecutionPattern::builtin(
            "performance-optimization",
            "Profiling-driven performance work",
            3,
            2,
            &["performance-optimizer", "code-implementer", "test-coverage-validator"],
            LabelRule::Any(labels(&["performance"])),
        ),
        ExecutionPattern::builtin(
            "ui-overhaul",
            "User interface and experience improvements",
            3,
            3,
            &["ui-ux-optimizer", "code-implementer", "test-coverage-validator"],
            LabelRule::Any(labels(&["ui", "ux", "frontend"])),
        ),
        ExecutionPattern::builtin(
            "infrastructure",
            "Deployment, CI and data layer changes",
            2,
            2,
            &["deployment-automation", "database-architect", "code-quality-reviewer"],
            LabelRule::Any(labels(&["deployment", "infrastructure", "ci"])),
        ),
    ]
}

/// Fallback used when no other pattern matches.
pub fn feature_development() -> ExecutionPattern {
    ExecutionPattern::builtin(
        DEFAULT_PATTERN,
        "Standard feature delivery",
        4,
        4,
        &[
            "strategic-planner",
            "system-architect",
            "code-implementer",
            "test-coverage-validator",
            "code-quality-reviewer",
        ],
        LabelRule::Always,
    )
}

/// Ordered pattern set. Selection takes the first match in registration
/// order, falling back to the default pattern.
#[derive(Debug, Clone)]
pub struct PatternRegistry {
    patterns: Vec<ExecutionPattern>,
    default: ExecutionPattern,
}

impl PatternRegistry {
    /// An empty registry whose fallback is `default`.
    pub fn new(default: ExecutionPattern) -> Self {
        Self {
            patterns: Vec::new(),
            default,
        }
    }

    pub fn builtin() -> Self {
        Self {
            patterns: builtin_patterns(),
            default: feature_development(),
        }
    }

    /// Add a pattern, or replace the one with the same name in place.
    /// Registering under the default's name replaces the default.
    pub fn register(&mut self, pattern: ExecutionPattern) {
        if pattern.name == self.default.name {
            self.default = pattern;
            return;
        }
        match self.patterns.iter_mut().find(|p| p.name == pattern.name) {
            Some(existing) => *existing = pattern,
            None => self.patterns.push(pattern),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ExecutionPattern> {
        self.patterns().find(|p| p.name == name)
    }

    /// Every pattern in registration order, the default last.
    pub fn patterns(&self) -> impl Iterator<Item = &ExecutionPattern> {
        self.patterns.iter().chain(std::iter::once(&self.default))
    }

    pub fn default_pattern(&self) -> &ExecutionPattern {
        &self.default
    }

    pub fn select(&self, labels: &[String]) -> &ExecutionPattern {
        self.patterns
            .iter()
            .find(|p| p.rule.matches(labels))
            .unwrap_or(&self.default)
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// The first label naming a known worker type, in label order.
pub fn map_worker_type(labels: &[String], known: &[String]) -> Option<String> {
    labels
        .iter()
        .map(|l| l.trim().to_lowercase())
        .find(|l| known.iter().any(|k| k == l))
}
