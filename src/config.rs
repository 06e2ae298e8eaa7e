//! Project configuration read from `.forgeflow/forgeflow.toml`.
//!
//! Every section and key is optional; a missing file yields the defaults.
//!
//! ```toml
//! [project]
//! claude_cmd = "claude"
//! base_branch = "main"
//!
//! [pool]
//! retry_count = 3
//! retry_interval_ms = 1000
//! global_concurrency = 8
//! initial_instances = 1
//! max_instances_per_type = 4
//!
//! [timeouts]
//! worker_secs = 1800
//!
//! [orchestrator]
//! cleanup_checkouts = true
//! comment_on_completion = true
//!
//! [quality]
//! commands = ["cargo fmt --check", "cargo test"]
//!
//! [protocols]
//! truth_severity = "error"
//! reference_severity = "critical"
//!
//! [[patterns]]
//! name = "docs-refresh"
//! description = "Documentation pass"
//! max_parallel_agents = 2
//! agent_types = ["code-implementer"]
//! match_any = ["docs"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::orchestrator::OrchestratorConfig;
use crate::patterns::{AGENT_TYPES, ExecutionPattern, LabelRule, PatternRegistry};
use crate::pool::PoolConfig;
use crate::protocol::builtin::{RuleSpec, default_rules};
use crate::protocol::{GatePolicy, Severity};

pub const CONFIG_FILE: &str = "forgeflow.toml";
pub const CONFIG_DIR: &str = ".forgeflow";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Overrides `CLAUDE_CMD` and the `claude` default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_cmd: Option<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Where task worktrees are created, relative to the repository.
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_worktree_dir() -> String {
    ".worktrees".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            claude_cmd: None,
            base_branch: default_base_branch(),
            worktree_dir: default_worktree_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    /// Instances pre-created for each built-in worker type.
    #[serde(default = "default_initial_instances")]
    pub initial_instances: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances_per_type: Option<usize>,
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_global_concurrency() -> usize {
    8
}

fn default_initial_instances() -> usize {
    1
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_interval_ms: default_retry_interval_ms(),
            global_concurrency: default_global_concurrency(),
            initial_instances: default_initial_instances(),
            max_instances_per_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_checkout_secs")]
    pub checkout_secs: u64,
    #[serde(default = "default_worker_secs")]
    pub worker_secs: u64,
    #[serde(default = "default_quality_secs")]
    pub quality_secs: u64,
    #[serde(default = "default_protocol_secs")]
    pub protocol_secs: u64,
}

fn default_checkout_secs() -> u64 {
    120
}

fn default_worker_secs() -> u64 {
    1800
}

fn default_quality_secs() -> u64 {
    600
}

fn default_protocol_secs() -> u64 {
    300
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            checkout_secs: default_checkout_secs(),
            worker_secs: default_worker_secs(),
            quality_secs: default_quality_secs(),
            protocol_secs: default_protocol_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default)]
    pub cleanup_checkouts: bool,
    #[serde(default)]
    pub comment_on_completion: bool,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            cleanup_checkouts: false,
            comment_on_completion: false,
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySection {
    /// Shell commands run in each checkout; all must exit zero.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Limit for each command on its own.
    #[serde(default = "default_quality_command_secs")]
    pub timeout_secs: u64,
}

fn default_quality_command_secs() -> u64 {
    300
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_secs: default_quality_command_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolsSection {
    /// Share of claimed artifacts that must exist for the truth check to pass.
    #[serde(default = "default_truth_threshold")]
    pub truth_threshold: f64,
    #[serde(default = "default_truth_severity")]
    pub truth_severity: Severity,
    #[serde(default = "default_reference_severity")]
    pub reference_severity: Severity,
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleSpec>,
}

fn default_truth_threshold() -> f64 {
    0.8
}

fn default_truth_severity() -> Severity {
    Severity::Error
}

fn default_reference_severity() -> Severity {
    Severity::Critical
}

impl Default for ProtocolsSection {
    fn default() -> Self {
        Self {
            truth_threshold: default_truth_threshold(),
            truth_severity: default_truth_severity(),
            reference_severity: default_reference_severity(),
            rules: default_rules(),
        }
    }
}

/// A `[[patterns]]` entry. With neither `match_any` nor `match_all` the
/// pattern always matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    #[serde(default = "default_estimated_duration_secs")]
    pub estimated_duration_secs: u64,
    #[serde(default)]
    pub agent_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_any: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_all: Vec<String>,
}

fn default_max_parallel_agents() -> usize {
    3
}

fn default_estimated_duration_secs() -> u64 {
    4 * 3600
}

impl PatternSpec {
    pub fn rule(&self) -> LabelRule {
        if !self.match_all.is_empty() {
            LabelRule::All(self.match_all.clone())
        } else if !self.match_any.is_empty() {
            LabelRule::Any(self.match_any.clone())
        } else {
            LabelRule::Always
        }
    }

    pub fn to_pattern(&self) -> ExecutionPattern {
        ExecutionPattern {
            name: self.name.clone(),
            description: self.description.clone(),
            max_parallel_agents: self.max_parallel_agents.max(1),
            estimated_duration_secs: self.estimated_duration_secs,
            agent_types: self.agent_types.clone(),
            rule: self.rule(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub quality: QualitySection,
    #[serde(default)]
    pub protocols: ProtocolsSection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<PatternSpec>,
}

impl FlowToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse forgeflow.toml")
    }

    /// Load `<dir>/forgeflow.toml`, or the defaults when it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize forgeflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// File, then `CLAUDE_CMD`, then `claude`.
    pub fn claude_cmd(&self) -> String {
        self.project
            .claude_cmd
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// `FORGEFLOW_GLOBAL_CONCURRENCY` wins over the file when it parses.
    pub fn global_concurrency(&self) -> usize {
        concurrency_override(
            std::env::var("FORGEFLOW_GLOBAL_CONCURRENCY").ok().as_deref(),
            self.pool.global_concurrency,
        )
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            retry_count: self.pool.retry_count,
            retry_interval: Duration::from_millis(self.pool.retry_interval_ms),
            global_concurrency: self.global_concurrency(),
            max_instances_per_type: self.pool.max_instances_per_type,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            checkout_timeout: Duration::from_secs(self.timeouts.checkout_secs),
            worker_timeout: Duration::from_secs(self.timeouts.worker_secs),
            quality_timeout: Duration::from_secs(self.timeouts.quality_secs),
            protocol_timeout: Duration::from_secs(self.timeouts.protocol_secs),
            cleanup_checkouts: self.orchestrator.cleanup_checkouts,
            comment_on_completion: self.orchestrator.comment_on_completion,
            event_buffer: self.orchestrator.event_buffer,
        }
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            truth_severity: self.protocols.truth_severity,
            reference_severity: self.protocols.reference_severity,
        }
    }

    /// Built-in patterns with the configured ones registered on top.
    pub fn pattern_registry(&self) -> PatternRegistry {
        let mut registry = PatternRegistry::builtin();
        for spec in &self.patterns {
            registry.register(spec.to_pattern());
        }
        registry
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pool.global_concurrency == 0 {
            warnings.push("pool.global_concurrency is 0; no task can ever run".to_string());
        }
        if self.pool.max_instances_per_type == Some(0) {
            warnings.push("pool.max_instances_per_type is 0; acquisition always fails".to_string());
        }
        if let Some(limit) = self.pool.max_instances_per_type
            && self.pool.initial_instances > limit
        {
            warnings.push(format!(
                "pool.initial_instances ({}) exceeds max_instances_per_type ({}); capped",
                self.pool.initial_instances, limit
            ));
        }
        if !(0.0..=1.0).contains(&self.protocols.truth_threshold) {
            warnings.push(format!(
                "protocols.truth_threshold {} is outside 0.0..=1.0",
                self.protocols.truth_threshold
            ));
        }
        for rule in &self.protocols.rules {
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                warnings.push(format!("Rule '{}' has an invalid pattern: {}", rule.id, e));
            }
        }

        for spec in &self.patterns {
            if spec.max_parallel_agents == 0 {
                warnings.push(format!(
                    "Pattern '{}' has max_parallel_agents = 0; using 1",
                    spec.name
                ));
            }
            if !spec.match_any.is_empty() && !spec.match_all.is_empty() {
                warnings.push(format!(
                    "Pattern '{}' sets both match_any and match_all; match_all is used",
                    spec.name
                ));
            }
            for agent in &spec.agent_types {
                if !AGENT_TYPES.contains(&agent.as_str()) {
                    warnings.push(format!(
                        "Pattern '{}' names unknown agent type '{}'",
                        spec.name, agent
                    ));
                }
            }
        }

        warnings
    }
}

fn concurrency_override(env: Option<&str>, fallback: usize) -> usize {
    env.and_then(|v| v.trim().parse().ok()).unwrap_or(fallback)
}

/// Resolved project location plus its parsed configuration.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: FlowToml,
}

impl FlowConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = FlowToml::load_or_default(&config_dir)?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
        })
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
