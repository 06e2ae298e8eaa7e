//! Built-in worker types.
//!
//! Every type in [`AGENT_TYPES`] is served by a [`ClaudeWorker`] with a
//! role-specific prompt; the types differ only in instructions and
//! advertised capabilities.

mod claude;
pub mod stream;

use std::sync::Arc;

use crate::errors::PoolError;
use crate::patterns::AGENT_TYPES;
use crate::pool::{AgentPool, Worker};

pub use claude::ClaudeWorker;

pub fn role_prompt(worker_type: &str) -> &'static str {
    match worker_type {
        "strategic-planner" => {
            "You are a strategic planner. Break the issue into concrete steps, record the plan in the repository, and implement the first step."
        }
        "system-architect" => {
            "You are a system architect. Design module boundaries and interfaces for the issue and implement the scaffolding."
        }
        "code-implementer" => {
            "You are a code implementer. Implement the issue completely, following the existing conventions of the codebase."
        }
        "test-coverage-validator" => {
            "You are a test engineer. Add or extend tests so the behavior described in the issue is covered, and fix any failures you find."
        }
        "security-auditor" => {
            "You are a security auditor. Find and fix vulnerabilities related to the issue. Never commit credentials."
        }
        "performance-optimizer" => {
            "You are a performance engineer. Measure, then remove the bottleneck described in the issue without changing behavior."
        }
        "ui-ux-optimizer" => {
            "You are a UI/UX engineer. Improve the interface described in the issue, keeping it accessible and consistent."
        }
        "database-architect" => {
            "You are a database architect. Implement the schema, migration or query changes the issue asks for, keeping migrations reversible."
        }
        "deployment-automation" => {
            "You are a deployment engineer. Implement the build, CI or infrastructure changes the issue asks for."
        }
        "code-quality-reviewer" => {
            "You are a code quality reviewer. Refactor the code named in the issue for clarity and remove dead code, without changing behavior."
        }
        "antihallucination-validator" => {
            "You are a verification engineer. Check that every file, function and import referenced by the issue really exists, and fix references that do not."
        }
        _ => "You are a software engineer. Resolve the issue completely.",
    }
}

pub fn capabilities(worker_type: &str) -> Vec<String> {
    let caps: &[&str] = match worker_type {
        "strategic-planner" => &["planning", "decomposition"],
        "system-architect" => &["architecture", "design"],
        "code-implementer" => &["implementation", "refactoring"],
        "test-coverage-validator" => &["testing", "coverage"],
        "security-auditor" => &["security", "audit"],
        "performance-optimizer" => &["performance", "profiling"],
        "ui-ux-optimizer" => &["ui", "accessibility"],
        "database-architect" => &["database", "migrations"],
        "deployment-automation" => &["ci", "infrastructure"],
        "code-quality-reviewer" => &["review", "refactoring"],
        "antihallucination-validator" => &["validation", "references"],
        _ => &["implementation"],
    };
    caps.iter().map(|c| c.to_string()).collect()
}

/// Register a Claude-backed factory for every built-in worker type.
pub fn register_builtin_workers(
    pool: &AgentPool,
    claude_cmd: &str,
    initial_instances: usize,
) -> Result<(), PoolError> {
    for worker_type in AGENT_TYPES {
        let cmd = claude_cmd.to_string();
        let ty = worker_type.to_string();
        let factory = move |instance_id: &str| -> anyhow::Result<Arc<dyn Worker>> {
            Ok(Arc::new(ClaudeWorker::new(instance_id, &ty, &cmd)))
        };
        pool.register_factory(worker_type, Arc::new(factory), initial_instances)?;
    }
    Ok(())
}
