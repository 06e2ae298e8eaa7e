//! Execution pattern listing: `forgeflow patterns`.

use std::path::Path;

use anyhow::Result;
use console::style;

use forgeflow::config::FlowConfig;
use forgeflow::patterns::{ExecutionPattern, LabelRule};

fn describe_rule(rule: &LabelRule) -> String {
    match rule {
        LabelRule::Always => "default".to_string(),
        LabelRule::Any(labels) => format!("any of: {}", labels.join(", ")),
        LabelRule::All(labels) => format!("all of: {}", labels.join(", ")),
    }
}

fn print_pattern(pattern: &ExecutionPattern) {
    println!(
        "  {} {}",
        style(&pattern.name).cyan().bold(),
        style(format!("({})", describe_rule(&pattern.rule))).dim()
    );
    if !pattern.description.is_empty() {
        println!("    {}", pattern.description);
    }
    println!(
        "    parallel: {}  estimate: {}h",
        pattern.max_parallel_agents,
        pattern.estimated_duration_secs / 3600
    );
    if !pattern.agent_types.is_empty() {
        println!("    agents: {}", pattern.agent_types.join(", "));
    }
}

pub fn cmd_patterns(project_dir: &Path) -> Result<()> {
    let config = FlowConfig::new(project_dir.to_path_buf())?;
    for warning in config.validate() {
        eprintln!("{} {}", style("warning:").yellow(), warning);
    }
    let registry = config.toml.pattern_registry();

    println!();
    println!("{}", style("Execution patterns").bold());
    println!("Checked in order; the first match wins.");
    println!();
    for pattern in registry.patterns() {
        print_pattern(pattern);
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_rule() {
        assert_eq!(describe_rule(&LabelRule::Always), "default");
        assert_eq!(
            describe_rule(&LabelRule::Any(vec!["bug".to_string(), "fix".to_string()])),
            "any of: bug, fix"
        );
    }
}
