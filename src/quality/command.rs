use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{QualityCheckpoint, QualityReport};
use crate::models::{Checkout, QualityIssue};
use crate::util::truncate;

const MAX_ISSUE_OUTPUT: usize = 2000;

/// Runs each configured shell command inside the checkout; any non-zero
/// exit, or exceeding the per-command timeout, is an issue.
pub struct CommandQualityCheckpoint {
    commands: Vec<String>,
    timeout: Duration,
}

impl CommandQualityCheckpoint {
    pub fn new(commands: Vec<String>, timeout: Duration) -> Self {
        Self { commands, timeout }
    }

    async fn run(&self, command: &str, checkout: &Checkout) -> Result<Option<QualityIssue>> {
        debug!(command, path = %checkout.path.display(), "Running quality check");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&checkout.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn quality command: {}", command))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for quality command")?,
            Err(_) => {
                return Ok(Some(QualityIssue {
                    check: command.to_string(),
                    message: format!("Timed out after {:?}", self.timeout),
                }));
            }
        };

        if output.status.success() {
            return Ok(None);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            format!("exited with code {}", output.status.code().unwrap_or(-1))
        };
        Ok(Some(QualityIssue {
            check: command.to_string(),
            message: truncate(&detail, MAX_ISSUE_OUTPUT),
        }))
    }
}

#[async_trait]
impl QualityCheckpoint for CommandQualityCheckpoint {
    async fn validate(&self, checkout: &Checkout) -> Result<QualityReport> {
        let mut issues = Vec::new();
        for command in &self.commands {
            if let Some(issue) = self.run(command, checkout).await? {
                issues.push(issue);
            }
        }
        info!(
            checkout = %checkout.id,
            checks = self.commands.len(),
            issues = issues.len(),
            "Quality checkpoint finished"
        );
        Ok(QualityReport::from_issues(issues))
    }
}
