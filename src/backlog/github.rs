use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::BacklogClient;
use crate::models::{ChildItem, WorkItem};

/// Label that ties a child issue to its epic.
pub fn epic_label(epic: &str) -> String {
    format!("epic:{}", epic.trim_start_matches('#'))
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

/// An issue as printed by `gh issue view/list --json`.
#[derive(Debug, Deserialize)]
struct GhIssue {
    number: i64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

impl GhIssue {
    fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}

/// Backlog backed by the `gh` CLI in a repository checkout.
///
/// Children of epic `N` are the open issues labelled `epic:N`.
pub struct GhBacklogClient {
    repo_dir: PathBuf,
    gh_cmd: String,
}

impl GhBacklogClient {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            gh_cmd: "gh".to_string(),
        }
    }

    pub fn with_command(mut self, gh_cmd: impl Into<String>) -> Self {
        self.gh_cmd = gh_cmd.into();
        self
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "Running gh");
        let output = Command::new(&self.gh_cmd)
            .args(args)
            .current_dir(&self.repo_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.gh_cmd, args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh {} failed: {}", args.join(" "), stderr.trim());
        }
        String::from_utf8(output.stdout).context("Invalid UTF-8 in gh output")
    }
}

fn issue_number(id: &str) -> &str {
    id.trim_start_matches('#')
}

#[async_trait]
impl BacklogClient for GhBacklogClient {
    async fn get_work_item(&self, id: &str) -> Result<WorkItem> {
        let json = self
            .gh(&["issue", "view", issue_number(id), "--json", "number,title,body,labels"])
            .await?;
        let issue: GhIssue =
            serde_json::from_str(&json).context("Failed to parse gh issue view output")?;
        Ok(WorkItem {
            id: issue.number.to_string(),
            title: issue.title.clone(),
            description: issue.body.clone().unwrap_or_default(),
            labels: issue.label_names(),
        })
    }

    async fn get_child_items(&self, id: &str) -> Result<Vec<ChildItem>> {
        let label = epic_label(id);
        let json = self
            .gh(&[
                "issue",
                "list",
                "--label",
                &label,
                "--state",
                "open",
                "--limit",
                "200",
                "--json",
                "number,title,labels",
            ])
            .await?;
        let issues: Vec<GhIssue> =
            serde_json::from_str(&json).context("Failed to parse gh issue list output")?;
        Ok(issues
            .into_iter()
            .map(|issue| ChildItem {
                id: issue.number.to_string(),
                number: issue.number,
                labels: issue.label_names(),
                title: issue.title,
            })
            .collect())
    }

    async fn comment(&self, issue_id: &str, body: &str) -> Result<()> {
        self.gh(&["issue", "comment", issue_number(issue_id), "--body", body])
            .await
            .map(|_| ())
    }
}
