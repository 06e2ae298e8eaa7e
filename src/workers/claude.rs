//! Worker backed by the `claude` CLI running inside the task's checkout.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::role_prompt;
use super::stream::{LineEvent, parse_line};
use crate::models::{Checkout, TaskContext};
use crate::pool::{Artifact, ProgressReporter, Worker, WorkerOutput};
use crate::util::truncate;

/// Larger files are reported by path only.
const MAX_ARTIFACT_BYTES: u64 = 256 * 1024;
const MAX_STDERR_CHARS: usize = 2000;

pub struct ClaudeWorker {
    id: String,
    worker_type: String,
    capabilities: Vec<String>,
    program: String,
    base_args: Vec<String>,
}

impl ClaudeWorker {
    /// `claude_cmd` may carry leading arguments, e.g. `npx claude`.
    pub fn new(id: &str, worker_type: &str, claude_cmd: &str) -> Self {
        let mut parts = claude_cmd.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "claude".to_string());
        Self {
            id: id.to_string(),
            worker_type: worker_type.to_string(),
            capabilities: super::capabilities(worker_type),
            program,
            base_args: parts.collect(),
        }
    }

    fn prompt(&self, ctx: &TaskContext, checkout: &Checkout) -> String {
        let branch = checkout.branch.as_deref().unwrap_or("the current branch");
        format!(
            "{role}\n\n\
             ## Task\n\
             Resolve issue #{number}: {title}\n\n\
             Work only inside this directory and commit your changes on {branch}.\n\
             Report progress as you go by printing <progress>N</progress> where N is 0-100.\n\
             Finish with a short summary of what you changed.",
            role = role_prompt(&self.worker_type),
            number = ctx.issue_number,
            title = ctx.title,
        )
    }
}

#[async_trait]
impl Worker for ClaudeWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn worker_type(&self) -> &str {
        &self.worker_type
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
        let prompt = self.prompt(ctx, checkout);
        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args([
                "--print",
                "--dangerously-skip-permissions",
                "--output-format",
                "stream-json",
                "--verbose",
                "-p",
                &prompt,
            ])
            .current_dir(&checkout.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        info!(
            worker = %self.id,
            task_id = %ctx.task_id,
            issue = ctx.issue_number,
            "Agent process started"
        );

        let stdout = child.stdout.take().context("Agent stdout was not captured")?;
        let stderr = child.stderr.take().context("Agent stderr was not captured")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut percent = 0u8;
        let mut summary = None;
        let mut last_text = String::new();
        let mut reported_error = false;

        loop {
            let line = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    warn!(worker = %self.id, task_id = %ctx.task_id, "Cancelled; killing agent process");
                    if let Err(e) = child.kill().await {
                        warn!(worker = %self.id, error = %e, "Failed to kill agent process");
                    }
                    bail!("Agent cancelled");
                }
                line = lines.next_line() => line.context("Failed to read agent output")?,
            };
            let Some(line) = line else { break };

            match parse_line(&line) {
                LineEvent::Progress(p) => {
                    percent = p;
                    progress.report(p, format!("{}%", p));
                }
                LineEvent::Activity(activity) => {
                    debug!(worker = %self.id, %activity, "Agent activity");
                    progress.report(percent, activity);
                }
                LineEvent::Text(text) => last_text = text,
                LineEvent::Finished { result, is_error } => {
                    reported_error = is_error;
                    summary = Some(result);
                }
                LineEvent::Ignored => {}
            }
        }

        let status = child.wait().await.context("Failed to wait for agent process")?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() || reported_error {
            let detail = if stderr.trim().is_empty() {
                summary.clone().unwrap_or_else(|| format!("exit status {}", status))
            } else {
                stderr.trim().to_string()
            };
            bail!("Agent failed: {}", truncate(&detail, MAX_STDERR_CHARS));
        }

        let artifacts = changed_files(&checkout.path).await;
        info!(
            worker = %self.id,
            task_id = %ctx.task_id,
            artifacts = artifacts.len(),
            "Agent process finished"
        );
        Ok(WorkerOutput {
            summary: summary.unwrap_or(last_text),
            artifacts,
        })
    }
}

/// Files added or modified in the checkout, per `git status`. A checkout
/// that is not a git repository yields no artifacts.
async fn changed_files(root: &Path) -> Vec<Artifact> {
    let output = match Command::new("git")
        .args(["status", "--porcelain", "--untracked-files=all"])
        .current_dir(root)
        .output()
        .await
    {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!(
                path = %root.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git status failed; reporting no artifacts"
            );
            return Vec::new();
        }
        Err(e) => {
            debug!(path = %root.display(), error = %e, "git unavailable; reporting no artifacts");
            return Vec::new();
        }
    };

    let mut artifacts = Vec::new();
    for path in parse_porcelain(&String::from_utf8_lossy(&output.stdout)) {
        let full = root.join(&path);
        let content = match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() && meta.len() <= MAX_ARTIFACT_BYTES => {
                tokio::fs::read_to_string(&full).await.unwrap_or_default()
            }
            Ok(_) => String::new(),
            Err(_) => continue,
        };
        artifacts.push(Artifact { path, content });
    }
    artifacts
}

/// Paths from `git status --porcelain` that still exist: deletions are
/// dropped and renames resolve to their new name.
fn parse_porcelain(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .filter_map(|line| {
            let (status, path) = line.split_at(3);
            if status.contains('D') {
                return None;
            }
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            Some(path.trim_matches('"').to_string())
        })
        .collect()
}
