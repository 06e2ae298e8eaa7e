use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::CheckoutProvider;
use crate::models::{Checkout, TaskContext};
use crate::util::slugify;

/// One `git worktree` per task under `<repo>/<worktree_dir>/`.
pub struct GitWorktreeProvider {
    repo_dir: PathBuf,
    base_branch: String,
    worktree_dir: String,
}

impl GitWorktreeProvider {
    pub fn new(repo_dir: impl Into<PathBuf>, base_branch: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            base_branch: base_branch.into(),
            worktree_dir: ".worktrees".to_string(),
        }
    }

    pub fn with_worktree_dir(mut self, dir: impl Into<String>) -> Self {
        self.worktree_dir = dir.into();
        self
    }

    pub fn branch_name(ctx: &TaskContext) -> String {
        let short_exec: String = ctx.execution_id.chars().take(8).collect();
        format!(
            "forgeflow/{}-issue-{}-{}",
            short_exec,
            ctx.issue_number,
            slugify(&ctx.title, 30)
        )
    }

    fn checkout_path(&self, ctx: &TaskContext) -> PathBuf {
        self.repo_dir
            .join(&self.worktree_dir)
            .join(format!("task-{}", ctx.task_id))
    }

    async fn git(&self, args: &[&str], path: Option<&Path>) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(path) = path {
            cmd.arg(path);
        }
        let output = cmd
            .current_dir(&self.repo_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl CheckoutProvider for GitWorktreeProvider {
    async fn provision(&self, ctx: &TaskContext) -> Result<Checkout> {
        let branch = Self::branch_name(ctx);
        let path = self.checkout_path(ctx);
        let parent = path
            .parent()
            .context("Worktree path has no parent directory")?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;

        self.git(
            &["worktree", "add", "-b", &branch, path_str, &self.base_branch],
            None,
        )
        .await?;
        debug!(task_id = %ctx.task_id, branch = %branch, path = %path.display(), "Worktree created");

        Ok(Checkout {
            id: ctx.task_id.clone(),
            path,
            branch: Some(branch),
        })
    }

    async fn cleanup(&self, checkout: &Checkout) -> Result<()> {
        self.git(&["worktree", "remove", "--force"], Some(&checkout.path))
            .await?;
        if let Some(branch) = &checkout.branch
            && let Err(e) = self.git(&["branch", "-D", branch], None).await
        {
            warn!(branch = %branch, "Failed to delete task branch: {:#}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> TaskContext {
        TaskContext {
            execution_id: "0f3c9a12-aaaa-bbbb-cccc-000000000000".to_string(),
            task_id: "task-uuid".to_string(),
            work_item_id: "1".to_string(),
            issue_id: "12".to_string(),
            issue_number: 12,
            title: "Add OAuth login!".to_string(),
            worker_type: "code-implementer".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_branch_name_is_slugged() {
        assert_eq!(
            GitWorktreeProvider::branch_name(&ctx()),
            "forgeflow/0f3c9a12-issue-12-add-oauth-login"
        );
    }

    #[test]
    fn test_checkout_path_under_worktree_dir() {
        let provider = GitWorktreeProvider::new("/repo", "main").with_worktree_dir(".wt");
        assert_eq!(
            provider.checkout_path(&ctx()),
            PathBuf::from("/repo/.wt/task-task-uuid")
        );
    }

    #[tokio::test]
    async fn test_provision_outside_repo_fails() {
        let dir = tempfile::tempdir().unwrap();
        let provider = GitWorktreeProvider::new(dir.path(), "main");
        let err = provider.provision(&ctx()).await.unwrap_err();
        assert!(format!("{err:#}").contains("git worktree add"));
    }
}
