//! Checkout seam: an isolated working copy per task.

mod worktree;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Checkout, TaskContext};

pub use worktree::GitWorktreeProvider;

#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn provision(&self, ctx: &TaskContext) -> Result<Checkout>;

    async fn cleanup(&self, checkout: &Checkout) -> Result<()>;
}
