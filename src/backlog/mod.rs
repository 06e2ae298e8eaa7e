//! Backlog seam: where work items and their child issues come from.

mod github;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChildItem, WorkItem};

pub use github::{GhBacklogClient, epic_label};

#[async_trait]
pub trait BacklogClient: Send + Sync {
    async fn get_work_item(&self, id: &str) -> Result<WorkItem>;

    /// Open child issues of the work item, in backlog order.
    async fn get_child_items(&self, id: &str) -> Result<Vec<ChildItem>>;

    /// Post a comment on an issue. Best-effort; the default does nothing.
    async fn comment(&self, _issue_id: &str, _body: &str) -> Result<()> {
        Ok(())
    }
}
