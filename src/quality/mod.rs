//! Quality checkpoint seam: a hard pass/fail gate over a task's checkout.

mod command;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Checkout, QualityIssue};

pub use command::CommandQualityCheckpoint;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
        }
    }

    pub fn from_issues(issues: Vec<QualityIssue>) -> Self {
        Self {
            passed: issues.is_empty(),
            issues,
        }
    }
}

#[async_trait]
pub trait QualityCheckpoint: Send + Sync {
    async fn validate(&self, checkout: &Checkout) -> Result<QualityReport>;
}
