//! Issue-tracker adapter: the narrow interface over the `bd` CLI. Exposes
//! `hook_bead` and `agent_state` as first-class columns on [`Issue`] so the
//! crash sweep, GUPP check and orphan check never need to parse them out of
//! narrative fields.

pub mod cli;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use town_core::DaemonError;

/// An issue (bead) tracked by `bd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    /// Non-empty means "an agent has claimed this work and must execute"
    /// (GUPP). Read from its own column, never parsed from a narrative
    /// field.
    #[serde(default)]
    pub hook_bead: String,
    /// Non-observable agent state (e.g. `"stuck"`, `"awaiting-gate"`,
    /// `"muted"`); never observable running/dead, which is always
    /// re-derived from the backend.
    #[serde(default)]
    pub agent_state: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Filters accepted by [`IssueTracker::list`].
#[derive(Debug, Clone, Default)]
pub struct IssueQuery {
    pub issue_type: Option<String>,
    pub label: Option<String>,
    pub status: Option<String>,
    pub assignee: Option<String>,
}

/// Issue-tracker adapter contract.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn list(&self, query: &IssueQuery) -> Result<Vec<Issue>, DaemonError>;
    async fn show(&self, id: &str) -> Result<Issue, DaemonError>;
    async fn update(&self, id: &str, fields: &HashMap<String, String>) -> Result<(), DaemonError>;
}
