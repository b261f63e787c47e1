//! `bd` CLI-shelled issue tracker client.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Command;
use town_core::DaemonError;

use super::{Issue, IssueQuery, IssueTracker};

fn adapter_error(message: impl Into<String>) -> DaemonError {
    DaemonError::AdapterNotFound {
        command: "bd".to_string(),
        message: message.into(),
    }
}

/// Shells out to the `bd` CLI for every operation.
#[derive(Debug, Clone, Default)]
pub struct CliIssueTracker;

#[async_trait]
impl IssueTracker for CliIssueTracker {
    async fn list(&self, query: &IssueQuery) -> Result<Vec<Issue>, DaemonError> {
        let mut args = vec!["list".to_string(), "--json".to_string()];
        if let Some(t) = &query.issue_type {
            args.push(format!("--type={t}"));
        }
        if let Some(l) = &query.label {
            args.push(format!("--label={l}"));
        }
        if let Some(s) = &query.status {
            args.push(format!("--status={s}"));
        }
        if let Some(a) = &query.assignee {
            args.push(format!("--assignee={a}"));
        }

        let output = Command::new("bd")
            .args(&args)
            .output()
            .map_err(|e| adapter_error(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(adapter_error(format!("bd list failed: {stderr}")));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| DaemonError::json("bd list output", e))
    }

    async fn show(&self, id: &str) -> Result<Issue, DaemonError> {
        let output = Command::new("bd")
            .args(["show", id, "--json"])
            .output()
            .map_err(|e| adapter_error(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(adapter_error(format!("bd show failed: {stderr}")));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| DaemonError::json("bd show output", e))
    }

    async fn update(&self, id: &str, fields: &HashMap<String, String>) -> Result<(), DaemonError> {
        let mut args = vec!["update".to_string(), id.to_string()];
        for (k, v) in fields {
            args.push(format!("--{k}={v}"));
        }
        let output = Command::new("bd")
            .args(&args)
            .output()
            .map_err(|e| adapter_error(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(adapter_error(format!("bd update failed: {stderr}")));
        }
        Ok(())
    }
}
