//! In-memory mock issue tracker for testing the crash sweep, GUPP check and
//! orphan check without a real `bd` installation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use town_core::DaemonError;

use super::{Issue, IssueQuery, IssueTracker};

#[derive(Default)]
struct MockState {
    issues: HashMap<String, Issue>,
}

/// In-memory [`IssueTracker`] double.
#[derive(Clone, Default)]
pub struct MockIssueTracker {
    state: Arc<Mutex<MockState>>,
}

impl MockIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, issue: Issue) {
        self.state.lock().unwrap().issues.insert(issue.id.clone(), issue);
    }
}

#[async_trait]
impl IssueTracker for MockIssueTracker {
    async fn list(&self, query: &IssueQuery) -> Result<Vec<Issue>, DaemonError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .issues
            .values()
            .filter(|i| query.issue_type.as_deref().is_none_or(|t| i.issue_type.as_deref() == Some(t)))
            .filter(|i| query.label.as_deref().is_none_or(|l| i.label.as_deref() == Some(l)))
            .filter(|i| query.status.as_deref().is_none_or(|s| i.status.as_deref() == Some(s)))
            .filter(|i| query.assignee.as_deref().is_none_or(|a| i.assignee.as_deref() == Some(a)))
            .cloned()
            .collect())
    }

    async fn show(&self, id: &str) -> Result<Issue, DaemonError> {
        self.state
            .lock()
            .unwrap()
            .issues
            .get(id)
            .cloned()
            .ok_or_else(|| DaemonError::AdapterNotFound {
                command: "bd".to_string(),
                message: format!("no such issue: {id}"),
            })
    }

    async fn update(&self, id: &str, fields: &HashMap<String, String>) -> Result<(), DaemonError> {
        let mut state = self.state.lock().unwrap();
        let issue = state.issues.get_mut(id).ok_or_else(|| DaemonError::AdapterNotFound {
            command: "bd".to_string(),
            message: format!("no such issue: {id}"),
        })?;
        if let Some(v) = fields.get("hook_bead") {
            issue.hook_bead = v.clone();
        }
        if let Some(v) = fields.get("agent_state") {
            issue.agent_state = Some(v.clone());
        }
        if let Some(v) = fields.get("status") {
            issue.status = Some(v.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: &str, hook_bead: &str) -> Issue {
        Issue {
            id: id.to_string(),
            issue_type: Some("polecat-work".to_string()),
            label: None,
            status: Some("open".to_string()),
            assignee: Some("alpha/polecats/p1".to_string()),
            hook_bead: hook_bead.to_string(),
            agent_state: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn update_sets_hook_bead_column() {
        let tracker = MockIssueTracker::new();
        tracker.insert(issue("i1", "bead-1"));

        let mut fields = HashMap::new();
        fields.insert("hook_bead".to_string(), String::new());
        tracker.update("i1", &fields).await.unwrap();

        let shown = tracker.show("i1").await.unwrap();
        assert_eq!(shown.hook_bead, "");
    }

    #[tokio::test]
    async fn list_filters_by_assignee() {
        let tracker = MockIssueTracker::new();
        tracker.insert(issue("i1", "bead-1"));
        tracker.insert(Issue { assignee: Some("alpha/polecats/p2".to_string()), ..issue("i2", "bead-2") });

        let query = IssueQuery {
            assignee: Some("alpha/polecats/p1".to_string()),
            ..Default::default()
        };
        let results = tracker.list(&query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "i1");
    }
}
