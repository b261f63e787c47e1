//! GUPP ("if you have hooked work, you must execute") and orphan-work
//! checks.
//!
//! Both scan the same set of polecat agent records. GUPP flags a polecat
//! that is alive, has claimed work (`hook_bead` non-empty), and has not
//! progressed (`updated_at`) in 30 minutes. Orphan flags a polecat whose
//! work is claimed but which is no longer alive at all. Liveness is never
//! read from the agent record — always re-derived from the backend, per
//! the daemon's typed split between observable and non-observable state.

use chrono::Utc;

use town_core::config::TimingConfig;
use town_core::error::DaemonError;
use town_core::Identity;

use crate::backend::Backend;
use crate::issues::{Issue, IssueQuery, IssueTracker};
use crate::mail::MailClient;

async fn agent_record(issues: &dyn IssueTracker, identity: &Identity) -> Result<Option<Issue>, DaemonError> {
    let query = IssueQuery {
        assignee: Some(identity.to_string()),
        ..Default::default()
    };
    Ok(issues.list(&query).await?.into_iter().next())
}

async fn is_alive(backend: &dyn Backend, identity: &Identity) -> Result<bool, DaemonError> {
    let session = identity.session_name();
    if !backend.has_session(&session).await? {
        return Ok(false);
    }
    backend.session_agent_alive(&session).await
}

/// Scan `polecats` for GUPP violations: hooked work, alive, stalled for
/// more than `gupp_stall_secs`. Each violator is mailed to its rig's
/// Witness. Returns the violating identities.
pub async fn check_gupp_violations(
    issues: &dyn IssueTracker,
    backend: &dyn Backend,
    mail: &dyn MailClient,
    polecats: &[Identity],
    timing: &TimingConfig,
) -> Result<Vec<Identity>, DaemonError> {
    let mut violators = Vec::new();
    for identity in polecats {
        let Some(record) = agent_record(issues, identity).await? else {
            continue;
        };
        if record.hook_bead.is_empty() {
            continue;
        }
        if !is_alive(backend, identity).await? {
            continue;
        }
        let Some(updated_at) = record.updated_at else {
            continue;
        };
        let stalled_secs = (Utc::now() - updated_at).num_seconds().max(0) as u64;
        if stalled_secs <= timing.gupp_stall_secs {
            continue;
        }

        if let Some(rig) = &identity.rig {
            let witness = Identity::witness(rig).to_string();
            let body = format!(
                "GUPP violation: {identity} has hooked {hook} but has not progressed in {mins} minutes",
                hook = record.hook_bead,
                mins = stalled_secs / 60,
            );
            mail.send(&witness, "GUPP violation", &body).await?;
        }
        violators.push(identity.clone());
    }
    Ok(violators)
}

/// Scan `polecats` for orphaned work: hooked work but no longer alive at
/// all. Each orphan is mailed to its rig's Witness; restart recovery is the
/// crash sweep's responsibility, not this check's. Returns the orphaned
/// identities.
pub async fn check_orphaned_work(
    issues: &dyn IssueTracker,
    backend: &dyn Backend,
    mail: &dyn MailClient,
    polecats: &[Identity],
) -> Result<Vec<Identity>, DaemonError> {
    let mut orphans = Vec::new();
    for identity in polecats {
        let Some(record) = agent_record(issues, identity).await? else {
            continue;
        };
        if record.hook_bead.is_empty() {
            continue;
        }
        if is_alive(backend, identity).await? {
            continue;
        }

        if let Some(rig) = &identity.rig {
            let witness = Identity::witness(rig).to_string();
            let body = format!("Orphaned work: {identity} claimed {hook} but is no longer alive", hook = record.hook_bead);
            mail.send(&witness, "orphaned work", &body).await?;
        }
        orphans.push(identity.clone());
    }
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::issues::mock::MockIssueTracker;
    use crate::mail::mock::MockMailClient;

    fn hooked_issue(assignee: &str, hook_bead: &str, updated_secs_ago: i64) -> Issue {
        Issue {
            id: "bead-1".to_string(),
            issue_type: None,
            label: None,
            status: None,
            assignee: Some(assignee.to_string()),
            hook_bead: hook_bead.to_string(),
            agent_state: None,
            updated_at: Some(Utc::now() - chrono::Duration::seconds(updated_secs_ago)),
        }
    }

    #[tokio::test]
    async fn alive_stalled_polecat_is_a_gupp_violation() {
        let issues = MockIssueTracker::new();
        let backend = MockBackend::new();
        let mail = MockMailClient::new();
        let identity = Identity::polecat("alpha", "p1");
        backend.new_session(&identity.session_name(), std::path::Path::new("/work")).await.unwrap();
        issues.insert(hooked_issue(&identity.to_string(), "bead-1", 31 * 60));

        let violators = check_gupp_violations(&issues, &backend, &mail, &[identity.clone()], &TimingConfig::default())
            .await
            .unwrap();

        assert_eq!(violators, vec![identity]);
        assert_eq!(mail.sent_to("alpha/witness").len(), 1);
    }

    #[tokio::test]
    async fn recently_updated_polecat_is_not_a_violation() {
        let issues = MockIssueTracker::new();
        let backend = MockBackend::new();
        let mail = MockMailClient::new();
        let identity = Identity::polecat("alpha", "p1");
        backend.new_session(&identity.session_name(), std::path::Path::new("/work")).await.unwrap();
        issues.insert(hooked_issue(&identity.to_string(), "bead-1", 60));

        let violators = check_gupp_violations(&issues, &backend, &mail, &[identity], &TimingConfig::default())
            .await
            .unwrap();

        assert!(violators.is_empty());
    }

    #[tokio::test]
    async fn dead_hooked_polecat_is_orphaned() {
        let issues = MockIssueTracker::new();
        let backend = MockBackend::new();
        let mail = MockMailClient::new();
        let identity = Identity::polecat("alpha", "p1");
        issues.insert(hooked_issue(&identity.to_string(), "bead-1", 0));

        let orphans = check_orphaned_work(&issues, &backend, &mail, &[identity.clone()]).await.unwrap();

        assert_eq!(orphans, vec![identity]);
        assert_eq!(mail.sent_to("alpha/witness").len(), 1);
    }

    #[tokio::test]
    async fn empty_hook_bead_is_never_flagged() {
        let issues = MockIssueTracker::new();
        let backend = MockBackend::new();
        let mail = MockMailClient::new();
        let identity = Identity::polecat("alpha", "p1");
        issues.insert(hooked_issue(&identity.to_string(), "", 0));

        let orphans = check_orphaned_work(&issues, &backend, &mail, &[identity]).await.unwrap();
        assert!(orphans.is_empty());
    }
}
