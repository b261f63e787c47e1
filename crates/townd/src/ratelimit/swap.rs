//! Profile swap orchestration: stop the current session, start it back up
//! on the newly selected profile, re-hook any in-flight issue claim, and
//! inject the transition prelude configured for the (from, to) pair.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use town_core::config::RolePolicy;
use town_core::event_log::{self, DaemonEvent, EventLogConfig};
use town_core::Identity;

use crate::backend::Backend;
use crate::issues::{IssueQuery, IssueTracker};

const RESUMED_NOTE: &str = "resumed after rate-limit swap";

/// Result of a completed swap, used for logging and tests.
#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub from: Option<String>,
    pub to: String,
    pub prelude: Option<String>,
    /// The hook-bead re-hooked onto the agent's in-flight issue, if one was
    /// claimed before the swap and the re-hook succeeded.
    pub rehooked_bead: Option<String>,
}

/// Stop `identity`'s session, start it again under `new_profile`, re-hook
/// any in-flight issue claim, and inject the matching transition prelude
/// (plus a short resumed-after-swap note) if one is configured.
pub async fn swap_profile(
    backend: &dyn Backend,
    issues: &dyn IssueTracker,
    identity: &Identity,
    work_dir: &Path,
    policy: &RolePolicy,
    from_profile: Option<&str>,
    to_profile: &str,
    event_log_cfg: &EventLogConfig,
) -> Result<SwapOutcome, town_core::DaemonError> {
    let session = identity.session_name();

    let query = IssueQuery {
        assignee: Some(identity.to_string()),
        ..Default::default()
    };
    let claimed = issues.list(&query).await?.into_iter().find(|i| !i.hook_bead.is_empty());

    if backend.has_session(&session).await? {
        backend.kill_session_with_processes(&session).await?;
    }
    backend.new_session(&session, work_dir).await?;
    backend.set_env(&session, "GASTOWN_PROFILE", to_profile).await?;

    // Re-hooking is best-effort: the work may already have been picked up
    // by another agent while this one was down, in which case the update
    // is simply skipped.
    let mut rehooked_bead = None;
    if let Some(issue) = &claimed {
        let mut fields = HashMap::new();
        fields.insert("hook_bead".to_string(), issue.hook_bead.clone());
        if issues.update(&issue.id, &fields).await.is_ok() {
            rehooked_bead = Some(issue.hook_bead.clone());
        }
    }

    let prelude = policy
        .transition_rules
        .iter()
        .find(|r| r.matches(from_profile.unwrap_or("*"), to_profile))
        .map(|r| r.prelude.clone());

    if let Some(text) = &prelude {
        backend.send_text(&session, text).await?;
        backend.send_key(&session, "Enter").await?;
    }
    backend.send_text(&session, RESUMED_NOTE).await?;
    backend.send_key(&session, "Enter").await?;

    let mut event = DaemonEvent::new("instance_swap")
        .with_identity(identity.to_string())
        .with_field("to", to_profile.to_string());
    event.role = Some(identity.role.as_str().to_string());
    event.rig = identity.rig.clone();
    if let Some(from) = from_profile {
        event = event.with_field("from", from.to_string());
    }
    event_log::emit(event_log_cfg, event);

    Ok(SwapOutcome {
        from: from_profile.map(String::from),
        to: to_profile.to_string(),
        prelude,
        rehooked_bead,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockCall};
    use crate::issues::mock::MockIssueTracker;
    use crate::issues::Issue;
    use town_core::config::TransitionRule;
    use tempfile::TempDir;

    fn policy() -> RolePolicy {
        RolePolicy {
            fallback_chain: vec!["anthropic-backup".to_string()],
            cooldown_secs: Some(1800),
            preferred_provider: Some("anthropic-main".to_string()),
            only_failover_if_all_preferred_cooling: true,
            transition_rules: vec![TransitionRule {
                from: "*".to_string(),
                to: "anthropic-backup".to_string(),
                trigger: "rate_limit".to_string(),
                prelude: "note: you have been swapped to the backup profile".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn swap_kills_old_session_and_starts_new_one_with_prelude() {
        let backend = Arc::new(MockBackend::new());
        let issues = MockIssueTracker::new();
        let identity = Identity::witness("alpha");
        let temp = TempDir::new().unwrap();
        let event_cfg = EventLogConfig::for_town_root(temp.path());

        backend
            .new_session(&identity.session_name(), temp.path())
            .await
            .unwrap();

        let outcome = swap_profile(
            backend.as_ref(),
            &issues,
            &identity,
            temp.path(),
            &policy(),
            Some("anthropic-main"),
            "anthropic-backup",
            &event_cfg,
        )
        .await
        .unwrap();

        assert_eq!(outcome.to, "anthropic-backup");
        assert!(outcome.prelude.is_some());
        assert!(backend.has_session(&identity.session_name()).await.unwrap());
        assert!(backend
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::SendText { text, .. } if text == RESUMED_NOTE)));
    }

    #[tokio::test]
    async fn swap_rehooks_the_agents_claimed_issue() {
        let backend = Arc::new(MockBackend::new());
        let issues = MockIssueTracker::new();
        let identity = Identity::witness("alpha");
        let temp = TempDir::new().unwrap();
        let event_cfg = EventLogConfig::for_town_root(temp.path());

        backend
            .new_session(&identity.session_name(), temp.path())
            .await
            .unwrap();
        issues.insert(Issue {
            id: "i1".to_string(),
            issue_type: Some("polecat-work".to_string()),
            label: None,
            status: Some("open".to_string()),
            assignee: Some(identity.to_string()),
            hook_bead: "bead-1".to_string(),
            agent_state: None,
            updated_at: None,
        });

        let outcome = swap_profile(
            backend.as_ref(),
            &issues,
            &identity,
            temp.path(),
            &policy(),
            Some("anthropic-main"),
            "anthropic-backup",
            &event_cfg,
        )
        .await
        .unwrap();

        assert_eq!(outcome.rehooked_bead, Some("bead-1".to_string()));
        let shown = issues.show("i1").await.unwrap();
        assert_eq!(shown.hook_bead, "bead-1");
    }

    #[tokio::test]
    async fn swap_without_a_claimed_issue_leaves_rehooked_bead_none() {
        let backend = Arc::new(MockBackend::new());
        let issues = MockIssueTracker::new();
        let identity = Identity::witness("alpha");
        let temp = TempDir::new().unwrap();
        let event_cfg = EventLogConfig::for_town_root(temp.path());

        backend
            .new_session(&identity.session_name(), temp.path())
            .await
            .unwrap();

        let outcome = swap_profile(
            backend.as_ref(),
            &issues,
            &identity,
            temp.path(),
            &policy(),
            Some("anthropic-main"),
            "anthropic-backup",
            &event_cfg,
        )
        .await
        .unwrap();

        assert_eq!(outcome.rehooked_bead, None);
    }
}
