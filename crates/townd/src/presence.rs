//! Agent presence checker: for each expected agent, ensure a live session
//! exists and start one if absent.
//!
//! Algorithm: compute identity, check rig operational state, query
//! the backend for session existence, query agent-alive, kill-then-recreate
//! a zombie (session present, runtime dead), and on create inject the
//! environment, wait for the runtime-ready signal, then inject the startup
//! prompt. A spawn error is non-fatal to the tick; the next tick retries.

use std::path::Path;
use std::time::Duration;

use town_core::config::{RigOperationalState, TimingConfig};
use town_core::error::DaemonError;
use town_core::Identity;

use crate::backend::Backend;
use crate::restart_tracker::RestartTracker;

/// Outcome of one presence check, used for logging and boot-triage's own
/// first step ("check Deacon session exists — if not, call presence,
/// record start").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceResult {
    /// The session already existed with a live runtime.
    AlreadyRunning,
    /// A new session was created.
    Started,
    /// The rig is parked or docked; auto-start was skipped.
    SkippedParked,
    /// The identity is in a crash loop; manual clear required.
    CrashLoop,
    /// Backoff from the last restart attempt has not yet elapsed.
    BackoffPending,
}

/// Per-identity environment and startup text the caller wants injected into
/// a freshly created session. Both fields are optional: a bare presence
/// check with no env/prompt still creates the session.
#[derive(Debug, Clone, Default)]
pub struct StartupProfile<'a> {
    pub env: &'a [(&'a str, &'a str)],
    pub startup_prompt: Option<&'a str>,
}

/// Ensure `identity` has a live session, creating (or zombie-recovering)
/// one if necessary.
pub async fn ensure_present(
    backend: &dyn Backend,
    identity: &Identity,
    work_dir: &Path,
    rig_state: RigOperationalState,
    restart_tracker: &RestartTracker,
    timing: &TimingConfig,
    startup: &StartupProfile<'_>,
) -> Result<PresenceResult, DaemonError> {
    if rig_state.skips_auto_start() {
        return Ok(PresenceResult::SkippedParked);
    }

    let session = identity.session_name();

    if backend.has_session(&session).await? {
        if backend.session_agent_alive(&session).await? {
            return Ok(PresenceResult::AlreadyRunning);
        }
        // Zombie: session present, runtime dead. Kill with all descendants
        // and fall through to create.
        backend.kill_session_with_processes(&session).await?;
    }

    let identity_str = identity.to_string();
    if restart_tracker.is_crash_looping(&identity_str)? {
        return Ok(PresenceResult::CrashLoop);
    }
    if !restart_tracker.should_restart(&identity_str, timing)? {
        return Ok(PresenceResult::BackoffPending);
    }
    restart_tracker.record_restart(&identity_str, timing)?;

    spawn(backend, &session, work_dir, timing, startup).await?;
    Ok(PresenceResult::Started)
}

async fn spawn(
    backend: &dyn Backend,
    session: &str,
    work_dir: &Path,
    timing: &TimingConfig,
    startup: &StartupProfile<'_>,
) -> Result<(), DaemonError> {
    backend.new_session(session, work_dir).await?;
    for (key, value) in startup.env {
        backend.set_env(session, key, value).await?;
    }
    wait_for_runtime_ready(backend, session, timing).await?;
    if let Some(prompt) = startup.startup_prompt {
        backend.send_text(session, prompt).await?;
        backend.send_key(session, "Enter").await?;
    }
    Ok(())
}

/// Poll `session_agent_alive` until it reports true or the configured
/// "Claude start timeout" elapses. A timeout is not treated as fatal: the
/// session was created and the next tick's presence check re-evaluates it.
async fn wait_for_runtime_ready(backend: &dyn Backend, session: &str, timing: &TimingConfig) -> Result<(), DaemonError> {
    let deadline = std::time::Instant::now() + Duration::from_secs(timing.runtime_ready_timeout_secs);
    let poll = Duration::from_millis(timing.runtime_ready_poll_millis);
    loop {
        if backend.session_agent_alive(session).await.unwrap_or(false) {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            return Ok(());
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RestartTracker, TimingConfig) {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        let mut timing = TimingConfig::default();
        timing.runtime_ready_timeout_secs = 0;
        (temp, RestartTracker::new(temp.path()), timing)
    }

    #[tokio::test]
    async fn absent_session_is_created() {
        let (temp, tracker, timing) = setup();
        let backend = MockBackend::new();
        let identity = Identity::witness("alpha");

        let result = ensure_present(
            &backend,
            &identity,
            temp.path(),
            RigOperationalState::Active,
            &tracker,
            &timing,
            &StartupProfile::default(),
        )
        .await
        .unwrap();

        assert_eq!(result, PresenceResult::Started);
        assert!(backend.has_session(&identity.session_name()).await.unwrap());
    }

    #[tokio::test]
    async fn live_session_is_already_running() {
        let (temp, tracker, timing) = setup();
        let backend = MockBackend::new();
        let identity = Identity::witness("alpha");
        backend.new_session(&identity.session_name(), temp.path()).await.unwrap();

        let result = ensure_present(
            &backend,
            &identity,
            temp.path(),
            RigOperationalState::Active,
            &tracker,
            &timing,
            &StartupProfile::default(),
        )
        .await
        .unwrap();

        assert_eq!(result, PresenceResult::AlreadyRunning);
    }

    #[tokio::test]
    async fn zombie_session_is_killed_then_recreated() {
        let (temp, tracker, timing) = setup();
        let backend = MockBackend::new();
        let identity = Identity::witness("alpha");
        backend.mark_zombie(&identity.session_name());

        let result = ensure_present(
            &backend,
            &identity,
            temp.path(),
            RigOperationalState::Active,
            &tracker,
            &timing,
            &StartupProfile::default(),
        )
        .await
        .unwrap();

        assert_eq!(result, PresenceResult::Started);
        assert!(backend.session_agent_alive(&identity.session_name()).await.unwrap());
    }

    #[tokio::test]
    async fn parked_rig_skips_auto_start() {
        let (temp, tracker, timing) = setup();
        let backend = MockBackend::new();
        let identity = Identity::witness("alpha");

        let result = ensure_present(
            &backend,
            &identity,
            temp.path(),
            RigOperationalState::Parked,
            &tracker,
            &timing,
            &StartupProfile::default(),
        )
        .await
        .unwrap();

        assert_eq!(result, PresenceResult::SkippedParked);
        assert_eq!(backend.session_count(), 0);
    }

    #[tokio::test]
    async fn crash_looping_identity_is_not_restarted() {
        let (temp, tracker, timing) = setup();
        let backend = MockBackend::new();
        let identity = Identity::witness("alpha");
        for _ in 0..timing.restart_crash_loop_threshold {
            tracker.record_restart(&identity.to_string(), &timing).unwrap();
        }

        let result = ensure_present(
            &backend,
            &identity,
            temp.path(),
            RigOperationalState::Active,
            &tracker,
            &timing,
            &StartupProfile::default(),
        )
        .await
        .unwrap();

        assert_eq!(result, PresenceResult::CrashLoop);
        assert_eq!(backend.session_count(), 0);
    }

    #[tokio::test]
    async fn startup_profile_injects_env_and_prompt() {
        let (temp, tracker, timing) = setup();
        let backend = MockBackend::new();
        let identity = Identity::witness("alpha");
        let startup = StartupProfile {
            env: &[("GASTOWN_ROLE", "witness")],
            startup_prompt: Some("begin"),
        };

        ensure_present(
            &backend,
            &identity,
            temp.path(),
            RigOperationalState::Active,
            &tracker,
            &timing,
            &startup,
        )
        .await
        .unwrap();

        let session = identity.session_name();
        assert!(backend.calls().iter().any(|c| matches!(
            c,
            crate::backend::mock::MockCall::SendText { name, text } if name == &session && text == "begin"
        )));
    }
}
