//! Rate-limit detection and fallback-profile management.
//!
//! [`detector`] scans recent pane output for provider rate-limit
//! signatures. [`cooldown`] persists which profiles are currently cooling.
//! [`selector`] walks a role's fallback chain honoring stickiness.
//! [`swap`] performs the actual stop/start/re-hook/prelude-injection.

pub mod cooldown;
pub mod detector;
pub mod selector;
pub mod swap;

use std::path::Path;

use chrono::Utc;
use serde_json::json;

use town_core::config::{ProfileConfig, RolePolicy};
use town_core::event_log::{self, DaemonEvent, EventLogConfig};
use town_core::{DaemonError, Identity};

use crate::backend::Backend;
use crate::issues::IssueTracker;
use cooldown::CooldownStore;

/// Writes one `daemon/ratelimit-events/event-YYYYMMDD-HHMMSS.json` file
/// carrying the rate-limit event record (id, ts, agent, role, rig,
/// current-profile, status-code, error-snippet, swapped-to, cooldown-until).
/// Fail-open, matching the rest of the event-logging stack: a write failure
/// is logged via `tracing` and never aborts the swap.
#[allow(clippy::too_many_arguments)]
fn write_ratelimit_event_file(
    town_root: &Path,
    identity: &Identity,
    current_profile: Option<&str>,
    error_snippet: Option<&str>,
    swapped_to: Option<&str>,
    cooldown_until: chrono::DateTime<Utc>,
) {
    let ts = Utc::now();
    let dir = town_root.join("daemon/ratelimit-events");
    let path = dir.join(format!("event-{}.json", ts.format("%Y%m%d-%H%M%S")));

    let record = json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "ts": ts.to_rfc3339(),
        "agent": identity.to_string(),
        "role": identity.role.as_str(),
        "rig": identity.rig,
        "current_profile": current_profile,
        "status_code": "429",
        "error_snippet": error_snippet,
        "swapped_to": swapped_to,
        "cooldown_until": cooldown_until.to_rfc3339(),
    });

    let result = (|| -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        std::fs::write(&path, serde_json::to_vec_pretty(&record).unwrap_or_default())
    })();

    if let Err(e) = result {
        tracing::warn!(error = %e, path = %path.display(), "failed to write rate-limit event file");
    }
}

/// Check `identity`'s pane for a rate-limit signature and, if found, start
/// a cooldown on the current profile and swap to the next available one.
///
/// Returns `Ok(None)` when no rate limit was detected, `Ok(Some(outcome))`
/// after a successful swap, and `Err(AllProfilesCooling)` when the entire
/// fallback chain is exhausted.
#[allow(clippy::too_many_arguments)]
pub async fn check_and_swap(
    backend: &dyn Backend,
    issues: &dyn IssueTracker,
    identity: &Identity,
    work_dir: &Path,
    town_root: &Path,
    policy: &RolePolicy,
    profiles: &[ProfileConfig],
    current_profile: Option<&str>,
    cooldowns: &CooldownStore,
    cooldown_secs: u64,
    event_log_cfg: &EventLogConfig,
) -> Result<Option<swap::SwapOutcome>, DaemonError> {
    let session = identity.session_name();
    let lines = backend.capture_pane_lines(&session, 40).await?;

    if !detector::looks_rate_limited(&lines) {
        return Ok(None);
    }

    let provider = detector::infer_provider(&lines);
    let error_snippet = detector::matching_line(&lines);
    let mut event = DaemonEvent::new("rate_limit")
        .with_identity(identity.to_string())
        .with_field("provider", provider);
    event.role = Some(identity.role.as_str().to_string());
    event.rig = identity.rig.clone();
    event_log::emit(event_log_cfg, event);

    let cooldown_duration = chrono::Duration::seconds(cooldown_secs as i64);
    if let Some(profile) = current_profile {
        cooldowns.start_cooldown(profile, cooldown_duration, "rate_limit")?;
    }

    let next = selector::select_profile(policy, profiles, cooldowns, current_profile)?.ok_or_else(|| {
        DaemonError::AllProfilesCooling {
            role: identity.role.as_str().to_string(),
        }
    })?;

    write_ratelimit_event_file(
        town_root,
        identity,
        current_profile,
        error_snippet.as_deref(),
        Some(&next),
        Utc::now() + cooldown_duration,
    );

    let outcome = swap::swap_profile(backend, issues, identity, work_dir, policy, current_profile, &next, event_log_cfg).await?;
    Ok(Some(outcome))
}
