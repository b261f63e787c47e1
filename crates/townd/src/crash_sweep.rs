//! Polecat crash sweep: for each registered polecat with work
//! hooked, re-derive liveness from the backend (never the agent record),
//! and on crash feed the mass-death detector and attempt a restart through
//! the same presence path used elsewhere. A restart failure is escalated
//! to the rig's Witness by mail.

use std::path::Path;

use town_core::config::{RigOperationalState, TimingConfig};
use town_core::error::DaemonError;
use town_core::event_log::EventLogConfig;
use town_core::Identity;

use crate::backend::Backend;
use crate::issues::{IssueQuery, IssueTracker};
use crate::mail::MailClient;
use crate::mass_death::MassDeathDetector;
use crate::presence::{self, StartupProfile};
use crate::restart_tracker::RestartTracker;

/// One polecat's crash-sweep outcome, returned for logging/tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Alive,
    NoHookedWork,
    CrashedRestarted,
    CrashedRestartFailed,
}

/// Sweep `polecats` for crashed agents: alive is always re-derived from the
/// backend, never read off the issue tracker's agent record.
#[allow(clippy::too_many_arguments)]
pub async fn sweep(
    issues: &dyn IssueTracker,
    backend: &dyn Backend,
    mail: &dyn MailClient,
    detector: &mut MassDeathDetector,
    restart_tracker: &RestartTracker,
    polecats: &[Identity],
    work_dir_for: impl Fn(&Identity) -> std::path::PathBuf,
    timing: &TimingConfig,
    event_log_cfg: &EventLogConfig,
) -> Result<Vec<(Identity, SweepOutcome)>, DaemonError> {
    let mut outcomes = Vec::new();
    for identity in polecats {
        let outcome = sweep_one(
            issues,
            backend,
            mail,
            detector,
            restart_tracker,
            identity,
            work_dir_for(identity).as_path(),
            timing,
            event_log_cfg,
        )
        .await?;
        outcomes.push((identity.clone(), outcome));
    }
    Ok(outcomes)
}

#[allow(clippy::too_many_arguments)]
async fn sweep_one(
    issues: &dyn IssueTracker,
    backend: &dyn Backend,
    mail: &dyn MailClient,
    detector: &mut MassDeathDetector,
    restart_tracker: &RestartTracker,
    identity: &Identity,
    work_dir: &Path,
    timing: &TimingConfig,
    event_log_cfg: &EventLogConfig,
) -> Result<SweepOutcome, DaemonError> {
    let query = IssueQuery {
        assignee: Some(identity.to_string()),
        ..Default::default()
    };
    let record = issues.list(&query).await?.into_iter().next();
    let hooked = record.map(|r| !r.hook_bead.is_empty()).unwrap_or(false);
    if !hooked {
        return Ok(SweepOutcome::NoHookedWork);
    }

    let session = identity.session_name();
    let alive = backend.has_session(&session).await? && backend.session_agent_alive(&session).await?;
    if alive {
        return Ok(SweepOutcome::Alive);
    }

    detector.record_death(&session, timing, event_log_cfg);

    match presence::ensure_present(
        backend,
        identity,
        work_dir,
        RigOperationalState::Active,
        restart_tracker,
        timing,
        &StartupProfile::default(),
    )
    .await
    {
        Ok(_) => Ok(SweepOutcome::CrashedRestarted),
        Err(e) => {
            if let Some(rig) = &identity.rig {
                let witness = Identity::witness(rig).to_string();
                let body = format!("Failed to restart crashed polecat {identity}: {e}");
                mail.send(&witness, "polecat restart failed", &body).await?;
            }
            Ok(SweepOutcome::CrashedRestartFailed)
        }
    }
}
