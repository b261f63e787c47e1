//! Lifecycle processor: a claim-then-execute consumer of the Deacon's
//! inbox. Messages subjected `LIFECYCLE:` carry a JSON (or bare-string,
//! for backward compatibility) action; the processor deletes the message
//! *before* acting on it, so a crash mid-restart never replays the action
//! on the next tick.

use serde::Deserialize;
use std::path::Path;

use town_core::config::{RigOperationalState, TimingConfig};
use town_core::error::DaemonError;
use town_core::Identity;

use crate::backend::Backend;
use crate::mail::{MailClient, Message};

const LIFECYCLE_SUBJECT_PREFIX: &str = "LIFECYCLE:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Restart,
    Shutdown,
    Cycle,
}

#[derive(Deserialize)]
struct LifecyclePayload {
    action: String,
}

fn parse_action(body: &str) -> Option<LifecycleAction> {
    let action_str = serde_json::from_str::<LifecyclePayload>(body)
        .map(|p| p.action)
        .unwrap_or_else(|_| body.trim().to_string());

    match action_str.as_str() {
        "restart" => Some(LifecycleAction::Restart),
        "shutdown" | "stop" => Some(LifecycleAction::Shutdown),
        "cycle" => Some(LifecycleAction::Cycle),
        _ => None,
    }
}

/// Process every `LIFECYCLE:` message in the Deacon's inbox.
///
/// Stale messages (older than `lifecycle_stale_secs`) are deleted without
/// being executed. A rig that is parked or docked refuses restart/cycle
/// actions for its members.
pub async fn process_inbox(
    mail: &dyn MailClient,
    backend: &dyn Backend,
    work_dir_for: impl Fn(&Identity) -> std::path::PathBuf,
    rig_state_for: impl Fn(&str) -> RigOperationalState,
    timing: &TimingConfig,
) -> Result<(), DaemonError> {
    let inbox = mail.inbox("deacon").await?;
    for message in inbox {
        if !message.subject.to_ascii_uppercase().starts_with(LIFECYCLE_SUBJECT_PREFIX) {
            continue;
        }
        handle_message(mail, backend, &message, &work_dir_for, &rig_state_for, timing).await?;
    }
    Ok(())
}

async fn handle_message(
    mail: &dyn MailClient,
    backend: &dyn Backend,
    message: &Message,
    work_dir_for: &impl Fn(&Identity) -> std::path::PathBuf,
    rig_state_for: &impl Fn(&str) -> RigOperationalState,
    timing: &TimingConfig,
) -> Result<(), DaemonError> {
    let now = chrono::Utc::now();
    let age_secs = message.age(now).num_seconds().max(0) as u64;

    // Claim before execute: delete regardless of what happens next so a
    // crash mid-action never replays it.
    mail.delete(&message.id).await?;

    if age_secs > timing.lifecycle_stale_secs {
        return Ok(());
    }

    let identity: Identity = match message.from.parse() {
        Ok(id) => id,
        Err(_) => return Ok(()),
    };

    let Some(action) = parse_action(&message.body) else {
        return Ok(());
    };

    if let Some(rig) = &identity.rig {
        if matches!(action, LifecycleAction::Restart | LifecycleAction::Cycle) && rig_state_for(rig).skips_auto_start() {
            return Ok(());
        }
    }

    execute(backend, &identity, action, work_dir_for(&identity).as_path()).await
}

async fn execute(
    backend: &dyn Backend,
    identity: &Identity,
    action: LifecycleAction,
    work_dir: &Path,
) -> Result<(), DaemonError> {
    let session = identity.session_name();
    match action {
        LifecycleAction::Shutdown => {
            if backend.has_session(&session).await? {
                backend.kill_session_with_processes(&session).await?;
            }
            Ok(())
        }
        LifecycleAction::Restart | LifecycleAction::Cycle => {
            if backend.has_session(&session).await? {
                backend.kill_session_with_processes(&session).await?;
            }
            backend.new_session(&session, work_dir).await
        }
    }
}
