//! Boot triage: a mechanical, fresh-each-tick responsiveness check on the
//! Deacon. The historical "spawn a reasoning session" mode is disabled
//! because it can block on prompts; this is a deterministic decision table
//! only.
//!
//! Algorithm: skip if the `.boot-running` marker is fresh; otherwise ensure
//! the Deacon session exists (recording `start` if it didn't), read the
//! Deacon heartbeat file and escalate nudge → restart on staleness.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use town_core::config::{RigOperationalState, TimingConfig};
use town_core::error::DaemonError;
use town_core::io::atomic_write;
use town_core::Identity;

use crate::backend::Backend;
use crate::presence::{self, StartupProfile};
use crate::restart_tracker::RestartTracker;

const BOOT_NUDGE_TEXT: &str = "[boot] Deacon heartbeat is stale; please confirm you are still working.";

/// The mechanical decision a triage tick reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootAction {
    Start,
    Nudge,
    Restart,
    Nothing,
    Error,
}

/// Persisted `boot-status.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootStatus {
    pub running: bool,
    pub last_action: BootAction,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Paths boot-triage reads and writes, rooted under the town's `deacon/`
/// directory.
struct BootPaths {
    running_marker: PathBuf,
    status_file: PathBuf,
    heartbeat_file: PathBuf,
}

impl BootPaths {
    fn for_town_root(town_root: &Path) -> Self {
        let dir = town_root.join("deacon/dogs/boot");
        BootPaths {
            running_marker: dir.join(".boot-running"),
            status_file: dir.join(".boot-status.json"),
            heartbeat_file: town_root.join("deacon/heartbeat"),
        }
    }
}

fn marker_age(path: &Path) -> Option<std::time::Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn write_status(path: &Path, action: BootAction, target: &str, error: Option<String>) -> Result<(), DaemonError> {
    let status = BootStatus {
        running: false,
        last_action: action,
        target: target.to_string(),
        error,
        ts: Utc::now(),
    };
    let buf = serde_json::to_vec_pretty(&status).map_err(|e| DaemonError::json(path, e))?;
    atomic_write(path, &buf)
}

/// Run one boot-triage tick. Returns the action taken, or `None` if the
/// tick was skipped because the running marker is still fresh.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    town_root: &Path,
    backend: &dyn Backend,
    deacon_work_dir: &Path,
    restart_tracker: &RestartTracker,
    timing: &TimingConfig,
) -> Result<Option<BootAction>, DaemonError> {
    let paths = BootPaths::for_town_root(town_root);
    std::fs::create_dir_all(paths.running_marker.parent().unwrap()).map_err(|e| DaemonError::io(&paths.running_marker, e))?;

    if let Some(age) = marker_age(&paths.running_marker) {
        if age < std::time::Duration::from_secs(timing.boot_running_fresh_secs) {
            return Ok(None);
        }
        // Stale marker: treated as absent and removed.
        let _ = std::fs::remove_file(&paths.running_marker);
    }
    atomic_write(&paths.running_marker, b"")?;

    let identity = Identity::deacon();
    let result = tick(&paths, &identity, backend, deacon_work_dir, restart_tracker, timing).await;

    let _ = std::fs::remove_file(&paths.running_marker);

    match &result {
        Ok(action) => write_status(&paths.status_file, *action, &identity.to_string(), None)?,
        Err(e) => write_status(&paths.status_file, BootAction::Error, &identity.to_string(), Some(e.to_string()))?,
    }

    result.map(Some)
}

async fn tick(
    paths: &BootPaths,
    identity: &Identity,
    backend: &dyn Backend,
    work_dir: &Path,
    restart_tracker: &RestartTracker,
    timing: &TimingConfig,
) -> Result<BootAction, DaemonError> {
    let session = identity.session_name();

    if !backend.has_session(&session).await? {
        presence::ensure_present(
            backend,
            identity,
            work_dir,
            RigOperationalState::Active,
            restart_tracker,
            timing,
            &StartupProfile::default(),
        )
        .await?;
        return Ok(BootAction::Start);
    }

    let age_secs = read_heartbeat_age_secs(&paths.heartbeat_file);

    // Boundaries are inclusive: a heartbeat exactly `boot_restart_age_secs`
    // or `boot_nudge_age_secs` old has already gone stale for that long, not
    // merely approaching it.
    match age_secs {
        Some(age) if age >= timing.boot_restart_age_secs => {
            backend.kill_session_with_processes(&session).await?;
            backend.new_session(&session, work_dir).await?;
            Ok(BootAction::Restart)
        }
        Some(age) if age >= timing.boot_nudge_age_secs => {
            backend.send_text(&session, BOOT_NUDGE_TEXT).await?;
            backend.send_key(&session, "Enter").await?;
            Ok(BootAction::Nudge)
        }
        _ => Ok(BootAction::Nothing),
    }
}

fn read_heartbeat_age_secs(path: &Path) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    let last_tick: DateTime<Utc> = contents.trim().parse().ok()?;
    let age = Utc::now() - last_tick;
    Some(age.num_seconds().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use tempfile::TempDir;

    fn write_heartbeat(town_root: &Path, age_secs: i64) {
        let path = town_root.join("deacon/heartbeat");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let ts = Utc::now() - chrono::Duration::seconds(age_secs);
        std::fs::write(path, ts.to_rfc3339()).unwrap();
    }

    #[tokio::test]
    async fn absent_deacon_session_is_started() {
        let temp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        let tracker = RestartTracker::new(temp.path());
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();

        let action = run(temp.path(), &backend, temp.path(), &tracker, &TimingConfig::default())
            .await
            .unwrap();

        assert_eq!(action, Some(BootAction::Start));
        assert!(backend.has_session("deacon").await.unwrap());
    }

    #[tokio::test]
    async fn fresh_heartbeat_does_nothing() {
        let temp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        backend.new_session("deacon", temp.path()).await.unwrap();
        let tracker = RestartTracker::new(temp.path());
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        write_heartbeat(temp.path(), 60);

        let action = run(temp.path(), &backend, temp.path(), &tracker, &TimingConfig::default())
            .await
            .unwrap();

        assert_eq!(action, Some(BootAction::Nothing));
    }

    #[tokio::test]
    async fn stale_heartbeat_over_15_min_nudges() {
        let temp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        backend.new_session("deacon", temp.path()).await.unwrap();
        let tracker = RestartTracker::new(temp.path());
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        write_heartbeat(temp.path(), 16 * 60);

        let action = run(temp.path(), &backend, temp.path(), &tracker, &TimingConfig::default())
            .await
            .unwrap();

        assert_eq!(action, Some(BootAction::Nudge));
    }

    #[tokio::test]
    async fn stale_heartbeat_over_30_min_restarts() {
        let temp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        backend.new_session("deacon", temp.path()).await.unwrap();
        let tracker = RestartTracker::new(temp.path());
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        write_heartbeat(temp.path(), 31 * 60);

        let action = run(temp.path(), &backend, temp.path(), &tracker, &TimingConfig::default())
            .await
            .unwrap();

        assert_eq!(action, Some(BootAction::Restart));
        assert!(backend.has_session("deacon").await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_exactly_15_min_stale_nudges() {
        let temp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        backend.new_session("deacon", temp.path()).await.unwrap();
        let tracker = RestartTracker::new(temp.path());
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        write_heartbeat(temp.path(), 15 * 60);

        let action = run(temp.path(), &backend, temp.path(), &tracker, &TimingConfig::default())
            .await
            .unwrap();

        assert_eq!(action, Some(BootAction::Nudge));
    }

    #[tokio::test]
    async fn heartbeat_exactly_30_min_stale_restarts() {
        let temp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        backend.new_session("deacon", temp.path()).await.unwrap();
        let tracker = RestartTracker::new(temp.path());
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        write_heartbeat(temp.path(), 30 * 60);

        let action = run(temp.path(), &backend, temp.path(), &tracker, &TimingConfig::default())
            .await
            .unwrap();

        assert_eq!(action, Some(BootAction::Restart));
    }

    #[tokio::test]
    async fn fresh_running_marker_skips_the_tick() {
        let temp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        let tracker = RestartTracker::new(temp.path());
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        let paths = BootPaths::for_town_root(temp.path());
        std::fs::create_dir_all(paths.running_marker.parent().unwrap()).unwrap();
        atomic_write(&paths.running_marker, b"").unwrap();

        let action = run(temp.path(), &backend, temp.path(), &tracker, &TimingConfig::default())
            .await
            .unwrap();

        assert_eq!(action, None);
    }
}
