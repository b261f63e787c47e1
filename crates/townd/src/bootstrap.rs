//! Daemon bootstrap: single-instance file lock,
//! PID file with liveness + command-line verification (to defeat PID
//! reuse), and the shutdown marker that short-circuits the supervisor tick.
//!
//! Centralizes cyclic/ad-hoc lifecycle
//! ownership: only the daemon itself writes these files, and only at
//! startup/shutdown, never from a sub-step.

use std::path::{Path, PathBuf};

use sysinfo::{Pid, System};
use tracing::warn;

use town_core::error::DaemonError;
use town_core::io::{try_acquire_lock, FileLock};

pub const DAEMON_LOCK_REL: &str = "daemon/daemon.lock";
pub const PID_FILE_REL: &str = "daemon/daemon.pid";
pub const SHUTDOWN_MARKER_REL: &str = "daemon/shutdown.lock";

/// The process name a live daemon's PID file entry must match, used to
/// distinguish a genuine daemon process from an unrelated process that
/// happens to have been assigned the same, reused PID.
const PROCESS_NAME: &str = "townd";

/// Acquire the town's exclusive daemon lock. A second daemon start on the
/// same town fails immediately (non-blocking) with [`DaemonError::LockHeld`]
/// rather than waiting for the first to exit.
pub fn acquire_daemon_lock(town_root: &Path) -> Result<FileLock, DaemonError> {
    let path = town_root.join(DAEMON_LOCK_REL);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DaemonError::io(parent, e))?;
    }
    try_acquire_lock(&path).map_err(|e| match e {
        DaemonError::LockTimeout { .. } => DaemonError::LockHeld,
        other => other,
    })
}

/// Write the current process's PID to `daemon/daemon.pid`.
pub fn write_pid_file(town_root: &Path) -> Result<(), DaemonError> {
    let path = town_root.join(PID_FILE_REL);
    let pid = std::process::id();
    town_core::io::atomic_write(&path, format!("{pid}\n").as_bytes()).map_err(|e| DaemonError::io(&path, e))
}

pub fn remove_pid_file(town_root: &Path) {
    let path = town_root.join(PID_FILE_REL);
    let _ = std::fs::remove_file(path);
}

/// Checks a pre-existing `daemon.pid` against the live process table. A PID
/// file surviving from a crashed daemon whose PID has since been reused by
/// an unrelated process must not be mistaken for a still-running daemon;
/// this check uses command-line inspection (not just signal-0 liveness)
/// to tell them apart. Removes the file if it's stale and returns whether a
/// genuine daemon process was found alive.
pub fn check_stale_pid_file(town_root: &Path) -> bool {
    let path = town_root.join(PID_FILE_REL);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<usize>() else {
        let _ = std::fs::remove_file(&path);
        return false;
    };

    let mut system = System::new();
    let sys_pid = Pid::from(pid);
    system.refresh_process(sys_pid);
    let alive = system
        .process(sys_pid)
        .map(|p| p.name().to_string_lossy().contains(PROCESS_NAME))
        .unwrap_or(false);

    if !alive {
        warn!(pid, "removing stale daemon.pid (PID not alive or reused by another process)");
        let _ = std::fs::remove_file(&path);
    }
    alive
}

pub fn shutdown_marker_path(town_root: &Path) -> PathBuf {
    town_root.join(SHUTDOWN_MARKER_REL)
}

pub fn shutdown_requested(town_root: &Path) -> bool {
    shutdown_marker_path(town_root).exists()
}

/// Write the shutdown marker, used by the `stop` CLI subcommand to signal a
/// coordinated shutdown in progress and suspend further supervisor ticks.
pub fn request_shutdown(town_root: &Path) -> Result<(), DaemonError> {
    let path = shutdown_marker_path(town_root);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DaemonError::io(parent, e))?;
    }
    std::fs::write(&path, b"").map_err(|e| DaemonError::io(&path, e))
}

pub fn clear_shutdown_marker(town_root: &Path) {
    let _ = std::fs::remove_file(shutdown_marker_path(town_root));
}
