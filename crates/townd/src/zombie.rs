//! Zombie process sweep: identifies runtime child processes with no
//! controlling terminal (`tty == "?"`) matching the runtime's command name,
//! sends `SIGTERM`, waits briefly, escalates to `SIGKILL`, and reports any
//! process that survives both.

use std::time::Duration;

use town_core::error::DaemonError;

/// Outcome of one zombie-process sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZombieSweepResult {
    pub killed: Vec<i32>,
    pub unkillable: Vec<i32>,
}

/// Sweep for orphaned runtime processes matching `command_name` with no
/// controlling terminal, and kill them.
#[cfg(unix)]
pub async fn sweep(command_name: &str, term_wait: Duration) -> Result<ZombieSweepResult, DaemonError> {
    let candidates = list_tty_less_processes(command_name)?;
    let mut result = ZombieSweepResult::default();

    for pid in candidates {
        send_signal(pid, libc::SIGTERM);
        tokio::time::sleep(term_wait).await;
        if !process_exists(pid) {
            result.killed.push(pid);
            continue;
        }

        send_signal(pid, libc::SIGKILL);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if process_exists(pid) {
            result.unkillable.push(pid);
        } else {
            result.killed.push(pid);
        }
    }

    Ok(result)
}

#[cfg(not(unix))]
pub async fn sweep(_command_name: &str, _term_wait: Duration) -> Result<ZombieSweepResult, DaemonError> {
    Ok(ZombieSweepResult::default())
}

#[cfg(unix)]
fn list_tty_less_processes(command_name: &str) -> Result<Vec<i32>, DaemonError> {
    let output = std::process::Command::new("ps")
        .args(["-eo", "pid=,tty=,comm="])
        .output()
        .map_err(|e| DaemonError::AdapterNotFound {
            command: "ps".to_string(),
            message: e.to_string(),
        })?;

    let text = String::from_utf8_lossy(&output.stdout);
    let mut pids = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [pid, tty, comm] = fields[..] else { continue };
        if tty != "?" || !comm.contains(command_name) {
            continue;
        }
        if let Ok(pid) = pid.parse::<i32>() {
            pids.push(pid);
        }
    }
    Ok(pids)
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: i32) {
    unsafe {
        libc::kill(pid, signal);
    }
}

#[cfg(unix)]
fn process_exists(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
