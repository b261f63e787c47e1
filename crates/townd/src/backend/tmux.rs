//! tmux-backed implementation of [`Backend`].
//!
//! Every call shells out to the `tmux` binary. Delivery (`send_text`,
//! `send_key`) enforces a minimum interval between sends to the same pane
//! and retries with jittered exponential backoff, mirroring the platform's
//! existing tmux sender.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use town_core::DaemonError;
use uuid::Uuid;

use super::Backend;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 100;
const MIN_SEND_INTERVAL_MS: u64 = 200;

static LAST_SEND_BY_PANE: OnceLock<Mutex<HashMap<String, Instant>>> = OnceLock::new();

fn last_send_map() -> &'static Mutex<HashMap<String, Instant>> {
    LAST_SEND_BY_PANE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_MS * (1 << attempt.saturating_sub(1));
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos());
    let pct = 75 + (nanos % 51) as u64;
    Duration::from_millis(base * pct / 100)
}

/// tmux-backed agent-presence adapter.
#[derive(Debug, Clone, Default)]
pub struct TmuxBackend;

impl TmuxBackend {
    fn transient(name: &str, message: impl Into<String>) -> DaemonError {
        DaemonError::TransientBackend {
            identity: town_core::Identity {
                role: town_core::Role::Boot,
                rig: None,
                name: Some(name.to_string()),
            },
            message: message.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output, DaemonError> {
        Command::new("tmux")
            .args(args)
            .output()
            .map_err(|e| DaemonError::AdapterNotFound {
                command: "tmux".to_string(),
                message: e.to_string(),
            })
    }

    async fn enforce_min_send_interval(&self, name: &str) {
        let delay = {
            let guard = last_send_map().lock();
            if let Ok(map) = guard {
                map.get(name)
                    .and_then(|last| {
                        let elapsed = last.elapsed();
                        if elapsed < Duration::from_millis(MIN_SEND_INTERVAL_MS) {
                            Some(Duration::from_millis(MIN_SEND_INTERVAL_MS) - elapsed)
                        } else {
                            None
                        }
                    })
                    .unwrap_or_default()
            } else {
                Duration::ZERO
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Ok(mut map) = last_send_map().lock() {
            map.insert(name.to_string(), Instant::now());
        }
    }

    fn send_with_retry<F>(&self, name: &str, mut attempt_fn: F) -> Result<(), DaemonError>
    where
        F: FnMut() -> Result<(), DaemonError>,
    {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match attempt_fn() {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
            if attempt < MAX_ATTEMPTS {
                std::thread::sleep(backoff_with_jitter(attempt));
            }
        }
        Err(last_err.unwrap_or_else(|| Self::transient(name, "unknown delivery failure")))
    }
}

#[async_trait]
impl Backend for TmuxBackend {
    async fn has_session(&self, name: &str) -> Result<bool, DaemonError> {
        let output = self.run(&["has-session", "-t", name])?;
        Ok(output.status.success())
    }

    async fn session_agent_alive(&self, name: &str) -> Result<bool, DaemonError> {
        if !self.has_session(name).await? {
            return Ok(false);
        }
        // A pane whose current command is a shell (not the runtime) means
        // the runtime has exited and the pane is a zombie.
        let output = self.run(&["list-panes", "-t", name, "-F", "#{pane_current_command}"])?;
        if !output.status.success() {
            return Ok(false);
        }
        let commands = String::from_utf8_lossy(&output.stdout);
        Ok(commands.lines().any(|c| !matches!(c.trim(), "bash" | "zsh" | "sh" | "")))
    }

    async fn new_session(&self, name: &str, work_dir: &Path) -> Result<(), DaemonError> {
        let work_dir = work_dir.to_string_lossy().to_string();
        let output = self.run(&["new-session", "-d", "-s", name, "-c", &work_dir])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::transient(name, format!("tmux new-session failed: {stderr}")));
        }
        Ok(())
    }

    async fn kill_session_with_processes(&self, name: &str) -> Result<(), DaemonError> {
        let output = self.run(&["kill-session", "-t", name])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Killing an already-gone session is not an error.
            if !stderr.contains("session not found") {
                return Err(Self::transient(name, format!("tmux kill-session failed: {stderr}")));
            }
        }
        Ok(())
    }

    async fn set_env(&self, name: &str, key: &str, value: &str) -> Result<(), DaemonError> {
        let output = self.run(&["set-environment", "-t", name, key, value])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::transient(name, format!("tmux set-environment failed: {stderr}")));
        }
        Ok(())
    }

    async fn send_text(&self, name: &str, text: &str) -> Result<(), DaemonError> {
        self.enforce_min_send_interval(name).await;
        let buffer = format!("town-delivery-{}", Uuid::new_v4());
        self.send_with_retry(name, || {
            let set_output = self.run(&["set-buffer", "-b", &buffer, "--", text])?;
            if !set_output.status.success() {
                let stderr = String::from_utf8_lossy(&set_output.stderr);
                return Err(Self::transient(name, format!("tmux set-buffer failed: {stderr}")));
            }
            let paste_output = self.run(&["paste-buffer", "-d", "-b", &buffer, "-t", name])?;
            if !paste_output.status.success() {
                let stderr = String::from_utf8_lossy(&paste_output.stderr);
                return Err(Self::transient(name, format!("tmux paste-buffer failed: {stderr}")));
            }
            Ok(())
        })
    }

    async fn send_key(&self, name: &str, key_name: &str) -> Result<(), DaemonError> {
        self.enforce_min_send_interval(name).await;
        self.send_with_retry(name, || {
            let output = self.run(&["send-keys", "-t", name, key_name])?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Self::transient(name, format!("tmux send-keys failed: {stderr}")));
            }
            Ok(())
        })
    }

    async fn capture_pane_lines(&self, name: &str, n: u32) -> Result<Vec<String>, DaemonError> {
        let range = format!("-{n}");
        let output = self.run(&["capture-pane", "-p", "-t", name, "-S", &range])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::transient(name, format!("tmux capture-pane failed: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, DaemonError> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}"])?;
        if !output.status.success() {
            // No server running means no sessions, not an error.
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_with_jitter_stays_in_expected_range() {
        let d1 = backoff_with_jitter(1).as_millis() as u64;
        let d2 = backoff_with_jitter(2).as_millis() as u64;
        assert!((75..=125).contains(&d1));
        assert!((150..=250).contains(&d2));
    }
}
