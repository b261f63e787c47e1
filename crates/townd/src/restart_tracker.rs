//! Per-identity restart history: exponential backoff between restart
//! attempts, crash-loop detection, and stability reset after a quiet period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use town_core::config::TimingConfig;
use town_core::error::DaemonError;
use town_core::io::{acquire_lock, atomic_write};

const LOCK_MAX_RETRIES: u32 = 5;

/// Restart history for one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartState {
    pub count: u32,
    pub first_restart: DateTime<Utc>,
    pub last_restart: DateTime<Utc>,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub crash_loop: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RestartFile {
    #[serde(default)]
    entries: HashMap<String, RestartState>,
}

/// Handle onto the on-disk restart-tracker state for one town.
pub struct RestartTracker {
    path: PathBuf,
    lock_path: PathBuf,
}

impl RestartTracker {
    pub fn new(town_root: &Path) -> Self {
        RestartTracker {
            path: town_root.join("daemon/restart_state.json"),
            lock_path: town_root.join("daemon/restart_state.json.lock"),
        }
    }

    /// Record a restart attempt for `identity` and return the backoff
    /// duration the caller must wait before the restart, plus whether this
    /// restart tips the identity into a crash loop.
    pub fn record_restart(&self, identity: &str, timing: &TimingConfig) -> Result<(std::time::Duration, bool), DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let mut file = self.load_locked()?;
        let now = Utc::now();

        let state = file.entries.entry(identity.to_string()).or_insert_with(|| RestartState {
            count: 0,
            first_restart: now,
            last_restart: now,
            last_success: None,
            crash_loop: false,
        });

        let stable_window_secs = timing.restart_stability_reset_secs as i64;
        if (now - state.last_restart).num_seconds() > stable_window_secs {
            state.count = 0;
            state.first_restart = now;
            state.crash_loop = false;
        }

        state.count += 1;
        state.last_restart = now;

        let window_secs = timing.restart_crash_loop_window_secs as i64;
        if (now - state.first_restart).num_seconds() <= window_secs
            && state.count >= timing.restart_crash_loop_threshold
        {
            state.crash_loop = true;
        }

        let backoff = backoff_for_count(state.count, timing);
        let crash_loop = state.crash_loop;
        self.save_locked(&file)?;
        Ok((backoff, crash_loop))
    }

    /// Record a successful, stable run, used to decide future resets.
    pub fn record_success(&self, identity: &str) -> Result<(), DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let mut file = self.load_locked()?;
        if let Some(state) = file.entries.get_mut(identity) {
            state.last_success = Some(Utc::now());
        }
        self.save_locked(&file)
    }

    /// Manually clear an identity's crash-loop flag and history (operator
    /// override).
    pub fn clear(&self, identity: &str) -> Result<(), DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let mut file = self.load_locked()?;
        file.entries.remove(identity);
        self.save_locked(&file)
    }

    pub fn is_crash_looping(&self, identity: &str) -> Result<bool, DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        Ok(self
            .load_locked()?
            .entries
            .get(identity)
            .map(|s| s.crash_loop)
            .unwrap_or(false))
    }

    /// Whether a restart should be attempted now: false while the identity is
    /// crash-looping, and false while the exponential backoff computed from
    /// its last restart has not yet elapsed.
    pub fn should_restart(&self, identity: &str, timing: &TimingConfig) -> Result<bool, DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let file = self.load_locked()?;
        let Some(state) = file.entries.get(identity) else {
            return Ok(true);
        };
        if state.crash_loop {
            return Ok(false);
        }
        let backoff = backoff_for_count(state.count, timing);
        let elapsed = Utc::now() - state.last_restart;
        Ok(elapsed >= chrono::Duration::from_std(backoff).unwrap_or_default())
    }

    fn load_locked(&self) -> Result<RestartFile, DaemonError> {
        if !self.path.exists() {
            return Ok(RestartFile::default());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| DaemonError::io(&self.path, e))?;
        if contents.trim().is_empty() {
            return Ok(RestartFile::default());
        }
        serde_json::from_str(&contents).map_err(|e| DaemonError::json(&self.path, e))
    }

    fn save_locked(&self, file: &RestartFile) -> Result<(), DaemonError> {
        let buf = serde_json::to_vec_pretty(file).map_err(|e| DaemonError::json(&self.path, e))?;
        atomic_write(&self.path, &buf)
    }
}

/// `initial * factor^(count-1)`, capped.
fn backoff_for_count(count: u32, timing: &TimingConfig) -> std::time::Duration {
    let initial = timing.restart_backoff_initial_secs;
    let factor = timing.restart_backoff_factor as u64;
    let cap = timing.restart_backoff_cap_secs;
    let exp = count.saturating_sub(1).min(32);
    let secs = initial.saturating_mul(factor.saturating_pow(exp)).min(cap);
    std::time::Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RestartTracker, TimingConfig) {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        let tracker = RestartTracker::new(temp.path());
        (temp, tracker, TimingConfig::default())
    }

    #[test]
    fn first_restart_uses_initial_backoff() {
        let (_temp, tracker, timing) = setup();
        let (backoff, crash_loop) = tracker.record_restart("alpha/witness", &timing).unwrap();
        assert_eq!(backoff.as_secs(), timing.restart_backoff_initial_secs);
        assert!(!crash_loop);
    }

    #[test]
    fn backoff_doubles_each_restart_until_cap() {
        let (_temp, tracker, timing) = setup();
        let (b1, _) = tracker.record_restart("alpha/witness", &timing).unwrap();
        let (b2, _) = tracker.record_restart("alpha/witness", &timing).unwrap();
        assert_eq!(b2.as_secs(), b1.as_secs() * 2);
    }

    #[test]
    fn five_restarts_in_window_trips_crash_loop() {
        let (_temp, tracker, timing) = setup();
        let mut crash_loop = false;
        for _ in 0..timing.restart_crash_loop_threshold {
            let (_, cl) = tracker.record_restart("alpha/witness", &timing).unwrap();
            crash_loop = cl;
        }
        assert!(crash_loop);
        assert!(tracker.is_crash_looping("alpha/witness").unwrap());
    }

    #[test]
    fn should_restart_is_true_for_unknown_identity() {
        let (_temp, tracker, timing) = setup();
        assert!(tracker.should_restart("alpha/witness", &timing).unwrap());
    }

    #[test]
    fn should_restart_is_false_while_backoff_has_not_elapsed() {
        let (_temp, tracker, timing) = setup();
        tracker.record_restart("alpha/witness", &timing).unwrap();
        assert!(!tracker.should_restart("alpha/witness", &timing).unwrap());
    }

    #[test]
    fn should_restart_is_false_once_crash_looping() {
        let (_temp, tracker, timing) = setup();
        for _ in 0..timing.restart_crash_loop_threshold {
            tracker.record_restart("alpha/witness", &timing).unwrap();
        }
        assert!(!tracker.should_restart("alpha/witness", &timing).unwrap());
    }

    #[test]
    fn clear_resets_crash_loop_flag() {
        let (_temp, tracker, timing) = setup();
        for _ in 0..timing.restart_crash_loop_threshold {
            tracker.record_restart("alpha/witness", &timing).unwrap();
        }
        tracker.clear("alpha/witness").unwrap();
        assert!(!tracker.is_crash_looping("alpha/witness").unwrap());
    }
}
