//! Cooldown store: a JSON-persisted array of cooldown records, one per
//! active (or recently active) profile cooldown.
//!
//! Guarded by the same lock+atomic-rewrite pattern as the nudge queue.
//! Already-expired records are dropped whenever the array is loaded, so
//! the file never accumulates stale entries across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use town_core::error::DaemonError;
use town_core::io::{acquire_lock, atomic_write};

const LOCK_MAX_RETRIES: u32 = 5;

/// One persisted cooldown, matching the data model's cooldown record:
/// `{ profile-name, started-at, expires-at, reason }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

/// Handle onto the on-disk cooldown array for one town.
pub struct CooldownStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl CooldownStore {
    pub fn new(town_root: &Path) -> Self {
        CooldownStore {
            path: town_root.join("daemon/cooldowns.json"),
            lock_path: town_root.join("daemon/cooldowns.json.lock"),
        }
    }

    /// Mark `profile` as cooling down until `now + duration` for `reason`.
    /// Cooldown end-times are monotone non-decreasing per profile: a new
    /// cooldown that would expire earlier than an existing one is ignored.
    pub fn start_cooldown(&self, profile: &str, duration: chrono::Duration, reason: &str) -> Result<(), DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let mut records = self.load_locked()?;
        let now = Utc::now();
        let expires_at = now + duration;
        if let Some(existing) = records.iter_mut().find(|r| r.profile == profile) {
            if expires_at > existing.expires_at {
                existing.started_at = now;
                existing.expires_at = expires_at;
                existing.reason = reason.to_string();
            }
        } else {
            records.push(CooldownRecord {
                profile: profile.to_string(),
                started_at: now,
                expires_at,
                reason: reason.to_string(),
            });
        }
        self.save_locked(&records)
    }

    /// Whether `profile` is still within its cooldown window.
    pub fn is_cooling(&self, profile: &str) -> Result<bool, DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let records = self.load_locked()?;
        Ok(records.iter().any(|r| r.profile == profile && r.expires_at > Utc::now()))
    }

    /// Clear a profile's cooldown manually (operator override).
    pub fn clear(&self, profile: &str) -> Result<(), DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let mut records = self.load_locked()?;
        records.retain(|r| r.profile != profile);
        self.save_locked(&records)
    }

    /// Rewrite the file with every already-expired record dropped. Called
    /// from the load path (so a stale on-disk array never grows the
    /// in-memory view) and from the supervisor tick's cooldown-pruning step.
    pub fn prune_expired(&self) -> Result<(), DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let records = self.load_locked()?;
        self.save_locked(&records)
    }

    /// Load the array, discarding any record whose `expires_at` has already
    /// passed: persistence reconciles only non-expired entries at load.
    fn load_locked(&self) -> Result<Vec<CooldownRecord>, DaemonError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| DaemonError::io(&self.path, e))?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let records: Vec<CooldownRecord> =
            serde_json::from_str(&contents).map_err(|e| DaemonError::json(&self.path, e))?;
        let now = Utc::now();
        Ok(records.into_iter().filter(|r| r.expires_at > now).collect())
    }

    fn save_locked(&self, records: &[CooldownRecord]) -> Result<(), DaemonError> {
        let buf = serde_json::to_vec_pretty(records).map_err(|e| DaemonError::json(&self.path, e))?;
        atomic_write(&self.path, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CooldownStore) {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        let store = CooldownStore::new(temp.path());
        (temp, store)
    }

    #[test]
    fn profile_not_cooling_by_default() {
        let (_temp, store) = setup();
        assert!(!store.is_cooling("anthropic-main").unwrap());
    }

    #[test]
    fn started_cooldown_is_observed() {
        let (_temp, store) = setup();
        store.start_cooldown("anthropic-main", chrono::Duration::seconds(600), "rate_limit").unwrap();
        assert!(store.is_cooling("anthropic-main").unwrap());
    }

    #[test]
    fn expired_cooldown_is_not_cooling() {
        let (_temp, store) = setup();
        store.start_cooldown("anthropic-main", chrono::Duration::seconds(-1), "rate_limit").unwrap();
        assert!(!store.is_cooling("anthropic-main").unwrap());
    }

    #[test]
    fn clear_removes_cooldown() {
        let (_temp, store) = setup();
        store.start_cooldown("anthropic-main", chrono::Duration::seconds(600), "rate_limit").unwrap();
        store.clear("anthropic-main").unwrap();
        assert!(!store.is_cooling("anthropic-main").unwrap());
    }

    #[test]
    fn persisted_record_carries_reason_and_started_at() {
        let (_temp, store) = setup();
        store.start_cooldown("anthropic-main", chrono::Duration::seconds(600), "rate_limit").unwrap();
        let records = store.load_locked().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, "rate_limit");
        assert!(records[0].started_at <= Utc::now());
        assert!(records[0].expires_at > Utc::now());
    }

    #[test]
    fn load_discards_already_expired_records() {
        let (_temp, store) = setup();
        store.start_cooldown("anthropic-main", chrono::Duration::seconds(-5), "rate_limit").unwrap();
        assert!(store.load_locked().unwrap().is_empty());
    }

    #[test]
    fn prune_expired_rewrites_the_file_without_expired_entries() {
        let (_temp, store) = setup();
        store.start_cooldown("anthropic-main", chrono::Duration::seconds(600), "rate_limit").unwrap();
        store.start_cooldown("anthropic-backup", chrono::Duration::seconds(-5), "rate_limit").unwrap();
        store.prune_expired().unwrap();

        let contents = std::fs::read_to_string(&store.path).unwrap();
        let on_disk: Vec<CooldownRecord> = serde_json::from_str(&contents).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].profile, "anthropic-main");
    }

    #[test]
    fn cooldown_end_time_is_monotone_non_decreasing() {
        let (_temp, store) = setup();
        store.start_cooldown("anthropic-main", chrono::Duration::seconds(600), "rate_limit").unwrap();
        let first_expiry = store.load_locked().unwrap()[0].expires_at;
        store.start_cooldown("anthropic-main", chrono::Duration::seconds(60), "rate_limit").unwrap();
        let second_expiry = store.load_locked().unwrap()[0].expires_at;
        assert!(second_expiry >= first_expiry);
    }
}
