//! On-disk nudge record format and the enqueue/load/save transaction.
//!
//! The queue file (`daemon/nudges.jsonl`) is append-only newline-delimited
//! JSON, guarded by a separate lock file (`daemon/nudges.jsonl.lock`) held
//! for the entire read-modify-write transaction. Rewrites go through
//! [`town_core::io::atomic_write`] (`queue.tmp` + fsync + rename).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use town_core::error::DaemonError;
use town_core::io::{acquire_lock, atomic_write};

const MAX_TOTAL: usize = 1024;
const MAX_PER_TARGET: usize = 8;
const MAX_LINE_BYTES: usize = 512;
const LOCK_MAX_RETRIES: u32 = 5;

/// One queued nudge request.
///
/// Field names are kept short (`t`, `m`, `f`, `ts`, `a`, `e`) to leave
/// headroom under the 512-byte line budget for the message body itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeRecord {
    pub id: String,
    pub t: String,
    pub m: String,
    pub f: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub a: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl NudgeRecord {
    fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

/// Deterministic id for (target, message, floor-second): retries of the
/// same nudge within one second collapse to a single surviving record.
pub fn compute_id(target: &str, message: &str, ts: DateTime<Utc>) -> String {
    let floor_secs = ts.timestamp();
    let mut hasher = blake3::Hasher::new();
    hasher.update(target.as_bytes());
    hasher.update(b"\0");
    hasher.update(message.as_bytes());
    hasher.update(b"\0");
    hasher.update(&floor_secs.to_le_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

/// Handle onto the on-disk nudge queue for one town.
pub struct NudgeQueue {
    queue_path: PathBuf,
    lock_path: PathBuf,
}

impl NudgeQueue {
    pub fn new(town_root: &Path) -> Self {
        NudgeQueue {
            queue_path: town_root.join("daemon/nudges.jsonl"),
            lock_path: town_root.join("daemon/nudges.jsonl.lock"),
        }
    }

    /// Enqueue a nudge. Idempotent: enqueuing the same (target, message)
    /// within the same second succeeds without creating a second record.
    ///
    /// Rejects with `QueueFull`/`PerTargetFull`/`LineTooLarge` if the bound
    /// would be violated; callers should fall back to mail.
    pub fn enqueue(&self, target: &str, message: &str, sender: &str) -> Result<(), DaemonError> {
        let now = Utc::now();
        let id = compute_id(target, message, now);
        let record = NudgeRecord {
            id: id.clone(),
            t: target.to_string(),
            m: message.to_string(),
            f: sender.to_string(),
            ts: now,
            a: 0,
            e: None,
        };

        if record.serialized_len() > MAX_LINE_BYTES {
            return Err(DaemonError::LineTooLarge {
                target: parse_target(target),
                len: record.serialized_len(),
            });
        }

        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let mut records = self.load_locked()?;

        if records.iter().any(|r| r.id == id) {
            // Duplicate within the same floor-second: idempotent success.
            return Ok(());
        }

        if records.len() >= MAX_TOTAL {
            return Err(DaemonError::QueueFull {
                target: parse_target(target),
            });
        }
        let per_target = records.iter().filter(|r| r.t == target).count();
        if per_target >= MAX_PER_TARGET {
            return Err(DaemonError::PerTargetFull {
                target: parse_target(target),
            });
        }

        records.push(record);
        self.save_locked(&records)
    }

    /// Acquire the lock, load the queue, let `f` mutate it, then persist.
    /// Used by the dispatcher for the process-queue transaction.
    pub fn with_locked_queue<F>(&self, f: F) -> Result<(), DaemonError>
    where
        F: FnOnce(&mut Vec<NudgeRecord>),
    {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        let mut records = self.load_locked()?;
        f(&mut records);
        self.save_locked(&records)
    }

    pub fn len(&self) -> Result<usize, DaemonError> {
        let _lock = acquire_lock(&self.lock_path, LOCK_MAX_RETRIES)?;
        Ok(self.load_locked()?.len())
    }

    pub fn mtime(&self) -> Option<std::time::SystemTime> {
        std::fs::metadata(&self.queue_path).ok()?.modified().ok()
    }

    fn load_locked(&self) -> Result<Vec<NudgeRecord>, DaemonError> {
        if !self.queue_path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.queue_path)
            .map_err(|e| DaemonError::io(&self.queue_path, e))?;
        let mut records = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: NudgeRecord =
                serde_json::from_str(line).map_err(|e| DaemonError::json(&self.queue_path, e))?;
            records.push(record);
        }
        Ok(records)
    }

    fn save_locked(&self, records: &[NudgeRecord]) -> Result<(), DaemonError> {
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record).map_err(|e| DaemonError::json(&self.queue_path, e))?);
            buf.push('\n');
        }
        atomic_write(&self.queue_path, buf.as_bytes())
    }
}

fn parse_target(target: &str) -> town_core::Identity {
    target.parse().unwrap_or(town_core::Identity {
        role: town_core::Role::Boot,
        rig: None,
        name: Some(target.to_string()),
    })
}

/// Per-target consecutive delivery failure counters, used by the dispatcher
/// to decide when to escalate via mail.
#[derive(Debug, Default)]
pub struct FailureCounters {
    counts: HashMap<String, u32>,
}

impl FailureCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, target: &str) -> u32 {
        let count = self.counts.entry(target.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&mut self, target: &str) {
        self.counts.remove(target);
    }
}
