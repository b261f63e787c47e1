//! Shared structured JSONL event logging for Gas Town binaries.
//!
//! Components emit structured events here (`instance_swap`, `rate_limit`,
//! `mass_death`, and general daemon lifecycle events) in addition to their
//! `tracing` output; the JSONL sink is what downstream tooling tails, while
//! `tracing` is for human-facing operational logs.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const DEFAULT_MAX_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_MAX_FILES: u32 = 5;

#[derive(Clone, Debug)]
pub struct EventLogConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub max_files: u32,
}

impl EventLogConfig {
    pub fn for_town_root(town_root: &Path) -> Self {
        let default_path = town_root.join("daemon/events.jsonl");
        let path = std::env::var("GASTOWN_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or(default_path);
        let max_bytes = std::env::var("GASTOWN_LOG_MAX_BYTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_BYTES);
        let max_files = std::env::var("GASTOWN_LOG_MAX_FILES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_FILES);

        EventLogConfig {
            path,
            max_bytes,
            max_files,
        }
    }
}

/// One structured daemon event. `fields` carries event-specific data
/// (`instance_swap`'s from/to profiles, `mass_death`'s session id list, ...).
#[derive(Clone, Debug)]
pub struct DaemonEvent {
    pub kind: &'static str,
    pub identity: Option<String>,
    pub role: Option<String>,
    pub rig: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub fields: Map<String, Value>,
}

impl DaemonEvent {
    pub fn new(kind: &'static str) -> Self {
        DaemonEvent {
            kind,
            identity: None,
            role: None,
            rig: None,
            result: None,
            error: None,
            fields: Map::new(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    fn to_json_line(&self) -> String {
        let mut obj = Map::new();
        obj.insert("ts".to_string(), json!(Utc::now().to_rfc3339()));
        obj.insert("kind".to_string(), json!(self.kind));
        if let Some(v) = &self.identity {
            obj.insert("identity".to_string(), json!(v));
        }
        if let Some(v) = &self.role {
            obj.insert("role".to_string(), json!(v));
        }
        if let Some(v) = &self.rig {
            obj.insert("rig".to_string(), json!(v));
        }
        if let Some(v) = &self.result {
            obj.insert("result".to_string(), json!(v));
        }
        if let Some(v) = &self.error {
            obj.insert("error".to_string(), json!(v));
        }
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj).to_string()
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn rotated_path(path: &Path, idx: u32) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), idx))
}

fn rotate_if_needed(path: &Path, max_bytes: u64, max_files: u32) -> std::io::Result<()> {
    if !path.exists() || fs::metadata(path)?.len() < max_bytes {
        return Ok(());
    }

    for idx in (1..max_files).rev() {
        let src = rotated_path(path, idx);
        let dst = rotated_path(path, idx + 1);
        if src.exists() {
            let _ = fs::rename(&src, &dst);
        }
    }
    let _ = fs::rename(path, rotated_path(path, 1));
    Ok(())
}

/// Append one structured event to the town's JSONL sink.
///
/// Fail-open: a write error is logged via `tracing` and swallowed, since a
/// logging failure must never abort a supervisor tick.
pub fn emit(cfg: &EventLogConfig, event: DaemonEvent) {
    let result = (|| -> std::io::Result<()> {
        ensure_parent(&cfg.path)?;
        rotate_if_needed(&cfg.path, cfg.max_bytes, cfg.max_files)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&cfg.path)?;
        file.write_all(event.to_json_line().as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    })();

    if let Err(e) = result {
        tracing::warn!(error = %e, path = %cfg.path.display(), "failed to write event log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn emits_event_as_one_json_line() {
        let tmp = TempDir::new().unwrap();
        let cfg = EventLogConfig::for_town_root(tmp.path());

        emit(
            &cfg,
            DaemonEvent::new("instance_swap")
                .with_identity("alpha/witness")
                .with_result("ok")
                .with_field("from_profile", "anthropic_a")
                .with_field("to_profile", "anthropic_b"),
        );

        let contents = fs::read_to_string(&cfg.path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["kind"], "instance_swap");
        assert_eq!(parsed["identity"], "alpha/witness");
        assert_eq!(parsed["from_profile"], "anthropic_a");
    }

    #[test]
    fn rotate_if_needed_renames_file() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("events.jsonl");
        fs::write(&log_path, b"1234567890").unwrap();
        rotate_if_needed(&log_path, 5, 5).unwrap();
        assert!(!log_path.exists());
        assert!(tmp.path().join("events.jsonl.1").exists());
    }

    #[test]
    fn mass_death_event_carries_affected_sessions() {
        let tmp = TempDir::new().unwrap();
        let cfg = EventLogConfig::for_town_root(tmp.path());

        emit(
            &cfg,
            DaemonEvent::new("mass_death").with_field(
                "sessions",
                json!(["alpha-polecat-p1", "alpha-polecat-p2", "alpha-polecat-p3"]),
            ),
        );

        let contents = fs::read_to_string(&cfg.path).unwrap();
        let parsed: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["sessions"].as_array().unwrap().len(), 3);
    }
}
