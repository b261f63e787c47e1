//! Shared error taxonomy for the Gas Town supervisor daemon.
//!
//! Every component returns `Result<_, DaemonError>`. Variants carry the
//! structured context named in the component design (path, identity,
//! profile, attempts) rather than forcing call sites to re-derive it from a
//! formatted string.

use std::path::PathBuf;
use thiserror::Error;

use crate::identity::Identity;

/// Errors produced by `town-core` and every `townd` component built on it.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// The presence adapter already reports the agent alive; callers should
    /// treat this as success, not failure.
    #[error("{0} is already running")]
    AlreadyRunning(Identity),

    /// A stop was requested for an identity with no live session.
    #[error("{0} is not running")]
    NotRunning(Identity),

    /// A session exists but the agent process inside it is dead.
    #[error("{0} session is a zombie (session present, agent dead)")]
    Zombie(Identity),

    /// Another daemon already holds `daemon/daemon.lock` for this town.
    #[error("town already has a running daemon (lock held by another process)")]
    LockHeld,

    /// Failed to acquire a file lock after exhausting retries.
    #[error("failed to acquire lock on {path} after {retries} retries")]
    LockTimeout { path: PathBuf, retries: u32 },

    /// A lifecycle mail message is older than the staleness cutoff.
    #[error("lifecycle message from {sender} is stale (age {age_secs}s)")]
    StaleMessage { sender: String, age_secs: u64 },

    /// Enqueue rejected: queue already has 1024 records.
    #[error("nudge queue is full (1024 records); send mail to {target} instead")]
    QueueFull { target: Identity },

    /// Enqueue rejected: target already has 8 records queued.
    #[error("nudge queue for {target} is full (8 records); send mail instead")]
    PerTargetFull { target: Identity },

    /// Enqueue rejected: serialized record exceeds 512 bytes.
    #[error("nudge line too large ({len} bytes > 512); use mail for {target} instead")]
    LineTooLarge { target: Identity, len: usize },

    /// The rate-limit manager has no non-cooling profile left to swap to.
    #[error("all profiles are cooling down for role {role}")]
    AllProfilesCooling { role: String },

    /// The restart tracker refuses further restarts; requires manual clear.
    #[error("{identity} is in a crash loop ({restarts} restarts); manual clear required")]
    CrashLoop { identity: Identity, restarts: u32 },

    /// A nudge's sentinel was still visible after the verify delay.
    #[error("nudge delivery to {target} is stuck (attempt {attempt})")]
    StuckDelivery { target: Identity, attempt: u32 },

    /// A transport failure on a backend adapter; the next tick retries.
    #[error("transient backend error for {identity}: {message}")]
    TransientBackend { identity: Identity, message: String },

    /// Could not parse an `Identity` from its slash-address form.
    #[error("invalid identity address: {0}")]
    InvalidIdentity(String),

    /// I/O error tied to a specific path.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization error tied to a specific path.
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// TOML parse error tied to a specific path.
    #[error("TOML error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    /// A subprocess adapter (tmux, `gt mail`, `bd`) failed to start at all.
    #[error("{command} not found or failed to start: {message}")]
    AdapterNotFound { command: String, message: String },
}

impl DaemonError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DaemonError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        DaemonError::Json {
            path: path.into(),
            source,
        }
    }
}
