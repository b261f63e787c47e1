//! Agent-presence adapter: the narrow interface the daemon consumes to
//! create, inspect and tear down an agent's runtime session. Concrete
//! implementations shell out to `tmux`; tests use [`mock::MockBackend`].

pub mod mock;
pub mod tmux;

use async_trait::async_trait;
use std::path::Path;
use town_core::DaemonError;

/// Agent-presence adapter contract (see external interfaces).
///
/// Implementors must not block the supervisor tick indefinitely: every
/// method is expected to carry its own short timeout internally.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Whether a session by this name exists at all.
    async fn has_session(&self, name: &str) -> Result<bool, DaemonError>;

    /// Whether the runtime process inside the session is alive. Only
    /// meaningful if `has_session` is true; backends may return `false` for
    /// an absent session rather than erroring.
    async fn session_agent_alive(&self, name: &str) -> Result<bool, DaemonError>;

    /// Create a new session rooted at `work_dir`.
    async fn new_session(&self, name: &str, work_dir: &Path) -> Result<(), DaemonError>;

    /// Kill the session and every descendant process.
    async fn kill_session_with_processes(&self, name: &str) -> Result<(), DaemonError>;

    /// Set an environment variable visible to the session's runtime.
    async fn set_env(&self, name: &str, key: &str, value: &str) -> Result<(), DaemonError>;

    /// Inject literal text into the session's current input line.
    async fn send_text(&self, name: &str, text: &str) -> Result<(), DaemonError>;

    /// Inject a named key (e.g. `"Enter"`).
    async fn send_key(&self, name: &str, key_name: &str) -> Result<(), DaemonError>;

    /// Capture the last `n` lines of the session's pane.
    async fn capture_pane_lines(&self, name: &str, n: u32) -> Result<Vec<String>, DaemonError>;

    /// List every known session name.
    async fn list_sessions(&self) -> Result<Vec<String>, DaemonError>;
}
