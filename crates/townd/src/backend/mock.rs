//! In-memory mock backend for testing without tmux.
//!
//! Records every call so tests can assert on them, and allows injecting
//! per-session liveness and error states for exercising restart, zombie and
//! transient-failure code paths.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use town_core::DaemonError;

use super::Backend;

/// One recorded call against a [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    NewSession { name: String },
    KillSession { name: String },
    SendText { name: String, text: String },
    SendKey { name: String, key: String },
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    sessions: HashSet<String>,
    zombies: HashSet<String>,
    captures: HashMap<String, Vec<String>>,
    new_session_error: Option<String>,
}

/// In-memory [`Backend`] double.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Mark a session as existing but with a dead runtime (zombie).
    pub fn mark_zombie(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(name.to_string());
        state.zombies.insert(name.to_string());
    }

    pub fn set_capture(&self, name: &str, lines: Vec<String>) {
        self.state.lock().unwrap().captures.insert(name.to_string(), lines);
    }

    pub fn set_new_session_error(&self, error: Option<&str>) {
        self.state.lock().unwrap().new_session_error = error.map(String::from);
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn has_session(&self, name: &str) -> Result<bool, DaemonError> {
        Ok(self.state.lock().unwrap().sessions.contains(name))
    }

    async fn session_agent_alive(&self, name: &str) -> Result<bool, DaemonError> {
        let state = self.state.lock().unwrap();
        Ok(state.sessions.contains(name) && !state.zombies.contains(name))
    }

    async fn new_session(&self, name: &str, _work_dir: &Path) -> Result<(), DaemonError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.new_session_error.clone() {
            return Err(DaemonError::TransientBackend {
                identity: town_core::Identity {
                    role: town_core::Role::Boot,
                    rig: None,
                    name: Some(name.to_string()),
                },
                message,
            });
        }
        state.sessions.insert(name.to_string());
        state.zombies.remove(name);
        state.calls.push(MockCall::NewSession { name: name.to_string() });
        Ok(())
    }

    async fn kill_session_with_processes(&self, name: &str) -> Result<(), DaemonError> {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(name);
        state.zombies.remove(name);
        state.calls.push(MockCall::KillSession { name: name.to_string() });
        Ok(())
    }

    async fn set_env(&self, _name: &str, _key: &str, _value: &str) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn send_text(&self, name: &str, text: &str) -> Result<(), DaemonError> {
        self.state.lock().unwrap().calls.push(MockCall::SendText {
            name: name.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_key(&self, name: &str, key: &str) -> Result<(), DaemonError> {
        self.state.lock().unwrap().calls.push(MockCall::SendKey {
            name: name.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    async fn capture_pane_lines(&self, name: &str, n: u32) -> Result<Vec<String>, DaemonError> {
        let state = self.state.lock().unwrap();
        let lines = state.captures.get(name).cloned().unwrap_or_default();
        Ok(lines.into_iter().rev().take(n as usize).rev().collect())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, DaemonError> {
        Ok(self.state.lock().unwrap().sessions.iter().cloned().collect())
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend").finish()
    }
}
