//! `gt mail` CLI-shelled mail client.

use async_trait::async_trait;
use std::process::Command;
use town_core::DaemonError;

use super::{MailClient, Message};

fn adapter_error(message: impl Into<String>) -> DaemonError {
    DaemonError::AdapterNotFound {
        command: "gt mail".to_string(),
        message: message.into(),
    }
}

/// Shells out to the `gt mail` CLI for every operation.
#[derive(Debug, Clone, Default)]
pub struct CliMailClient;

#[async_trait]
impl MailClient for CliMailClient {
    async fn inbox(&self, identity: &str) -> Result<Vec<Message>, DaemonError> {
        let output = Command::new("gt")
            .args(["mail", "inbox", "--identity", identity, "--json"])
            .output()
            .map_err(|e| adapter_error(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(adapter_error(format!("gt mail inbox failed: {stderr}")));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| DaemonError::json("gt mail inbox output", e))
    }

    async fn delete(&self, id: &str) -> Result<(), DaemonError> {
        let output = Command::new("gt")
            .args(["mail", "delete", id])
            .output()
            .map_err(|e| adapter_error(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(adapter_error(format!("gt mail delete failed: {stderr}")));
        }
        Ok(())
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), DaemonError> {
        let output = Command::new("gt")
            .args(["mail", "send", "--to", to, "--subject", subject, "--body", body])
            .output()
            .map_err(|e| adapter_error(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(adapter_error(format!("gt mail send failed: {stderr}")));
        }
        Ok(())
    }
}
