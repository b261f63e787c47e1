//! Mail adapter: the external asynchronous message channel used by the
//! lifecycle processor and every escalation path (GUPP, orphan, crash,
//! stuck-nudge alerts). The daemon never reads the mail store's files
//! directly — it only ever shells out to the `gt mail` CLI.

pub mod cli;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use town_core::DaemonError;

/// One message in an identity's inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: Option<String>,
}

impl Message {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.ts
    }
}

/// Mail adapter contract.
#[async_trait]
pub trait MailClient: Send + Sync {
    async fn inbox(&self, identity: &str) -> Result<Vec<Message>, DaemonError>;
    async fn delete(&self, id: &str) -> Result<(), DaemonError>;
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), DaemonError>;
}
