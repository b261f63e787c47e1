//! In-memory mock mail client for testing the lifecycle processor and
//! escalation paths without a real `gt mail` daemon.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use town_core::DaemonError;

use super::{MailClient, Message};

#[derive(Debug, Default)]
struct MockState {
    inboxes: HashMap<String, Vec<Message>>,
    sent: Vec<(String, String, String)>,
    deleted: Vec<String>,
}

/// In-memory [`MailClient`] double.
#[derive(Clone, Default)]
pub struct MockMailClient {
    state: Arc<Mutex<MockState>>,
}

impl MockMailClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, identity: &str, message: Message) {
        self.state
            .lock()
            .unwrap()
            .inboxes
            .entry(identity.to_string())
            .or_default()
            .push(message);
    }

    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Messages sent to `to`, as (subject, body) pairs.
    pub fn sent_to(&self, to: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(t, _, _)| t == to)
            .map(|(_, subject, body)| (subject.clone(), body.clone()))
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl MailClient for MockMailClient {
    async fn inbox(&self, identity: &str) -> Result<Vec<Message>, DaemonError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .inboxes
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, id: &str) -> Result<(), DaemonError> {
        let mut state = self.state.lock().unwrap();
        for messages in state.inboxes.values_mut() {
            messages.retain(|m| m.id != id);
        }
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), DaemonError> {
        self.state
            .lock()
            .unwrap()
            .sent
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn delete_removes_message_from_every_inbox() {
        let client = MockMailClient::new();
        client.push(
            "deacon",
            Message {
                id: "m1".to_string(),
                from: "boot".to_string(),
                to: "deacon".to_string(),
                subject: "LIFECYCLE: restart".to_string(),
                body: "{}".to_string(),
                ts: Utc::now(),
                read: false,
                priority: None,
                message_type: None,
            },
        );
        client.delete("m1").await.unwrap();
        assert!(client.inbox("deacon").await.unwrap().is_empty());
        assert_eq!(client.deleted(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn send_is_recorded() {
        let client = MockMailClient::new();
        client.send("mayor", "ALERT", "broken").await.unwrap();
        assert_eq!(
            client.sent(),
            vec![("mayor".to_string(), "ALERT".to_string(), "broken".to_string())]
        );
    }
}
