//! NATS credential-event subscriber: reconnects with exponential
//! backoff capped at 30s, and forwards account-credential trouble into the
//! rate-limit manager's cooldown store so a profile whose credentials are
//! failing to refresh is taken out of rotation without waiting for a `429`
//! to surface it.

use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use town_core::config::ProfileConfig;

use crate::ratelimit::cooldown::CooldownStore;

const SUBJECT: &str = "coop.events.credential";
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// `{event_type, account, error?, ts}` payload published on credential
/// refresh attempts by the external credential manager.
#[derive(Debug, Deserialize)]
struct CredentialEvent {
    event_type: CredentialEventType,
    account: String,
    #[serde(default)]
    error: Option<String>,
    #[allow(dead_code)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum CredentialEventType {
    RefreshFailed,
    Refreshed,
    ReauthRequired,
}

/// Spawn the subscriber as a background task; it reconnects indefinitely
/// until `shutdown` fires.
pub fn spawn(
    nats_url: String,
    profiles: Vec<ProfileConfig>,
    cooldowns: CooldownStore,
    cooldown_secs: u64,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run(&nats_url, &profiles, &cooldowns, cooldown_secs, shutdown).await;
    })
}

async fn run(
    nats_url: &str,
    profiles: &[ProfileConfig],
    cooldowns: &CooldownStore,
    cooldown_secs: u64,
    shutdown: CancellationToken,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match connect_and_subscribe(nats_url, profiles, cooldowns, cooldown_secs, shutdown.clone()).await {
            Ok(()) => return, // shutdown requested mid-stream
            Err(e) => {
                warn!(error = %e, backoff_secs = backoff.as_secs(), "credential-event subscriber disconnected; reconnecting");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn connect_and_subscribe(
    nats_url: &str,
    profiles: &[ProfileConfig],
    cooldowns: &CooldownStore,
    cooldown_secs: u64,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let client = async_nats::connect(nats_url).await?;
    info!(url = %nats_url, subject = SUBJECT, "credential-event subscriber connected");
    let mut sub = client.subscribe(SUBJECT).await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            msg = sub.next() => {
                let Some(msg) = msg else {
                    anyhow::bail!("credential-event subscription stream closed");
                };
                handle_message(&msg.payload, profiles, cooldowns, cooldown_secs);
            }
        }
    }
}

fn handle_message(payload: &[u8], profiles: &[ProfileConfig], cooldowns: &CooldownStore, cooldown_secs: u64) {
    let event: CredentialEvent = match serde_json::from_slice(payload) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "dropping unparseable credential event");
            return;
        }
    };

    let affected: Vec<&str> = profiles
        .iter()
        .filter(|p| p.credentials_handle == event.account)
        .map(|p| p.name.as_str())
        .collect();

    match event.event_type {
        CredentialEventType::RefreshFailed | CredentialEventType::ReauthRequired => {
            warn!(account = %event.account, error = ?event.error, "credential event forces cooldown");
            for profile in affected {
                if let Err(e) =
                    cooldowns.start_cooldown(profile, chrono::Duration::seconds(cooldown_secs as i64), "credential")
                {
                    warn!(profile, error = %e, "failed to start cooldown from credential event");
                }
            }
        }
        CredentialEventType::Refreshed => {
            for profile in affected {
                if let Err(e) = cooldowns.clear(profile) {
                    warn!(profile, error = %e, "failed to clear cooldown from credential event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn profile(name: &str, account: &str) -> ProfileConfig {
        ProfileConfig {
            name: name.to_string(),
            provider: "anthropic".to_string(),
            credentials_handle: account.to_string(),
        }
    }

    #[test]
    fn reauth_required_starts_a_cooldown_for_matching_profiles() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        let cooldowns = CooldownStore::new(temp.path());
        let profiles = vec![profile("anthropic_a", "acct-1")];
        let payload = br#"{"event_type":"reauth_required","account":"acct-1","error":"token expired"}"#;

        handle_message(payload, &profiles, &cooldowns, 600);

        assert!(cooldowns.is_cooling("anthropic_a").unwrap());
    }

    #[test]
    fn refreshed_clears_an_existing_cooldown() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        let cooldowns = CooldownStore::new(temp.path());
        cooldowns.start_cooldown("anthropic_a", chrono::Duration::seconds(600), "credential").unwrap();
        let profiles = vec![profile("anthropic_a", "acct-1")];
        let payload = br#"{"event_type":"refreshed","account":"acct-1"}"#;

        handle_message(payload, &profiles, &cooldowns, 600);

        assert!(!cooldowns.is_cooling("anthropic_a").unwrap());
    }

    #[test]
    fn unrelated_account_is_ignored() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        let cooldowns = CooldownStore::new(temp.path());
        let profiles = vec![profile("anthropic_a", "acct-1")];
        let payload = br#"{"event_type":"reauth_required","account":"acct-other"}"#;

        handle_message(payload, &profiles, &cooldowns, 600);

        assert!(!cooldowns.is_cooling("anthropic_a").unwrap());
    }

    #[test]
    fn malformed_payload_does_not_panic() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        let cooldowns = CooldownStore::new(temp.path());
        handle_message(b"not json", &[], &cooldowns, 600);
    }
}
