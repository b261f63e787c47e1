//! Dispatch loop: polls the queue, delivers one oldest nudge per target,
//! verifies delivery by sentinel, detects stuck input, retries with bounded
//! attempts, and escalates to mail after repeated per-target failure.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use town_core::config::TimingConfig;

use crate::backend::Backend;
use crate::mail::MailClient;

use super::queue::{FailureCounters, NudgeQueue, NudgeRecord};

const ESCALATION_SUBJECT: &str = "nudge delivery failing";
const LEGACY_PREFIX: &str = "[from ";

/// Runs the queue poll loop until `shutdown` fires.
///
/// Every tick: load the queue, drop expired and attempt-exhausted records,
/// group the rest by target, take the single oldest record per target, and
/// attempt delivery. A failed delivery increments the record's attempt
/// counter and is written back; a delivered-and-verified record is removed.
pub async fn run(
    queue: Arc<NudgeQueue>,
    backend: Arc<dyn Backend>,
    mail: Arc<dyn MailClient>,
    timing: TimingConfig,
    shutdown: CancellationToken,
) {
    let mut failures = FailureCounters::new();
    let mut adopted = std::collections::HashSet::new();
    // `None` so the first poll always processes the queue, even if it was
    // populated (and its mtime set) before this loop started watching it.
    let mut last_mtime: Option<std::time::SystemTime> = None;
    let poll = Duration::from_millis(timing.queue_poll_millis);
    let mut legacy_interval = tokio::time::interval(Duration::from_secs(timing.stuck_poll_secs));
    legacy_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("nudge dispatch loop shutting down");
                return;
            }
            _ = tokio::time::sleep(poll) => {
                let mtime = queue.mtime();
                if mtime != last_mtime {
                    last_mtime = mtime;
                    if let Err(e) = tick(&queue, backend.as_ref(), mail.as_ref(), &timing, &mut failures).await {
                        warn!(error = %e, "nudge dispatch tick failed");
                    }
                }
            }
            _ = legacy_interval.tick() => {
                if let Err(e) = scan_legacy_nudges(&queue, backend.as_ref(), &mut adopted).await {
                    warn!(error = %e, "legacy nudge adoption scan failed");
                }
            }
        }
    }
}

/// Parses an older, unprefixed `[from <sender>] <message>` line (predates
/// the id-sentinel format) into (sender, message).
fn parse_legacy_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start().strip_prefix(LEGACY_PREFIX)?;
    let close = rest.find(']')?;
    let sender = &rest[..close];
    let message = rest[close + 1..].trim_start();
    Some((sender, message))
}

/// Separately from regular dispatch, scans every known session's recent
/// output for the legacy unprefixed sentinel and re-enqueues it under a
/// fresh id so it gets delivered (or retried) through the modern pipeline.
///
/// `adopted` bounds re-adoption of the exact same line to once: without it
/// a line that lingers on screen across every scan would be re-enqueued
/// every `stuck_poll_secs`, letting an adversarial sender exhaust a
/// target's queue quota purely through re-queue loops.
async fn scan_legacy_nudges(
    queue: &NudgeQueue,
    backend: &dyn Backend,
    adopted: &mut std::collections::HashSet<(String, String)>,
) -> Result<(), town_core::DaemonError> {
    let sessions = backend.list_sessions().await?;
    for session in sessions {
        let lines = match backend.capture_pane_lines(&session, 20).await {
            Ok(lines) => lines,
            Err(_) => continue,
        };
        for line in &lines {
            if !is_legacy_sentinel(line) {
                continue;
            }
            let key = (session.clone(), line.clone());
            if adopted.contains(&key) {
                continue;
            }
            let Some((sender, message)) = parse_legacy_line(line) else {
                continue;
            };
            match queue.enqueue(&session, message, sender) {
                Ok(()) => {
                    info!(target = %session, "adopted legacy nudge into modern queue");
                    let _ = backend.send_key(&session, "C-u").await;
                }
                Err(e) => {
                    debug!(target = %session, error = %e, "legacy nudge adoption did not enqueue");
                }
            }
            adopted.insert(key);
        }
    }
    Ok(())
}

async fn tick(
    queue: &NudgeQueue,
    backend: &dyn Backend,
    mail: &dyn MailClient,
    timing: &TimingConfig,
    failures: &mut FailureCounters,
) -> Result<(), town_core::DaemonError> {
    let due = select_due_records(queue, timing)?;
    for record in due {
        deliver_one(queue, backend, mail, timing, failures, record).await;
    }
    Ok(())
}

/// Drop expired/exhausted records in place, then return one oldest-first
/// record per distinct target for this tick's delivery attempt.
fn select_due_records(
    queue: &NudgeQueue,
    timing: &TimingConfig,
) -> Result<Vec<NudgeRecord>, town_core::DaemonError> {
    let mut due = Vec::new();
    queue.with_locked_queue(|records| {
        let now = Utc::now();
        records.retain(|r| {
            let age_secs = (now - r.ts).num_seconds().max(0) as u64;
            let expired = age_secs > timing.nudge_expiry_secs;
            let exhausted = r.a >= timing.nudge_max_attempts;
            if expired {
                debug!(target = %r.t, id = %r.id, "dropping expired nudge");
            }
            if exhausted {
                debug!(target = %r.t, id = %r.id, "dropping attempt-exhausted nudge");
            }
            !(expired || exhausted)
        });

        let mut by_target: HashMap<String, &NudgeRecord> = HashMap::new();
        for r in records.iter() {
            by_target
                .entry(r.t.clone())
                .and_modify(|existing| {
                    if r.ts < existing.ts {
                        *existing = r;
                    }
                })
                .or_insert(r);
        }
        due = by_target.into_values().cloned().collect();
    })?;
    Ok(due)
}

async fn deliver_one(
    queue: &NudgeQueue,
    backend: &dyn Backend,
    mail: &dyn MailClient,
    timing: &TimingConfig,
    failures: &mut FailureCounters,
    mut record: NudgeRecord,
) {
    let session = &record.t;
    let sentinel = format!("{}-[from {}] {}", record.id, record.f, record.m);

    let delivered = match backend.send_text(session, &sentinel).await {
        Ok(()) => {
            tokio::time::sleep(Duration::from_millis(timing.nudge_verify_delay_millis)).await;
            verify_and_submit(backend, session, &record.id, timing).await
        }
        Err(e) => {
            warn!(target = %session, error = %e, "nudge send_text failed");
            false
        }
    };

    if delivered {
        failures.record_success(session);
        remove_record(queue, &record.id);
        return;
    }

    record.a += 1;
    record.e = Some("delivery not verified".to_string());
    let attempt_failures = failures.record_failure(session);

    if let Err(e) = update_record(queue, record.clone()) {
        warn!(target = %session, error = %e, "failed to persist nudge retry state");
    }

    if attempt_failures >= timing.nudge_escalation_threshold {
        escalate(mail, session, attempt_failures).await;
    }
}

/// After sending the sentinel, send Enter once to submit it. If the
/// sentinel is still visible in the pane after the verify delay, the input
/// line is stuck (e.g. a modal dialog ate the Enter); clear it so the next
/// attempt starts from a clean line.
async fn verify_and_submit(backend: &dyn Backend, session: &str, sentinel_id: &str, timing: &TimingConfig) -> bool {
    if backend.send_key(session, "Enter").await.is_err() {
        return false;
    }
    tokio::time::sleep(Duration::from_millis(timing.nudge_verify_delay_millis)).await;

    match backend.capture_pane_lines(session, 5).await {
        Ok(lines) => {
            let still_visible = lines.iter().any(|l| l.contains(sentinel_id));
            if still_visible {
                warn!(target = %session, "nudge appears stuck in input line; clearing");
                let _ = backend.send_key(session, "C-u").await;
                false
            } else {
                true
            }
        }
        Err(_) => {
            // Cannot verify; assume delivered rather than retry forever.
            true
        }
    }
}

async fn escalate(mail: &dyn MailClient, target: &str, attempts: u32) {
    let body = format!("nudge delivery to {target} has failed {attempts} consecutive times");
    if let Err(e) = mail.send("deacon", ESCALATION_SUBJECT, &body).await {
        warn!(target = %target, error = %e, "failed to send nudge escalation mail");
    }
}

fn remove_record(queue: &NudgeQueue, id: &str) {
    let _ = queue.with_locked_queue(|records| {
        records.retain(|r| r.id != id);
    });
}

fn update_record(queue: &NudgeQueue, updated: NudgeRecord) -> Result<(), town_core::DaemonError> {
    queue.with_locked_queue(|records| {
        if let Some(slot) = records.iter_mut().find(|r| r.id == updated.id) {
            *slot = updated;
        }
    })
}

/// Scans a pane's recent output for unprefixed `[from <sender>] <msg>`
/// strings that predate the id-prefixed sentinel format, so nudges sent by
/// an older daemon build are still recognized as delivered rather than
/// retried forever.
pub fn is_legacy_sentinel(line: &str) -> bool {
    line.trim_start().starts_with(LEGACY_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::mail::mock::MockMailClient;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn timing() -> TimingConfig {
        TimingConfig::default()
    }

    fn queue(temp: &TempDir) -> Arc<NudgeQueue> {
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        Arc::new(NudgeQueue::new(temp.path()))
    }

    #[tokio::test]
    async fn delivers_and_removes_on_success() {
        let temp = TempDir::new().unwrap();
        let q = queue(&temp);
        q.enqueue("alpha/witness", "hello", "boot").unwrap();

        let backend = Arc::new(MockBackend::new());
        let mail = Arc::new(MockMailClient::new());
        let mut failures = FailureCounters::new();

        tick(&q, backend.as_ref(), mail.as_ref(), &timing(), &mut failures)
            .await
            .unwrap();

        assert_eq!(q.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn stuck_sentinel_still_visible_is_retried_not_dropped() {
        let temp = TempDir::new().unwrap();
        let q = queue(&temp);
        q.enqueue("alpha/witness", "hello", "boot").unwrap();

        let backend = Arc::new(MockBackend::new());
        let mail = Arc::new(MockMailClient::new());
        let mut failures = FailureCounters::new();

        // Pre-seed the pane capture with the record's id so verification
        // sees the sentinel as still stuck in the input line.
        let due = select_due_records(&q, &timing()).unwrap();
        let id = due[0].id.clone();
        backend.set_capture("alpha/witness", vec![format!("{id}-[from boot] hello")]);

        tick(&q, backend.as_ref(), mail.as_ref(), &timing(), &mut failures)
            .await
            .unwrap();

        assert_eq!(q.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn only_one_record_per_target_is_selected_per_tick() {
        let temp = TempDir::new().unwrap();
        let q = queue(&temp);
        q.enqueue("alpha/witness", "first", "boot").unwrap();

        let due = select_due_records(&q, &timing()).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn legacy_sentinel_is_recognized() {
        assert!(is_legacy_sentinel("[from boot] restart your session"));
        assert!(!is_legacy_sentinel("no-prefix message"));
    }

    #[test]
    fn legacy_line_parses_sender_and_message() {
        let (sender, message) = parse_legacy_line("[from boot] restart your session").unwrap();
        assert_eq!(sender, "boot");
        assert_eq!(message, "restart your session");
    }

    #[tokio::test]
    async fn legacy_scan_adopts_into_the_modern_queue_and_clears_the_line() {
        let temp = TempDir::new().unwrap();
        let q = queue(&temp);
        let backend = Arc::new(MockBackend::new());
        backend.new_session("alpha/witness", temp.path()).await.unwrap();
        backend.set_capture("alpha/witness", vec!["[from boot] restart your session".to_string()]);

        let mut adopted = std::collections::HashSet::new();
        scan_legacy_nudges(&q, backend.as_ref(), &mut adopted).await.unwrap();

        assert_eq!(q.len().unwrap(), 1);
        assert!(backend
            .calls()
            .iter()
            .any(|c| matches!(c, crate::backend::mock::MockCall::SendKey { key, .. } if key == "C-u")));
    }

    #[tokio::test]
    async fn legacy_scan_does_not_readopt_the_same_line_twice() {
        let temp = TempDir::new().unwrap();
        let q = queue(&temp);
        let backend = Arc::new(MockBackend::new());
        backend.new_session("alpha/witness", temp.path()).await.unwrap();
        backend.set_capture("alpha/witness", vec!["[from boot] restart your session".to_string()]);

        let mut adopted = std::collections::HashSet::new();
        scan_legacy_nudges(&q, backend.as_ref(), &mut adopted).await.unwrap();
        scan_legacy_nudges(&q, backend.as_ref(), &mut adopted).await.unwrap();

        assert_eq!(q.len().unwrap(), 1);
    }
}
