//! Town configuration: cadence constants, role policies and fallback
//! chains, loaded once at startup into an immutable [`TownConfig`].
//!
//! Environment-driven flags (the historical "degraded mode" globals) become
//! fields here instead: the config struct is built once in `main.rs` and
//! passed by reference into every sub-step, never read from the environment
//! again after startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::DaemonError;

/// Complete, resolved daemon configuration for one town.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TownConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub rigs: Vec<RigConfig>,
    /// Role policy keyed by role name (`witness`, `refinery`, `polecat`, ...).
    #[serde(default)]
    pub role_policies: HashMap<String, RolePolicy>,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

impl Default for TownConfig {
    fn default() -> Self {
        TownConfig {
            timing: TimingConfig::default(),
            rigs: Vec::new(),
            role_policies: HashMap::new(),
            profiles: Vec::new(),
        }
    }
}

/// Cadences and deadlines named throughout the component design.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub tick_interval_secs: u64,
    pub queue_poll_millis: u64,
    pub stuck_poll_secs: u64,
    pub rate_limit_scan_secs: u64,
    pub nudge_verify_delay_millis: u64,
    pub nudge_expiry_secs: u64,
    pub nudge_max_attempts: u32,
    pub nudge_escalation_threshold: u32,
    pub boot_running_fresh_secs: u64,
    pub boot_nudge_age_secs: u64,
    pub boot_restart_age_secs: u64,
    pub lifecycle_stale_secs: u64,
    pub gupp_stall_secs: u64,
    pub mass_death_window_secs: u64,
    pub mass_death_threshold: u32,
    pub restart_backoff_initial_secs: u64,
    pub restart_backoff_factor: u32,
    pub restart_backoff_cap_secs: u64,
    pub restart_crash_loop_threshold: u32,
    pub restart_crash_loop_window_secs: u64,
    pub restart_stability_reset_secs: u64,
    pub default_cooldown_secs: u64,
    pub runtime_ready_timeout_secs: u64,
    pub runtime_ready_poll_millis: u64,
    pub zombie_term_wait_millis: u64,
    pub spawn_trigger_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            tick_interval_secs: 180,
            queue_poll_millis: 200,
            stuck_poll_secs: 2,
            rate_limit_scan_secs: 30,
            nudge_verify_delay_millis: 200,
            nudge_expiry_secs: 120,
            nudge_max_attempts: 5,
            nudge_escalation_threshold: 3,
            boot_running_fresh_secs: 5 * 60,
            boot_nudge_age_secs: 15 * 60,
            boot_restart_age_secs: 30 * 60,
            lifecycle_stale_secs: 6 * 60 * 60,
            gupp_stall_secs: 30 * 60,
            mass_death_window_secs: 30,
            mass_death_threshold: 3,
            restart_backoff_initial_secs: 30,
            restart_backoff_factor: 2,
            restart_backoff_cap_secs: 10 * 60,
            restart_crash_loop_threshold: 5,
            restart_crash_loop_window_secs: 15 * 60,
            restart_stability_reset_secs: 30 * 60,
            default_cooldown_secs: 30 * 60,
            runtime_ready_timeout_secs: 60,
            runtime_ready_poll_millis: 500,
            zombie_term_wait_millis: 2_000,
            spawn_trigger_timeout_secs: 2,
        }
    }
}

/// One rig's operational state and working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    pub name: String,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub operational_state: RigOperationalState,
    /// Names of the registered per-rig polecats (one `Identity::polecat`
    /// each). The Witness and Refinery are implicit singletons per rig and
    /// need no separate listing.
    #[serde(default)]
    pub polecats: Vec<String>,
}

/// A rig may be parked or docked, both of which skip auto-start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RigOperationalState {
    #[default]
    Active,
    Parked,
    Docked,
}

impl RigOperationalState {
    pub fn skips_auto_start(self) -> bool {
        matches!(self, RigOperationalState::Parked | RigOperationalState::Docked)
    }
}

/// A role's fallback chain, cooldown and stickiness policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePolicy {
    /// Ordered fallback chain of profile names.
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default)]
    pub preferred_provider: Option<String>,
    #[serde(default)]
    pub only_failover_if_all_preferred_cooling: bool,
    #[serde(default)]
    pub transition_rules: Vec<TransitionRule>,
}

/// A match rule for the textual prelude injected after a profile swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRule {
    /// Profile name, or `"*"` for wildcard.
    pub from: String,
    /// Profile name, or `"*"` for wildcard.
    pub to: String,
    pub trigger: String,
    pub prelude: String,
}

impl TransitionRule {
    pub fn matches(&self, from: &str, to: &str) -> bool {
        (self.from == "*" || self.from == from) && (self.to == "*" || self.to == to)
    }
}

/// A named credential+provider pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    pub provider: String,
    pub credentials_handle: String,
}

/// Load and merge configuration from a TOML file plus town-root defaults.
///
/// Priority (highest to lowest): the explicit `config_path` if given, then
/// `<town_root>/daemon/config.toml`, then [`TownConfig::default`].
pub fn load_config(town_root: &Path, config_path: Option<&Path>) -> Result<TownConfig, DaemonError> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| town_root.join("daemon/config.toml"));

    if !path.exists() {
        return Ok(TownConfig::default());
    }

    let contents = std::fs::read_to_string(&path).map_err(|e| DaemonError::io(&path, e))?;
    toml::from_str(&contents).map_err(|e| DaemonError::Toml {
        path: path.clone(),
        source: Box::new(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = load_config(temp.path(), None).unwrap();
        assert_eq!(config.timing.tick_interval_secs, 180);
        assert!(config.rigs.is_empty());
    }

    #[test]
    fn loads_toml_config_file() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("daemon")).unwrap();
        std::fs::write(
            temp.path().join("daemon/config.toml"),
            r#"
            [timing]
            tick_interval_secs = 60

            [[rigs]]
            name = "alpha"
            work_dir = "/work/alpha"
            operational_state = "parked"
            "#,
        )
        .unwrap();

        let config = load_config(temp.path(), None).unwrap();
        assert_eq!(config.timing.tick_interval_secs, 60);
        assert_eq!(config.rigs.len(), 1);
        assert_eq!(config.rigs[0].operational_state, RigOperationalState::Parked);
    }

    #[test]
    fn explicit_config_path_overrides_town_root_default() {
        let temp = TempDir::new().unwrap();
        let explicit = temp.path().join("other.toml");
        std::fs::write(&explicit, "[timing]\ntick_interval_secs = 42\n").unwrap();

        let config = load_config(temp.path(), Some(&explicit)).unwrap();
        assert_eq!(config.timing.tick_interval_secs, 42);
    }

    #[test]
    fn parked_and_docked_rigs_skip_auto_start() {
        assert!(RigOperationalState::Parked.skips_auto_start());
        assert!(RigOperationalState::Docked.skips_auto_start());
        assert!(!RigOperationalState::Active.skips_auto_start());
    }

    #[test]
    fn wildcard_transition_rule_matches_any() {
        let rule = TransitionRule {
            from: "*".to_string(),
            to: "anthropic_b".to_string(),
            trigger: "rate_limit".to_string(),
            prelude: "resumed".to_string(),
        };
        assert!(rule.matches("anthropic_a", "anthropic_b"));
        assert!(!rule.matches("anthropic_a", "anthropic_c"));
    }
}
