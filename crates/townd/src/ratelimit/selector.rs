//! Fallback profile selection: walks a role's ordered fallback chain,
//! skipping profiles on cooldown, honoring the "stay on preferred unless
//! every preferred profile is cooling" stickiness rule.

use town_core::config::{ProfileConfig, RolePolicy};

use super::cooldown::CooldownStore;

fn provider_of<'a>(profiles: &'a [ProfileConfig], name: &str) -> Option<&'a str> {
    profiles.iter().find(|p| p.name == name).map(|p| p.provider.as_str())
}

/// Choose the next profile name to swap `current` to for `policy`.
///
/// Returns `None` when every candidate in the fallback chain is cooling
/// (callers should surface [`town_core::DaemonError::AllProfilesCooling`]).
pub fn select_profile(
    policy: &RolePolicy,
    profiles: &[ProfileConfig],
    cooldowns: &CooldownStore,
    current: Option<&str>,
) -> Result<Option<String>, town_core::DaemonError> {
    if policy.only_failover_if_all_preferred_cooling {
        if let Some(preferred) = &policy.preferred_provider {
            for candidate in &policy.fallback_chain {
                if Some(candidate.as_str()) == current {
                    continue;
                }
                if provider_of(profiles, candidate) == Some(preferred.as_str()) && !cooldowns.is_cooling(candidate)? {
                    return Ok(Some(candidate.clone()));
                }
            }
            // Every profile on the preferred provider is cooling (or there
            // are none); fall through to the plain fallback-chain walk.
        }
    }

    for candidate in &policy.fallback_chain {
        if Some(candidate.as_str()) == current {
            continue;
        }
        if !cooldowns.is_cooling(candidate)? {
            return Ok(Some(candidate.clone()));
        }
    }

    Ok(None)
}
