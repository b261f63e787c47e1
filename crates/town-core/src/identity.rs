//! Tagged agent identity.
//!
//! Replaces string-sniffing identity parsing (`strings.HasSuffix("-witness")`
//! style checks) with a tagged variant and a single parser/printer pair.
//! Every backend, mail and address
//! formatting call site derives from this type instead of re-deriving it from
//! a naming convention.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DaemonError;

/// The role an agent plays in a town.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Mayor,
    Deacon,
    Witness,
    Refinery,
    Crew,
    Polecat,
    Boot,
}

impl Role {
    /// Whether this role is a town-wide singleton (one instance, no rig).
    pub fn is_singleton(self) -> bool {
        matches!(self, Role::Mayor | Role::Deacon | Role::Boot)
    }

    /// Whether this role carries a per-rig name component (`crew/<name>`,
    /// `polecats/<name>`).
    pub fn is_named(self) -> bool {
        matches!(self, Role::Crew | Role::Polecat)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Mayor => "mayor",
            Role::Deacon => "deacon",
            Role::Witness => "witness",
            Role::Refinery => "refinery",
            Role::Crew => "crew",
            Role::Polecat => "polecat",
            Role::Boot => "boot",
        }
    }

    fn plural(self) -> &'static str {
        match self {
            Role::Crew => "crews",
            Role::Polecat => "polecats",
            other => other.as_str(),
        }
    }
}

impl FromStr for Role {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mayor" => Ok(Role::Mayor),
            "deacon" => Ok(Role::Deacon),
            "witness" => Ok(Role::Witness),
            "refinery" => Ok(Role::Refinery),
            "crew" | "crews" => Ok(Role::Crew),
            "polecat" | "polecats" => Ok(Role::Polecat),
            "boot" => Ok(Role::Boot),
            other => Err(DaemonError::InvalidIdentity(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved agent identity: role, optional rig, optional instance
/// name. The cache key used throughout the daemon.
///
/// Rendered as a slash-address: `rig/witness`, `rig/polecats/<name>`, or bare
/// `deacon` for town singletons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub role: Role,
    pub rig: Option<String>,
    pub name: Option<String>,
}

impl Identity {
    pub fn mayor() -> Self {
        Identity {
            role: Role::Mayor,
            rig: None,
            name: None,
        }
    }

    pub fn deacon() -> Self {
        Identity {
            role: Role::Deacon,
            rig: None,
            name: None,
        }
    }

    pub fn boot() -> Self {
        Identity {
            role: Role::Boot,
            rig: None,
            name: None,
        }
    }

    pub fn witness(rig: impl Into<String>) -> Self {
        Identity {
            role: Role::Witness,
            rig: Some(rig.into()),
            name: None,
        }
    }

    pub fn refinery(rig: impl Into<String>) -> Self {
        Identity {
            role: Role::Refinery,
            rig: Some(rig.into()),
            name: None,
        }
    }

    pub fn polecat(rig: impl Into<String>, name: impl Into<String>) -> Self {
        Identity {
            role: Role::Polecat,
            rig: Some(rig.into()),
            name: Some(name.into()),
        }
    }

    pub fn crew(rig: impl Into<String>, name: impl Into<String>) -> Self {
        Identity {
            role: Role::Crew,
            rig: Some(rig.into()),
            name: Some(name.into()),
        }
    }

    /// A filesystem- and backend-safe session name for this identity, e.g.
    /// `rig-witness` or `rig-polecat-name`. Distinct from the human-facing
    /// slash-address rendered by `Display`.
    pub fn session_name(&self) -> String {
        let mut parts = Vec::new();
        if let Some(rig) = &self.rig {
            parts.push(rig.clone());
        }
        parts.push(self.role.as_str().to_string());
        if let Some(name) = &self.name {
            parts.push(name.clone());
        }
        parts.join("-")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.rig, &self.name) {
            (Some(rig), Some(name)) => write!(f, "{rig}/{}/{name}", self.role.plural()),
            (Some(rig), None) => write!(f, "{rig}/{}", self.role.as_str()),
            (None, _) => f.write_str(self.role.as_str()),
        }
    }
}

impl FromStr for Identity {
    type Err = DaemonError;

    /// Parses `role`, `rig/role`, or `rig/role-plural/name` slash-addresses.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [role] => {
                let role = Role::from_str(role)?;
                if role.is_named() {
                    return Err(DaemonError::InvalidIdentity(s.to_string()));
                }
                Ok(Identity {
                    role,
                    rig: None,
                    name: None,
                })
            }
            [rig, role] => {
                let role = Role::from_str(role)?;
                if role.is_singleton() || role.is_named() {
                    return Err(DaemonError::InvalidIdentity(s.to_string()));
                }
                Ok(Identity {
                    role,
                    rig: Some((*rig).to_string()),
                    name: None,
                })
            }
            [rig, role, name] => {
                let role = Role::from_str(role)?;
                if !role.is_named() {
                    return Err(DaemonError::InvalidIdentity(s.to_string()));
                }
                Ok(Identity {
                    role,
                    rig: Some((*rig).to_string()),
                    name: Some((*name).to_string()),
                })
            }
            _ => Err(DaemonError::InvalidIdentity(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_round_trips() {
        let id = Identity::deacon();
        assert_eq!(id.to_string(), "deacon");
        assert_eq!(Identity::from_str("deacon").unwrap(), id);
    }

    #[test]
    fn per_rig_round_trips() {
        let id = Identity::witness("alpha");
        assert_eq!(id.to_string(), "alpha/witness");
        assert_eq!(Identity::from_str("alpha/witness").unwrap(), id);
    }

    #[test]
    fn named_round_trips() {
        let id = Identity::polecat("alpha", "p1");
        assert_eq!(id.to_string(), "alpha/polecats/p1");
        assert_eq!(Identity::from_str("alpha/polecats/p1").unwrap(), id);
    }

    #[test]
    fn crew_round_trips() {
        let id = Identity::crew("alpha", "c1");
        assert_eq!(id.to_string(), "alpha/crews/c1");
        assert_eq!(Identity::from_str("alpha/crews/c1").unwrap(), id);
    }

    #[test]
    fn rejects_singleton_with_rig() {
        assert!(Identity::from_str("alpha/deacon").is_err());
    }

    #[test]
    fn rejects_named_role_without_name() {
        assert!(Identity::from_str("alpha/polecats").is_err());
    }

    #[test]
    fn rejects_unknown_role() {
        assert!(Identity::from_str("alpha/gremlin").is_err());
    }

    #[test]
    fn session_name_is_hyphenated() {
        let id = Identity::polecat("alpha", "p1");
        assert_eq!(id.session_name(), "alpha-polecat-p1");
    }

    #[test]
    fn identity_is_hashable_cache_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(Identity::witness("alpha"), 1);
        assert_eq!(map.get(&Identity::witness("alpha")), Some(&1));
    }
}
