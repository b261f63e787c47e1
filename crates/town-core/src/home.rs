//! Town root discovery.
//!
//! A daemon is authoritative for exactly one town. This module resolves
//! which directory that is, mirroring the precedence the platform's other
//! binaries use for their home-directory resolution.
//!
//! # Precedence
//!
//! 1. `GASTOWN_ROOT` environment variable (if set and non-empty)
//! 2. current working directory, if it (or an ancestor) contains a
//!    `daemon/` directory
//! 3. `dirs::home_dir()`-derived default at `~/.gastown`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolve the town root directory.
///
/// # Precedence
///
/// 1. `GASTOWN_ROOT` environment variable (if set and non-empty)
/// 2. the given `start_dir` or one of its ancestors that contains a
///    `daemon/` directory
/// 3. `~/.gastown`
pub fn resolve_town_root(start_dir: &Path) -> Result<PathBuf> {
    if let Ok(root) = std::env::var("GASTOWN_ROOT") {
        let trimmed = root.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    if let Some(found) = find_ancestor_town(start_dir) {
        return Ok(found);
    }

    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".gastown"))
}

fn find_ancestor_town(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = start_dir;
    loop {
        if dir.join("daemon").is_dir() {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}
