//! Crash-safe atomic file rewrite.
//!
//! Every persisted store in the daemon (nudge queue, cooldowns, restart
//! tracker, boot status) is rewritten the same way: write the full contents
//! to a sibling `.tmp` file, fsync it, then rename over the real path. The
//! rename is atomic on both POSIX and Windows filesystems, so a reader never
//! observes a partially written file and a crash mid-write leaves the old
//! contents intact.
//!
//! This is a deliberate simplification of a platform-specific atomic-swap
//! syscall approach: the component design calls only for tmp-file-plus-rename,
//! not a cross-file content exchange.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::DaemonError;

/// Write `contents` to `path` via a temporary sibling file, fsync, then
/// rename into place.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), DaemonError> {
    let tmp_path = tmp_path_for(path);

    let mut file = File::create(&tmp_path).map_err(|e| DaemonError::io(&tmp_path, e))?;
    file.write_all(contents)
        .map_err(|e| DaemonError::io(&tmp_path, e))?;
    file.sync_all().map_err(|e| DaemonError::io(&tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| DaemonError::io(path, e))?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.jsonl");

        atomic_write(&path, b"line one\nline two\n").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "line one\nline two\n");
    }

    #[test]
    fn tmp_file_does_not_survive_a_successful_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cooldowns.json");

        atomic_write(&path, b"[]").unwrap();
        assert!(!dir.path().join("cooldowns.json.tmp").exists());
    }

    #[test]
    fn overwrites_existing_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("restart_state.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }
}
