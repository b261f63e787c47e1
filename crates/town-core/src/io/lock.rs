//! File locking with backoff retry.

use fs2::FileExt;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use crate::error::DaemonError;

/// File lock guard that automatically releases on drop.
pub struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquire an exclusive lock on a file with exponential backoff retry.
///
/// Attempt 0 waits 0ms, attempt 1 waits 50ms, attempt 2 waits 100ms, and so
/// on doubling each time. Used for `daemon.lock` (non-blocking single try,
/// see [`try_acquire_lock`]) and for `queue.lock`/`cooldowns.json`'s guard
/// file where a short wait for a contending writer is expected.
pub fn acquire_lock(path: &Path, max_retries: u32) -> Result<FileLock, DaemonError> {
    use std::fs::OpenOptions;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| DaemonError::io(path, e))?;

    for attempt in 0..=max_retries {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(FileLock { file }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if attempt < max_retries {
                    let wait_ms = 50u64 * (1 << attempt);
                    std::thread::sleep(Duration::from_millis(wait_ms));
                }
            }
            Err(e) => return Err(DaemonError::io(path, e)),
        }
    }

    Err(DaemonError::LockTimeout {
        path: path.to_path_buf(),
        retries: max_retries,
    })
}

/// Acquire the lock with a single non-blocking attempt. Used for
/// `daemon/daemon.lock`: a second daemon start must fail immediately, not
/// wait around for the first to exit.
pub fn try_acquire_lock(path: &Path) -> Result<FileLock, DaemonError> {
    acquire_lock(path, 0)
}
