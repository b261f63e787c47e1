//! File-system primitives shared by every on-disk store in the daemon:
//! exclusive locking with backoff retry, and crash-safe atomic rewrite.

pub mod atomic;
pub mod lock;

pub use atomic::atomic_write;
pub use lock::{acquire_lock, try_acquire_lock, FileLock};
