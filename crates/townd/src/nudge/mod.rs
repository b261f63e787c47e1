//! The nudge queue: a bounded, deduplicated, at-most-once-in-flight-per-target
//! reliable delivery queue backed by an append-only log with crash recovery.
//!
//! [`queue`] owns the on-disk record format, enqueue preconditions and the
//! file-locked read-modify-write transaction. [`dispatch`] owns the poll
//! loop, per-target delivery, stuck detection, escalation and legacy
//! adoption.

pub mod dispatch;
pub mod queue;

pub use queue::{NudgeQueue, NudgeRecord};
