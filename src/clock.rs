//! Wall-clock helpers.
//!
//! `SystemTime` is used for anything compared against on-disk deadlines
//! (expiry is stored as Unix-milliseconds). It is explicitly *not* used to
//! derive `cas` values, since it isn't guaranteed monotonic on every
//! platform; see `ShardWorker`'s cas counter for that.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix-milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall-clock time in Unix-nanoseconds, used only to seed the
/// per-shard cas counter at worker construction.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
