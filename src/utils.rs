//! Small helpers shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current timestamp as nanoseconds since the Unix epoch.
///
/// Used to stamp received DAQ packets when the target does not provide its
/// own timestamps. If the system clock is before the epoch (very rare),
/// returns 0 rather than panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
