//! Millisecond clock shared by liveness bookkeeping
//!
//! `last_update == 0` is the forced-dead sentinel, so timestamps must be
//! wall-clock milliseconds (large against any configured expiry window).

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
