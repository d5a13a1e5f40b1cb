// Time helpers for the pool services.
//
// System time here is only used for scheduling, logging and persisted
// bookkeeping timestamps. Anything that gates a chain phase (block age,
// work delay) is computed against the block timestamp reported by the
// chain itself.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type TimestampMillis = u64;
pub type TimestampSeconds = u64;

#[inline]
pub fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
}

// Current unix time in seconds
pub fn now_secs() -> TimestampSeconds {
    now().as_secs()
}

// Current unix time in milliseconds
pub fn now_millis() -> TimestampMillis {
    now().as_millis() as TimestampMillis
}

// Age of a block whose timestamp is in unix seconds; zero when the
// timestamp sits in the future (clock skew between us and the chain).
pub fn block_age_secs(block_timestamp: TimestampSeconds) -> u64 {
    now_secs().saturating_sub(block_timestamp)
}
