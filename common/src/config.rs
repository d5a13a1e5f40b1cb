use std::time::Duration;

// Money units

// 7 decimal places
pub const COIN_DECIMALS: u8 = 7;
// 10 000 000 stroops to represent 1 KALE
pub const STROOPS_PER_KALE: u64 = 10u64.pow(COIN_DECIMALS as u32);
// Minimum balance for a custodial wallet to take part in bursts (1 KALE)
pub const MIN_FUNDING_STROOPS: u64 = STROOPS_PER_KALE;
// Smallest total a farmer may settle out with (0.1 KALE)
pub const MIN_EXIT_STROOPS: u64 = STROOPS_PER_KALE / 10;
// Default stake base before the per-contract percentage is applied (5 KALE)
pub const DEFAULT_BASE_STAKE_STROOPS: u64 = 5 * STROOPS_PER_KALE;

// Ratio arithmetic
// All percentage-like values (stake percentage, reward split, platform fee)
// are carried as basis points so settlement never touches a float.
pub const BPS_SCALE: u32 = 10_000;
// Platform keeps 5% of gross rewards unless the contract overrides it
pub const DEFAULT_PLATFORM_FEE_BPS: u32 = 500;

// Block lifecycle timing

// A block must be at least this old before planting
pub const PLANT_AGE_SECS: u64 = 30;
// Blocks older than this are no longer worth planting
pub const PLANT_CUTOFF_SECS: u64 = PLANT_AGE_SECS + 60;
// Work is submitted this long after the block timestamp
pub const WORK_DELAY_SECS: u64 = 240;
// Past work_time + deadline the work phase is abandoned
pub const WORK_DEADLINE_SECS: u64 = 60;
// Wall-clock budget for one nonce-search subprocess run
pub const SUBPROCESS_TIMEOUT_SECS: u64 = 120;
// Recovery attempts for a failed nonce search, each with a doubled budget
pub const MAX_WORK_RECOVERIES: u32 = 3;
// Default difficulty asked of the nonce-search subprocess
pub const DEFAULT_TARGET_ZEROS: u32 = 5;
// Default nonce budget handed to the subprocess on the first attempt
pub const DEFAULT_NONCE_COUNT: u64 = 25_000_000;

// Polling & queueing

// Chain head poll cadence, clamped to the bounds below
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const MAX_POLL_INTERVAL_SECS: u64 = 30;
// Blocks waiting behind an in-flight plant burst
pub const BLOCK_QUEUE_DEPTH: usize = 4;

// Concurrency caps

pub const PLANT_CONCURRENCY: usize = 10;
pub const HARVEST_CONCURRENCY: usize = 5;
pub const SETTLE_CONCURRENCY: usize = 4;

// Retry policies

// Discoverer -> Executor notification
pub const NOTIFY_MAX_ATTEMPTS: u32 = 3;
pub const NOTIFY_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const NOTIFY_BACKOFF_CAP: Duration = Duration::from_secs(8);
// Settlement payout legs
pub const PAYOUT_MAX_RETRIES: u32 = 3;
pub const PAYOUT_BACKOFF_BASE: Duration = Duration::from_secs(30);
pub const PAYOUT_BACKOFF_CAP: Duration = Duration::from_secs(300);
// Chain transactions rejected for recoverable reasons (seq, fee)
pub const CHAIN_TX_MAX_RETRIES: u32 = 3;

// Per-operation wall-clock bound on any chain adapter call
pub const CHAIN_OP_TIMEOUT: Duration = Duration::from_secs(30);

// Shutdown: how long in-flight bursts get to settle before the kill
pub const DRAIN_SECS: u64 = 30;

// Clamp the configured poll interval into its allowed window
pub fn clamp_poll_interval(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_clamped() {
        assert_eq!(clamp_poll_interval(0), Duration::from_secs(1));
        assert_eq!(clamp_poll_interval(5), Duration::from_secs(5));
        assert_eq!(clamp_poll_interval(120), Duration::from_secs(30));
    }

    #[test]
    fn money_units() {
        assert_eq!(STROOPS_PER_KALE, 10_000_000);
        assert_eq!(MIN_EXIT_STROOPS, 1_000_000);
    }
}
