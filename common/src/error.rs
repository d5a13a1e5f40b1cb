use std::time::Duration;

use strum::Display;

// Every failure surfaced by the pool carries one of these kinds so the
// engines can pick a uniform policy (retry, record, or fail fast) without
// inspecting error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    // Chain RPC or DB connection flapped
    TransientNetwork,
    // Tx rejected with a recoverable reason (sequence, fee)
    TransientChain,
    // Malformed input, surfaced to the caller as-is
    PermanentBadRequest,
    // Custodial wallet underfunded, farmer flagged for a balance re-check
    InsufficientFunds,
    // Nonce worker crashed or timed out
    SubprocessFailure,
    // Settlement split did not sum, fatal for that exit
    CalculationImbalance,
    // Re-discovery of an already known block, swallowed
    IdempotencyConflict,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork | ErrorKind::TransientChain | ErrorKind::SubprocessFailure
        )
    }
}

// Exponential backoff with a cap; attempt is zero-based.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map(|d| d.min(cap)).unwrap_or(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::TransientNetwork.is_retryable());
        assert!(ErrorKind::TransientChain.is_retryable());
        assert!(!ErrorKind::PermanentBadRequest.is_retryable());
        assert!(!ErrorKind::InsufficientFunds.is_retryable());
        assert!(!ErrorKind::CalculationImbalance.is_retryable());
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(8);
        assert_eq!(backoff_delay(0, base, cap), Duration::from_millis(500));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(10, base, cap), cap);
        assert_eq!(backoff_delay(40, base, cap), cap);
    }

    #[test]
    fn kind_display_is_snake_case() {
        assert_eq!(ErrorKind::TransientNetwork.to_string(), "transient_network");
        assert_eq!(ErrorKind::InsufficientFunds.to_string(), "insufficient_funds");
    }
}
