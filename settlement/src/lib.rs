pub mod engine;
pub mod payout;
pub mod split;

pub use engine::{ExitRequest, SettlementEngine};
pub use payout::{PayoutConfig, PayoutRunner};

use thiserror::Error;

use kale_common::crypto::CryptoError;
use kale_common::model::{PayoutLeg, Stroops};
use kale_storage::StoreError;
use kale_wallet::ChainError;

use split::SplitError;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("unknown farmer")]
    UnknownFarmer,

    #[error("unknown pooler")]
    UnknownPooler,

    #[error("farmer has no active pool contract")]
    NoActiveContract,

    #[error("an exit is already processing for this farmer")]
    ExitInProgress,

    #[error("invalid external wallet address")]
    InvalidWallet,

    #[error("total rewards {total} are below the exit minimum {minimum}")]
    BelowMinimum { total: Stroops, minimum: Stroops },

    #[error(transparent)]
    Imbalance(#[from] SplitError),

    #[error("payout leg {leg} failed permanently: {reason}")]
    LegFailed { leg: PayoutLeg, reason: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("key handling error: {0}")]
    Crypto(#[from] CryptoError),
}

impl SettlementError {
    // Stable codes for the user-facing error body. Internal failures all
    // collapse to INTERNAL_ERROR so nothing chain- or db-specific leaks.
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::UnknownFarmer => "UNKNOWN_FARMER",
            SettlementError::UnknownPooler => "UNKNOWN_POOLER",
            SettlementError::NoActiveContract => "NO_ACTIVE_CONTRACT",
            SettlementError::ExitInProgress => "EXIT_ALREADY_PROCESSING",
            SettlementError::InvalidWallet => "INVALID_WALLET_ADDRESS",
            SettlementError::BelowMinimum { .. } => "EXIT_AMOUNT_BELOW_MINIMUM",
            SettlementError::Imbalance(_) => "CALCULATION_IMBALANCE",
            SettlementError::LegFailed { .. } => "PAYOUT_FAILED",
            SettlementError::Store(_) | SettlementError::Chain(_) | SettlementError::Crypto(_) => {
                "INTERNAL_ERROR"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            SettlementError::BelowMinimum { total: 1, minimum: 2 }.code(),
            "EXIT_AMOUNT_BELOW_MINIMUM"
        );
        assert_eq!(SettlementError::NoActiveContract.code(), "NO_ACTIVE_CONTRACT");
        assert_eq!(
            SettlementError::Store(StoreError::NotFound("x")).code(),
            "INTERNAL_ERROR"
        );
    }
}
