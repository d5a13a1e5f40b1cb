pub mod config;
pub mod funding;
pub mod notifier;
pub mod planter;
pub mod poller;

use thiserror::Error;

use kale_common::crypto::CryptoError;
use kale_storage::StoreError;
use kale_wallet::ChainError;

#[derive(Debug, Error)]
pub enum DiscovererError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("key handling error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("executor notification failed: {0}")]
    Notify(String),
}
