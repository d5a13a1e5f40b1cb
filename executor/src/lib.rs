pub mod config;
pub mod harvester;
pub mod scheduler;
pub mod server;
pub mod worker;

use thiserror::Error;
use uuid::Uuid;

use kale_common::model::BlockIndex;
use kale_storage::StoreError;
use kale_wallet::ChainError;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("nonce subprocess failed: {0}")]
    Subprocess(String),

    #[error("farmer {farmer_id} has no successful planting for block {block_index}")]
    NoPlanting {
        block_index: BlockIndex,
        farmer_id: Uuid,
    },

    #[error("work deadline exceeded for block {0}")]
    DeadlineExceeded(BlockIndex),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
