pub mod keys;
pub mod rpc;
pub mod tx;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;

use kale_common::crypto::CryptoError;
use kale_common::error::ErrorKind;
use kale_common::model::{BlockIndex, Stroops};

// The chain adapter is the only seam between the pool engines and the
// chain RPC. Everything behind it is synchronous from the caller's view
// and bounded by a per-operation timeout.

#[derive(Debug, Clone)]
pub struct NewWallet {
    pub public: String,
    pub secret: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Funding {
    pub balance: Stroops,
    pub is_funded: bool,
}

// Snapshot of the chain head as reported by the RPC
#[derive(Debug, Clone)]
pub struct BlockHead {
    pub block_index: BlockIndex,
    // 32 bytes, hex encoded
    pub entropy: String,
    // Unix seconds
    pub timestamp: u64,
    pub plantable: bool,
    pub min_stake: Stroops,
    pub max_stake: Stroops,
    pub min_zeros: u32,
    pub max_zeros: u32,
}

#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_hash: String,
}

#[derive(Debug, Clone)]
pub struct HarvestReceipt {
    pub tx_hash: String,
    pub reward: Stroops,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    // Rejected for a reason that goes away with a fresh sequence or fee
    #[error("chain rejected transaction: {0}")]
    Recoverable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("insufficient funds: need {need}, have {have}")]
    InsufficientFunds { need: Stroops, have: Stroops },

    #[error("malformed rpc response: {0}")]
    Protocol(String),

    #[error("key error: {0}")]
    Key(String),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Network(_) | ChainError::Timeout(_) | ChainError::Protocol(_) => {
                ErrorKind::TransientNetwork
            }
            ChainError::Recoverable(_) => ErrorKind::TransientChain,
            ChainError::BadRequest(_) | ChainError::Key(_) => ErrorKind::PermanentBadRequest,
            ChainError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<CryptoError> for ChainError {
    fn from(err: CryptoError) -> Self {
        ChainError::Key(err.to_string())
    }
}

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    // Fresh custodial keypair; the caller persists (and encrypts) it
    async fn generate_wallet(&self) -> Result<NewWallet, ChainError>;

    async fn check_funding(&self, public: &str) -> Result<Funding, ChainError>;

    async fn head(&self) -> Result<BlockHead, ChainError>;

    async fn plant(
        &self,
        secret: &str,
        block_index: BlockIndex,
        stake: Stroops,
    ) -> Result<TxReceipt, ChainError>;

    async fn work(
        &self,
        secret: &str,
        block_index: BlockIndex,
        nonce: u64,
        hash: &str,
    ) -> Result<TxReceipt, ChainError>;

    async fn harvest(
        &self,
        secret: &str,
        block_index: BlockIndex,
    ) -> Result<HarvestReceipt, ChainError>;

    async fn transfer(
        &self,
        secret: &str,
        destination: &str,
        amount: Stroops,
    ) -> Result<TxReceipt, ChainError>;

    // Liveness probe of the chain RPC
    async fn health(&self) -> bool;
}
