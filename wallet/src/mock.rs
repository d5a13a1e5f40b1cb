use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use kale_common::config::MIN_FUNDING_STROOPS;
use kale_common::model::{BlockIndex, Stroops};

use crate::{
    keys, BlockHead, ChainAdapter, ChainError, Funding, HarvestReceipt, NewWallet, TxReceipt,
};

// Scriptable in-memory chain adapter. Tests inject failures per wallet or
// destination and inspect the call journal afterwards.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CheckFunding { public: String },
    Plant { public: String, block_index: BlockIndex, stake: Stroops },
    Work { public: String, block_index: BlockIndex, nonce: u64 },
    Harvest { public: String, block_index: BlockIndex },
    Transfer { public: String, destination: String, amount: Stroops },
}

#[derive(Default)]
struct MockState {
    head: Option<BlockHead>,
    balances: HashMap<String, Stroops>,
    plant_failures: HashMap<String, ChainError>,
    harvest_failures: HashMap<String, ChainError>,
    // consumed front to back; an empty queue means the transfer succeeds
    transfer_failures: HashMap<String, VecDeque<ChainError>>,
    rewards: HashMap<(BlockIndex, String), Stroops>,
    default_reward: Stroops,
    calls: Vec<MockCall>,
    tx_counter: u64,
    healthy: bool,
}

pub struct MockChain {
    state: Mutex<MockState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                default_reward: 1_000_000,
                healthy: true,
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock chain lock poisoned")
    }

    pub fn set_head(&self, head: BlockHead) {
        self.lock().head = Some(head);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    pub fn credit(&self, public: &str, amount: Stroops) {
        self.lock().balances.insert(public.to_string(), amount);
    }

    pub fn fail_plant(&self, public: &str, error: ChainError) {
        self.lock().plant_failures.insert(public.to_string(), error);
    }

    pub fn fail_harvest(&self, public: &str, error: ChainError) {
        self.lock().harvest_failures.insert(public.to_string(), error);
    }

    // The next `times` transfers to this destination fail with clones of
    // the given error, then transfers succeed again.
    pub fn fail_transfers_to(&self, destination: &str, times: usize, error: ChainError) {
        let mut state = self.lock();
        let queue = state
            .transfer_failures
            .entry(destination.to_string())
            .or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn set_reward(&self, block_index: BlockIndex, public: &str, reward: Stroops) {
        self.lock().rewards.insert((block_index, public.to_string()), reward);
    }

    pub fn set_default_reward(&self, reward: Stroops) {
        self.lock().default_reward = reward;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn transfers_to(&self, destination: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, MockCall::Transfer { destination: d, .. } if d == destination))
            .count()
    }

    fn next_tx(state: &mut MockState, prefix: &str) -> String {
        state.tx_counter += 1;
        format!("{prefix}-{:06}", state.tx_counter)
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    async fn generate_wallet(&self) -> Result<NewWallet, ChainError> {
        Ok(keys::generate())
    }

    async fn check_funding(&self, public: &str) -> Result<Funding, ChainError> {
        let mut state = self.lock();
        state.calls.push(MockCall::CheckFunding { public: public.to_string() });
        let balance = state.balances.get(public).copied().unwrap_or(0);
        Ok(Funding {
            balance,
            is_funded: balance >= MIN_FUNDING_STROOPS,
        })
    }

    async fn head(&self) -> Result<BlockHead, ChainError> {
        self.lock()
            .head
            .clone()
            .ok_or_else(|| ChainError::Protocol("mock head not set".into()))
    }

    async fn plant(
        &self,
        secret: &str,
        block_index: BlockIndex,
        stake: Stroops,
    ) -> Result<TxReceipt, ChainError> {
        let public = keys::public_of_secret(secret)?;
        let mut state = self.lock();
        state.calls.push(MockCall::Plant {
            public: public.clone(),
            block_index,
            stake,
        });
        if let Some(error) = state.plant_failures.get(&public) {
            return Err(error.clone());
        }
        let tx_hash = Self::next_tx(&mut state, "plant");
        Ok(TxReceipt { tx_hash })
    }

    async fn work(
        &self,
        secret: &str,
        block_index: BlockIndex,
        nonce: u64,
        _hash: &str,
    ) -> Result<TxReceipt, ChainError> {
        let public = keys::public_of_secret(secret)?;
        let mut state = self.lock();
        state.calls.push(MockCall::Work {
            public,
            block_index,
            nonce,
        });
        let tx_hash = Self::next_tx(&mut state, "work");
        Ok(TxReceipt { tx_hash })
    }

    async fn harvest(
        &self,
        secret: &str,
        block_index: BlockIndex,
    ) -> Result<HarvestReceipt, ChainError> {
        let public = keys::public_of_secret(secret)?;
        let mut state = self.lock();
        state.calls.push(MockCall::Harvest {
            public: public.clone(),
            block_index,
        });
        if let Some(error) = state.harvest_failures.get(&public) {
            return Err(error.clone());
        }
        let reward = state
            .rewards
            .get(&(block_index, public))
            .copied()
            .unwrap_or(state.default_reward);
        let tx_hash = Self::next_tx(&mut state, "harvest");
        Ok(HarvestReceipt { tx_hash, reward })
    }

    async fn transfer(
        &self,
        secret: &str,
        destination: &str,
        amount: Stroops,
    ) -> Result<TxReceipt, ChainError> {
        let public = keys::public_of_secret(secret)?;
        let mut state = self.lock();
        state.calls.push(MockCall::Transfer {
            public,
            destination: destination.to_string(),
            amount,
        });
        if let Some(queue) = state.transfer_failures.get_mut(destination) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        let tx_hash = Self::next_tx(&mut state, "transfer");
        Ok(TxReceipt { tx_hash })
    }

    async fn health(&self) -> bool {
        self.lock().healthy
    }
}
