pub mod memory;
pub mod pg;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use kale_common::model::{
    BlockIndex, BlockOperation, ContractStatus, EligibleFarmer, ExitAuditLog, ExitSplit, Farmer,
    FarmerStatus, Harvest, NewBlockOperation, PayoutLeg, Planting, PoolContract, Pooler, Stroops,
    Work,
};

// The database is the single source of truth: Discoverer, Executor and
// the settlement runner coordinate exclusively through it. Multi-write
// operations (exit creation, exit completion) are single transactions
// inside the backend and are never observable half-applied.

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait PoolStore: Send + Sync {
    // -- farmers --

    async fn farmer_by_id(&self, id: Uuid) -> Result<Option<Farmer>, StoreError>;

    // Every farmer of this pooler with status active_in_pool, a funded
    // custodial wallet and a live contract.
    async fn eligible_farmers(&self, pooler_id: Uuid) -> Result<Vec<EligibleFarmer>, StoreError>;

    async fn update_farmer_balance(
        &self,
        id: Uuid,
        balance: Stroops,
        is_funded: bool,
    ) -> Result<(), StoreError>;

    // Credit a harvest reward onto the custodial balance
    async fn add_farmer_reward(&self, id: Uuid, reward: Stroops) -> Result<(), StoreError>;

    async fn set_farmer_status(&self, id: Uuid, status: FarmerStatus) -> Result<(), StoreError>;

    // insufficient_funds policy: flag now, re-check against the chain later
    async fn flag_funding_recheck(&self, id: Uuid) -> Result<(), StoreError>;

    async fn farmers_for_funding_check(&self) -> Result<Vec<Farmer>, StoreError>;

    // -- poolers & contracts --

    async fn pooler_by_id(&self, id: Uuid) -> Result<Option<Pooler>, StoreError>;

    // At most one live contract per farmer, enforced by a partial unique
    // index; this returns it regardless of pending/active/exiting.
    async fn live_contract_for_farmer(
        &self,
        farmer_id: Uuid,
    ) -> Result<Option<PoolContract>, StoreError>;

    async fn set_contract_status(
        &self,
        id: Uuid,
        status: ContractStatus,
    ) -> Result<(), StoreError>;

    // -- block operations --

    // Idempotent per block_index: a re-discovery refreshes the metadata
    // columns and returns the existing row. The bool reports whether the
    // row was created by this call.
    async fn upsert_block_operation(
        &self,
        new: &NewBlockOperation,
    ) -> Result<(BlockOperation, bool), StoreError>;

    async fn block_operation_by_index(
        &self,
        block_index: BlockIndex,
    ) -> Result<Option<BlockOperation>, StoreError>;

    async fn mark_plant_requested(&self, block_index: BlockIndex) -> Result<(), StoreError>;

    // No eligible farmers: the block is done before it started
    async fn complete_block_empty(&self, block_index: BlockIndex) -> Result<(), StoreError>;

    async fn fail_block(&self, block_index: BlockIndex, reason: &str) -> Result<(), StoreError>;

    // Aggregate the plant burst and advance to planting_completed
    async fn record_plant_summary(
        &self,
        block_index: BlockIndex,
        total_farmers: u32,
        successful_plants: u32,
        total_staked: Stroops,
    ) -> Result<(), StoreError>;

    async fn record_work_summary(
        &self,
        block_index: BlockIndex,
        successful_works: u32,
    ) -> Result<(), StoreError>;

    // Adds this burst's rewards and advances to completed
    async fn record_harvest_summary(
        &self,
        block_index: BlockIndex,
        successful_harvests: u32,
        total_rewards: Stroops,
    ) -> Result<(), StoreError>;

    // -- plantings / works / harvests --

    // All three record_* calls are idempotent per (block_index,
    // farmer_id): a duplicate is skipped and reported as false.
    async fn record_planting(&self, planting: &Planting) -> Result<bool, StoreError>;

    async fn successful_planting(
        &self,
        block_index: BlockIndex,
        farmer_id: Uuid,
    ) -> Result<Option<Planting>, StoreError>;

    async fn plantings_for_block(
        &self,
        block_index: BlockIndex,
    ) -> Result<Vec<Planting>, StoreError>;

    async fn record_work(&self, work: &Work) -> Result<bool, StoreError>;

    async fn works_for_block(&self, block_index: BlockIndex) -> Result<Vec<Work>, StoreError>;

    // Successfully worked blocks up to the given index that have no
    // successful harvest yet, oldest first.
    async fn unharvested_work_blocks(
        &self,
        farmer_id: Uuid,
        up_to: BlockIndex,
    ) -> Result<Vec<BlockIndex>, StoreError>;

    async fn record_harvest(&self, harvest: &Harvest) -> Result<bool, StoreError>;

    async fn last_harvest_index(&self, farmer_id: Uuid) -> Result<Option<BlockIndex>, StoreError>;

    // Successful harvests not yet tied to any exit split
    async fn unexited_harvests(&self, farmer_id: Uuid) -> Result<Vec<Harvest>, StoreError>;

    // -- exit settlement --

    async fn processing_exit_for_farmer(
        &self,
        farmer_id: Uuid,
    ) -> Result<Option<ExitSplit>, StoreError>;

    // One transaction: insert the split, mark the included harvests,
    // move the contract and farmer to exiting, append the audit entry.
    async fn create_exit_split(
        &self,
        split: &ExitSplit,
        harvest_ids: &[Uuid],
        audit: &ExitAuditLog,
    ) -> Result<(), StoreError>;

    // Claim up to `limit` processing exits for this runner. Claims are
    // leases: a crashed runner's exits become claimable again after
    // `lease_secs`.
    async fn claim_pending_exits(
        &self,
        limit: usize,
        lease_secs: u64,
    ) -> Result<Vec<ExitSplit>, StoreError>;

    async fn update_exit_leg(
        &self,
        id: Uuid,
        leg: PayoutLeg,
        tx_hash: &str,
    ) -> Result<(), StoreError>;

    // Returns the new total retry count
    async fn bump_exit_retry(&self, id: Uuid) -> Result<u32, StoreError>;

    // One transaction: split completed, contract completed, farmer
    // exited, audit appended.
    async fn complete_exit(&self, split: &ExitSplit, audit: &ExitAuditLog)
        -> Result<(), StoreError>;

    async fn fail_exit(
        &self,
        id: Uuid,
        details: &str,
        audit: &ExitAuditLog,
    ) -> Result<(), StoreError>;

    async fn append_audit(&self, entry: &ExitAuditLog) -> Result<(), StoreError>;

    async fn audit_for_exit(&self, exit_split_id: Uuid) -> Result<Vec<ExitAuditLog>, StoreError>;
}
