use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::warn;
use tokio::sync::RwLock;
use uuid::Uuid;

use kale_common::model::{
    BlockIndex, BlockOperation, BlockStatus, ContractStatus, EligibleFarmer, ExitAuditLog,
    ExitSplit, ExitStatus, Farmer, FarmerStatus, Harvest, NewBlockOperation, PayoutLeg, Planting,
    PoolContract, Pooler, Stroops, Work,
};

use crate::{PoolStore, StoreError};

// In-memory twin of the Postgres backend with the same uniqueness and
// transition rules. Tests run the engines against it verbatim.

#[derive(Default)]
struct Inner {
    farmers: HashMap<Uuid, Farmer>,
    poolers: HashMap<Uuid, Pooler>,
    contracts: HashMap<Uuid, PoolContract>,
    blocks: HashMap<BlockIndex, BlockOperation>,
    plantings: HashMap<(BlockIndex, Uuid), Planting>,
    works: HashMap<(BlockIndex, Uuid), Work>,
    harvests: HashMap<(BlockIndex, Uuid), Harvest>,
    exits: HashMap<Uuid, ExitSplit>,
    audit: Vec<ExitAuditLog>,
    claims: HashMap<Uuid, DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- seeding helpers for tests and local runs --

    pub async fn put_farmer(&self, farmer: Farmer) {
        self.inner.write().await.farmers.insert(farmer.id, farmer);
    }

    pub async fn put_pooler(&self, pooler: Pooler) {
        self.inner.write().await.poolers.insert(pooler.id, pooler);
    }

    pub async fn put_contract(&self, contract: PoolContract) {
        self.inner
            .write()
            .await
            .contracts
            .insert(contract.id, contract);
    }

    pub async fn put_harvest(&self, harvest: Harvest) {
        self.inner
            .write()
            .await
            .harvests
            .insert((harvest.block_index, harvest.farmer_id), harvest);
    }

    pub async fn put_work(&self, work: Work) {
        self.inner
            .write()
            .await
            .works
            .insert((work.block_index, work.farmer_id), work);
    }

    // -- direct inspection for tests --

    pub async fn harvest(&self, block_index: BlockIndex, farmer_id: Uuid) -> Option<Harvest> {
        self.inner
            .read()
            .await
            .harvests
            .get(&(block_index, farmer_id))
            .cloned()
    }

    pub async fn exit_by_id(&self, id: Uuid) -> Option<ExitSplit> {
        self.inner.read().await.exits.get(&id).cloned()
    }

    pub async fn contract_by_id(&self, id: Uuid) -> Option<PoolContract> {
        self.inner.read().await.contracts.get(&id).cloned()
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn farmer_by_id(&self, id: Uuid) -> Result<Option<Farmer>, StoreError> {
        Ok(self.inner.read().await.farmers.get(&id).cloned())
    }

    async fn eligible_farmers(&self, pooler_id: Uuid) -> Result<Vec<EligibleFarmer>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<EligibleFarmer> = inner
            .farmers
            .values()
            .filter(|f| f.status == FarmerStatus::ActiveInPool && f.is_funded)
            .filter_map(|farmer| {
                inner
                    .contracts
                    .values()
                    .find(|c| {
                        c.farmer_id == farmer.id
                            && c.pooler_id == pooler_id
                            && c.status == ContractStatus::Active
                    })
                    .map(|contract| EligibleFarmer {
                        farmer: farmer.clone(),
                        contract: contract.clone(),
                    })
            })
            .collect();
        out.sort_by_key(|e| e.farmer.id);
        Ok(out)
    }

    async fn update_farmer_balance(
        &self,
        id: Uuid,
        balance: Stroops,
        is_funded: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let farmer = inner.farmers.get_mut(&id).ok_or(StoreError::NotFound("farmer"))?;
        farmer.current_balance = balance;
        farmer.is_funded = is_funded;
        farmer.needs_funding_check = false;
        if is_funded && farmer.funded_at.is_none() {
            farmer.funded_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn add_farmer_reward(&self, id: Uuid, reward: Stroops) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let farmer = inner.farmers.get_mut(&id).ok_or(StoreError::NotFound("farmer"))?;
        farmer.current_balance += reward;
        Ok(())
    }

    async fn set_farmer_status(&self, id: Uuid, status: FarmerStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let farmer = inner.farmers.get_mut(&id).ok_or(StoreError::NotFound("farmer"))?;
        farmer.status = status;
        Ok(())
    }

    async fn flag_funding_recheck(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let farmer = inner.farmers.get_mut(&id).ok_or(StoreError::NotFound("farmer"))?;
        farmer.needs_funding_check = true;
        Ok(())
    }

    async fn farmers_for_funding_check(&self) -> Result<Vec<Farmer>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Farmer> = inner
            .farmers
            .values()
            .filter(|f| f.needs_funding_check)
            .cloned()
            .collect();
        out.sort_by_key(|f| f.id);
        Ok(out)
    }

    async fn pooler_by_id(&self, id: Uuid) -> Result<Option<Pooler>, StoreError> {
        Ok(self.inner.read().await.poolers.get(&id).cloned())
    }

    async fn live_contract_for_farmer(
        &self,
        farmer_id: Uuid,
    ) -> Result<Option<PoolContract>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .contracts
            .values()
            .find(|c| {
                c.farmer_id == farmer_id
                    && matches!(
                        c.status,
                        ContractStatus::Pending | ContractStatus::Active | ContractStatus::Exiting
                    )
            })
            .cloned())
    }

    async fn set_contract_status(
        &self,
        id: Uuid,
        status: ContractStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let contract = inner
            .contracts
            .get_mut(&id)
            .ok_or(StoreError::NotFound("contract"))?;
        contract.status = status;
        if status == ContractStatus::Exiting {
            contract.exit_requested_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn upsert_block_operation(
        &self,
        new: &NewBlockOperation,
    ) -> Result<(BlockOperation, bool), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.blocks.get_mut(&new.block_index) {
            existing.entropy = new.entropy.clone();
            existing.block_age_secs = new.block_age_secs;
            existing.plantable = new.plantable;
            existing.min_zeros = new.min_zeros;
            existing.max_zeros = new.max_zeros;
            existing.min_stake = new.min_stake;
            existing.max_stake = new.max_stake;
            return Ok((existing.clone(), false));
        }

        let block = BlockOperation {
            id: Uuid::new_v4(),
            block_index: new.block_index,
            pooler_id: new.pooler_id,
            status: BlockStatus::Discovered,
            entropy: new.entropy.clone(),
            block_age_secs: new.block_age_secs,
            plantable: new.plantable,
            min_zeros: new.min_zeros,
            max_zeros: new.max_zeros,
            min_stake: new.min_stake,
            max_stake: new.max_stake,
            total_farmers: 0,
            successful_plants: 0,
            successful_works: 0,
            successful_harvests: 0,
            total_staked: 0,
            total_rewards: 0,
            discovered_at: Utc::now(),
            plant_requested_at: None,
            plant_completed_at: None,
            work_completed_at: None,
        };
        inner.blocks.insert(new.block_index, block.clone());
        Ok((block, true))
    }

    async fn block_operation_by_index(
        &self,
        block_index: BlockIndex,
    ) -> Result<Option<BlockOperation>, StoreError> {
        Ok(self.inner.read().await.blocks.get(&block_index).cloned())
    }

    async fn mark_plant_requested(&self, block_index: BlockIndex) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(block) = inner.blocks.get_mut(&block_index) {
            if block.plant_requested_at.is_none() {
                block.plant_requested_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn complete_block_empty(&self, block_index: BlockIndex) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.blocks.get_mut(&block_index) {
            Some(block) if block.status == BlockStatus::Discovered => {
                block.status = BlockStatus::Completed;
                block.total_farmers = 0;
            }
            _ => warn!("block {block_index} not in discovered state, empty completion skipped"),
        }
        Ok(())
    }

    async fn fail_block(&self, block_index: BlockIndex, _reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(block) = inner.blocks.get_mut(&block_index) {
            if !matches!(block.status, BlockStatus::Completed | BlockStatus::Failed) {
                block.status = BlockStatus::Failed;
            }
        }
        Ok(())
    }

    async fn record_plant_summary(
        &self,
        block_index: BlockIndex,
        total_farmers: u32,
        successful_plants: u32,
        total_staked: Stroops,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.blocks.get_mut(&block_index) {
            Some(block) if block.status == BlockStatus::Discovered => {
                block.status = BlockStatus::PlantingCompleted;
                block.total_farmers = total_farmers;
                block.successful_plants = successful_plants;
                block.total_staked = total_staked;
                block.plant_completed_at = Some(Utc::now());
            }
            _ => warn!("block {block_index} already past discovery, plant summary skipped"),
        }
        Ok(())
    }

    async fn record_work_summary(
        &self,
        block_index: BlockIndex,
        successful_works: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.blocks.get_mut(&block_index) {
            Some(block) if block.status == BlockStatus::PlantingCompleted => {
                block.status = BlockStatus::WorkCompleted;
                block.successful_works = successful_works;
                block.work_completed_at = Some(Utc::now());
            }
            _ => warn!("block {block_index} not awaiting work, work summary skipped"),
        }
        Ok(())
    }

    async fn record_harvest_summary(
        &self,
        block_index: BlockIndex,
        successful_harvests: u32,
        total_rewards: Stroops,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.blocks.get_mut(&block_index) {
            Some(block) if block.status == BlockStatus::WorkCompleted => {
                block.status = BlockStatus::Completed;
                block.successful_harvests += successful_harvests;
                block.total_rewards += total_rewards;
            }
            _ => warn!("block {block_index} not awaiting harvest, harvest summary skipped"),
        }
        Ok(())
    }

    async fn record_planting(&self, planting: &Planting) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (planting.block_index, planting.farmer_id);
        if inner.plantings.contains_key(&key) {
            return Ok(false);
        }
        inner.plantings.insert(key, planting.clone());
        Ok(true)
    }

    async fn successful_planting(
        &self,
        block_index: BlockIndex,
        farmer_id: Uuid,
    ) -> Result<Option<Planting>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .plantings
            .get(&(block_index, farmer_id))
            .filter(|p| p.status == kale_common::model::AttemptStatus::Success)
            .cloned())
    }

    async fn plantings_for_block(
        &self,
        block_index: BlockIndex,
    ) -> Result<Vec<Planting>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Planting> = inner
            .plantings
            .values()
            .filter(|p| p.block_index == block_index)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.farmer_id);
        Ok(out)
    }

    async fn record_work(&self, work: &Work) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (work.block_index, work.farmer_id);
        if inner.works.contains_key(&key) {
            return Ok(false);
        }
        inner.works.insert(key, work.clone());
        Ok(true)
    }

    async fn works_for_block(&self, block_index: BlockIndex) -> Result<Vec<Work>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Work> = inner
            .works
            .values()
            .filter(|w| w.block_index == block_index)
            .cloned()
            .collect();
        out.sort_by_key(|w| w.farmer_id);
        Ok(out)
    }

    async fn unharvested_work_blocks(
        &self,
        farmer_id: Uuid,
        up_to: BlockIndex,
    ) -> Result<Vec<BlockIndex>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<BlockIndex> = inner
            .works
            .values()
            .filter(|w| {
                w.farmer_id == farmer_id
                    && w.status == kale_common::model::AttemptStatus::Success
                    && w.block_index <= up_to
            })
            .filter(|w| {
                !inner
                    .harvests
                    .get(&(w.block_index, farmer_id))
                    .map(|h| h.status == kale_common::model::AttemptStatus::Success)
                    .unwrap_or(false)
            })
            .map(|w| w.block_index)
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    async fn record_harvest(&self, harvest: &Harvest) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (harvest.block_index, harvest.farmer_id);
        if inner.harvests.contains_key(&key) {
            return Ok(false);
        }
        inner.harvests.insert(key, harvest.clone());
        Ok(true)
    }

    async fn last_harvest_index(&self, farmer_id: Uuid) -> Result<Option<BlockIndex>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .harvests
            .values()
            .filter(|h| {
                h.farmer_id == farmer_id && h.status == kale_common::model::AttemptStatus::Success
            })
            .map(|h| h.block_index)
            .max())
    }

    async fn unexited_harvests(&self, farmer_id: Uuid) -> Result<Vec<Harvest>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Harvest> = inner
            .harvests
            .values()
            .filter(|h| {
                h.farmer_id == farmer_id
                    && h.status == kale_common::model::AttemptStatus::Success
                    && !h.included_in_exit
            })
            .cloned()
            .collect();
        out.sort_by_key(|h| h.block_index);
        Ok(out)
    }

    async fn processing_exit_for_farmer(
        &self,
        farmer_id: Uuid,
    ) -> Result<Option<ExitSplit>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .exits
            .values()
            .find(|e| e.farmer_id == farmer_id && e.status == ExitStatus::Processing)
            .cloned())
    }

    async fn create_exit_split(
        &self,
        split: &ExitSplit,
        harvest_ids: &[Uuid],
        audit: &ExitAuditLog,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        // split conservation, mirrored from the database CHECK
        if split.farmer_share + split.pooler_share + split.platform_fee != split.total_rewards {
            return Err(StoreError::Conflict("split does not conserve total".into()));
        }

        let claimable = inner
            .harvests
            .values()
            .filter(|h| harvest_ids.contains(&h.id) && !h.included_in_exit)
            .count();
        if claimable != harvest_ids.len() {
            return Err(StoreError::Conflict(format!(
                "only {claimable} of {} harvests could be marked for exit {}",
                harvest_ids.len(),
                split.id
            )));
        }

        for harvest in inner.harvests.values_mut() {
            if harvest_ids.contains(&harvest.id) {
                harvest.included_in_exit = true;
                harvest.exit_split_id = Some(split.id);
            }
        }
        if let Some(contract) = inner.contracts.get_mut(&split.contract_id) {
            contract.status = ContractStatus::Exiting;
            contract.exit_requested_at = Some(Utc::now());
        }
        if let Some(farmer) = inner.farmers.get_mut(&split.farmer_id) {
            farmer.status = FarmerStatus::Exiting;
        }
        inner.exits.insert(split.id, split.clone());
        inner.audit.push(audit.clone());
        Ok(())
    }

    async fn claim_pending_exits(
        &self,
        limit: usize,
        lease_secs: u64,
    ) -> Result<Vec<ExitSplit>, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let lease = Duration::seconds(lease_secs as i64);

        let mut claimable: Vec<ExitSplit> = inner
            .exits
            .values()
            .filter(|e| e.status == ExitStatus::Processing)
            .filter(|e| match inner.claims.get(&e.id) {
                Some(claimed_at) => now - *claimed_at >= lease,
                None => true,
            })
            .cloned()
            .collect();
        claimable.sort_by_key(|e| e.initiated_at);
        claimable.truncate(limit);

        for exit in &claimable {
            inner.claims.insert(exit.id, now);
        }
        Ok(claimable)
    }

    async fn update_exit_leg(
        &self,
        id: Uuid,
        leg: PayoutLeg,
        tx_hash: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let exit = inner.exits.get_mut(&id).ok_or(StoreError::NotFound("exit split"))?;
        let slot = match leg {
            PayoutLeg::Farmer => &mut exit.farmer_tx_hash,
            PayoutLeg::Pooler => &mut exit.pooler_tx_hash,
            PayoutLeg::Platform => &mut exit.platform_tx_hash,
        };
        if slot.is_none() {
            *slot = Some(tx_hash.to_string());
        }
        Ok(())
    }

    async fn bump_exit_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut inner = self.inner.write().await;
        let exit = inner.exits.get_mut(&id).ok_or(StoreError::NotFound("exit split"))?;
        exit.retry_count += 1;
        Ok(exit.retry_count)
    }

    async fn complete_exit(
        &self,
        split: &ExitSplit,
        audit: &ExitAuditLog,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        {
            let exit = inner
                .exits
                .get_mut(&split.id)
                .ok_or(StoreError::NotFound("exit split"))?;
            if exit.status != ExitStatus::Processing {
                return Err(StoreError::Conflict(format!(
                    "exit {} is not processing",
                    split.id
                )));
            }
            exit.status = ExitStatus::Completed;
            exit.completed_at = Some(Utc::now());
            exit.farmer_tx_hash = split.farmer_tx_hash.clone();
            exit.pooler_tx_hash = split.pooler_tx_hash.clone();
            exit.platform_tx_hash = split.platform_tx_hash.clone();
        }
        if let Some(contract) = inner.contracts.get_mut(&split.contract_id) {
            contract.status = ContractStatus::Completed;
        }
        if let Some(farmer) = inner.farmers.get_mut(&split.farmer_id) {
            farmer.status = FarmerStatus::Exited;
        }
        inner.audit.push(audit.clone());
        Ok(())
    }

    async fn fail_exit(
        &self,
        id: Uuid,
        _details: &str,
        audit: &ExitAuditLog,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let exit = inner.exits.get_mut(&id).ok_or(StoreError::NotFound("exit split"))?;
        if exit.status == ExitStatus::Processing {
            exit.status = ExitStatus::Failed;
        }
        inner.audit.push(audit.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &ExitAuditLog) -> Result<(), StoreError> {
        self.inner.write().await.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_for_exit(&self, exit_split_id: Uuid) -> Result<Vec<ExitAuditLog>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .audit
            .iter()
            .filter(|a| a.exit_split_id == exit_split_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kale_common::model::AttemptStatus;

    fn new_block(index: BlockIndex, pooler_id: Uuid) -> NewBlockOperation {
        NewBlockOperation {
            block_index: index,
            pooler_id,
            entropy: "ab".repeat(32),
            block_age_secs: 10,
            plantable: true,
            min_zeros: 4,
            max_zeros: 9,
            min_stake: 0,
            max_stake: 10_000_000,
        }
    }

    #[tokio::test]
    async fn duplicate_discovery_reuses_the_row() {
        let store = MemoryStore::new();
        let pooler = Uuid::new_v4();

        let (first, created) = store.upsert_block_operation(&new_block(42, pooler)).await.unwrap();
        assert!(created);

        // second discovery of block 42 with fresher metadata
        let mut refreshed = new_block(42, pooler);
        refreshed.block_age_secs = 25;
        let (second, created) = store.upsert_block_operation(&refreshed).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.block_age_secs, 25);
    }

    #[tokio::test]
    async fn at_most_one_planting_per_block_and_farmer() {
        let store = MemoryStore::new();
        let farmer = Uuid::new_v4();
        let pooler = Uuid::new_v4();

        let planting = Planting::success(7, farmer, pooler, "GWALLET".into(), 100, "tx1".into());
        assert!(store.record_planting(&planting).await.unwrap());

        let replay = Planting::success(7, farmer, pooler, "GWALLET".into(), 100, "tx2".into());
        assert!(!store.record_planting(&replay).await.unwrap());

        let rows = store.plantings_for_block(7).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].transaction_hash.as_deref(), Some("tx1"));
    }

    #[tokio::test]
    async fn block_status_never_moves_backwards() {
        let store = MemoryStore::new();
        let pooler = Uuid::new_v4();
        store.upsert_block_operation(&new_block(9, pooler)).await.unwrap();

        store.record_plant_summary(9, 3, 2, 500).await.unwrap();
        // a stale plant summary replay must not reset the status
        store.record_plant_summary(9, 1, 1, 100).await.unwrap();

        let block = store.block_operation_by_index(9).await.unwrap().unwrap();
        assert_eq!(block.status, BlockStatus::PlantingCompleted);
        assert_eq!(block.successful_plants, 2);
        assert_eq!(block.total_staked, 500);
    }

    #[tokio::test]
    async fn unharvested_blocks_exclude_harvested_ones() {
        let store = MemoryStore::new();
        let farmer = Uuid::new_v4();

        for index in [10, 20, 30] {
            store
                .put_work(Work {
                    id: Uuid::new_v4(),
                    block_index: index,
                    farmer_id: farmer,
                    nonce: 1,
                    hash: "00abc".into(),
                    zeros: 5,
                    gap: 0,
                    transaction_hash: Some("tx".into()),
                    status: AttemptStatus::Success,
                    error_message: None,
                    compensation_required: false,
                    worked_at: Utc::now(),
                })
                .await;
        }
        store
            .put_harvest(Harvest {
                id: Uuid::new_v4(),
                block_index: 10,
                farmer_id: farmer,
                reward_amount: 50,
                transaction_hash: Some("h".into()),
                status: AttemptStatus::Success,
                error_message: None,
                included_in_exit: false,
                exit_split_id: None,
                harvested_at: Utc::now(),
            })
            .await;

        assert_eq!(store.unharvested_work_blocks(farmer, 30).await.unwrap(), vec![20, 30]);
        assert_eq!(store.unharvested_work_blocks(farmer, 25).await.unwrap(), vec![20]);
        assert_eq!(store.last_harvest_index(farmer).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn claims_are_leased() {
        let store = MemoryStore::new();
        let exit = sample_exit();
        store.inner.write().await.exits.insert(exit.id, exit.clone());

        let claimed = store.claim_pending_exits(4, 600).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // still leased out
        let claimed = store.claim_pending_exits(4, 600).await.unwrap();
        assert!(claimed.is_empty());

        // an expired lease makes the exit claimable again
        let claimed = store.claim_pending_exits(4, 0).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    fn sample_exit() -> ExitSplit {
        ExitSplit {
            id: Uuid::new_v4(),
            farmer_id: Uuid::new_v4(),
            pooler_id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            total_rewards: 100,
            farmer_share: 70,
            pooler_share: 25,
            platform_fee: 5,
            reward_split_bps: 7000,
            platform_fee_bps: 500,
            farmer_external_wallet: "GEXT".into(),
            farmer_custodial_wallet: "GCUST".into(),
            pooler_wallet: "GPOOL".into(),
            platform_wallet: "GPLAT".into(),
            farmer_tx_hash: None,
            pooler_tx_hash: None,
            platform_tx_hash: None,
            status: ExitStatus::Processing,
            retry_count: 0,
            blocks_included: 1,
            harvests_included: 1,
            initiated_at: Utc::now(),
            completed_at: None,
            exit_reason: None,
        }
    }

    #[tokio::test]
    async fn harvests_cannot_join_two_exits() {
        let store = MemoryStore::new();
        let farmer = Uuid::new_v4();
        let harvest_id = Uuid::new_v4();
        store
            .put_harvest(Harvest {
                id: harvest_id,
                block_index: 5,
                farmer_id: farmer,
                reward_amount: 100,
                transaction_hash: Some("h".into()),
                status: AttemptStatus::Success,
                error_message: None,
                included_in_exit: false,
                exit_split_id: None,
                harvested_at: Utc::now(),
            })
            .await;

        let mut first = sample_exit();
        first.farmer_id = farmer;
        let audit = ExitAuditLog::new(first.id, "initiated", serde_json::json!({}));
        store.create_exit_split(&first, &[harvest_id], &audit).await.unwrap();

        let mut second = sample_exit();
        second.farmer_id = farmer;
        let audit = ExitAuditLog::new(second.id, "initiated", serde_json::json!({}));
        let err = store.create_exit_split(&second, &[harvest_id], &audit).await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));
    }
}
