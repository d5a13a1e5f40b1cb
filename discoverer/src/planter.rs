use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use uuid::Uuid;

use kale_common::api::notify::{PlantedFarmerEntry, PlantedFarmersPayload};
use kale_common::config::{
    BPS_SCALE, DEFAULT_BASE_STAKE_STROOPS, PLANT_AGE_SECS, PLANT_CONCURRENCY, PLANT_CUTOFF_SECS,
};
use kale_common::crypto::cipher::SeedCipher;
use kale_common::error::ErrorKind;
use kale_common::model::{
    BlockStatus, EligibleFarmer, NewBlockOperation, Planting, Stroops,
};
use kale_common::time::block_age_secs;
use kale_storage::PoolStore;
use kale_wallet::{BlockHead, ChainAdapter};

use crate::notifier::ExecutorNotifier;
use crate::DiscovererError;

#[derive(Debug, Clone)]
pub struct PlanterConfig {
    pub base_stake: Stroops,
    pub concurrency: usize,
    pub plant_age_secs: u64,
    pub plant_cutoff_secs: u64,
}

impl Default for PlanterConfig {
    fn default() -> Self {
        Self {
            base_stake: DEFAULT_BASE_STAKE_STROOPS,
            concurrency: PLANT_CONCURRENCY,
            plant_age_secs: PLANT_AGE_SECS,
            plant_cutoff_secs: PLANT_CUTOFF_SECS,
        }
    }
}

// Runs the full plant pipeline for one discovered block: record, select,
// wait out the age gate, fan out the burst, aggregate and notify the
// executor. Farmer failures stay inside their own burst slot.
pub struct Planter {
    chain: Arc<dyn ChainAdapter>,
    store: Arc<dyn PoolStore>,
    cipher: Arc<SeedCipher>,
    notifier: Arc<dyn ExecutorNotifier>,
    pooler_id: Uuid,
    config: PlanterConfig,
}

struct PlantOutcome {
    stake: Stroops,
    entry: Option<PlantedFarmerEntry>,
}

impl Planter {
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        store: Arc<dyn PoolStore>,
        cipher: Arc<SeedCipher>,
        notifier: Arc<dyn ExecutorNotifier>,
        pooler_id: Uuid,
        config: PlanterConfig,
    ) -> Self {
        Self {
            chain,
            store,
            cipher,
            notifier,
            pooler_id,
            config,
        }
    }

    pub async fn process_block(&self, head: &BlockHead) -> Result<(), DiscovererError> {
        let age = block_age_secs(head.timestamp);
        let (block, created) = self
            .store
            .upsert_block_operation(&NewBlockOperation {
                block_index: head.block_index,
                pooler_id: self.pooler_id,
                entropy: head.entropy.clone(),
                block_age_secs: age,
                plantable: head.plantable,
                min_zeros: head.min_zeros,
                max_zeros: head.max_zeros,
                min_stake: head.min_stake,
                max_stake: head.max_stake,
            })
            .await?;

        if !created {
            info!(
                "block {} re-discovered, reusing operation {}",
                head.block_index, block.id
            );
            match block.status {
                // previous run died before the burst; take over
                BlockStatus::Discovered => {}
                // burst done but the executor may have missed the word
                BlockStatus::PlantingCompleted => return self.renotify(head).await,
                other => {
                    debug!("block {} already {other}, nothing to do", head.block_index);
                    return Ok(());
                }
            }
        }

        if age > self.config.plant_cutoff_secs {
            warn!(
                "block {} is {age}s old, past the plant cutoff, dropping",
                head.block_index
            );
            self.store
                .fail_block(head.block_index, "past plant cutoff before burst")
                .await?;
            return Ok(());
        }

        let eligible = self.store.eligible_farmers(self.pooler_id).await?;
        if eligible.is_empty() {
            info!("block {}: no eligible farmers", head.block_index);
            self.store.complete_block_empty(head.block_index).await?;
            return Ok(());
        }

        if !head.plantable {
            let wait = self.config.plant_age_secs.saturating_sub(age);
            if wait > 0 {
                debug!(
                    "block {}: {wait}s until plantable age, waiting",
                    head.block_index
                );
                sleep(Duration::from_secs(wait)).await;
            }
        }

        self.store.mark_plant_requested(head.block_index).await?;

        let total_farmers = eligible.len();
        info!(
            "block {}: planting for {total_farmers} farmers",
            head.block_index
        );
        let outcomes = self.plant_burst(head, eligible).await;

        let entries: Vec<PlantedFarmerEntry> = outcomes
            .iter()
            .filter_map(|o| o.entry.clone())
            .collect();
        let total_staked: Stroops = outcomes
            .iter()
            .filter(|o| o.entry.is_some())
            .map(|o| o.stake)
            .sum();

        self.store
            .record_plant_summary(
                head.block_index,
                total_farmers as u32,
                entries.len() as u32,
                total_staked,
            )
            .await?;
        info!(
            "block {}: {}/{} plants succeeded, {total_staked} stroops staked",
            head.block_index,
            entries.len(),
            total_farmers
        );

        if entries.is_empty() {
            return Ok(());
        }
        self.send_notification(head, entries).await;
        Ok(())
    }

    async fn plant_burst(&self, head: &BlockHead, eligible: Vec<EligibleFarmer>) -> Vec<PlantOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();

        for candidate in eligible {
            let semaphore = semaphore.clone();
            let chain = self.chain.clone();
            let store = self.store.clone();
            let cipher = self.cipher.clone();
            let head = head.clone();
            let pooler_id = self.pooler_id;
            let base_stake = self.config.base_stake;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                plant_one(chain, store, cipher, &head, pooler_id, base_stake, candidate).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                // a crashed slot counts as a failed farmer, nothing more
                Err(err) => warn!("plant task crashed: {err}"),
            }
        }
        outcomes
    }

    // Rebuild the planted set from persisted rows and tell the executor
    // again; receipt on its side is idempotent per block.
    async fn renotify(&self, head: &BlockHead) -> Result<(), DiscovererError> {
        let mut entries = Vec::new();
        for planting in self.store.plantings_for_block(head.block_index).await? {
            if planting.status != kale_common::model::AttemptStatus::Success {
                continue;
            }
            let Some(farmer) = self.store.farmer_by_id(planting.farmer_id).await? else {
                warn!("planting {} references unknown farmer", planting.id);
                continue;
            };
            let secret = match self.cipher.decrypt_seed(&farmer.custodial_secret_enc) {
                Ok(secret) => secret,
                Err(err) => {
                    warn!("cannot decrypt seed for farmer {}: {err}", farmer.id);
                    continue;
                }
            };
            entries.push(PlantedFarmerEntry {
                farmer_id: farmer.id,
                custodial_wallet: planting.custodial_wallet.clone(),
                custodial_secret_key: secret.to_string(),
                stake_amount: planting.stake_amount.to_string(),
                planting_time: planting.planted_at,
            });
        }

        if entries.is_empty() {
            debug!("block {}: nothing to re-notify", head.block_index);
            return Ok(());
        }
        self.send_notification(head, entries).await;
        Ok(())
    }

    async fn send_notification(&self, head: &BlockHead, entries: Vec<PlantedFarmerEntry>) {
        let payload = PlantedFarmersPayload {
            block_index: head.block_index,
            entropy: head.entropy.clone(),
            block_timestamp: head.timestamp,
            planted_farmers: entries,
        };
        match self.notifier.notify(&payload).await {
            Ok(response) => info!(
                "block {}: executor scheduled {} farmers",
                head.block_index, response.farmers_scheduled
            ),
            // the operation stays at planting_completed; a later
            // re-discovery of this block re-notifies
            Err(err) => warn!(
                "block {}: executor notification failed, will re-notify on re-discovery: {err}",
                head.block_index
            ),
        }
    }
}

fn compute_stake(stake_bps: u32, base_stake: Stroops, balance: Stroops) -> Stroops {
    let desired = (base_stake as u128 * stake_bps as u128 / BPS_SCALE as u128) as Stroops;
    desired.min(balance)
}

async fn plant_one(
    chain: Arc<dyn ChainAdapter>,
    store: Arc<dyn PoolStore>,
    cipher: Arc<SeedCipher>,
    head: &BlockHead,
    pooler_id: Uuid,
    base_stake: Stroops,
    candidate: EligibleFarmer,
) -> PlantOutcome {
    let farmer = candidate.farmer;

    // replaying a discovery must not re-submit a plant that already landed
    match store.successful_planting(head.block_index, farmer.id).await {
        Ok(Some(existing)) => {
            debug!(
                "farmer {} already planted block {}, reusing",
                farmer.id, head.block_index
            );
            let entry = cipher
                .decrypt_seed(&farmer.custodial_secret_enc)
                .map(|secret| PlantedFarmerEntry {
                    farmer_id: farmer.id,
                    custodial_wallet: existing.custodial_wallet.clone(),
                    custodial_secret_key: secret.to_string(),
                    stake_amount: existing.stake_amount.to_string(),
                    planting_time: existing.planted_at,
                })
                .ok();
            return PlantOutcome {
                stake: existing.stake_amount,
                entry,
            };
        }
        Ok(None) => {}
        Err(err) => {
            warn!("planting lookup failed for farmer {}: {err}", farmer.id);
            return PlantOutcome { stake: 0, entry: None };
        }
    }

    let stake = compute_stake(candidate.contract.stake_bps, base_stake, farmer.current_balance);

    let secret = match cipher.decrypt_seed(&farmer.custodial_secret_enc) {
        Ok(secret) => secret,
        Err(err) => {
            warn!("cannot decrypt seed for farmer {}: {err}", farmer.id);
            record_failure(&store, head, &farmer, pooler_id, stake, format!("seed unusable: {err}")).await;
            return PlantOutcome { stake, entry: None };
        }
    };

    match chain.plant(&secret, head.block_index, stake).await {
        Ok(receipt) => {
            let planting = Planting::success(
                head.block_index,
                farmer.id,
                pooler_id,
                farmer.custodial_public_key.clone(),
                stake,
                receipt.tx_hash,
            );
            if let Err(err) = store.record_planting(&planting).await {
                warn!("recording planting for farmer {} failed: {err}", farmer.id);
            }
            let entry = PlantedFarmerEntry {
                farmer_id: farmer.id,
                custodial_wallet: farmer.custodial_public_key,
                custodial_secret_key: secret.to_string(),
                stake_amount: stake.to_string(),
                planting_time: planting.planted_at,
            };
            PlantOutcome {
                stake,
                entry: Some(entry),
            }
        }
        Err(err) => {
            debug!(
                "plant failed for farmer {} on block {}: {err}",
                farmer.id, head.block_index
            );
            if err.kind() == ErrorKind::InsufficientFunds {
                if let Err(flag_err) = store.flag_funding_recheck(farmer.id).await {
                    warn!("flagging funding re-check for {} failed: {flag_err}", farmer.id);
                }
            }
            record_failure(&store, head, &farmer, pooler_id, stake, err.to_string()).await;
            PlantOutcome { stake, entry: None }
        }
    }
}

async fn record_failure(
    store: &Arc<dyn PoolStore>,
    head: &BlockHead,
    farmer: &kale_common::model::Farmer,
    pooler_id: Uuid,
    stake: Stroops,
    error: String,
) {
    let planting = Planting::failed(
        head.block_index,
        farmer.id,
        pooler_id,
        farmer.custodial_public_key.clone(),
        stake,
        error,
    );
    if let Err(err) = store.record_planting(&planting).await {
        warn!("recording failed planting for farmer {} failed: {err}", farmer.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stake_scales_with_contract_and_clamps_to_balance() {
        // 50% of a 5 KALE base
        assert_eq!(compute_stake(5_000, 50_000_000, 100_000_000), 25_000_000);
        // clamped by the wallet balance
        assert_eq!(compute_stake(5_000, 50_000_000, 1_000_000), 1_000_000);
        // zero percentage stakes nothing
        assert_eq!(compute_stake(0, 50_000_000, 100_000_000), 0);
        // empty wallet stakes nothing
        assert_eq!(compute_stake(10_000, 50_000_000, 0), 0);
    }
}
