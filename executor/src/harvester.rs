use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use kale_common::config::HARVEST_CONCURRENCY;
use kale_common::model::{AttemptStatus, BlockIndex, Harvest, Stroops};
use kale_storage::PoolStore;
use kale_wallet::ChainAdapter;

use crate::scheduler::{HarvestJob, ScheduledFarmer};

// Claims rewards once a block's work is done. A farmer is due when the
// completed block is at least harvest_interval blocks past their last
// harvest; everything they have worked but not yet claimed is harvested
// in one go, oldest block first.
pub struct Harvester {
    chain: Arc<dyn ChainAdapter>,
    store: Arc<dyn PoolStore>,
    concurrency: usize,
}

struct FarmerHarvest {
    successes: u32,
    rewards: Stroops,
}

impl Harvester {
    pub fn new(chain: Arc<dyn ChainAdapter>, store: Arc<dyn PoolStore>) -> Self {
        Self::with_concurrency(chain, store, HARVEST_CONCURRENCY)
    }

    pub fn with_concurrency(
        chain: Arc<dyn ChainAdapter>,
        store: Arc<dyn PoolStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            chain,
            store,
            concurrency,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<HarvestJob>, mut shutdown: watch::Receiver<bool>) {
        info!("harvester started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                job = rx.recv() => match job {
                    Some(job) => self.run_job(job).await,
                    None => break,
                },
            }
        }
        info!("harvester stopped");
    }

    pub async fn run_job(&self, job: HarvestJob) {
        let block_index = job.block_index;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for farmer in job.farmers {
            let semaphore = semaphore.clone();
            let chain = self.chain.clone();
            let store = self.store.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                harvest_farmer(chain, store, block_index, farmer).await
            });
        }

        let mut successes = 0u32;
        let mut rewards: Stroops = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    successes += outcome.successes;
                    rewards += outcome.rewards;
                }
                Err(err) => warn!("harvest task crashed: {err}"),
            }
        }

        if let Err(err) = self
            .store
            .record_harvest_summary(block_index, successes, rewards)
            .await
        {
            warn!("block {block_index}: harvest summary failed: {err}");
        }
        info!("block {block_index}: {successes} harvests for {rewards} stroops");
    }
}

async fn harvest_farmer(
    chain: Arc<dyn ChainAdapter>,
    store: Arc<dyn PoolStore>,
    block_index: BlockIndex,
    farmer: ScheduledFarmer,
) -> FarmerHarvest {
    let none = FarmerHarvest {
        successes: 0,
        rewards: 0,
    };

    let interval = match store.live_contract_for_farmer(farmer.farmer_id).await {
        Ok(Some(contract)) => contract.harvest_interval as u64,
        Ok(None) => {
            debug!("farmer {} has no live contract, skipping harvest", farmer.farmer_id);
            return none;
        }
        Err(err) => {
            warn!("contract lookup for farmer {} failed: {err}", farmer.farmer_id);
            return none;
        }
    };

    let pending = match store.unharvested_work_blocks(farmer.farmer_id, block_index).await {
        Ok(pending) => pending,
        Err(err) => {
            warn!("pending-work lookup for farmer {} failed: {err}", farmer.farmer_id);
            return none;
        }
    };
    if pending.is_empty() {
        return none;
    }

    // a farmer with no harvest yet measures the interval from their first
    // worked block
    let baseline = match store.last_harvest_index(farmer.farmer_id).await {
        Ok(Some(last)) => last,
        Ok(None) => pending[0].saturating_sub(1),
        Err(err) => {
            warn!("harvest history lookup for farmer {} failed: {err}", farmer.farmer_id);
            return none;
        }
    };
    if block_index.saturating_sub(baseline) < interval {
        debug!(
            "farmer {}: block {block_index} is within the harvest interval ({interval}), not due",
            farmer.farmer_id
        );
        return none;
    }

    let mut outcome = FarmerHarvest {
        successes: 0,
        rewards: 0,
    };
    for index in pending {
        match chain.harvest(&farmer.custodial_secret, index).await {
            Ok(receipt) => {
                let harvest = Harvest {
                    id: Uuid::new_v4(),
                    block_index: index,
                    farmer_id: farmer.farmer_id,
                    reward_amount: receipt.reward,
                    transaction_hash: Some(receipt.tx_hash),
                    status: AttemptStatus::Success,
                    error_message: None,
                    included_in_exit: false,
                    exit_split_id: None,
                    harvested_at: Utc::now(),
                };
                match store.record_harvest(&harvest).await {
                    Ok(true) => {
                        outcome.successes += 1;
                        outcome.rewards += receipt.reward;
                        if let Err(err) = store
                            .add_farmer_reward(farmer.farmer_id, receipt.reward)
                            .await
                        {
                            warn!("crediting reward to farmer {} failed: {err}", farmer.farmer_id);
                        }
                    }
                    Ok(false) => debug!(
                        "harvest row for block {index} / farmer {} already present",
                        farmer.farmer_id
                    ),
                    Err(err) => {
                        warn!("recording harvest for farmer {} failed: {err}", farmer.farmer_id)
                    }
                }
            }
            Err(err) => {
                warn!(
                    "harvest of block {index} for farmer {} failed: {err}",
                    farmer.farmer_id
                );
                let harvest = Harvest {
                    id: Uuid::new_v4(),
                    block_index: index,
                    farmer_id: farmer.farmer_id,
                    reward_amount: 0,
                    transaction_hash: None,
                    status: AttemptStatus::Failed,
                    error_message: Some(err.to_string()),
                    included_in_exit: false,
                    exit_split_id: None,
                    harvested_at: Utc::now(),
                };
                if let Err(record_err) = store.record_harvest(&harvest).await {
                    warn!(
                        "recording failed harvest for farmer {} failed: {record_err}",
                        farmer.farmer_id
                    );
                }
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use kale_common::model::{AttemptStatus, ContractStatus, Farmer, FarmerStatus, PoolContract, Work};
    use kale_storage::memory::MemoryStore;
    use kale_wallet::keys;
    use kale_wallet::mock::{MockCall, MockChain};

    struct Setup {
        store: Arc<MemoryStore>,
        chain: Arc<MockChain>,
        harvester: Harvester,
        farmer: ScheduledFarmer,
    }

    async fn setup(harvest_interval: u32) -> Setup {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new());
        let wallet = keys::generate();
        let farmer_id = Uuid::new_v4();

        store
            .put_farmer(Farmer {
                id: farmer_id,
                user_id: Uuid::new_v4(),
                custodial_public_key: wallet.public.clone(),
                custodial_secret_enc: "unused".into(),
                payout_wallet_address: None,
                status: FarmerStatus::ActiveInPool,
                current_balance: 0,
                is_funded: true,
                needs_funding_check: false,
                funded_at: Some(Utc::now()),
                joined_pool_at: Some(Utc::now()),
            })
            .await;
        store
            .put_contract(PoolContract {
                id: Uuid::new_v4(),
                farmer_id,
                pooler_id: Uuid::new_v4(),
                stake_bps: 5_000,
                harvest_interval,
                reward_split_bps: 5_000,
                platform_fee_bps: 500,
                status: ContractStatus::Active,
                created_at: Utc::now(),
                confirmed_at: Some(Utc::now()),
                exit_requested_at: None,
                contract_terms: serde_json::json!({}),
            })
            .await;

        let harvester = Harvester::with_concurrency(chain.clone(), store.clone(), 2);
        Setup {
            store,
            chain,
            harvester,
            farmer: ScheduledFarmer {
                farmer_id,
                custodial_wallet: wallet.public,
                custodial_secret: wallet.secret,
                stake: 1_000_000,
            },
        }
    }

    async fn add_work(setup: &Setup, block_index: BlockIndex) {
        setup
            .store
            .put_work(Work {
                id: Uuid::new_v4(),
                block_index,
                farmer_id: setup.farmer.farmer_id,
                nonce: 1,
                hash: "00000a".into(),
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

    fn harvest_calls(chain: &MockChain) -> Vec<BlockIndex> {
        chain
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Harvest { block_index, .. } => Some(block_index),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn due_farmer_harvests_all_pending_blocks() {
        let setup = setup(1).await;
        add_work(&setup, 10).await;
        add_work(&setup, 11).await;
        setup.chain.set_default_reward(700_000);

        setup
            .harvester
            .run_job(HarvestJob {
                block_index: 11,
                farmers: vec![setup.farmer.clone()],
            })
            .await;

        assert_eq!(harvest_calls(&setup.chain), vec![10, 11]);
        let harvest = setup.store.harvest(10, setup.farmer.farmer_id).await.unwrap();
        assert_eq!(harvest.status, AttemptStatus::Success);
        assert_eq!(harvest.reward_amount, 700_000);

        // rewards are credited onto the custodial balance
        let farmer = setup.store.farmer_by_id(setup.farmer.farmer_id).await.unwrap().unwrap();
        assert_eq!(farmer.current_balance, 1_400_000);
    }

    #[tokio::test]
    async fn interval_gates_the_harvest() {
        let setup = setup(5).await;
        add_work(&setup, 10).await;

        // first worked block is 10, so nothing is due before block 14
        setup
            .harvester
            .run_job(HarvestJob {
                block_index: 12,
                farmers: vec![setup.farmer.clone()],
            })
            .await;
        assert!(harvest_calls(&setup.chain).is_empty());

        // at block 14 the interval since the baseline (9) is met
        add_work(&setup, 14).await;
        setup
            .harvester
            .run_job(HarvestJob {
                block_index: 14,
                farmers: vec![setup.farmer.clone()],
            })
            .await;
        assert_eq!(harvest_calls(&setup.chain), vec![10, 14]);
    }

    #[tokio::test]
    async fn interval_measures_from_the_last_harvest() {
        let setup = setup(3).await;
        add_work(&setup, 10).await;
        setup
            .harvester
            .run_job(HarvestJob {
                block_index: 12,
                farmers: vec![setup.farmer.clone()],
            })
            .await;
        assert_eq!(harvest_calls(&setup.chain), vec![10]);

        // the next harvest is only due 3 blocks past the harvested block
        add_work(&setup, 11).await;
        setup
            .harvester
            .run_job(HarvestJob {
                block_index: 12,
                farmers: vec![setup.farmer.clone()],
            })
            .await;
        assert_eq!(harvest_calls(&setup.chain), vec![10]);

        setup
            .harvester
            .run_job(HarvestJob {
                block_index: 13,
                farmers: vec![setup.farmer.clone()],
            })
            .await;
        assert_eq!(harvest_calls(&setup.chain), vec![10, 11]);
    }

    #[tokio::test]
    async fn failed_harvest_is_recorded_and_isolated() {
        let setup = setup(1).await;
        add_work(&setup, 20).await;
        setup.chain.fail_harvest(
            &setup.farmer.custodial_wallet,
            kale_wallet::ChainError::Network("flap".into()),
        );

        setup
            .harvester
            .run_job(HarvestJob {
                block_index: 20,
                farmers: vec![setup.farmer.clone()],
            })
            .await;

        let harvest = setup.store.harvest(20, setup.farmer.farmer_id).await.unwrap();
        assert_eq!(harvest.status, AttemptStatus::Failed);
        assert!(harvest.error_message.is_some());
        let farmer = setup.store.farmer_by_id(setup.farmer.farmer_id).await.unwrap().unwrap();
        assert_eq!(farmer.current_balance, 0);
    }
}
