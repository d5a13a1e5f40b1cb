use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use kale_common::api::notify::{NotifyResponse, PlantedFarmersPayload};
use kale_common::crypto::cipher::SeedCipher;
use kale_common::model::{
    AttemptStatus, BlockStatus, ContractStatus, Farmer, FarmerStatus, PoolContract, Stroops,
};
use kale_common::time::now_secs;
use kale_discoverer::notifier::ExecutorNotifier;
use kale_discoverer::planter::{Planter, PlanterConfig};
use kale_discoverer::DiscovererError;
use kale_storage::{memory::MemoryStore, PoolStore};
use kale_wallet::mock::{MockCall, MockChain};
use kale_wallet::{keys, BlockHead, ChainError};

const CIPHER_KEY: [u8; 32] = [3u8; 32];
const BASE_STAKE: Stroops = 2_000_000;

#[derive(Default)]
struct RecordingNotifier {
    payloads: Mutex<Vec<PlantedFarmersPayload>>,
}

impl RecordingNotifier {
    fn payloads(&self) -> Vec<PlantedFarmersPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutorNotifier for RecordingNotifier {
    async fn notify(
        &self,
        payload: &PlantedFarmersPayload,
    ) -> Result<NotifyResponse, DiscovererError> {
        self.payloads.lock().unwrap().push(payload.clone());
        Ok(NotifyResponse {
            success: true,
            farmers_scheduled: payload.planted_farmers.len(),
        })
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    chain: Arc<MockChain>,
    cipher: Arc<SeedCipher>,
    notifier: Arc<RecordingNotifier>,
    planter: Planter,
    pooler_id: Uuid,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(MockChain::new());
    let cipher = Arc::new(SeedCipher::new(&CIPHER_KEY).unwrap());
    let notifier = Arc::new(RecordingNotifier::default());
    let pooler_id = Uuid::new_v4();

    let planter = Planter::new(
        chain.clone(),
        store.clone(),
        cipher.clone(),
        notifier.clone(),
        pooler_id,
        PlanterConfig {
            base_stake: BASE_STAKE,
            ..PlanterConfig::default()
        },
    );

    Fixture {
        store,
        chain,
        cipher,
        notifier,
        planter,
        pooler_id,
    }
}

async fn add_farmer(fixture: &Fixture, balance: Stroops) -> (Uuid, String) {
    let wallet = keys::generate();
    let farmer_id = Uuid::new_v4();
    fixture
        .store
        .put_farmer(Farmer {
            id: farmer_id,
            user_id: Uuid::new_v4(),
            custodial_public_key: wallet.public.clone(),
            custodial_secret_enc: fixture.cipher.encrypt_seed(&wallet.secret).unwrap(),
            payout_wallet_address: None,
            status: FarmerStatus::ActiveInPool,
            current_balance: balance,
            is_funded: true,
            needs_funding_check: false,
            funded_at: Some(Utc::now()),
            joined_pool_at: Some(Utc::now()),
        })
        .await;
    fixture
        .store
        .put_contract(PoolContract {
            id: Uuid::new_v4(),
            farmer_id,
            pooler_id: fixture.pooler_id,
            stake_bps: 5_000,
            harvest_interval: 1,
            reward_split_bps: 5_000,
            platform_fee_bps: 500,
            status: ContractStatus::Active,
            created_at: Utc::now(),
            confirmed_at: Some(Utc::now()),
            exit_requested_at: None,
            contract_terms: serde_json::json!({}),
        })
        .await;
    (farmer_id, wallet.public)
}

fn plantable_head(block_index: u64) -> BlockHead {
    BlockHead {
        block_index,
        entropy: "cd".repeat(32),
        timestamp: now_secs() - 40,
        plantable: true,
        min_stake: 0,
        max_stake: 100_000_000,
        min_zeros: 4,
        max_zeros: 9,
    }
}

fn plant_calls(chain: &MockChain) -> Vec<(String, u64, Stroops)> {
    chain
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::Plant {
                public,
                block_index,
                stake,
            } => Some((public, block_index, stake)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn partial_burst_isolates_the_failing_farmer() {
    let fixture = fixture();
    let (farmer_a, _) = add_farmer(&fixture, 10_000_000).await;
    let (farmer_b, public_b) = add_farmer(&fixture, 10_000_000).await;
    let (farmer_c, _) = add_farmer(&fixture, 10_000_000).await;
    fixture.chain.fail_plant(
        &public_b,
        ChainError::InsufficientFunds {
            need: 1_000_000,
            have: 7,
        },
    );

    fixture.planter.process_block(&plantable_head(42)).await.unwrap();

    let block = fixture.store.block_operation_by_index(42).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::PlantingCompleted);
    assert_eq!(block.total_farmers, 3);
    assert_eq!(block.successful_plants, 2);
    // each contract stakes 50% of the 2_000_000 base
    assert_eq!(block.total_staked, 2_000_000);

    let plantings = fixture.store.plantings_for_block(42).await.unwrap();
    assert_eq!(plantings.len(), 3);
    let failed: Vec<_> = plantings
        .iter()
        .filter(|p| p.status == AttemptStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].farmer_id, farmer_b);
    assert!(failed[0].error_message.as_deref().unwrap_or("").contains("insufficient"));

    // the notification carries exactly the two successful farmers
    let payloads = fixture.notifier.payloads();
    assert_eq!(payloads.len(), 1);
    let mut notified: Vec<Uuid> = payloads[0]
        .planted_farmers
        .iter()
        .map(|f| f.farmer_id)
        .collect();
    notified.sort();
    let mut expected = vec![farmer_a, farmer_c];
    expected.sort();
    assert_eq!(notified, expected);

    // the underfunded farmer is flagged for a balance re-check
    let flagged = fixture.store.farmers_for_funding_check().await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].id, farmer_b);
}

#[tokio::test]
async fn empty_selection_completes_without_a_burst() {
    let fixture = fixture();

    fixture.planter.process_block(&plantable_head(10)).await.unwrap();

    let block = fixture.store.block_operation_by_index(10).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::Completed);
    assert_eq!(block.total_farmers, 0);
    assert!(fixture.notifier.payloads().is_empty());
    assert!(plant_calls(&fixture.chain).is_empty());
}

#[tokio::test]
async fn duplicate_discovery_never_replants() {
    let fixture = fixture();
    add_farmer(&fixture, 10_000_000).await;
    add_farmer(&fixture, 10_000_000).await;

    let head = plantable_head(42);
    fixture.planter.process_block(&head).await.unwrap();
    fixture.planter.process_block(&head).await.unwrap();

    // one chain tx per farmer despite two discoveries
    assert_eq!(plant_calls(&fixture.chain).len(), 2);
    assert_eq!(fixture.store.plantings_for_block(42).await.unwrap().len(), 2);

    // the second discovery re-notifies the same farmer set
    let payloads = fixture.notifier.payloads();
    assert_eq!(payloads.len(), 2);
    let ids = |p: &PlantedFarmersPayload| {
        let mut ids: Vec<Uuid> = p.planted_farmers.iter().map(|f| f.farmer_id).collect();
        ids.sort();
        ids
    };
    assert_eq!(ids(&payloads[0]), ids(&payloads[1]));
}

#[tokio::test]
async fn stale_blocks_are_dropped() {
    let fixture = fixture();
    add_farmer(&fixture, 10_000_000).await;

    let mut head = plantable_head(99);
    head.timestamp = now_secs() - 300;
    head.plantable = false;
    fixture.planter.process_block(&head).await.unwrap();

    let block = fixture.store.block_operation_by_index(99).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::Failed);
    assert!(plant_calls(&fixture.chain).is_empty());
    assert!(fixture.notifier.payloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn young_blocks_wait_for_the_age_gate() {
    let fixture = fixture();
    let (farmer, _) = add_farmer(&fixture, 10_000_000).await;

    // freshly minted block, not yet plantable
    let mut head = plantable_head(55);
    head.timestamp = now_secs();
    head.plantable = false;
    fixture.planter.process_block(&head).await.unwrap();

    // the gate elapsed (virtually) and the plant went through
    let calls = plant_calls(&fixture.chain);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, 55);
    let planting = fixture.store.successful_planting(55, farmer).await.unwrap();
    assert!(planting.is_some());
}

#[tokio::test]
async fn stake_is_clamped_by_the_custodial_balance() {
    let fixture = fixture();
    // balance below the 1_000_000 the contract would stake
    add_farmer(&fixture, 250_000).await;

    fixture.planter.process_block(&plantable_head(7)).await.unwrap();

    let calls = plant_calls(&fixture.chain);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].2, 250_000);
}
