#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use kale_common::difficulty::work_hash;
use kale_common::model::{AttemptStatus, BlockStatus, NewBlockOperation, Planting};
use kale_common::time::now_secs;
use kale_executor::scheduler::{ScheduledFarmer, SchedulerCommand, WorkJob};
use kale_executor::worker::{WorkConfig, WorkRunner};
use kale_storage::{memory::MemoryStore, PoolStore};
use kale_wallet::keys;
use kale_wallet::mock::{MockCall, MockChain};

// Stand-in for the nonce-search binary: ignores its arguments and prints
// a pre-computed candidate stream.
fn fake_worker(dir: &tempfile::TempDir, stdout_lines: &[String]) -> PathBuf {
    let path = dir.path().join("kale-worker.sh");
    let mut script = String::from("#!/bin/sh\n");
    for line in stdout_lines {
        script.push_str(&format!("echo '{line}'\n"));
    }
    std::fs::write(&path, script).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}

struct Setup {
    store: Arc<MemoryStore>,
    chain: Arc<MockChain>,
    farmer: ScheduledFarmer,
    farmer_bytes: [u8; 32],
}

async fn setup() -> Setup {
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(MockChain::new());

    let wallet = keys::generate();
    let farmer_hex = keys::public_hex_of_secret(&wallet.secret).unwrap();
    let farmer_bytes: [u8; 32] = hex::decode(&farmer_hex).unwrap().try_into().unwrap();

    Setup {
        store,
        chain,
        farmer: ScheduledFarmer {
            farmer_id: Uuid::new_v4(),
            custodial_wallet: wallet.public,
            custodial_secret: wallet.secret,
            stake: 1_000_000,
        },
        farmer_bytes,
    }
}

fn runner(
    setup: &Setup,
    worker_bin: PathBuf,
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
) -> WorkRunner {
    WorkRunner::new(
        setup.chain.clone(),
        setup.store.clone(),
        scheduler_tx,
        WorkConfig {
            worker_bin,
            nonce_count: 1_000,
            target_zeros: 0,
            subprocess_timeout: Duration::from_secs(5),
            max_recoveries: 1,
            ..WorkConfig::default()
        },
    )
}

const ENTROPY: [u8; 32] = [0xcd; 32];

fn job(setup: &Setup, block_index: u64) -> WorkJob {
    WorkJob {
        block_index,
        entropy: hex::encode(ENTROPY),
        block_timestamp: now_secs().saturating_sub(290),
        farmers: vec![setup.farmer.clone()],
    }
}

async fn seed_block_and_planting(setup: &Setup, block_index: u64) {
    setup
        .store
        .upsert_block_operation(&NewBlockOperation {
            block_index,
            pooler_id: Uuid::new_v4(),
            entropy: hex::encode(ENTROPY),
            block_age_secs: 0,
            plantable: true,
            min_zeros: 0,
            max_zeros: 9,
            min_stake: 0,
            max_stake: 10_000_000,
        })
        .await
        .unwrap();
    setup
        .store
        .record_plant_summary(block_index, 1, 1, 1_000_000)
        .await
        .unwrap();
    setup
        .store
        .record_planting(&Planting::success(
            block_index,
            setup.farmer.farmer_id,
            Uuid::new_v4(),
            setup.farmer.custodial_wallet.clone(),
            1_000_000,
            "plant-tx".into(),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn valid_candidate_is_verified_and_submitted() {
    let setup = setup().await;
    seed_block_and_planting(&setup, 42).await;

    let nonce = 7u64;
    let hash = hex::encode(work_hash(&setup.farmer_bytes, 42, &ENTROPY, nonce));
    let dir = tempfile::tempdir().unwrap();
    let worker_bin = fake_worker(&dir, &[format!("[{nonce}, \"{hash}\"]")]);

    let (tx, mut rx) = mpsc::channel(8);
    runner(&setup, worker_bin, tx).run_block(job(&setup, 42)).await;

    let works = setup.store.works_for_block(42).await.unwrap();
    assert_eq!(works.len(), 1);
    assert_eq!(works[0].status, AttemptStatus::Success);
    assert_eq!(works[0].nonce, nonce);
    assert_eq!(works[0].hash, hash);
    assert!(works[0].transaction_hash.is_some());

    // the chain saw exactly one work submission
    let submissions: Vec<_> = setup
        .chain
        .calls()
        .into_iter()
        .filter(|call| matches!(call, MockCall::Work { .. }))
        .collect();
    assert_eq!(submissions.len(), 1);

    // block advanced and the harvest got queued
    let block = setup.store.block_operation_by_index(42).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::WorkCompleted);
    assert_eq!(block.successful_works, 1);
    assert!(matches!(
        rx.try_recv().unwrap(),
        SchedulerCommand::ScheduleHarvest(h) if h.block_index == 42
    ));
}

#[tokio::test]
async fn work_without_planting_is_refused() {
    let setup = setup().await;
    // block exists but the farmer never planted
    setup
        .store
        .upsert_block_operation(&NewBlockOperation {
            block_index: 43,
            pooler_id: Uuid::new_v4(),
            entropy: hex::encode(ENTROPY),
            block_age_secs: 0,
            plantable: true,
            min_zeros: 0,
            max_zeros: 9,
            min_stake: 0,
            max_stake: 10_000_000,
        })
        .await
        .unwrap();
    setup.store.record_plant_summary(43, 1, 0, 0).await.unwrap();

    let nonce = 7u64;
    let hash = hex::encode(work_hash(&setup.farmer_bytes, 43, &ENTROPY, nonce));
    let dir = tempfile::tempdir().unwrap();
    let worker_bin = fake_worker(&dir, &[format!("[{nonce}, \"{hash}\"]")]);

    let (tx, _rx) = mpsc::channel(8);
    runner(&setup, worker_bin, tx).run_block(job(&setup, 43)).await;

    assert!(setup.store.works_for_block(43).await.unwrap().is_empty());
    assert!(setup
        .chain
        .calls()
        .iter()
        .all(|call| !matches!(call, MockCall::Work { .. })));
}

#[tokio::test]
async fn lying_subprocess_exhausts_recoveries_and_compensates() {
    let setup = setup().await;
    seed_block_and_planting(&setup, 44).await;

    // hash does not match the claimed nonce
    let dir = tempfile::tempdir().unwrap();
    let worker_bin = fake_worker(&dir, &[format!("[9, \"{}\"]", "ab".repeat(32))]);

    let (tx, _rx) = mpsc::channel(8);
    runner(&setup, worker_bin, tx).run_block(job(&setup, 44)).await;

    let works = setup.store.works_for_block(44).await.unwrap();
    assert_eq!(works.len(), 1);
    assert_eq!(works[0].status, AttemptStatus::Failed);
    assert!(works[0].compensation_required);
    assert!(setup
        .chain
        .calls()
        .iter()
        .all(|call| !matches!(call, MockCall::Work { .. })));
}

#[tokio::test]
async fn missed_deadline_marks_compensation() {
    let setup = setup().await;
    seed_block_and_planting(&setup, 45).await;

    let dir = tempfile::tempdir().unwrap();
    let worker_bin = fake_worker(&dir, &["[1, \"aa\"]".to_string()]);

    let (tx, _rx) = mpsc::channel(8);
    let mut old_job = job(&setup, 45);
    // far past block_timestamp + delay + deadline
    old_job.block_timestamp = now_secs().saturating_sub(3_600);
    runner(&setup, worker_bin, tx).run_block(old_job).await;

    let works = setup.store.works_for_block(45).await.unwrap();
    assert_eq!(works.len(), 1);
    assert_eq!(works[0].status, AttemptStatus::Failed);
    assert!(works[0].compensation_required);
    assert!(works[0]
        .error_message
        .as_deref()
        .unwrap_or("")
        .contains("deadline"));
}

#[tokio::test]
async fn duplicate_job_skips_existing_work() {
    let setup = setup().await;
    seed_block_and_planting(&setup, 46).await;

    let nonce = 3u64;
    let hash = hex::encode(work_hash(&setup.farmer_bytes, 46, &ENTROPY, nonce));
    let dir = tempfile::tempdir().unwrap();
    let worker_bin = fake_worker(&dir, &[format!("[{nonce}, \"{hash}\"]")]);

    let (tx, _rx) = mpsc::channel(8);
    let runner = runner(&setup, worker_bin, tx);
    runner.run_block(job(&setup, 46)).await;
    runner.run_block(job(&setup, 46)).await;

    let submissions: Vec<_> = setup
        .chain
        .calls()
        .into_iter()
        .filter(|call| matches!(call, MockCall::Work { .. }))
        .collect();
    assert_eq!(submissions.len(), 1);
    assert_eq!(setup.store.works_for_block(46).await.unwrap().len(), 1);
}
