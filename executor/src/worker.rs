use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use uuid::Uuid;

use kale_common::config::{
    DEFAULT_NONCE_COUNT, DEFAULT_TARGET_ZEROS, MAX_WORK_RECOVERIES, SUBPROCESS_TIMEOUT_SECS,
    WORK_DEADLINE_SECS, WORK_DELAY_SECS,
};
use kale_common::difficulty::{difficulty_gap, leading_hex_zeros, work_hash};
use kale_common::model::{AttemptStatus, Work};
use kale_common::time::now_secs;
use kale_storage::PoolStore;
use kale_wallet::{keys, ChainAdapter};

use crate::scheduler::{HarvestJob, ScheduledFarmer, SchedulerCommand, WorkJob};
use crate::ExecutorError;

#[derive(Debug, Clone)]
pub struct WorkConfig {
    // Path to the nonce-search binary
    pub worker_bin: PathBuf,
    // Nonce budget of the first attempt; recoveries double it
    pub nonce_count: u64,
    pub target_zeros: u32,
    pub subprocess_timeout: Duration,
    pub max_recoveries: u32,
    pub work_delay_secs: u64,
    pub work_deadline_secs: u64,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            worker_bin: PathBuf::from("kale-worker"),
            nonce_count: DEFAULT_NONCE_COUNT,
            target_zeros: DEFAULT_TARGET_ZEROS,
            subprocess_timeout: Duration::from_secs(SUBPROCESS_TIMEOUT_SECS),
            max_recoveries: MAX_WORK_RECOVERIES,
            work_delay_secs: WORK_DELAY_SECS,
            work_deadline_secs: WORK_DEADLINE_SECS,
        }
    }
}

// Drives the nonce search and the work submission for one block at a
// time. The subprocess saturates the machine, so farmers within a block
// run strictly one after another; scale comes from more executors.
pub struct WorkRunner {
    chain: Arc<dyn ChainAdapter>,
    store: Arc<dyn PoolStore>,
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
    config: WorkConfig,
}

impl WorkRunner {
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        store: Arc<dyn PoolStore>,
        scheduler_tx: mpsc::Sender<SchedulerCommand>,
        config: WorkConfig,
    ) -> Self {
        Self {
            chain,
            store,
            scheduler_tx,
            config,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<WorkJob>, mut shutdown: watch::Receiver<bool>) {
        info!("work runner started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                job = rx.recv() => match job {
                    Some(job) => self.run_block(job).await,
                    None => break,
                },
            }
        }
        info!("work runner stopped");
    }

    pub async fn run_block(&self, job: WorkJob) {
        let block_index = job.block_index;
        let work_time = job.block_timestamp + self.config.work_delay_secs;
        let now = now_secs();

        if now > work_time + self.config.work_deadline_secs {
            warn!(
                "block {block_index}: work window closed {}s ago, compensating {} farmers",
                now - work_time - self.config.work_deadline_secs,
                job.farmers.len()
            );
            for farmer in &job.farmers {
                self.record_failed_work(
                    block_index,
                    farmer.farmer_id,
                    "work deadline exceeded".to_string(),
                    true,
                )
                .await;
            }
            if let Err(err) = self.store.record_work_summary(block_index, 0).await {
                warn!("block {block_index}: work summary failed: {err}");
            }
            return;
        }

        let mut successes = 0u32;
        for farmer in &job.farmers {
            match self.work_farmer(&job, farmer).await {
                Ok(()) => successes += 1,
                Err(err) => warn!(
                    "block {block_index}: work failed for farmer {}: {err}",
                    farmer.farmer_id
                ),
            }
        }

        if let Err(err) = self.store.record_work_summary(block_index, successes).await {
            warn!("block {block_index}: work summary failed: {err}");
        }
        info!(
            "block {block_index}: {successes}/{} works submitted",
            job.farmers.len()
        );

        // harvest follows work on the shared timer queue
        let harvest = SchedulerCommand::ScheduleHarvest(HarvestJob {
            block_index,
            farmers: job.farmers.clone(),
        });
        if self.scheduler_tx.send(harvest).await.is_err() {
            warn!("block {block_index}: scheduler is gone, harvest not queued");
        }
    }

    async fn work_farmer(
        &self,
        job: &WorkJob,
        farmer: &ScheduledFarmer,
    ) -> Result<(), ExecutorError> {
        let block_index = job.block_index;

        // a work submission is only valid on top of a successful plant
        if self
            .store
            .successful_planting(block_index, farmer.farmer_id)
            .await?
            .is_none()
        {
            return Err(ExecutorError::NoPlanting {
                block_index,
                farmer_id: farmer.farmer_id,
            });
        }

        // duplicate notification delivery must not re-run the search
        let already_worked = self
            .store
            .works_for_block(block_index)
            .await?
            .iter()
            .any(|w| w.farmer_id == farmer.farmer_id);
        if already_worked {
            debug!(
                "block {block_index}: farmer {} already has a work row, skipping",
                farmer.farmer_id
            );
            return Ok(());
        }

        let farmer_hex = keys::public_hex_of_secret(&farmer.custodial_secret)?;
        let mut nonce_budget = self.config.nonce_count;
        let mut last_error = String::from("no attempt made");

        for attempt in 0..=self.config.max_recoveries {
            if attempt > 0 {
                nonce_budget = nonce_budget.saturating_mul(2);
                info!(
                    "block {block_index}: recovery {attempt} for farmer {} with budget {nonce_budget}",
                    farmer.farmer_id
                );
            }

            let (nonce, hash_hex) = match self
                .search_nonce(&farmer_hex, block_index, &job.entropy, nonce_budget)
                .await
            {
                Ok(found) => found,
                Err(err) => {
                    last_error = err.to_string();
                    continue;
                }
            };

            match self.verify_candidate(&farmer_hex, block_index, &job.entropy, nonce, &hash_hex) {
                Ok(zeros) => {
                    return self
                        .submit_work(job, farmer, nonce, hash_hex, zeros)
                        .await;
                }
                Err(reason) => {
                    last_error = reason;
                    continue;
                }
            }
        }

        self.record_failed_work(block_index, farmer.farmer_id, last_error.clone(), true)
            .await;
        Err(ExecutorError::Subprocess(last_error))
    }

    // The subprocess is opaque; its answer is re-derived before anything
    // goes on chain.
    fn verify_candidate(
        &self,
        farmer_hex: &str,
        block_index: u64,
        entropy_hex: &str,
        nonce: u64,
        hash_hex: &str,
    ) -> Result<u32, String> {
        let farmer_bytes: [u8; 32] = hex::decode(farmer_hex)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| "farmer key is not 32 bytes".to_string())?;
        let entropy: [u8; 32] = hex::decode(entropy_hex)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| "entropy is not 32 bytes".to_string())?;

        let expected = work_hash(&farmer_bytes, block_index, &entropy, nonce);
        if hex::encode(expected) != hash_hex {
            return Err("subprocess hash does not match its nonce".to_string());
        }

        let zeros = leading_hex_zeros(&expected);
        if zeros < self.config.target_zeros {
            return Err(format!(
                "hash has {zeros} leading zeros, target is {}",
                self.config.target_zeros
            ));
        }
        Ok(zeros)
    }

    async fn submit_work(
        &self,
        job: &WorkJob,
        farmer: &ScheduledFarmer,
        nonce: u64,
        hash_hex: String,
        zeros: u32,
    ) -> Result<(), ExecutorError> {
        match self
            .chain
            .work(&farmer.custodial_secret, job.block_index, nonce, &hash_hex)
            .await
        {
            Ok(receipt) => {
                let work = Work {
                    id: Uuid::new_v4(),
                    block_index: job.block_index,
                    farmer_id: farmer.farmer_id,
                    nonce,
                    hash: hash_hex,
                    zeros,
                    gap: difficulty_gap(zeros, self.config.target_zeros),
                    transaction_hash: Some(receipt.tx_hash),
                    status: AttemptStatus::Success,
                    error_message: None,
                    compensation_required: false,
                    worked_at: Utc::now(),
                };
                if !self.store.record_work(&work).await? {
                    debug!(
                        "block {}: work row for farmer {} already present",
                        job.block_index, farmer.farmer_id
                    );
                }
                debug!(
                    "block {}: farmer {} worked with {zeros} zeros (nonce {nonce})",
                    job.block_index, farmer.farmer_id
                );
                Ok(())
            }
            Err(err) => {
                self.record_failed_work(
                    job.block_index,
                    farmer.farmer_id,
                    err.to_string(),
                    false,
                )
                .await;
                Err(err.into())
            }
        }
    }

    async fn search_nonce(
        &self,
        farmer_hex: &str,
        block_index: u64,
        entropy_hex: &str,
        nonce_count: u64,
    ) -> Result<(u64, String), ExecutorError> {
        let mut command = Command::new(&self.config.worker_bin);
        command
            .arg("--farmer-hex")
            .arg(farmer_hex)
            .arg("--index")
            .arg(block_index.to_string())
            .arg("--entropy-hex")
            .arg(entropy_hex)
            .arg("--nonce-count")
            .arg(nonce_count.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn()?;
        let output = timeout(self.config.subprocess_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ExecutorError::Subprocess(format!(
                    "timed out after {:?}",
                    self.config.subprocess_timeout
                ))
            })??;

        if !output.status.success() {
            return Err(ExecutorError::Subprocess(format!(
                "exit status {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_final_candidate(&stdout)
    }

    async fn record_failed_work(
        &self,
        block_index: u64,
        farmer_id: Uuid,
        error: String,
        compensation_required: bool,
    ) {
        let work = Work {
            id: Uuid::new_v4(),
            block_index,
            farmer_id,
            nonce: 0,
            hash: String::new(),
            zeros: 0,
            gap: 0,
            transaction_hash: None,
            status: AttemptStatus::Failed,
            error_message: Some(error),
            compensation_required,
            worked_at: Utc::now(),
        };
        if let Err(err) = self.store.record_work(&work).await {
            warn!("recording failed work for farmer {farmer_id} failed: {err}");
        }
    }
}

// The subprocess prints one `[nonce, hash_hex]` JSON array per candidate;
// the last line is the final answer.
fn parse_final_candidate(stdout: &str) -> Result<(u64, String), ExecutorError> {
    let line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| ExecutorError::Subprocess("no output produced".to_string()))?;

    serde_json::from_str::<(u64, String)>(line.trim())
        .map_err(|err| ExecutorError::Subprocess(format!("unparseable candidate {line:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_candidate_is_the_last_nonempty_line() {
        let stdout = "[1, \"aa\"]\n[2, \"bb\"]\n\n[3, \"cc\"]\n\n";
        let (nonce, hash) = parse_final_candidate(stdout).unwrap();
        assert_eq!(nonce, 3);
        assert_eq!(hash, "cc");
    }

    #[test]
    fn garbage_output_is_rejected() {
        assert!(parse_final_candidate("").is_err());
        assert!(parse_final_candidate("searching...\n").is_err());
        assert!(parse_final_candidate("{\"nonce\": 1}").is_err());
    }
}
