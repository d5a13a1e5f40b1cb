use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;

use kale_common::config::{
    PAYOUT_BACKOFF_BASE, PAYOUT_BACKOFF_CAP, PAYOUT_MAX_RETRIES, SETTLE_CONCURRENCY,
};
use kale_common::crypto::cipher::SeedCipher;
use kale_common::error::backoff_delay;
use kale_common::model::{ExitAuditLog, ExitSplit, ExitStatus, PayoutLeg};
use kale_storage::PoolStore;
use kale_wallet::ChainAdapter;

use crate::SettlementError;

// Hash recorded for a leg whose amount is zero; a zero-stroop transfer
// would be rejected by the chain, and the completion criterion still
// needs all three slots filled.
const ZERO_AMOUNT_TX: &str = "skipped:zero-amount";

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub claim_lease_secs: u64,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            max_retries: PAYOUT_MAX_RETRIES,
            backoff_base: PAYOUT_BACKOFF_BASE,
            backoff_cap: PAYOUT_BACKOFF_CAP,
            concurrency: SETTLE_CONCURRENCY,
            poll_interval: Duration::from_secs(10),
            claim_lease_secs: 600,
        }
    }
}

// Pays claimed exits: three ordered transfers from the farmer's custodial
// wallet, one exit at a time per farmer, several farmers in parallel.
// Sequencing the legs keeps the custodial wallet to one in-flight tx.
pub struct PayoutRunner {
    store: Arc<dyn PoolStore>,
    chain: Arc<dyn ChainAdapter>,
    cipher: Arc<SeedCipher>,
    config: PayoutConfig,
}

impl PayoutRunner {
    pub fn new(
        store: Arc<dyn PoolStore>,
        chain: Arc<dyn ChainAdapter>,
        cipher: Arc<SeedCipher>,
        config: PayoutConfig,
    ) -> Self {
        Self {
            store,
            chain,
            cipher,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("payout runner started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(self.config.poll_interval) => {}
            }

            let claimed = match self
                .store
                .claim_pending_exits(self.config.concurrency, self.config.claim_lease_secs)
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    warn!("claiming exits failed: {err}");
                    continue;
                }
            };
            if claimed.is_empty() {
                continue;
            }

            let mut jobs = JoinSet::new();
            for exit in claimed {
                let runner = self.clone();
                jobs.spawn(async move {
                    let exit_id = exit.id;
                    if let Err(err) = runner.run_exit(exit).await {
                        error!("exit {exit_id} payout failed: {err}");
                    }
                });
            }
            while jobs.join_next().await.is_some() {}
        }
        info!("payout runner stopped");
    }

    // Replay-safe: a leg whose hash is already persisted is skipped, so a
    // crashed or re-claimed job never pays twice.
    pub async fn run_exit(&self, mut exit: ExitSplit) -> Result<(), SettlementError> {
        let farmer = self
            .store
            .farmer_by_id(exit.farmer_id)
            .await?
            .ok_or(SettlementError::UnknownFarmer)?;
        let secret = self.cipher.decrypt_seed(&farmer.custodial_secret_enc)?;

        for leg in [PayoutLeg::Farmer, PayoutLeg::Pooler, PayoutLeg::Platform] {
            if exit.leg_hash(leg).is_some() {
                info!("exit {}: {leg} leg already paid, skipping", exit.id);
                continue;
            }
            let tx_hash = self.pay_leg(&mut exit, leg, &secret).await?;
            self.store.update_exit_leg(exit.id, leg, &tx_hash).await?;
            set_leg_hash(&mut exit, leg, tx_hash.clone());

            // the farmer leg is the user-visible milestone
            if leg == PayoutLeg::Farmer {
                self.store
                    .append_audit(&ExitAuditLog::new(
                        exit.id,
                        "farmer_paid",
                        json!({ "tx_hash": tx_hash, "amount": exit.farmer_share }),
                    ))
                    .await?;
            }
        }

        let audit = ExitAuditLog::new(
            exit.id,
            "completed",
            json!({
                "farmer_tx_hash": exit.farmer_tx_hash,
                "pooler_tx_hash": exit.pooler_tx_hash,
                "platform_tx_hash": exit.platform_tx_hash,
                "retry_count": exit.retry_count,
            }),
        )
        .transition(ExitStatus::Processing, ExitStatus::Completed);
        self.store.complete_exit(&exit, &audit).await?;

        info!(
            "exit {} completed: {} stroops paid out across three legs",
            exit.id, exit.total_rewards
        );
        Ok(())
    }

    async fn pay_leg(
        &self,
        exit: &mut ExitSplit,
        leg: PayoutLeg,
        secret: &str,
    ) -> Result<String, SettlementError> {
        let amount = exit.leg_amount(leg);
        if amount == 0 {
            warn!("exit {}: {leg} leg amount is zero, recording skip", exit.id);
            return Ok(ZERO_AMOUNT_TX.to_string());
        }
        let destination = exit.leg_destination(leg).to_string();

        let mut attempt = 0u32;
        loop {
            match self.chain.transfer(secret, &destination, amount).await {
                Ok(receipt) => return Ok(receipt.tx_hash),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    exit.retry_count = self.store.bump_exit_retry(exit.id).await?;
                    self.store
                        .append_audit(&ExitAuditLog::new(
                            exit.id,
                            format!("{leg}_retried"),
                            json!({ "attempt": attempt, "error": err.to_string() }),
                        ))
                        .await?;
                    let delay =
                        backoff_delay(attempt - 1, self.config.backoff_base, self.config.backoff_cap);
                    warn!(
                        "exit {}: {leg} leg attempt {attempt} failed ({err}), retrying in {delay:?}",
                        exit.id
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    // successful legs stay paid; only the exit record is failed
                    let audit = ExitAuditLog::new(
                        exit.id,
                        "failed",
                        json!({ "leg": leg.to_string(), "error": err.to_string() }),
                    )
                    .transition(ExitStatus::Processing, ExitStatus::Failed);
                    self.store
                        .fail_exit(exit.id, &format!("{leg} leg: {err}"), &audit)
                        .await?;
                    return Err(SettlementError::LegFailed {
                        leg,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

fn set_leg_hash(exit: &mut ExitSplit, leg: PayoutLeg, tx_hash: String) {
    match leg {
        PayoutLeg::Farmer => exit.farmer_tx_hash = Some(tx_hash),
        PayoutLeg::Pooler => exit.pooler_tx_hash = Some(tx_hash),
        PayoutLeg::Platform => exit.platform_tx_hash = Some(tx_hash),
    }
}
