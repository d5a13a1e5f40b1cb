use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::interval;

use kale_storage::PoolStore;
use kale_wallet::ChainAdapter;

// Farmers whose plant failed with insufficient funds are flagged rather
// than retried; this task refreshes their custodial balance against the
// chain so the next burst sees current numbers.
pub struct FundingChecker {
    chain: Arc<dyn ChainAdapter>,
    store: Arc<dyn PoolStore>,
    check_interval: Duration,
}

impl FundingChecker {
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        store: Arc<dyn PoolStore>,
        check_interval: Duration,
    ) -> Self {
        Self {
            chain,
            store,
            check_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("funding checker started, interval {:?}", self.check_interval);
        let mut ticker = interval(self.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.check_flagged().await,
            }
        }
        info!("funding checker stopped");
    }

    async fn check_flagged(&self) {
        let farmers = match self.store.farmers_for_funding_check().await {
            Ok(farmers) => farmers,
            Err(err) => {
                warn!("loading flagged farmers failed: {err}");
                return;
            }
        };
        if farmers.is_empty() {
            return;
        }
        debug!("re-checking funding for {} farmer(s)", farmers.len());

        for farmer in farmers {
            match self.chain.check_funding(&farmer.custodial_public_key).await {
                Ok(funding) => {
                    if let Err(err) = self
                        .store
                        .update_farmer_balance(farmer.id, funding.balance, funding.is_funded)
                        .await
                    {
                        warn!("balance update for farmer {} failed: {err}", farmer.id);
                        continue;
                    }
                    info!(
                        "farmer {}: balance {} stroops, funded: {}",
                        farmer.id, funding.balance, funding.is_funded
                    );
                }
                Err(err) => warn!("funding check for farmer {} failed: {err}", farmer.id),
            }
        }
    }
}
