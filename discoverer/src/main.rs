use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::sync::watch;
use tokio::time::timeout;

use kale_common::config::DRAIN_SECS;
use kale_common::crypto::cipher::SeedCipher;
use kale_common::logger;
use kale_discoverer::config::DiscovererConfig;
use kale_discoverer::funding::FundingChecker;
use kale_discoverer::notifier::HttpNotifier;
use kale_discoverer::planter::{Planter, PlanterConfig};
use kale_discoverer::poller::{BlockQueue, BurstWorker, Poller};
use kale_storage::pg::PgStore;
use kale_storage::PoolStore;
use kale_wallet::rpc::HorizonClient;
use kale_wallet::ChainAdapter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = DiscovererConfig::parse();
    logger::setup(&config.logger_config()).context("logger setup failed")?;
    info!("kale discoverer starting for pooler {}", config.pooler_id);

    let store: Arc<dyn PoolStore> = {
        let pg = PgStore::connect(&config.database_url)
            .await
            .context("database connection failed")?;
        pg.migrate().await.context("running migrations failed")?;
        Arc::new(pg)
    };

    let chain: Arc<dyn ChainAdapter> = Arc::new(
        HorizonClient::new(
            &config.rpc_url,
            config.network_passphrase.clone(),
            config.contract_id.clone(),
        )
        .context("chain rpc client setup failed")?,
    );
    if !chain.health().await {
        warn!("chain rpc at {} is not answering health checks yet", config.rpc_url);
    }

    let cipher = Arc::new(SeedCipher::from_hex(&config.cipher_key).context("invalid cipher key")?);
    let notifier = Arc::new(
        HttpNotifier::new(&config.executor_url, config.executor_token.clone())
            .context("notifier setup failed")?,
    );

    let planter = Planter::new(
        chain.clone(),
        store.clone(),
        cipher,
        notifier,
        config.pooler_id,
        PlanterConfig {
            base_stake: config.base_stake,
            concurrency: config.plant_concurrency,
            ..PlanterConfig::default()
        },
    );

    let queue = Arc::new(BlockQueue::default());
    let poller = Poller::new(chain.clone(), queue.clone(), config.poll_interval());
    let worker = BurstWorker::new(planter, queue.clone());
    let funding = FundingChecker::new(
        chain,
        store,
        Duration::from_secs(config.funding_check_secs),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller_task = tokio::spawn(poller.run(shutdown_rx.clone()));
    let worker_task = tokio::spawn(worker.run(shutdown_rx.clone()));
    let funding_task = tokio::spawn(funding.run(shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown requested, draining in-flight bursts (up to {DRAIN_SECS}s)");
    let _ = shutdown_tx.send(true);

    let _ = poller_task.await;
    let _ = funding_task.await;

    // the worker finishes the block it is on; anything hung past the
    // drain window is cut loose
    let worker_abort = worker_task.abort_handle();
    if timeout(Duration::from_secs(DRAIN_SECS), worker_task).await.is_err() {
        warn!("drain window elapsed, aborting the burst worker");
        worker_abort.abort();
    }

    info!("kale discoverer stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler installation");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
