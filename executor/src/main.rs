use std::sync::Arc;
use std::time::Duration;

use actix_web::web;
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use kale_common::config::DRAIN_SECS;
use kale_common::crypto::cipher::SeedCipher;
use kale_common::logger;
use kale_executor::config::ExecutorConfig;
use kale_executor::harvester::Harvester;
use kale_executor::scheduler::Scheduler;
use kale_executor::server::{run_server, ServerState};
use kale_executor::worker::WorkRunner;
use kale_settlement::{PayoutConfig, PayoutRunner};
use kale_storage::pg::PgStore;
use kale_storage::PoolStore;
use kale_wallet::rpc::HorizonClient;
use kale_wallet::ChainAdapter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ExecutorConfig::parse();
    logger::setup(&config.logger_config()).context("logger setup failed")?;
    info!("kale executor starting");

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

    let (scheduler_tx, scheduler_rx) = mpsc::channel(64);
    let (work_tx, work_rx) = mpsc::channel(16);
    let (harvest_tx, harvest_rx) = mpsc::channel(16);

    let scheduler = Scheduler::with_work_delay(
        scheduler_rx,
        work_tx,
        harvest_tx,
        Duration::from_secs(config.work_delay_secs),
    );
    let work_runner = WorkRunner::new(
        chain.clone(),
        store.clone(),
        scheduler_tx.clone(),
        config.work_config(),
    );
    let harvester = Harvester::with_concurrency(
        chain.clone(),
        store.clone(),
        config.harvest_concurrency,
    );
    let payout_runner = Arc::new(PayoutRunner::new(
        store,
        chain,
        cipher,
        PayoutConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let work_task = tokio::spawn(work_runner.run(work_rx, shutdown_rx.clone()));
    let harvest_task = tokio::spawn(harvester.run(harvest_rx, shutdown_rx.clone()));
    let payout_task = tokio::spawn(payout_runner.run(shutdown_rx.clone()));

    let state = web::Data::new(ServerState {
        scheduler_tx,
        bearer_token: config.bearer_token.clone(),
    });
    let server_task = tokio::spawn(run_server(
        config.bind_address.clone(),
        state,
        shutdown_rx,
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown requested, draining (up to {DRAIN_SECS}s)");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_task.await;
    let _ = payout_task.await;
    if let Ok(result) = timeout(Duration::from_secs(1), server_task).await {
        if let Ok(Err(err)) = result {
            warn!("server exited with error: {err}");
        }
    }

    // in-flight nonce subprocesses die with their tasks (kill on drop)
    for (name, task) in [("work runner", work_task), ("harvester", harvest_task)] {
        let abort = task.abort_handle();
        if timeout(Duration::from_secs(DRAIN_SECS), task).await.is_err() {
            warn!("{name} did not drain in time, aborting");
            abort.abort();
        }
    }

    info!("kale executor stopped");
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
