use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use uuid::Uuid;

use kale_common::config::{
    clamp_poll_interval, DEFAULT_BASE_STAKE_STROOPS, DEFAULT_POLL_INTERVAL_SECS, PLANT_CONCURRENCY,
};
use kale_common::logger::LoggerConfig;
use kale_common::model::Stroops;

/// KALE pool block discoverer: watches the chain head and runs the plant
/// burst for every new block.
#[derive(Parser, Clone, Debug)]
#[command(name = "kale-discoverer")]
#[command(about = "KALE pool block discoverer")]
pub struct DiscovererConfig {
    /// Chain RPC endpoint
    #[clap(long, env = "KALE_RPC_URL")]
    pub rpc_url: String,

    /// Network passphrase transactions are bound to
    #[clap(long, env = "KALE_NETWORK_PASSPHRASE")]
    pub network_passphrase: String,

    /// On-chain farming contract id
    #[clap(long, env = "KALE_CONTRACT_ID")]
    pub contract_id: String,

    /// Postgres connection string
    #[clap(long, env = "KALE_DATABASE_URL")]
    pub database_url: String,

    /// Identity of this pooler
    #[clap(long, env = "KALE_POOLER_ID")]
    pub pooler_id: Uuid,

    /// Base URL of the executor the planted set is posted to
    #[clap(long, env = "KALE_EXECUTOR_URL")]
    pub executor_url: String,

    /// Bearer token for executor notifications
    #[clap(long, env = "KALE_EXECUTOR_TOKEN")]
    pub executor_token: String,

    /// Hex key custodial seeds are encrypted with at rest
    #[clap(long, env = "KALE_CIPHER_KEY")]
    pub cipher_key: String,

    /// Head poll cadence in seconds, clamped to 1..=30
    #[clap(long, env = "KALE_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval_secs: u64,

    /// Parallel plant submissions per burst
    #[clap(long, env = "KALE_PLANT_CONCURRENCY", default_value_t = PLANT_CONCURRENCY)]
    pub plant_concurrency: usize,

    /// Base stake in stroops before the contract percentage is applied
    #[clap(long, env = "KALE_BASE_STAKE", default_value_t = DEFAULT_BASE_STAKE_STROOPS)]
    pub base_stake: Stroops,

    /// Cadence of the custodial funding re-check in seconds
    #[clap(long, env = "KALE_FUNDING_CHECK_SECS", default_value_t = 120)]
    pub funding_check_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, env = "KALE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Disable the log file
    #[clap(long)]
    pub disable_file_logging: bool,

    /// Disable colors in terminal logs
    #[clap(long)]
    pub disable_log_color: bool,

    /// Log filename
    #[clap(long, default_value_t = String::from("kale-discoverer.log"))]
    pub filename_log: String,

    /// Logs directory
    #[clap(long, default_value_t = String::from("logs/"))]
    pub logs_path: String,
}

impl DiscovererConfig {
    pub fn poll_interval(&self) -> Duration {
        clamp_poll_interval(self.poll_interval_secs)
    }

    pub fn logger_config(&self) -> LoggerConfig {
        LoggerConfig {
            level: self.log_level.parse().unwrap_or(LevelFilter::Info),
            disable_colors: self.disable_log_color,
            disable_file_logging: self.disable_file_logging,
            filename_log: self.filename_log.clone(),
            logs_path: self.logs_path.clone(),
        }
    }
}
