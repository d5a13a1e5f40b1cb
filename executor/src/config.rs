use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use kale_common::config::{
    DEFAULT_NONCE_COUNT, DEFAULT_TARGET_ZEROS, HARVEST_CONCURRENCY, MAX_WORK_RECOVERIES,
    SUBPROCESS_TIMEOUT_SECS, WORK_DEADLINE_SECS, WORK_DELAY_SECS,
};
use kale_common::logger::LoggerConfig;

use crate::worker::WorkConfig;

/// KALE pool executor: receives planted-farmer notifications, runs the
/// nonce search at the right time and harvests matured rewards.
#[derive(Parser, Clone, Debug)]
#[command(name = "kale-executor")]
#[command(about = "KALE pool work and harvest executor")]
pub struct ExecutorConfig {
    /// Address the notification server binds to
    #[clap(long, env = "KALE_EXECUTOR_BIND", default_value_t = String::from("127.0.0.1:8081"))]
    pub bind_address: String,

    /// Bearer token expected on notifications
    #[clap(long, env = "KALE_EXECUTOR_TOKEN")]
    pub bearer_token: String,

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

    /// Hex key custodial seeds are encrypted with at rest
    #[clap(long, env = "KALE_CIPHER_KEY")]
    pub cipher_key: String,

    /// Destination of the platform fee in exit settlements
    #[clap(long, env = "KALE_PLATFORM_WALLET")]
    pub platform_wallet: String,

    /// Path to the nonce-search binary
    #[clap(long, env = "KALE_WORKER_BIN", default_value_t = String::from("kale-worker"))]
    pub worker_bin: String,

    /// Nonce budget of the first search attempt
    #[clap(long, env = "KALE_NONCE_COUNT", default_value_t = DEFAULT_NONCE_COUNT)]
    pub nonce_count: u64,

    /// Leading hex zeros asked of the nonce search
    #[clap(long, env = "KALE_TARGET_ZEROS", default_value_t = DEFAULT_TARGET_ZEROS)]
    pub target_zeros: u32,

    /// Seconds after the block timestamp before work is submitted
    #[clap(long, env = "KALE_WORK_DELAY_SECS", default_value_t = WORK_DELAY_SECS)]
    pub work_delay_secs: u64,

    /// Seconds past the work time before the attempt is abandoned
    #[clap(long, env = "KALE_WORK_DEADLINE_SECS", default_value_t = WORK_DEADLINE_SECS)]
    pub work_deadline_secs: u64,

    /// Parallel harvest submissions per burst
    #[clap(long, env = "KALE_HARVEST_CONCURRENCY", default_value_t = HARVEST_CONCURRENCY)]
    pub harvest_concurrency: usize,

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
    #[clap(long, default_value_t = String::from("kale-executor.log"))]
    pub filename_log: String,

    /// Logs directory
    #[clap(long, default_value_t = String::from("logs/"))]
    pub logs_path: String,
}

impl ExecutorConfig {
    pub fn work_config(&self) -> WorkConfig {
        WorkConfig {
            worker_bin: PathBuf::from(&self.worker_bin),
            nonce_count: self.nonce_count,
            target_zeros: self.target_zeros,
            subprocess_timeout: Duration::from_secs(SUBPROCESS_TIMEOUT_SECS),
            max_recoveries: MAX_WORK_RECOVERIES,
            work_delay_secs: self.work_delay_secs,
            work_deadline_secs: self.work_deadline_secs,
        }
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
