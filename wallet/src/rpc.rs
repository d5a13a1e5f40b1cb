use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use kale_common::config::{CHAIN_OP_TIMEOUT, CHAIN_TX_MAX_RETRIES, MIN_FUNDING_STROOPS};
use kale_common::error::backoff_delay;
use kale_common::model::{BlockIndex, Stroops};

use crate::tx::{Operation, TxBuilder};
use crate::{
    keys, BlockHead, ChainAdapter, ChainError, Funding, HarvestReceipt, NewWallet, TxReceipt,
};

// JSON-RPC error codes the chain node answers with
const CODE_BAD_SEQ: i32 = -32001;
const CODE_BAD_FEE: i32 = -32002;
const CODE_UNDERFUNDED: i32 = -32003;
const CODE_NOT_FOUND: i32 = -32004;
const CODE_INVALID_PARAMS: i32 = -32602;

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    // Network-level retries inside one logical call
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout: CHAIN_OP_TIMEOUT,
            connection_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(4),
        }
    }
}

// JSON-RPC client against the chain node. One instance is shared by all
// bursts; reqwest pools the underlying connections.
pub struct HorizonClient {
    client: reqwest::Client,
    endpoint: String,
    config: RpcConfig,
    builder: TxBuilder,
}

#[derive(Debug, serde::Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u32,
    method: &'static str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcLatestBlock {
    index: BlockIndex,
    entropy: String,
    timestamp: u64,
    plantable: bool,
    min_stake: Stroops,
    max_stake: Stroops,
    min_zeros: u32,
    max_zeros: u32,
}

#[derive(Debug, Deserialize)]
struct RpcAccount {
    sequence: u64,
    balance: Stroops,
}

#[derive(Debug, Deserialize)]
struct RpcSubmitResult {
    hash: String,
    #[serde(default)]
    reward: Option<Stroops>,
}

impl HorizonClient {
    pub fn new(
        rpc_url: &str,
        network_passphrase: String,
        contract_id: String,
    ) -> Result<Self, ChainError> {
        Self::with_config(rpc_url, network_passphrase, contract_id, RpcConfig::default())
    }

    pub fn with_config(
        rpc_url: &str,
        network_passphrase: String,
        contract_id: String,
        config: RpcConfig,
    ) -> Result<Self, ChainError> {
        let endpoint = if rpc_url.starts_with("http://") || rpc_url.starts_with("https://") {
            format!("{}/json_rpc", rpc_url.trim_end_matches('/'))
        } else {
            format!("http://{}/json_rpc", rpc_url.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connection_timeout)
            .build()
            .map_err(|e| ChainError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            config,
            builder: TxBuilder::new(network_passphrase, contract_id),
        })
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, ChainError> {
        let mut last_error = ChainError::Network("request never attempted".into());

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1, self.config.retry_base, self.config.retry_cap);
                warn!("retrying rpc {method} in {delay:?} (attempt {attempt}/{})", self.config.max_retries);
                sleep(delay).await;
            }

            match self.call_once(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    // only network-level flakiness is worth an in-call retry
                    if !matches!(err, ChainError::Network(_) | ChainError::Timeout(_)) {
                        return Err(err);
                    }
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    async fn call_once(&self, method: &'static str, params: Value) -> Result<Value, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: rand::random::<u32>(),
            method,
            params,
        };
        debug!("rpc call {method}");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::Timeout(self.config.request_timeout)
                } else {
                    ChainError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Network(format!("http status {status}")));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Protocol(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(classify_rpc_error(error));
        }

        body.result
            .ok_or_else(|| ChainError::Protocol("response without result".into()))
    }

    async fn account(&self, public: &str) -> Result<RpcAccount, ChainError> {
        let result = self.call("get_account", json!({ "account": public })).await?;
        serde_json::from_value(result).map_err(|e| ChainError::Protocol(e.to_string()))
    }

    // Sign and submit one operation; recoverable rejections (stale
    // sequence, fee bump) are retried with a freshly loaded sequence.
    async fn submit(&self, secret: &str, operation: Operation) -> Result<RpcSubmitResult, ChainError> {
        let source = keys::public_of_secret(secret)?;
        let mut last_error = None;

        for attempt in 0..CHAIN_TX_MAX_RETRIES {
            let account = self.account(&source).await?;
            let tx = self.builder.build(secret, account.sequence + 1, operation.clone())?;

            match self
                .call("submit_transaction", serde_json::to_value(&tx).map_err(|e| ChainError::Protocol(e.to_string()))?)
                .await
            {
                Ok(result) => {
                    return serde_json::from_value(result)
                        .map_err(|e| ChainError::Protocol(e.to_string()))
                }
                Err(ChainError::Recoverable(reason)) => {
                    warn!("tx rejected ({reason}), refetching sequence (attempt {})", attempt + 1);
                    last_error = Some(ChainError::Recoverable(reason));
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| ChainError::Protocol("submit loop exhausted".into())))
    }
}

fn classify_rpc_error(error: JsonRpcError) -> ChainError {
    let message = error.message;
    match error.code {
        CODE_BAD_SEQ | CODE_BAD_FEE => ChainError::Recoverable(message),
        CODE_UNDERFUNDED => parse_underfunded(&message),
        CODE_INVALID_PARAMS => ChainError::BadRequest(message),
        CODE_NOT_FOUND => ChainError::BadRequest(message),
        _ => {
            // unknown codes: sniff the message before giving up on retries
            let lower = message.to_lowercase();
            if lower.contains("sequence") || lower.contains("fee") {
                ChainError::Recoverable(message)
            } else if lower.contains("underfunded") || lower.contains("insufficient") {
                parse_underfunded(&message)
            } else {
                ChainError::BadRequest(message)
            }
        }
    }
}

// The node reports "underfunded: need N have M"; fall back to zeros when
// the numbers are absent.
fn parse_underfunded(message: &str) -> ChainError {
    let mut need = 0;
    let mut have = 0;
    let mut words = message.split_whitespace().peekable();
    while let Some(word) = words.next() {
        match word {
            "need" => need = words.peek().and_then(|w| w.parse().ok()).unwrap_or(0),
            "have" => have = words.peek().and_then(|w| w.parse().ok()).unwrap_or(0),
            _ => {}
        }
    }
    ChainError::InsufficientFunds { need, have }
}

#[async_trait]
impl ChainAdapter for HorizonClient {
    async fn generate_wallet(&self) -> Result<NewWallet, ChainError> {
        Ok(keys::generate())
    }

    async fn check_funding(&self, public: &str) -> Result<Funding, ChainError> {
        match self.account(public).await {
            Ok(account) => Ok(Funding {
                balance: account.balance,
                is_funded: account.balance >= MIN_FUNDING_STROOPS,
            }),
            // an account the chain has never seen simply holds nothing
            Err(ChainError::BadRequest(_)) => Ok(Funding {
                balance: 0,
                is_funded: false,
            }),
            Err(err) => Err(err),
        }
    }

    async fn head(&self) -> Result<BlockHead, ChainError> {
        let result = self.call("get_latest_block", json!({})).await?;
        let block: RpcLatestBlock =
            serde_json::from_value(result).map_err(|e| ChainError::Protocol(e.to_string()))?;
        Ok(BlockHead {
            block_index: block.index,
            entropy: block.entropy,
            timestamp: block.timestamp,
            plantable: block.plantable,
            min_stake: block.min_stake,
            max_stake: block.max_stake,
            min_zeros: block.min_zeros,
            max_zeros: block.max_zeros,
        })
    }

    async fn plant(
        &self,
        secret: &str,
        block_index: BlockIndex,
        stake: Stroops,
    ) -> Result<TxReceipt, ChainError> {
        let result = self.submit(secret, Operation::Plant { block_index, stake }).await?;
        Ok(TxReceipt { tx_hash: result.hash })
    }

    async fn work(
        &self,
        secret: &str,
        block_index: BlockIndex,
        nonce: u64,
        hash: &str,
    ) -> Result<TxReceipt, ChainError> {
        let result = self
            .submit(
                secret,
                Operation::Work {
                    block_index,
                    nonce,
                    hash: hash.to_string(),
                },
            )
            .await?;
        Ok(TxReceipt { tx_hash: result.hash })
    }

    async fn harvest(
        &self,
        secret: &str,
        block_index: BlockIndex,
    ) -> Result<HarvestReceipt, ChainError> {
        let result = self.submit(secret, Operation::Harvest { block_index }).await?;
        let reward = result
            .reward
            .ok_or_else(|| ChainError::Protocol("harvest result without reward".into()))?;
        Ok(HarvestReceipt {
            tx_hash: result.hash,
            reward,
        })
    }

    async fn transfer(
        &self,
        secret: &str,
        destination: &str,
        amount: Stroops,
    ) -> Result<TxReceipt, ChainError> {
        let result = self
            .submit(
                secret,
                Operation::Transfer {
                    destination: destination.to_string(),
                    amount,
                },
            )
            .await?;
        Ok(TxReceipt { tx_hash: result.hash })
    }

    async fn health(&self) -> bool {
        self.call("get_info", json!({})).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_errors_classify_by_code() {
        let err = classify_rpc_error(JsonRpcError {
            code: CODE_BAD_SEQ,
            message: "tx_bad_seq".into(),
        });
        assert!(matches!(err, ChainError::Recoverable(_)));

        let err = classify_rpc_error(JsonRpcError {
            code: CODE_INVALID_PARAMS,
            message: "missing field".into(),
        });
        assert!(matches!(err, ChainError::BadRequest(_)));
    }

    #[test]
    fn unknown_codes_classify_by_message() {
        let err = classify_rpc_error(JsonRpcError {
            code: -1,
            message: "bad sequence number".into(),
        });
        assert!(matches!(err, ChainError::Recoverable(_)));

        let err = classify_rpc_error(JsonRpcError {
            code: -1,
            message: "account underfunded need 100 have 7".into(),
        });
        assert!(matches!(
            err,
            ChainError::InsufficientFunds { need: 100, have: 7 }
        ));
    }

    #[test]
    fn underfunded_without_numbers_defaults_to_zero() {
        assert!(matches!(
            parse_underfunded("underfunded"),
            ChainError::InsufficientFunds { need: 0, have: 0 }
        ));
    }
}
