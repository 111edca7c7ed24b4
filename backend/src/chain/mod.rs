//! # Chain Module
//!
//! Client for the EVM chains the Enzyme vaults live on. It speaks plain
//! JSON-RPC and encodes calls with the `sol!` bindings in [`contracts`].
//!
//! ## Responsibilities
//!
//! - Read share and USDC balances
//! - Resolve each vault's comptroller
//! - Submit redemption and deposit transactions from the user's wallet
//! - Wait for receipts and classify failures
//!
//! ## Transaction Flow
//!
//! ```text
//! 1. Encode call (sol! bindings)
//!              ↓
//! 2. eth_sendTransaction via the wallet signer endpoint
//!              ↓
//! 3. Poll eth_getTransactionReceipt on the vault's chain
//!              ↓
//! 4. status 0x1 → confirmed, 0x0 → reverted
//! ```
//!
//! Read-only calls are retried with exponential backoff. Transaction
//! submission is never retried: a second submission could redeem twice.

pub mod contracts;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alloy_primitives::{hex, Address, U256};
use alloy_sol_types::SolCall;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, VaultKey, VaultRegistry};
use contracts::{IEnzymeComptroller, IEnzymeVault, IERC20, FULL_PAYOUT_BPS};

/// EIP-1193 "user rejected the request".
const USER_REJECTED_CODE: i64 = 4001;

/// Errors from chain interactions.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// Could not reach the RPC endpoint or it timed out.
    #[error("RPC transport error: {0}")]
    Transport(String),

    /// The node answered with a JSON-RPC error.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The wallet declined to sign.
    #[error("Transaction rejected by wallet: {0}")]
    Rejected(String),

    /// Mined with status 0.
    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    /// Broadcast, but no receipt within the confirmation timeout.
    /// The outcome is unknown.
    #[error("Transaction {tx_hash} not confirmed within {timeout_secs}s")]
    Unconfirmed { tx_hash: String, timeout_secs: u64 },

    /// The node no longer knows the transaction; it was never mined.
    #[error("Transaction {tx_hash} was dropped without being mined")]
    Dropped { tx_hash: String },

    /// The vault has no deployed proxy.
    #[error("Vault {0} is not available")]
    VaultUnavailable(VaultKey),

    /// Malformed input or node response.
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Where a previously sent transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Mined with status 1.
    Confirmed,
    /// Mined with status 0.
    Reverted,
    /// Known to the node but not mined yet.
    Pending,
    /// Unknown to the node.
    Dropped,
}

/// Operations the redemption lifecycle needs from the vault contracts.
pub trait VaultContractProxy: Send + Sync + 'static {
    /// Redeem `shares` (integer units) for USDC and wait for confirmation.
    ///
    /// Returns the transaction hash.
    fn submit_redemption(&self, wallet: &str, vault: VaultKey, shares: u128)
        -> impl Future<Output = Result<String, ChainError>> + Send;

    /// Look up a sent transaction once, without waiting.
    fn transaction_status(&self, vault: VaultKey, tx_hash: &str)
        -> impl Future<Output = Result<TxStatus, ChainError>> + Send;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    block_number: Option<String>,
}

impl TransactionReceipt {
    fn succeeded(&self) -> bool {
        self.status.as_deref() == Some("0x1")
    }
}

/// Minimal JSON-RPC 2.0 client.
#[derive(Clone)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    next_id: Arc<AtomicU64>,
}

impl JsonRpcClient {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Send a single request and decode its `result`.
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        let response: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Transport(format!("Invalid JSON-RPC response: {}", e)))?;

        if let Some(error) = response.error {
            if error.code == USER_REJECTED_CODE {
                return Err(ChainError::Rejected(error.message));
            }
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| ChainError::Decode(format!("{} result: {}", method, e)))
    }

    /// Execute a read-only operation with retry logic.
    ///
    /// Retries up to 4 attempts (initial attempt + 3 retries) with
    /// exponential backoff on transport errors and timeouts. Uses a
    /// 10-second timeout per attempt. JSON-RPC errors are returned
    /// immediately since repeating the call would not change them.
    pub async fn request_with_retry<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        const MAX_RETRIES: u32 = 3;
        const INITIAL_DELAY_MS: u64 = 200;
        const TIMEOUT_SECS: u64 = 10;

        let mut attempt = 0;
        loop {
            let outcome = timeout(Duration::from_secs(TIMEOUT_SECS), self.request(method, params.clone())).await;
            let error = match outcome {
                Ok(Ok(result)) => {
                    if attempt > 0 {
                        info!("RPC {} succeeded after {} retries", method, attempt);
                    }
                    return Ok(result);
                }
                Ok(Err(ChainError::Transport(e))) => ChainError::Transport(e),
                Ok(Err(other)) => return Err(other),
                Err(_) => ChainError::Transport(format!("{} timed out after {}s", method, TIMEOUT_SECS)),
            };

            if attempt >= MAX_RETRIES {
                warn!("RPC {} failed after {} attempts: {}", method, MAX_RETRIES + 1, error);
                return Err(error);
            }

            let delay_ms = INITIAL_DELAY_MS * (1 << attempt); // 200ms, 400ms, 800ms
            debug!("RPC {} failed (attempt {}): {}. Retrying in {}ms...", method, attempt + 1, error, delay_ms);
            sleep(Duration::from_millis(delay_ms)).await;
            attempt += 1;
        }
    }
}

/// [`VaultContractProxy`] for Enzyme vaults over JSON-RPC.
///
/// Holds one RPC client per vault chain plus an optional wallet signer
/// endpoint used for `eth_sendTransaction`.
#[derive(Clone)]
pub struct EnzymeVaultProxy {
    vaults: VaultRegistry,
    rpc: HashMap<VaultKey, JsonRpcClient>,
    signer: Option<JsonRpcClient>,
    confirmation_timeout: Duration,
    receipt_poll_interval: Duration,
    comptrollers: Arc<Mutex<HashMap<VaultKey, Address>>>,
}

impl EnzymeVaultProxy {
    pub fn new(config: &AppConfig) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        let rpc = config
            .vaults
            .iter()
            .map(|v| (v.key, JsonRpcClient::new(client.clone(), &v.rpc_url)))
            .collect();

        // The signer may have to wait for the user to approve; no HTTP timeout.
        let signer = config.signer_rpc_url.as_deref().map(|url| {
            JsonRpcClient::new(reqwest::Client::new(), url)
        });

        info!("Chain proxy initialized:");
        for vault in config.vaults.iter() {
            match vault.vault_proxy {
                Some(proxy) => info!("  {} ({}): {} via {}", vault.key, vault.network, proxy, vault.rpc_url),
                None => info!("  {} ({}): not deployed", vault.key, vault.network),
            }
        }

        Ok(Self {
            vaults: config.vaults.clone(),
            rpc,
            signer,
            confirmation_timeout: Duration::from_secs(config.tx_confirmation_timeout_secs),
            receipt_poll_interval: Duration::from_millis(config.receipt_poll_interval_ms),
            comptrollers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn rpc(&self, vault: VaultKey) -> Result<&JsonRpcClient, ChainError> {
        self.rpc
            .get(&vault)
            .ok_or(ChainError::VaultUnavailable(vault))
    }

    fn vault_proxy(&self, vault: VaultKey) -> Result<Address, ChainError> {
        self.vaults
            .get(vault)
            .and_then(|v| v.vault_proxy)
            .ok_or(ChainError::VaultUnavailable(vault))
    }

    fn denomination_asset(&self, vault: VaultKey) -> Result<Address, ChainError> {
        self.vaults
            .get(vault)
            .map(|v| v.denomination_asset)
            .ok_or(ChainError::VaultUnavailable(vault))
    }

    /// `eth_call` against the latest block, decoding the return data.
    async fn call<C: SolCall>(&self, vault: VaultKey, to: Address, call: &C) -> Result<C::Return, ChainError> {
        let params = json!([
            { "to": to.to_string(), "data": hex::encode_prefixed(call.abi_encode()) },
            "latest"
        ]);
        let raw: String = self.rpc(vault)?.request_with_retry("eth_call", params).await?;
        let bytes = hex::decode(&raw).map_err(|e| ChainError::Decode(e.to_string()))?;
        C::abi_decode_returns(&bytes, true).map_err(|e| ChainError::Decode(e.to_string()))
    }

    /// Resolve (and cache) the comptroller of a vault.
    pub async fn comptroller(&self, vault: VaultKey) -> Result<Address, ChainError> {
        let cached = self
            .comptrollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&vault)
            .copied();
        if let Some(address) = cached {
            return Ok(address);
        }

        let proxy = self.vault_proxy(vault)?;
        let accessor = self
            .call(vault, proxy, &IEnzymeVault::getAccessorCall {})
            .await?
            ._0;

        debug!("Comptroller for {}: {}", vault, accessor);
        self.comptrollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vault, accessor);
        Ok(accessor)
    }

    /// Share balance of `wallet` (18-decimal integer units).
    pub async fn share_balance(&self, wallet: &str, vault: VaultKey) -> Result<u128, ChainError> {
        let account = parse_wallet(wallet)?;
        let proxy = self.vault_proxy(vault)?;
        let balance = self
            .call(vault, proxy, &IEnzymeVault::balanceOfCall { account })
            .await?
            ._0;
        u256_to_u128(balance)
    }

    /// USDC balance of `wallet` on the vault's chain (6-decimal units).
    pub async fn usdc_balance(&self, wallet: &str, vault: VaultKey) -> Result<u128, ChainError> {
        let account = parse_wallet(wallet)?;
        let usdc = self.denomination_asset(vault)?;
        let balance = self
            .call(vault, usdc, &IERC20::balanceOfCall { account })
            .await?
            ._0;
        u256_to_u128(balance)
    }

    /// Approve the comptroller for `amount` USDC and buy shares with it.
    ///
    /// Returns `(approve_tx, buy_shares_tx)`.
    pub async fn approve_and_buy_shares(
        &self,
        wallet: &str,
        vault: VaultKey,
        amount: u128,
    ) -> Result<(String, String), ChainError> {
        let from = parse_wallet(wallet)?;
        let comptroller = self.comptroller(vault).await?;
        let usdc = self.denomination_asset(vault)?;
        let amount = U256::from(amount);

        let approve = IERC20::approveCall { spender: comptroller, amount };
        let approve_tx = self.send_and_confirm(vault, from, usdc, approve.abi_encode()).await?;

        let buy = IEnzymeComptroller::buySharesCall {
            _investmentAmount: amount,
            _minSharesQuantity: U256::from(1u64),
        };
        let buy_tx = self.send_and_confirm(vault, from, comptroller, buy.abi_encode()).await?;

        Ok((approve_tx, buy_tx))
    }

    /// Latest block number; used as an RPC health probe.
    pub async fn block_number(&self, vault: VaultKey) -> Result<u64, ChainError> {
        let raw: String = self
            .rpc(vault)?
            .request_with_retry("eth_blockNumber", json!([]))
            .await?;
        parse_quantity(&raw)
    }

    /// Send a transaction from `from` and wait until it is mined.
    async fn send_and_confirm(
        &self,
        vault: VaultKey,
        from: Address,
        to: Address,
        data: Vec<u8>,
    ) -> Result<String, ChainError> {
        let sender = match &self.signer {
            Some(signer) => signer,
            None => self.rpc(vault)?,
        };

        let params = json!([{
            "from": from.to_string(),
            "to": to.to_string(),
            "data": hex::encode_prefixed(data),
        }]);

        // Never retried: the node may have accepted the first attempt.
        let tx_hash: String = sender.request("eth_sendTransaction", params).await?;
        info!("Transaction sent on {}: {}", vault, tx_hash);

        self.wait_for_receipt(vault, &tx_hash).await?;
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, vault: VaultKey, tx_hash: &str) -> Result<(), ChainError> {
        let rpc = self.rpc(vault)?;
        let deadline = Instant::now() + self.confirmation_timeout;

        let receipt = poll_receipt(deadline, self.receipt_poll_interval, || {
            rpc.request_with_retry::<Option<TransactionReceipt>>("eth_getTransactionReceipt", json!([tx_hash]))
        })
        .await;

        match receipt {
            Some(receipt) if receipt.succeeded() => {
                debug!("Transaction {} confirmed in block {:?}", tx_hash, receipt.block_number);
                Ok(())
            }
            Some(_) => {
                warn!("Transaction {} reverted", tx_hash);
                Err(ChainError::Reverted {
                    tx_hash: tx_hash.to_string(),
                })
            }
            None => Err(ChainError::Unconfirmed {
                tx_hash: tx_hash.to_string(),
                timeout_secs: self.confirmation_timeout.as_secs(),
            }),
        }
    }
}

/// Poll `lookup` until it yields a receipt or `deadline` passes.
///
/// A lookup still running at the deadline is abandoned, so retries
/// inside it cannot stretch the wait.
async fn poll_receipt<F, Fut>(deadline: Instant, poll_interval: Duration, mut lookup: F) -> Option<TransactionReceipt>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<TransactionReceipt>, ChainError>>,
{
    loop {
        match timeout_at(deadline, lookup()).await {
            Ok(Ok(Some(receipt))) => return Some(receipt),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => debug!("Receipt lookup failed: {}", e),
            Err(_) => return None,
        }

        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        sleep_until((now + poll_interval).min(deadline)).await;
    }
}

impl VaultContractProxy for EnzymeVaultProxy {
    async fn submit_redemption(&self, wallet: &str, vault: VaultKey, shares: u128) -> Result<String, ChainError> {
        let recipient = parse_wallet(wallet)?;
        let comptroller = self.comptroller(vault).await?;
        let usdc = self.denomination_asset(vault)?;

        info!("Redeeming {} share units on {} for {}", shares, vault, wallet);

        let redeem = IEnzymeComptroller::redeemSharesForSpecificAssetsCall {
            _recipient: recipient,
            _sharesQuantity: U256::from(shares),
            _payoutAssets: vec![usdc],
            _payoutAssetPercentages: vec![U256::from(FULL_PAYOUT_BPS)],
        };

        self.send_and_confirm(vault, recipient, comptroller, redeem.abi_encode())
            .await
    }

    async fn transaction_status(&self, vault: VaultKey, tx_hash: &str) -> Result<TxStatus, ChainError> {
        let rpc = self.rpc(vault)?;

        let receipt: Option<TransactionReceipt> = rpc
            .request_with_retry("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if let Some(receipt) = receipt {
            return Ok(if receipt.succeeded() {
                TxStatus::Confirmed
            } else {
                TxStatus::Reverted
            });
        }

        let transaction: Option<Value> = rpc
            .request_with_retry("eth_getTransactionByHash", json!([tx_hash]))
            .await?;
        Ok(match transaction {
            Some(_) => TxStatus::Pending,
            None => TxStatus::Dropped,
        })
    }
}

fn parse_wallet(wallet: &str) -> Result<Address, ChainError> {
    wallet
        .parse()
        .map_err(|e| ChainError::Decode(format!("Invalid wallet address {}: {}", wallet, e)))
}

fn u256_to_u128(value: U256) -> Result<u128, ChainError> {
    u128::try_from(value).map_err(|_| ChainError::Decode(format!("Value {} exceeds u128", value)))
}

/// Parse a JSON-RPC hex quantity (`0x1b4`).
fn parse_quantity(raw: &str) -> Result<u64, ChainError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16).map_err(|e| ChainError::Decode(format!("Invalid quantity {}: {}", raw, e)))
}
