//! # Redemption Manager Service
//!
//! The RedemptionManager tracks each wallet's redemption requests, one
//! per vault, and mediates the user actions against the record store
//! and the vault contracts.
//!
//! ## Responsibilities
//!
//! - Cache the pending request of every (wallet, vault)
//! - Refuse invalid requests before any network call
//! - Gate execution on the unlock time
//! - Keep on-chain execution and the store record consistent, and flag
//!   the cases where they are not
//!
//! ## Lifecycle
//!
//! ```text
//!   [no request] --request--> [pending, locked]
//!   [pending, locked] --unlock_at reached--> [pending, ready]
//!   [pending, *] --cancel--> [no request]
//!   [pending, ready] --execute ok--> [no request]
//!   [pending, ready] --execute, chain fails--> [pending, ready]
//!   [pending, ready] --execute, store fails or unconfirmed--> [awaiting reconciliation]
//!   [awaiting reconciliation] --reconcile or refresh--> [no request]
//! ```
//!
//! ## Cache
//!
//! The store owns the records. The cache is a read replica, replaced
//! wholesale by every successful refresh (last read wins) and updated
//! optimistically by the manager's own actions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainError, TxStatus, VaultContractProxy};
use crate::config::{VaultKey, VaultRegistry};
use crate::store::{
    NewRedemption, RecordStore, RedemptionRequest, RedemptionStatus, StatusUpdate, StoreError,
};
use crate::utils::{format_countdown, to_base_units, SHARE_DECIMALS};

/// Source of wall-clock time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Errors from redemption operations.
#[derive(Debug, thiserror::Error)]
pub enum RedemptionError {
    /// A precondition failed. No network call was made.
    #[error("{0}")]
    Validation(String),

    /// The record store rejected the call or could not be reached.
    /// Cached state is unchanged.
    #[error("Record store error: {0}")]
    Remote(#[from] StoreError),

    /// The on-chain transaction failed or was rejected by the wallet.
    /// The request stays pending and can be executed again.
    #[error("Chain error: {0}")]
    Chain(ChainError),

    /// Execution attempted before the unlock time.
    #[error("Redemption on {vault} is not ready")]
    NotReady {
        vault: VaultKey,
        unlock_at: Option<DateTime<Utc>>,
    },

    /// Redeemed on-chain, but the store still shows the request as
    /// pending. Must not be retried; funds have moved.
    #[error("Redemption executed on-chain ({tx_hash}) but the record was not updated: {reason}")]
    PartialSuccess { tx_hash: String, reason: String },

    /// Transaction sent, outcome unknown. Must not be retried blindly;
    /// funds may have moved.
    #[error("Redemption transaction {tx_hash} was sent but not confirmed: {reason}")]
    Unconfirmed { tx_hash: String, reason: String },
}

impl RedemptionError {
    /// API error code.
    pub fn code(&self) -> &'static str {
        match self {
            RedemptionError::Validation(_) => "VALIDATION_ERROR",
            RedemptionError::Remote(_) => "REMOTE_ERROR",
            RedemptionError::Chain(_) => "CHAIN_ERROR",
            RedemptionError::NotReady { .. } => "NOT_READY",
            RedemptionError::PartialSuccess { .. } | RedemptionError::Unconfirmed { .. } => {
                "RECONCILIATION_REQUIRED"
            }
        }
    }

    /// Transaction hash of a redemption that may already have moved funds.
    pub fn reconciliation_tx(&self) -> Option<&str> {
        match self {
            RedemptionError::PartialSuccess { tx_hash, .. }
            | RedemptionError::Unconfirmed { tx_hash, .. } => Some(tx_hash),
            _ => None,
        }
    }
}

/// Input to [`RedemptionManager::request_redemption`].
///
/// Balance and price are supplied by the caller (see
/// `PortfolioService::quote_redemption`).
#[derive(Debug, Clone)]
pub struct RedemptionOrder {
    pub vault: VaultKey,
    pub shares_amount: Decimal,
    /// Current on-chain share balance of the wallet.
    pub share_balance: Decimal,
    /// Current share price in USDC.
    pub share_price: Decimal,
}

/// A transaction that left the chain and the store out of sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReconciliation {
    pub request_id: String,
    pub tx_hash: String,
    /// False when the transaction was never confirmed.
    pub confirmed: bool,
}

/// Display view of one vault's redemption state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultRedemption {
    pub vault: VaultKey,
    pub request: Option<RedemptionRequest>,
    /// Milliseconds until unlock (0 once unlocked).
    pub remaining_ms: Option<i64>,
    /// `2m 0s`, `1h 5m`, `Ready!`.
    pub countdown: Option<String>,
    pub ready: bool,
    pub reconciliation: Option<PendingReconciliation>,
}

/// Display view of a wallet's redemption state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionSnapshot {
    pub wallet: String,
    pub cooldown_seconds: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub vaults: Vec<VaultRedemption>,
}

#[derive(Debug, Clone)]
struct WalletCache {
    requests: BTreeMap<VaultKey, Option<RedemptionRequest>>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl WalletCache {
    fn empty() -> Self {
        Self {
            requests: VaultKey::ALL.iter().map(|k| (*k, None)).collect(),
            refreshed_at: None,
        }
    }

    fn pending(&self, vault: VaultKey) -> Option<&RedemptionRequest> {
        self.requests
            .get(&vault)
            .and_then(Option::as_ref)
            .filter(|r| r.status == RedemptionStatus::Pending)
    }
}

type ActionKey = (String, VaultKey);

struct ManagerState {
    wallets: HashMap<String, WalletCache>,
    cooldown_secs: u64,
    in_flight: HashSet<ActionKey>,
    reconciliations: HashMap<ActionKey, PendingReconciliation>,
}

/// Marks a (wallet, vault) as busy until dropped.
struct ActionGuard<'a> {
    state: &'a Mutex<ManagerState>,
    key: ActionKey,
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .remove(&self.key);
    }
}

/// The redemption lifecycle manager.
///
/// Owns the only mutable redemption state in the service. Shared as
/// `Arc<RedemptionManager<..>>` between API handlers and pollers.
///
/// ## Usage
///
/// ```rust,ignore
/// let manager = RedemptionManager::new(store, proxy, SystemClock, vaults, 120);
///
/// manager.refresh_pending(wallet).await;
/// let request = manager.request_redemption(wallet, order).await?;
///
/// if manager.is_ready(wallet, VaultKey::Arb) {
///     let tx_hash = manager.execute_redemption(wallet, VaultKey::Arb).await?;
/// }
/// ```
pub struct RedemptionManager<S, P, C = SystemClock> {
    store: S,
    proxy: P,
    clock: C,
    vaults: VaultRegistry,
    state: Mutex<ManagerState>,
}

impl<S, P, C> RedemptionManager<S, P, C>
where
    S: RecordStore,
    P: VaultContractProxy,
    C: Clock,
{
    /// Create a manager with an empty cache.
    ///
    /// `default_cooldown_secs` is only used until the store reports its
    /// own cooldown.
    pub fn new(store: S, proxy: P, clock: C, vaults: VaultRegistry, default_cooldown_secs: u64) -> Self {
        Self {
            store,
            proxy,
            clock,
            vaults,
            state: Mutex::new(ManagerState {
                wallets: HashMap::new(),
                cooldown_secs: default_cooldown_secs,
                in_flight: HashSet::new(),
                reconciliations: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current cooldown in seconds (server value once seen).
    pub fn cooldown_secs(&self) -> u64 {
        self.lock().cooldown_secs
    }

    // ==========================================
    // REFRESH
    // ==========================================

    /// Reload the wallet's pending requests from the store.
    ///
    /// Replaces the wallet's cache unconditionally. Errors are logged and
    /// the previous cache is kept; the return value only says whether
    /// the refresh happened.
    pub async fn refresh_pending(&self, wallet: &str) -> bool {
        let wallet = wallet.to_lowercase();

        match self.load(&wallet).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to refresh pending redemptions for {}: {}", wallet, e);
                false
            }
        }
    }

    /// Replace the wallet's cache with the store's pending list.
    async fn load(&self, wallet: &str) -> Result<(), StoreError> {
        let snapshot = self.store.pending(wallet).await?;

        let now = self.clock.now();
        let mut state = self.lock();

        if let Some(secs) = snapshot.cooldown_seconds.filter(|s| *s > 0) {
            if secs != state.cooldown_secs {
                info!("Redemption cooldown set by record store: {}s", secs);
            }
            state.cooldown_secs = secs;
        }
        let cooldown = state.cooldown_secs;

        let mut cache = WalletCache::empty();
        cache.refreshed_at = Some(now);

        for record in snapshot.records {
            if record.status.is_terminal() {
                debug!("Skipping {} redemption {}", record.status, record.id);
                continue;
            }
            match record.into_request(wallet, cooldown, now) {
                Ok(request) => {
                    let vault = request.vault;
                    if let Some(Some(previous)) = cache.requests.insert(vault, Some(request)) {
                        warn!(
                            "Record store returned several pending redemptions for {} on {}; ignoring {}",
                            wallet, vault, previous.id
                        );
                    }
                }
                Err(e) => warn!("Skipping redemption record for {}: {}", wallet, e),
            }
        }

        // A reconciliation is settled once the store stops reporting its request.
        state.reconciliations.retain(|(w, vault), pending| {
            if w.as_str() != wallet {
                return true;
            }
            let still_pending = cache
                .pending(*vault)
                .map(|r| r.id == pending.request_id)
                .unwrap_or(false);
            if !still_pending {
                info!("Redemption {} on {} reconciled by record store", pending.request_id, vault);
            }
            still_pending
        });

        debug!(
            "Refreshed redemptions for {}: {} pending",
            wallet,
            cache.requests.values().filter(|r| r.is_some()).count()
        );
        state.wallets.insert(wallet.to_string(), cache);
        Ok(())
    }

    /// Load the wallet's cache if no refresh has populated it yet.
    ///
    /// Actions on a wallet without an open session would otherwise judge
    /// against an empty cache.
    async fn ensure_loaded(&self, wallet: &str) -> Result<(), RedemptionError> {
        let loaded = self
            .lock()
            .wallets
            .get(wallet)
            .map(|c| c.refreshed_at.is_some())
            .unwrap_or(false);
        if loaded {
            return Ok(());
        }

        debug!("Loading pending redemptions for {} before acting", wallet);
        self.load(wallet).await.map_err(|e| {
            warn!("Failed to load pending redemptions for {}: {}", wallet, e);
            RedemptionError::Remote(e)
        })
    }

    // ==========================================
    // USER ACTIONS
    // ==========================================

    /// Request a redemption.
    ///
    /// A wallet whose cache was never loaded is refreshed first, so the
    /// duplicate check sees the store's pending requests.
    ///
    /// ## Errors
    ///
    /// - `Validation` - non-positive amount, unavailable vault, amount
    ///   above balance, request already pending, or another action in
    ///   flight. Nothing is written to the store.
    /// - `Remote` - the store refused or could not be read; nothing is cached.
    pub async fn request_redemption(
        &self,
        wallet: &str,
        order: RedemptionOrder,
    ) -> Result<RedemptionRequest, RedemptionError> {
        let wallet = wallet.to_lowercase();
        let vault = order.vault;

        if order.shares_amount <= Decimal::ZERO {
            return Err(RedemptionError::Validation(
                "Amount must be greater than 0".to_string(),
            ));
        }
        if !self.vaults.is_available(vault) {
            return Err(RedemptionError::Validation(format!(
                "Vault {} is not available",
                vault
            )));
        }
        if order.shares_amount > order.share_balance {
            return Err(RedemptionError::Validation(format!(
                "Insufficient shares: requested {}, available {}",
                order.shares_amount, order.share_balance
            )));
        }
        let estimated_usdc_value = order
            .shares_amount
            .checked_mul(order.share_price)
            .ok_or_else(|| RedemptionError::Validation("Amount is too large".to_string()))?;

        self.ensure_loaded(&wallet).await?;
        let (_guard, _) = self.begin_action(&wallet, vault, |cached| match cached {
            Some(existing) => Err(RedemptionError::Validation(format!(
                "A redemption is already pending on {} (unlocks at {})",
                vault, existing.unlock_at
            ))),
            None => Ok(()),
        })?;

        info!(
            "Requesting redemption of {} shares on {} for {} (est. {} USDC)",
            order.shares_amount, vault, wallet, estimated_usdc_value
        );

        let draft = NewRedemption {
            wallet_address: wallet.clone(),
            vault,
            shares_amount: order.shares_amount,
            estimated_usdc_value,
        };

        let record = self.store.create(&draft).await.map_err(|e| {
            warn!("Record store refused redemption request for {}: {}", wallet, e);
            RedemptionError::Remote(e)
        })?;

        let now = self.clock.now();
        let request = record
            .into_request(&wallet, self.cooldown_secs(), now)
            .map_err(|e| RedemptionError::Remote(StoreError::InvalidResponse(e)))?;

        if request.status != RedemptionStatus::Pending || request.vault != vault {
            return Err(RedemptionError::Remote(StoreError::InvalidResponse(format!(
                "expected a pending request on {}, got {} on {}",
                vault, request.status, request.vault
            ))));
        }

        self.lock()
            .wallets
            .entry(wallet.clone())
            .or_insert_with(WalletCache::empty)
            .requests
            .insert(vault, Some(request.clone()));

        info!("Redemption {} pending on {}, unlocks at {}", request.id, vault, request.unlock_at);
        Ok(request)
    }

    /// Cancel the pending redemption of a vault.
    ///
    /// Returns `Ok(None)` without writing to the store when nothing is
    /// pending. On success the vault is immediately free for a new
    /// request.
    pub async fn cancel_redemption(
        &self,
        wallet: &str,
        vault: VaultKey,
    ) -> Result<Option<RedemptionRequest>, RedemptionError> {
        let wallet = wallet.to_lowercase();

        self.ensure_loaded(&wallet).await?;
        let (_guard, cached) = self.begin_action(&wallet, vault, |_| Ok(()))?;
        let request = match cached {
            Some(request) => request,
            None => {
                debug!("No pending redemption to cancel for {} on {}", wallet, vault);
                return Ok(None);
            }
        };

        if let Some(pending) = self.reconciliation(&wallet, vault) {
            return Err(RedemptionError::Validation(format!(
                "Redemption was already submitted in {}; it cannot be cancelled",
                pending.tx_hash
            )));
        }

        info!("Cancelling redemption {} on {} for {}", request.id, vault, wallet);

        let update = transition(&request, RedemptionStatus::Cancelled, None)?;
        let record = self.store.update_status(&update).await.map_err(|e| {
            warn!("Record store refused to cancel redemption {}: {}", request.id, e);
            RedemptionError::Remote(e)
        })?;

        self.clear_entry(&wallet, vault, &request.id);

        let cancelled = record
            .into_request(&wallet, self.cooldown_secs(), self.clock.now())
            .unwrap_or_else(|_| RedemptionRequest {
                status: RedemptionStatus::Cancelled,
                ..request
            });
        Ok(Some(cancelled))
    }

    /// Whether the vault's pending redemption may be executed now.
    pub fn is_ready(&self, wallet: &str, vault: VaultKey) -> bool {
        let now = self.clock.now();
        self.cached(&wallet.to_lowercase(), vault)
            .map(|r| r.is_unlocked(now))
            .unwrap_or(false)
    }

    /// Milliseconds until the vault's redemption unlocks (0 when ready).
    pub fn countdown(&self, wallet: &str, vault: VaultKey) -> Option<i64> {
        let now = self.clock.now();
        self.cached(&wallet.to_lowercase(), vault)
            .map(|r| r.remaining_ms(now))
    }

    /// Execute an unlocked redemption.
    ///
    /// ## Flow
    ///
    /// ```text
    /// 1. Check the request is unlocked
    /// 2. Redeem the shares on-chain and wait for confirmation
    /// 3. Mark the record completed with the tx hash
    /// 4. Clear the cache entry
    /// ```
    ///
    /// ## Errors
    ///
    /// - `NotReady` - nothing pending or still locked; nothing submitted
    /// - `Remote` - the wallet's cache could not be loaded
    /// - `Chain` - step 2 failed; the request stays pending
    /// - `Unconfirmed` - step 2 timed out after sending
    /// - `PartialSuccess` - step 3 failed after step 2 succeeded
    pub async fn execute_redemption(&self, wallet: &str, vault: VaultKey) -> Result<String, RedemptionError> {
        let wallet = wallet.to_lowercase();
        self.ensure_loaded(&wallet).await?;
        let now = self.clock.now();

        let (_guard, cached) = self.begin_action(&wallet, vault, |cached| match cached {
            Some(request) if request.is_unlocked(now) => Ok(()),
            other => Err(RedemptionError::NotReady {
                vault,
                unlock_at: other.map(|r| r.unlock_at),
            }),
        })?;
        let request = cached.ok_or(RedemptionError::NotReady { vault, unlock_at: None })?;

        if let Some(pending) = self.reconciliation(&wallet, vault) {
            return Err(RedemptionError::Validation(format!(
                "Redemption was already submitted in {}; reconcile it instead of executing again",
                pending.tx_hash
            )));
        }

        let shares = to_base_units(request.shares_amount, SHARE_DECIMALS)
            .filter(|s| *s > 0)
            .ok_or_else(|| {
                RedemptionError::Validation(format!("Invalid share amount {}", request.shares_amount))
            })?;

        let mut update = transition(&request, RedemptionStatus::Completed, None)?;

        info!("Executing redemption {} on {} for {}", request.id, vault, wallet);

        let tx_hash = match self.proxy.submit_redemption(&wallet, vault, shares).await {
            Ok(tx_hash) => tx_hash,
            Err(ChainError::Unconfirmed { tx_hash, timeout_secs }) => {
                error!(
                    "Redemption {} sent in {} but not confirmed after {}s",
                    request.id, tx_hash, timeout_secs
                );
                self.mark_reconciliation(&wallet, vault, &request.id, &tx_hash, false);
                return Err(RedemptionError::Unconfirmed {
                    tx_hash,
                    reason: format!("no receipt after {}s", timeout_secs),
                });
            }
            Err(e) => {
                warn!("Redemption {} failed on-chain: {}", request.id, e);
                return Err(RedemptionError::Chain(e));
            }
        };

        update.tx_hash = Some(tx_hash.clone());
        if let Err(e) = self.store.update_status(&update).await {
            error!(
                "Redemption {} executed in {} but record update failed: {}",
                request.id, tx_hash, e
            );
            self.mark_reconciliation(&wallet, vault, &request.id, &tx_hash, true);
            return Err(RedemptionError::PartialSuccess {
                tx_hash,
                reason: e.to_string(),
            });
        }

        self.clear_entry(&wallet, vault, &request.id);
        info!("Redemption {} completed: {}", request.id, tx_hash);
        Ok(tx_hash)
    }

    /// Settle a redemption whose transaction left the chain and the
    /// store out of sync.
    ///
    /// A transaction that was never confirmed is looked up first:
    ///
    /// ```text
    /// mined, status 1     → record completed, cache cleared
    /// reverted or dropped → marker cleared, Chain (request stays pending)
    /// still pending       → marker kept, Unconfirmed
    /// ```
    ///
    /// A confirmed transaction goes straight to the record update.
    /// Returns `Ok(None)` when nothing awaits reconciliation.
    pub async fn reconcile_redemption(&self, wallet: &str, vault: VaultKey) -> Result<Option<String>, RedemptionError> {
        let wallet = wallet.to_lowercase();

        let (_guard, _) = self.begin_action(&wallet, vault, |_| Ok(()))?;
        let pending = match self.reconciliation(&wallet, vault) {
            Some(pending) => pending,
            None => return Ok(None),
        };

        if !pending.confirmed {
            self.confirm_on_chain(&wallet, vault, &pending).await?;
        }

        info!("Reconciling redemption {} with {}", pending.request_id, pending.tx_hash);

        let update = StatusUpdate {
            id: pending.request_id.clone(),
            status: RedemptionStatus::Completed,
            tx_hash: Some(pending.tx_hash.clone()),
        };
        self.store.update_status(&update).await.map_err(|e| {
            warn!("Reconciliation of {} failed: {}", pending.request_id, e);
            RedemptionError::Remote(e)
        })?;

        self.lock().reconciliations.remove(&(wallet.clone(), vault));
        self.clear_entry(&wallet, vault, &pending.request_id);
        Ok(Some(pending.tx_hash))
    }

    /// Resolve an unconfirmed redemption transaction against the chain.
    async fn confirm_on_chain(
        &self,
        wallet: &str,
        vault: VaultKey,
        pending: &PendingReconciliation,
    ) -> Result<(), RedemptionError> {
        let tx_hash = pending.tx_hash.clone();

        let status = match self.proxy.transaction_status(vault, &tx_hash).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Receipt lookup for {} failed: {}", tx_hash, e);
                return Err(RedemptionError::Unconfirmed {
                    tx_hash,
                    reason: format!("receipt lookup failed: {}", e),
                });
            }
        };

        match status {
            TxStatus::Confirmed => {
                info!("Redemption {} confirmed on-chain in {}", pending.request_id, tx_hash);
                self.mark_reconciliation(wallet, vault, &pending.request_id, &tx_hash, true);
                Ok(())
            }
            TxStatus::Pending => Err(RedemptionError::Unconfirmed {
                tx_hash,
                reason: "transaction is still pending".to_string(),
            }),
            TxStatus::Reverted | TxStatus::Dropped => {
                warn!(
                    "Redemption {} transaction {} was {:?}; the request stays pending",
                    pending.request_id, tx_hash, status
                );
                self.lock().reconciliations.remove(&(wallet.to_string(), vault));
                let error = match status {
                    TxStatus::Reverted => ChainError::Reverted { tx_hash },
                    _ => ChainError::Dropped { tx_hash },
                };
                Err(RedemptionError::Chain(error))
            }
        }
    }

    // ==========================================
    // READ MODEL
    // ==========================================

    /// Copy of the wallet's cached state, with countdowns, for display.
    pub fn snapshot(&self, wallet: &str) -> RedemptionSnapshot {
        let wallet = wallet.to_lowercase();
        let now = self.clock.now();
        let state = self.lock();
        let cache = state.wallets.get(&wallet);

        let vaults = VaultKey::ALL
            .iter()
            .map(|vault| {
                let request = cache.and_then(|c| c.pending(*vault)).cloned();
                let remaining_ms = request.as_ref().map(|r| r.remaining_ms(now));
                VaultRedemption {
                    vault: *vault,
                    ready: request.as_ref().map(|r| r.is_unlocked(now)).unwrap_or(false),
                    countdown: remaining_ms.map(format_countdown),
                    remaining_ms,
                    reconciliation: state.reconciliations.get(&(wallet.clone(), *vault)).cloned(),
                    request,
                }
            })
            .collect();

        RedemptionSnapshot {
            wallet: wallet.clone(),
            cooldown_seconds: state.cooldown_secs,
            refreshed_at: cache.and_then(|c| c.refreshed_at),
            vaults,
        }
    }

    /// Drop a wallet's cache (its dashboard session ended).
    ///
    /// Pending reconciliations are kept.
    pub fn evict(&self, wallet: &str) {
        self.lock().wallets.remove(&wallet.to_lowercase());
    }

    // ==========================================
    // INTERNALS
    // ==========================================

    fn cached(&self, wallet: &str, vault: VaultKey) -> Option<RedemptionRequest> {
        self.lock()
            .wallets
            .get(wallet)
            .and_then(|c| c.pending(vault))
            .cloned()
    }

    fn reconciliation(&self, wallet: &str, vault: VaultKey) -> Option<PendingReconciliation> {
        self.lock()
            .reconciliations
            .get(&(wallet.to_string(), vault))
            .cloned()
    }

    /// Check preconditions and mark (wallet, vault) busy in one step.
    ///
    /// `check` sees the cached pending request; a second action on the
    /// same vault while one is in flight fails with `Validation`.
    fn begin_action<F>(
        &self,
        wallet: &str,
        vault: VaultKey,
        check: F,
    ) -> Result<(ActionGuard<'_>, Option<RedemptionRequest>), RedemptionError>
    where
        F: FnOnce(Option<&RedemptionRequest>) -> Result<(), RedemptionError>,
    {
        let mut state = self.lock();
        let cached = state.wallets.get(wallet).and_then(|c| c.pending(vault)).cloned();
        check(cached.as_ref())?;

        let key = (wallet.to_string(), vault);
        if !state.in_flight.insert(key.clone()) {
            return Err(RedemptionError::Validation(format!(
                "Another redemption action is in progress on {}",
                vault
            )));
        }

        Ok((ActionGuard { state: &self.state, key }, cached))
    }

    /// Remove a cache entry, unless a refresh already replaced it.
    fn clear_entry(&self, wallet: &str, vault: VaultKey, request_id: &str) {
        let mut state = self.lock();
        if let Some(cache) = state.wallets.get_mut(wallet) {
            if let Some(slot) = cache.requests.get_mut(&vault) {
                if slot.as_ref().map(|r| r.id == request_id).unwrap_or(false) {
                    *slot = None;
                }
            }
        }
    }

    fn mark_reconciliation(&self, wallet: &str, vault: VaultKey, request_id: &str, tx_hash: &str, confirmed: bool) {
        self.lock().reconciliations.insert(
            (wallet.to_string(), vault),
            PendingReconciliation {
                request_id: request_id.to_string(),
                tx_hash: tx_hash.to_string(),
                confirmed,
            },
        );
    }
}

/// Status update moving `request` to `next`, refusing to leave a terminal status.
fn transition(
    request: &RedemptionRequest,
    next: RedemptionStatus,
    tx_hash: Option<String>,
) -> Result<StatusUpdate, RedemptionError> {
    if !request.status.can_transition_to(next) {
        return Err(RedemptionError::Validation(format!(
            "Redemption {} is already {}",
            request.id, request.status
        )));
    }
    Ok(StatusUpdate {
        id: request.id.clone(),
        status: next,
        tx_hash,
    })
}

#[cfg(test)]
pub(crate) mod fakes {
    //! In-memory stand-ins for the store, the chain and the clock.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Duration, Utc};
    use tokio::sync::Semaphore;

    use super::Clock;
    use crate::chain::{ChainError, TxStatus, VaultContractProxy};
    use crate::config::VaultKey;
    use crate::store::{
        NewRedemption, PendingSnapshot, RecordStore, RedemptionRecord, StatusUpdate, StoreError,
    };

    #[derive(Clone)]
    pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        pub fn at(now: DateTime<Utc>) -> Self {
            Self(Arc::new(Mutex::new(now)))
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *self.0.lock().unwrap() = now;
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now = *now + by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct StoreInner {
        pending: VecDeque<Result<PendingSnapshot, String>>,
        create: VecDeque<Result<RedemptionRecord, String>>,
        update: VecDeque<Result<RedemptionRecord, String>>,
        created: Vec<NewRedemption>,
        updates: Vec<StatusUpdate>,
        pending_calls: usize,
        pending_gate: Option<Arc<Semaphore>>,
    }

    /// Record store answering from scripted responses.
    ///
    /// Unscripted calls fail with `Rejected("unscripted")`.
    #[derive(Clone, Default)]
    pub struct FakeStore(Arc<Mutex<StoreInner>>);

    impl FakeStore {
        pub fn push_pending(&self, response: Result<PendingSnapshot, String>) {
            self.0.lock().unwrap().pending.push_back(response);
        }

        pub fn push_create(&self, response: Result<RedemptionRecord, String>) {
            self.0.lock().unwrap().create.push_back(response);
        }

        pub fn push_update(&self, response: Result<RedemptionRecord, String>) {
            self.0.lock().unwrap().update.push_back(response);
        }

        pub fn created(&self) -> Vec<NewRedemption> {
            self.0.lock().unwrap().created.clone()
        }

        pub fn updates(&self) -> Vec<StatusUpdate> {
            self.0.lock().unwrap().updates.clone()
        }

        /// Make `pending` wait for a permit on the returned semaphore.
        pub fn hold_pending(&self) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            self.0.lock().unwrap().pending_gate = Some(gate.clone());
            gate
        }

        pub fn pending_calls(&self) -> usize {
            self.0.lock().unwrap().pending_calls
        }

        pub fn total_calls(&self) -> usize {
            let inner = self.0.lock().unwrap();
            inner.pending_calls + inner.created.len() + inner.updates.len()
        }
    }

    fn scripted<T>(queue: &mut VecDeque<Result<T, String>>) -> Result<T, StoreError> {
        queue
            .pop_front()
            .unwrap_or_else(|| Err("unscripted".to_string()))
            .map_err(StoreError::Rejected)
    }

    impl RecordStore for FakeStore {
        async fn pending(&self, _wallet: &str) -> Result<PendingSnapshot, StoreError> {
            let gate = self.0.lock().unwrap().pending_gate.clone();
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
            let mut inner = self.0.lock().unwrap();
            inner.pending_calls += 1;
            scripted(&mut inner.pending)
        }

        async fn create(&self, draft: &NewRedemption) -> Result<RedemptionRecord, StoreError> {
            let mut inner = self.0.lock().unwrap();
            inner.created.push(draft.clone());
            scripted(&mut inner.create)
        }

        async fn update_status(&self, update: &StatusUpdate) -> Result<RedemptionRecord, StoreError> {
            let mut inner = self.0.lock().unwrap();
            inner.updates.push(update.clone());
            scripted(&mut inner.update)
        }
    }

    pub enum ChainOutcome {
        Confirmed(String),
        Reverted,
        Unconfirmed(String),
    }

    #[derive(Default)]
    struct ProxyInner {
        outcomes: VecDeque<ChainOutcome>,
        statuses: VecDeque<Result<TxStatus, ChainError>>,
        submissions: Vec<(String, VaultKey, u128)>,
        status_lookups: Vec<String>,
    }

    #[derive(Clone, Default)]
    pub struct FakeProxy(Arc<Mutex<ProxyInner>>);

    impl FakeProxy {
        pub fn push_outcome(&self, outcome: ChainOutcome) {
            self.0.lock().unwrap().outcomes.push_back(outcome);
        }

        pub fn submissions(&self) -> Vec<(String, VaultKey, u128)> {
            self.0.lock().unwrap().submissions.clone()
        }

        pub fn push_status(&self, status: Result<TxStatus, ChainError>) {
            self.0.lock().unwrap().statuses.push_back(status);
        }

        /// Hashes passed to `transaction_status`, in order.
        pub fn status_lookups(&self) -> Vec<String> {
            self.0.lock().unwrap().status_lookups.clone()
        }
    }

    impl VaultContractProxy for FakeProxy {
        async fn submit_redemption(&self, wallet: &str, vault: VaultKey, shares: u128) -> Result<String, ChainError> {
            let mut inner = self.0.lock().unwrap();
            inner.submissions.push((wallet.to_string(), vault, shares));
            match inner.outcomes.pop_front() {
                Some(ChainOutcome::Confirmed(tx_hash)) => Ok(tx_hash),
                Some(ChainOutcome::Unconfirmed(tx_hash)) => Err(ChainError::Unconfirmed {
                    tx_hash,
                    timeout_secs: 180,
                }),
                Some(ChainOutcome::Reverted) | None => Err(ChainError::Reverted {
                    tx_hash: "0xbad".to_string(),
                }),
            }
        }

        async fn transaction_status(&self, _vault: VaultKey, tx_hash: &str) -> Result<TxStatus, ChainError> {
            let mut inner = self.0.lock().unwrap();
            inner.status_lookups.push(tx_hash.to_string());
            inner
                .statuses
                .pop_front()
                .unwrap_or_else(|| Err(ChainError::Transport("unscripted".to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::config::vaults::test_registry;
    use crate::store::{PendingSnapshot, RedemptionRecord};
    use chrono::{Duration, TimeZone};
    use std::str::FromStr;

    const WALLET: &str = "0xAAaaAAaaAAaaAAaaAAaaAAaaAAaaAAaaAAaaAAaa";

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    fn record(id: &str, vault: &str, shares: &str, unlock_at: DateTime<Utc>, status: RedemptionStatus) -> RedemptionRecord {
        RedemptionRecord {
            id: id.to_string(),
            wallet_address: Some(WALLET.to_lowercase()),
            vault: vault.to_string(),
            shares_amount: dec(shares),
            estimated_usdc_value: None,
            unlock_at: Some(unlock_at),
            status,
            tx_hash: None,
            created_at: None,
        }
    }

    fn order(shares: &str) -> RedemptionOrder {
        RedemptionOrder {
            vault: VaultKey::Arb,
            shares_amount: dec(shares),
            share_balance: dec("100"),
            share_price: dec("1.075"),
        }
    }

    struct Harness {
        store: FakeStore,
        proxy: FakeProxy,
        clock: ManualClock,
        manager: RedemptionManager<FakeStore, FakeProxy, ManualClock>,
    }

    fn harness() -> Harness {
        let store = FakeStore::default();
        let proxy = FakeProxy::default();
        let clock = ManualClock::at(t0());
        let manager = RedemptionManager::new(store.clone(), proxy.clone(), clock.clone(), test_registry(), 120);
        Harness { store, proxy, clock, manager }
    }

    /// Harness whose wallet cache was loaded from an empty store.
    async fn warm_harness() -> Harness {
        let h = harness();
        h.store.push_pending(Ok(PendingSnapshot::default()));
        assert!(h.manager.refresh_pending(WALLET).await);
        h
    }

    /// Harness with a pending 10.5-share request on arb unlocking at t0 + 120s.
    async fn harness_with_pending() -> Harness {
        let h = harness();
        h.store.push_pending(Ok(PendingSnapshot {
            records: vec![record("r1", "arb", "10.5", t0() + Duration::seconds(120), RedemptionStatus::Pending)],
            cooldown_seconds: Some(120),
        }));
        assert!(h.manager.refresh_pending(WALLET).await);
        h
    }

    // ---------- request ----------

    #[tokio::test]
    async fn test_request_rejects_non_positive_amount_without_store_call() {
        let h = harness();
        for shares in ["0", "-1"] {
            let err = h.manager.request_redemption(WALLET, order(shares)).await.unwrap_err();
            assert!(matches!(err, RedemptionError::Validation(_)));
        }
        assert_eq!(h.store.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_request_rejects_when_pending_cached() {
        let h = harness_with_pending().await;
        let err = h.manager.request_redemption(WALLET, order("1")).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Validation(_)));
        assert!(h.store.created().is_empty());
    }

    #[tokio::test]
    async fn test_request_rejects_amount_above_balance() {
        let h = harness();
        let mut o = order("101");
        o.share_balance = dec("100");
        let err = h.manager.request_redemption(WALLET, o).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Validation(_)));
        assert_eq!(h.store.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_request_rejects_unavailable_vault() {
        let h = harness();
        let mut o = order("1");
        o.vault = VaultKey::Base;
        let err = h.manager.request_redemption(WALLET, o).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Validation(_)));
        assert_eq!(h.store.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_request_computes_estimate_and_caches_pending() {
        let h = warm_harness().await;
        h.store.push_create(Ok(record(
            "r1",
            "arb",
            "10.5",
            t0() + Duration::seconds(120),
            RedemptionStatus::Pending,
        )));

        let request = h.manager.request_redemption(WALLET, order("10.5")).await.unwrap();

        let created = h.store.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].estimated_usdc_value, dec("11.2875"));
        assert_eq!(created[0].wallet_address, WALLET.to_lowercase());
        assert_eq!(request.status, RedemptionStatus::Pending);

        let snapshot = h.manager.snapshot(WALLET);
        let arb = &snapshot.vaults[0];
        assert_eq!(arb.request.as_ref().map(|r| r.id.as_str()), Some("r1"));
        assert_eq!(arb.remaining_ms, Some(120_000));
        assert_eq!(arb.countdown.as_deref(), Some("2m 0s"));
        assert!(!arb.ready);
    }

    #[tokio::test]
    async fn test_second_request_fails_and_keeps_first() {
        let h = warm_harness().await;
        h.store.push_create(Ok(record("r1", "arb", "10.5", t0() + Duration::seconds(120), RedemptionStatus::Pending)));

        h.manager.request_redemption(WALLET, order("10.5")).await.unwrap();
        let err = h.manager.request_redemption(WALLET, order("2")).await.unwrap_err();

        assert!(matches!(err, RedemptionError::Validation(_)));
        assert_eq!(h.store.created().len(), 1);
        let cached = h.manager.snapshot(WALLET).vaults[0].request.clone().unwrap();
        assert_eq!(cached.id, "r1");
        assert_eq!(cached.shares_amount, dec("10.5"));
    }

    #[tokio::test]
    async fn test_request_store_rejection_caches_nothing() {
        let h = warm_harness().await;
        h.store.push_create(Err("already pending".to_string()));

        let err = h.manager.request_redemption(WALLET, order("1")).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Remote(_)));
        assert!(h.manager.snapshot(WALLET).vaults[0].request.is_none());
    }

    // ---------- is_ready ----------

    #[tokio::test]
    async fn test_is_ready_boundary() {
        let h = harness_with_pending().await;
        let unlock = t0() + Duration::seconds(120);

        h.clock.set(unlock - Duration::milliseconds(1));
        assert!(!h.manager.is_ready(WALLET, VaultKey::Arb));
        assert!(!h.manager.is_ready(WALLET, VaultKey::Arb));

        h.clock.set(unlock);
        assert!(h.manager.is_ready(WALLET, VaultKey::Arb));
        assert!(h.manager.is_ready(WALLET, VaultKey::Arb));

        h.clock.set(unlock + Duration::days(3));
        assert!(h.manager.is_ready(WALLET, VaultKey::Arb));
        assert!(!h.manager.is_ready(WALLET, VaultKey::Base));
    }

    // ---------- refresh ----------

    #[tokio::test]
    async fn test_refresh_then_clock_advance_unlocks() {
        let h = harness_with_pending().await;
        assert_eq!(h.manager.cooldown_secs(), 120);
        assert!(!h.manager.is_ready(WALLET, VaultKey::Arb));
        assert_eq!(h.manager.countdown(WALLET, VaultKey::Arb), Some(120_000));

        h.clock.advance(Duration::seconds(120));
        assert!(h.manager.is_ready(WALLET, VaultKey::Arb));
        assert_eq!(h.manager.countdown(WALLET, VaultKey::Arb), Some(0));
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_cache() {
        let h = harness_with_pending().await;
        h.store.push_pending(Err("connection reset".to_string()));

        assert!(!h.manager.refresh_pending(WALLET).await);
        let cached = h.manager.snapshot(WALLET).vaults[0].request.clone();
        assert_eq!(cached.map(|r| r.id), Some("r1".to_string()));
    }

    #[tokio::test]
    async fn test_refresh_replaces_cache() {
        let h = harness_with_pending().await;
        h.store.push_pending(Ok(PendingSnapshot::default()));

        assert!(h.manager.refresh_pending(WALLET).await);
        assert!(h.manager.snapshot(WALLET).vaults.iter().all(|v| v.request.is_none()));
    }

    #[tokio::test]
    async fn test_refresh_skips_terminal_and_unknown_records() {
        let h = harness();
        let unlock = t0() + Duration::seconds(60);
        h.store.push_pending(Ok(PendingSnapshot {
            records: vec![
                record("done", "arb", "1", unlock, RedemptionStatus::Completed),
                record("odd", "optimism", "1", unlock, RedemptionStatus::Pending),
            ],
            cooldown_seconds: None,
        }));

        assert!(h.manager.refresh_pending(WALLET).await);
        assert!(h.manager.snapshot(WALLET).vaults.iter().all(|v| v.request.is_none()));
    }

    #[tokio::test]
    async fn test_server_cooldown_overrides_default() {
        let h = harness();
        let mut no_unlock = record("r1", "arb", "1", t0(), RedemptionStatus::Pending);
        no_unlock.unlock_at = None;
        h.store.push_pending(Ok(PendingSnapshot {
            records: vec![no_unlock],
            cooldown_seconds: Some(600),
        }));

        assert!(h.manager.refresh_pending(WALLET).await);
        assert_eq!(h.manager.cooldown_secs(), 600);
        assert_eq!(h.manager.countdown(WALLET, VaultKey::Arb), Some(600_000));
    }

    // ---------- cancel ----------

    #[tokio::test]
    async fn test_cancel_without_request_is_noop() {
        let h = warm_harness().await;
        let calls_before = h.store.total_calls();

        assert_eq!(h.manager.cancel_redemption(WALLET, VaultKey::Arb).await.unwrap(), None);
        assert_eq!(h.store.total_calls(), calls_before);
    }

    #[tokio::test]
    async fn test_cancel_clears_cache() {
        let h = harness_with_pending().await;
        h.store.push_update(Ok(record("r1", "arb", "10.5", t0(), RedemptionStatus::Cancelled)));

        let cancelled = h.manager.cancel_redemption(WALLET, VaultKey::Arb).await.unwrap().unwrap();

        assert_eq!(cancelled.status, RedemptionStatus::Cancelled);
        assert_eq!(h.store.updates()[0].status, RedemptionStatus::Cancelled);
        assert_eq!(h.store.updates()[0].id, "r1");
        assert!(h.manager.snapshot(WALLET).vaults[0].request.is_none());

        // Vault is free again without waiting for a poll
        h.store.push_create(Ok(record("r2", "arb", "1", t0() + Duration::seconds(120), RedemptionStatus::Pending)));
        assert!(h.manager.request_redemption(WALLET, order("1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_rejection_keeps_cache() {
        let h = harness_with_pending().await;
        h.store.push_update(Err("already completed".to_string()));

        let err = h.manager.cancel_redemption(WALLET, VaultKey::Arb).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Remote(_)));
        assert!(h.manager.snapshot(WALLET).vaults[0].request.is_some());
    }

    // ---------- execute ----------

    #[tokio::test]
    async fn test_execute_before_unlock_makes_no_calls() {
        let h = harness_with_pending().await;
        let calls_before = h.store.total_calls();

        let err = h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap_err();

        assert!(matches!(err, RedemptionError::NotReady { vault: VaultKey::Arb, unlock_at: Some(_) }));
        assert!(h.proxy.submissions().is_empty());
        assert_eq!(h.store.total_calls(), calls_before);

        let err = h.manager.execute_redemption(WALLET, VaultKey::Base).await.unwrap_err();
        assert!(matches!(err, RedemptionError::NotReady { unlock_at: None, .. }));
    }

    #[tokio::test]
    async fn test_execute_success_completes_and_clears() {
        let h = harness_with_pending().await;
        h.clock.advance(Duration::seconds(120));
        h.proxy.push_outcome(ChainOutcome::Confirmed("0xfeed".to_string()));
        h.store.push_update(Ok(record("r1", "arb", "10.5", t0(), RedemptionStatus::Completed)));

        let tx_hash = h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap();

        assert_eq!(tx_hash, "0xfeed");
        assert_eq!(
            h.proxy.submissions(),
            vec![(WALLET.to_lowercase(), VaultKey::Arb, 10_500_000_000_000_000_000)]
        );
        let update = &h.store.updates()[0];
        assert_eq!(update.status, RedemptionStatus::Completed);
        assert_eq!(update.tx_hash.as_deref(), Some("0xfeed"));
        assert!(h.manager.snapshot(WALLET).vaults[0].request.is_none());
    }

    #[tokio::test]
    async fn test_execute_chain_failure_stays_pending() {
        let h = harness_with_pending().await;
        h.clock.advance(Duration::seconds(120));
        h.proxy.push_outcome(ChainOutcome::Reverted);

        let err = h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap_err();

        assert!(matches!(err, RedemptionError::Chain(_)));
        assert!(h.store.updates().is_empty());
        assert!(h.manager.is_ready(WALLET, VaultKey::Arb));

        // Retryable without re-requesting
        h.proxy.push_outcome(ChainOutcome::Confirmed("0xfeed".to_string()));
        h.store.push_update(Ok(record("r1", "arb", "10.5", t0(), RedemptionStatus::Completed)));
        assert_eq!(h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap(), "0xfeed");
    }

    #[tokio::test]
    async fn test_execute_store_failure_is_partial_success() {
        let h = harness_with_pending().await;
        h.clock.advance(Duration::seconds(121));
        h.proxy.push_outcome(ChainOutcome::Confirmed("0xdead...beef".to_string()));
        h.store.push_update(Err("timed out".to_string()));

        let err = h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap_err();

        match &err {
            RedemptionError::PartialSuccess { tx_hash, .. } => assert_eq!(tx_hash, "0xdead...beef"),
            other => panic!("expected PartialSuccess, got {:?}", other),
        }
        assert_eq!(err.code(), "RECONCILIATION_REQUIRED");

        let arb = &h.manager.snapshot(WALLET).vaults[0];
        assert_eq!(arb.request.as_ref().map(|r| r.status), Some(RedemptionStatus::Pending));
        assert_eq!(
            arb.reconciliation.as_ref().map(|r| r.tx_hash.as_str()),
            Some("0xdead...beef")
        );

        // A second execution would redeem twice; it is refused before the chain.
        let err = h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Validation(_)));
        assert_eq!(h.proxy.submissions().len(), 1);

        // And so is cancelling.
        assert!(matches!(
            h.manager.cancel_redemption(WALLET, VaultKey::Arb).await,
            Err(RedemptionError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_after_partial_success() {
        let h = harness_with_pending().await;
        h.clock.advance(Duration::seconds(120));
        h.proxy.push_outcome(ChainOutcome::Confirmed("0xfeed".to_string()));
        h.store.push_update(Err("timed out".to_string()));
        let _ = h.manager.execute_redemption(WALLET, VaultKey::Arb).await;

        h.store.push_update(Ok(record("r1", "arb", "10.5", t0(), RedemptionStatus::Completed)));
        let reconciled = h.manager.reconcile_redemption(WALLET, VaultKey::Arb).await.unwrap();

        assert_eq!(reconciled.as_deref(), Some("0xfeed"));
        // Confirmed on-chain already; no receipt lookup needed.
        assert!(h.proxy.status_lookups().is_empty());
        let last = h.store.updates().pop().unwrap();
        assert_eq!(last.tx_hash.as_deref(), Some("0xfeed"));
        let arb = &h.manager.snapshot(WALLET).vaults[0];
        assert!(arb.request.is_none());
        assert!(arb.reconciliation.is_none());
        assert_eq!(h.manager.reconcile_redemption(WALLET, VaultKey::Arb).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_settles_reconciliation() {
        let h = harness_with_pending().await;
        h.clock.advance(Duration::seconds(120));
        h.proxy.push_outcome(ChainOutcome::Confirmed("0xfeed".to_string()));
        h.store.push_update(Err("timed out".to_string()));
        let _ = h.manager.execute_redemption(WALLET, VaultKey::Arb).await;

        // The store caught up on its own.
        h.store.push_pending(Ok(PendingSnapshot::default()));
        assert!(h.manager.refresh_pending(WALLET).await);
        assert!(h.manager.snapshot(WALLET).vaults[0].reconciliation.is_none());
    }

    #[tokio::test]
    async fn test_unconfirmed_execution_blocks_retry() {
        let h = harness_with_pending().await;
        h.clock.advance(Duration::seconds(120));
        h.proxy.push_outcome(ChainOutcome::Unconfirmed("0xslow".to_string()));

        let err = h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap_err();

        assert!(matches!(err, RedemptionError::Unconfirmed { .. }));
        assert_eq!(err.reconciliation_tx(), Some("0xslow"));
        assert!(h.store.updates().is_empty());
        let reconciliation = h.manager.snapshot(WALLET).vaults[0].reconciliation.clone().unwrap();
        assert!(!reconciliation.confirmed);
    }

    /// Pending request r1 on arb, executed past unlock with no receipt for `0xslow`.
    async fn harness_with_unconfirmed() -> Harness {
        let h = harness_with_pending().await;
        h.clock.advance(Duration::seconds(120));
        h.proxy.push_outcome(ChainOutcome::Unconfirmed("0xslow".to_string()));
        let err = h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Unconfirmed { .. }));
        h
    }

    #[tokio::test]
    async fn test_reconcile_unconfirmed_checks_chain_before_completing() {
        let h = harness_with_unconfirmed().await;
        h.proxy.push_status(Ok(TxStatus::Confirmed));
        h.store.push_update(Ok(record("r1", "arb", "10.5", t0(), RedemptionStatus::Completed)));

        let reconciled = h.manager.reconcile_redemption(WALLET, VaultKey::Arb).await.unwrap();

        assert_eq!(reconciled.as_deref(), Some("0xslow"));
        assert_eq!(h.proxy.status_lookups(), vec!["0xslow".to_string()]);
        let update = h.store.updates().pop().unwrap();
        assert_eq!(update.status, RedemptionStatus::Completed);
        assert_eq!(update.tx_hash.as_deref(), Some("0xslow"));
        let arb = &h.manager.snapshot(WALLET).vaults[0];
        assert!(arb.request.is_none());
        assert!(arb.reconciliation.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_failed_transaction_reopens_request() {
        for status in [TxStatus::Reverted, TxStatus::Dropped] {
            let h = harness_with_unconfirmed().await;
            h.proxy.push_status(Ok(status));

            let err = h.manager.reconcile_redemption(WALLET, VaultKey::Arb).await.unwrap_err();

            assert!(matches!(err, RedemptionError::Chain(_)), "{:?}: {:?}", status, err);
            assert!(h.store.updates().is_empty());
            let arb = &h.manager.snapshot(WALLET).vaults[0];
            assert!(arb.reconciliation.is_none());
            assert_eq!(arb.request.as_ref().map(|r| r.status), Some(RedemptionStatus::Pending));

            // The shares never moved; executing again is allowed.
            h.proxy.push_outcome(ChainOutcome::Confirmed("0xfeed".to_string()));
            h.store.push_update(Ok(record("r1", "arb", "10.5", t0(), RedemptionStatus::Completed)));
            assert_eq!(h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap(), "0xfeed");
        }
    }

    #[tokio::test]
    async fn test_reconcile_still_pending_keeps_marker() {
        let h = harness_with_unconfirmed().await;

        // The store keeps listing r1 as pending.
        h.store.push_pending(Ok(PendingSnapshot {
            records: vec![record("r1", "arb", "10.5", t0() + Duration::seconds(120), RedemptionStatus::Pending)],
            cooldown_seconds: Some(120),
        }));
        assert!(h.manager.refresh_pending(WALLET).await);

        h.proxy.push_status(Ok(TxStatus::Pending));
        let err = h.manager.reconcile_redemption(WALLET, VaultKey::Arb).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Unconfirmed { .. }));
        assert_eq!(err.reconciliation_tx(), Some("0xslow"));

        h.proxy.push_status(Err(ChainError::Transport("connection reset".to_string())));
        let err = h.manager.reconcile_redemption(WALLET, VaultKey::Arb).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Unconfirmed { .. }));

        assert!(h.store.updates().is_empty());
        assert!(h.manager.snapshot(WALLET).vaults[0].reconciliation.is_some());
        assert!(matches!(
            h.manager.execute_redemption(WALLET, VaultKey::Arb).await,
            Err(RedemptionError::Validation(_))
        ));
        assert_eq!(h.proxy.submissions().len(), 1);
    }

    // ---------- cold cache ----------

    fn unlocked_snapshot() -> PendingSnapshot {
        PendingSnapshot {
            records: vec![record("r1", "arb", "10.5", t0() - Duration::seconds(1), RedemptionStatus::Pending)],
            cooldown_seconds: Some(120),
        }
    }

    #[tokio::test]
    async fn test_execute_on_cold_cache_loads_store_first() {
        let h = harness();
        h.store.push_pending(Ok(unlocked_snapshot()));
        h.proxy.push_outcome(ChainOutcome::Confirmed("0xfeed".to_string()));
        h.store.push_update(Ok(record("r1", "arb", "10.5", t0(), RedemptionStatus::Completed)));

        let tx_hash = h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap();

        assert_eq!(tx_hash, "0xfeed");
        assert_eq!(h.store.pending_calls(), 1);
        assert_eq!(h.store.updates()[0].id, "r1");
    }

    #[tokio::test]
    async fn test_cancel_and_request_on_cold_cache_see_store_state() {
        let h = harness();
        h.store.push_pending(Ok(unlocked_snapshot()));

        let err = h.manager.request_redemption(WALLET, order("1")).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Validation(_)));
        assert!(h.store.created().is_empty());

        h.store.push_update(Ok(record("r1", "arb", "10.5", t0(), RedemptionStatus::Cancelled)));
        let cancelled = h.manager.cancel_redemption(WALLET, VaultKey::Arb).await.unwrap();
        assert_eq!(cancelled.map(|r| r.id), Some("r1".to_string()));

        // Loaded once; later actions use the cache.
        assert_eq!(h.store.pending_calls(), 1);
    }

    #[tokio::test]
    async fn test_cold_cache_load_failure_blocks_action() {
        let h = harness();
        h.store.push_pending(Err("connection reset".to_string()));

        let err = h.manager.execute_redemption(WALLET, VaultKey::Arb).await.unwrap_err();

        assert!(matches!(err, RedemptionError::Remote(_)));
        assert!(h.proxy.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_evicted_wallet_is_reloaded() {
        let h = harness_with_pending().await;
        h.manager.evict(WALLET);
        h.store.push_pending(Ok(unlocked_snapshot()));
        h.store.push_update(Ok(record("r1", "arb", "10.5", t0(), RedemptionStatus::Cancelled)));

        assert!(h.manager.cancel_redemption(WALLET, VaultKey::Arb).await.unwrap().is_some());
        assert_eq!(h.store.pending_calls(), 2);
    }

    #[tokio::test]
    async fn test_wallet_keys_are_case_insensitive() {
        let h = harness_with_pending().await;
        assert!(h.manager.snapshot(&WALLET.to_uppercase().replace("0X", "0x")).vaults[0].request.is_some());
        h.manager.evict(WALLET);
        assert!(h.manager.snapshot(WALLET).vaults[0].request.is_none());
    }
}
