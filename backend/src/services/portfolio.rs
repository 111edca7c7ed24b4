//! # Portfolio Service
//!
//! Read side of the dashboard (vault metrics, wallet positions) plus the
//! deposit flow and the share quote a redemption request is built from.
//!
//! ## Position Valuation
//!
//! ```text
//! shares      = vault.balanceOf(wallet) / 10^18
//! value (USD) = shares * share_price        (share_price defaults to 1)
//! total       = Σ value over all vaults
//! ```

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::chain::{ChainError, EnzymeVaultProxy};
use crate::config::{VaultDefinition, VaultKey, VaultRegistry};
use crate::utils::{
    format_percent, format_usd, from_base_units, to_base_units, SHARE_DECIMALS, USDC_DECIMALS,
};

use super::redemption_manager::RedemptionOrder;
use super::vault_data::{VaultDataClient, VaultMetrics};

#[derive(Debug, thiserror::Error)]
pub enum PortfolioError {
    #[error("{0}")]
    Validation(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

impl PortfolioError {
    pub fn code(&self) -> &'static str {
        match self {
            PortfolioError::Validation(_) => "VALIDATION_ERROR",
            PortfolioError::Chain(_) => "CHAIN_ERROR",
        }
    }
}

/// Metrics of one vault as shown on the overview cards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultOverview {
    pub vault: VaultKey,
    pub name: String,
    pub network: String,
    pub available: bool,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub share_price: Option<Decimal>,
    /// Percent, `monthly_return * 12`.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub apy: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub aum: Option<Decimal>,
    pub share_price_display: String,
    pub apy_display: String,
    pub aum_display: String,
}

impl VaultOverview {
    fn new(definition: &VaultDefinition, metrics: &VaultMetrics) -> Self {
        let apy = metrics.apy();
        Self {
            vault: definition.key,
            name: definition.name.clone(),
            network: definition.network.clone(),
            available: definition.is_available(),
            share_price: metrics.share_price,
            apy,
            aum: metrics.aum,
            share_price_display: format_usd(metrics.share_price),
            apy_display: format_percent(apy),
            aum_display: format_usd(metrics.aum),
        }
    }
}

/// A wallet's holdings in one vault.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultPosition {
    pub vault: VaultKey,
    pub available: bool,
    #[serde(with = "rust_decimal::serde::float")]
    pub shares: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub share_price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub value_usd: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub usdc_balance: Decimal,
    pub value_display: String,
}

/// A wallet's holdings across all vaults.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub wallet: String,
    pub vaults: Vec<VaultPosition>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_value_usd: Decimal,
    pub total_display: String,
}

/// Result of a deposit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositReceipt {
    pub vault: VaultKey,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub approve_tx_hash: String,
    pub deposit_tx_hash: String,
}

/// Value a raw share balance at `share_price`.
pub fn value_position(
    definition: &VaultDefinition,
    raw_shares: u128,
    raw_usdc: u128,
    metrics: &VaultMetrics,
) -> VaultPosition {
    let shares = from_base_units(raw_shares, SHARE_DECIMALS).unwrap_or(Decimal::ZERO);
    let usdc_balance = from_base_units(raw_usdc, USDC_DECIMALS).unwrap_or(Decimal::ZERO);
    let share_price = metrics.effective_share_price();
    let value_usd = shares.checked_mul(share_price).unwrap_or(Decimal::MAX);

    VaultPosition {
        vault: definition.key,
        available: definition.is_available(),
        shares,
        share_price,
        value_usd,
        usdc_balance,
        value_display: format_usd(Some(value_usd)),
    }
}

/// Check a deposit against the wallet's USDC balance.
///
/// Returns the amount in USDC base units.
pub fn validate_deposit(
    vaults: &VaultRegistry,
    vault: VaultKey,
    amount: Decimal,
    raw_usdc_balance: u128,
) -> Result<u128, PortfolioError> {
    if amount <= Decimal::ZERO {
        return Err(PortfolioError::Validation("Amount must be greater than 0".to_string()));
    }
    if !vaults.is_available(vault) {
        return Err(PortfolioError::Validation(format!("Vault {} is not available", vault)));
    }
    let units = to_base_units(amount, USDC_DECIMALS)
        .filter(|u| *u > 0)
        .ok_or_else(|| PortfolioError::Validation(format!("Invalid amount {}", amount)))?;
    if units > raw_usdc_balance {
        return Err(PortfolioError::Validation(format!(
            "Insufficient USDC: requested {}, available {}",
            amount,
            from_base_units(raw_usdc_balance, USDC_DECIMALS).unwrap_or(Decimal::ZERO)
        )));
    }
    Ok(units)
}

/// Portfolio queries and deposits.
#[derive(Clone)]
pub struct PortfolioService {
    vaults: VaultRegistry,
    chain: EnzymeVaultProxy,
    vault_data: VaultDataClient,
}

impl PortfolioService {
    pub fn new(vaults: VaultRegistry, chain: EnzymeVaultProxy, vault_data: VaultDataClient) -> Self {
        Self {
            vaults,
            chain,
            vault_data,
        }
    }

    /// Metrics of one vault; failures are logged and reported as missing.
    pub async fn metrics(&self, vault: VaultKey) -> VaultMetrics {
        let Some(definition) = self.vaults.get(vault) else {
            return VaultMetrics::default();
        };
        match self.vault_data.fetch(&definition.data_network).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Failed to fetch metrics for {}: {}", vault, e);
                VaultMetrics::default()
            }
        }
    }

    /// Overview card of every vault.
    pub async fn vault_overview(&self) -> Vec<VaultOverview> {
        let metrics = join_all(self.vaults.iter().map(|v| self.metrics(v.key))).await;
        self.vaults
            .iter()
            .zip(metrics.iter())
            .map(|(definition, metrics)| VaultOverview::new(definition, metrics))
            .collect()
    }

    /// Holdings of `wallet` in every vault.
    ///
    /// A vault whose balances cannot be read reports zero.
    pub async fn position(&self, wallet: &str) -> Portfolio {
        let positions = join_all(self.vaults.iter().map(|definition| async move {
            let metrics = self.metrics(definition.key).await;
            let (shares, usdc) = if definition.is_available() {
                let shares = self.chain.share_balance(wallet, definition.key).await;
                let usdc = self.chain.usdc_balance(wallet, definition.key).await;
                (
                    shares.unwrap_or_else(|e| {
                        warn!("Share balance of {} on {} unavailable: {}", wallet, definition.key, e);
                        0
                    }),
                    usdc.unwrap_or_else(|e| {
                        warn!("USDC balance of {} on {} unavailable: {}", wallet, definition.key, e);
                        0
                    }),
                )
            } else {
                (0, 0)
            };
            value_position(definition, shares, usdc, &metrics)
        }))
        .await;

        let total_value_usd = positions
            .iter()
            .fold(Decimal::ZERO, |acc, p| acc.saturating_add(p.value_usd));

        Portfolio {
            wallet: wallet.to_string(),
            vaults: positions,
            total_value_usd,
            total_display: format_usd(Some(total_value_usd)),
        }
    }

    /// Build a redemption order from the current balance and price.
    pub async fn quote_redemption(
        &self,
        wallet: &str,
        vault: VaultKey,
        shares_amount: Decimal,
    ) -> Result<RedemptionOrder, PortfolioError> {
        if shares_amount <= Decimal::ZERO {
            return Err(PortfolioError::Validation("Amount must be greater than 0".to_string()));
        }
        if !self.vaults.is_available(vault) {
            return Err(PortfolioError::Validation(format!("Vault {} is not available", vault)));
        }
        let raw = self.chain.share_balance(wallet, vault).await?;
        let share_balance = from_base_units(raw, SHARE_DECIMALS)
            .ok_or_else(|| PortfolioError::Validation("Share balance out of range".to_string()))?;
        let share_price = self.metrics(vault).await.effective_share_price();

        Ok(RedemptionOrder {
            vault,
            shares_amount,
            share_balance,
            share_price,
        })
    }

    /// Deposit `amount` USDC into a vault.
    pub async fn deposit(&self, wallet: &str, vault: VaultKey, amount: Decimal) -> Result<DepositReceipt, PortfolioError> {
        // Validate the cheap preconditions before touching the chain.
        validate_deposit(&self.vaults, vault, amount, u128::MAX)?;
        let balance = self.chain.usdc_balance(wallet, vault).await?;
        let units = validate_deposit(&self.vaults, vault, amount, balance)?;

        info!("Depositing {} USDC into {} for {}", amount, vault, wallet);
        let (approve_tx_hash, deposit_tx_hash) = self.chain.approve_and_buy_shares(wallet, vault, units).await?;
        info!("Deposit into {} confirmed: {}", vault, deposit_tx_hash);

        Ok(DepositReceipt {
            vault,
            amount,
            approve_tx_hash,
            deposit_tx_hash,
        })
    }

    /// Whether the chain RPC of every available vault answers.
    pub async fn chain_reachable(&self) -> bool {
        let checks = self
            .vaults
            .iter()
            .filter(|v| v.is_available())
            .map(|v| async move {
                match self.chain.block_number(v.key).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("RPC health check for {} failed: {}", v.key, e);
                        false
                    }
                }
            });
        join_all(checks).await.into_iter().all(|ok| ok)
    }
}
