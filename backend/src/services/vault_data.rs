//! Client for the vault data service (share price, returns, AUM).

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum VaultDataError {
    #[error("Vault data service unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Vault data service error: {0}")]
    Rejected(String),
}

/// Latest metrics of one vault. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultMetrics {
    #[serde(default)]
    pub share_price: Option<Decimal>,
    #[serde(default)]
    pub monthly_return: Option<Decimal>,
    #[serde(default)]
    pub aum: Option<Decimal>,
}

impl VaultMetrics {
    /// Annualized return: twelve times the monthly return.
    pub fn apy(&self) -> Option<Decimal> {
        self.monthly_return
            .and_then(|m| m.checked_mul(Decimal::from(12)))
    }

    /// Share price in USDC, 1 when unknown or not positive.
    pub fn effective_share_price(&self) -> Decimal {
        self.share_price
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(Decimal::ONE)
    }
}

#[derive(Clone)]
pub struct VaultDataClient {
    client: reqwest::Client,
    base_url: String,
}

impl VaultDataClient {
    pub fn new(config: &AppConfig) -> Result<Self, VaultDataError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.vault_data_api_url.clone(),
        })
    }

    /// Fetch the metrics of the vault on `network` (`arbitrum`, `base`).
    pub async fn fetch(&self, network: &str) -> Result<VaultMetrics, VaultDataError> {
        debug!("Fetching vault metrics for {}", network);

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("action", "get"), ("network", network)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        parse_metrics(status, &body)
    }
}

fn parse_metrics(status: reqwest::StatusCode, body: &str) -> Result<VaultMetrics, VaultDataError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|_| VaultDataError::Rejected(format!("HTTP {}: not JSON", status)))?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return Err(VaultDataError::Rejected(
            error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()),
        ));
    }
    if !status.is_success() {
        return Err(VaultDataError::Rejected(format!("HTTP {}", status)));
    }

    serde_json::from_value(value).map_err(|e| VaultDataError::Rejected(e.to_string()))
}
