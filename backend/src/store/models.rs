//! # Redemption Record Models
//!
//! Data structures exchanged with the redemption record store, and the
//! typed [`RedemptionRequest`] the rest of the service works with.
//!
//! ## Wire Format
//!
//! The store speaks snake_case JSON. Amounts are JSON numbers and
//! `unlock_at` is an ISO-8601 timestamp:
//!
//! ```json
//! {
//!     "id": "6f1c...",
//!     "vault": "arb",
//!     "shares_amount": 10.5,
//!     "estimated_usdc_value": 11.2875,
//!     "unlock_at": "2025-01-15T12:02:00Z",
//!     "status": "pending"
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::VaultKey;

/// Upper bound applied to a locally derived cooldown (ten years).
const MAX_COOLDOWN_SECS: i64 = 10 * 365 * 24 * 3600;

/// Status of a redemption request.
///
/// `Completed` and `Cancelled` are terminal: a request never goes back
/// to `Pending` once it reached one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedemptionStatus {
    /// Waiting out the cooldown, or unlocked and waiting for execution.
    Pending,
    /// Redeemed on-chain.
    Completed,
    /// Withdrawn by the user before execution.
    Cancelled,
}

impl RedemptionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RedemptionStatus::Pending)
    }

    /// Whether moving from `self` to `next` respects monotonicity.
    pub fn can_transition_to(&self, next: RedemptionStatus) -> bool {
        match (self, next) {
            (RedemptionStatus::Pending, _) => true,
            (current, next) => *current == next,
        }
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::Completed => "completed",
            RedemptionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A redemption request as returned by the record store.
#[derive(Debug, Clone, Deserialize)]
pub struct RedemptionRecord {
    /// Store-assigned identifier. Some deployments use numeric ids;
    /// they are kept as their string form.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,

    #[serde(default)]
    pub wallet_address: Option<String>,

    /// Raw vault key. Unknown keys are skipped by the caller.
    pub vault: String,

    pub shares_amount: Decimal,

    #[serde(default)]
    pub estimated_usdc_value: Option<Decimal>,

    #[serde(default)]
    pub unlock_at: Option<DateTime<Utc>>,

    pub status: RedemptionStatus,

    #[serde(default)]
    pub tx_hash: Option<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RedemptionRecord {
    /// Convert a wire record into a typed request.
    ///
    /// `cooldown_secs` is only used when the store left out `unlock_at`.
    pub fn into_request(
        self,
        wallet: &str,
        cooldown_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<RedemptionRequest, String> {
        let vault: VaultKey = self.vault.parse()?;
        let cooldown = Duration::seconds(
            i64::try_from(cooldown_secs)
                .unwrap_or(MAX_COOLDOWN_SECS)
                .min(MAX_COOLDOWN_SECS),
        );
        let base = self.created_at.unwrap_or(now);
        let unlock_at = self.unlock_at.unwrap_or_else(|| {
            base.checked_add_signed(cooldown)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });

        Ok(RedemptionRequest {
            id: self.id,
            wallet_address: self
                .wallet_address
                .map(|w| w.to_lowercase())
                .unwrap_or_else(|| wallet.to_string()),
            vault,
            shares_amount: self.shares_amount,
            estimated_usdc_value: self.estimated_usdc_value,
            status: self.status,
            unlock_at,
            tx_hash: self.tx_hash,
            created_at: self.created_at,
        })
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("invalid redemption id: {}", other))),
    }
}

/// A redemption request held in the manager's cache.
///
/// The record store owns the authoritative copy; this is a read
/// replica used for display and for gating execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRequest {
    pub id: String,

    /// Requesting wallet (lowercase hex).
    pub wallet_address: String,

    pub vault: VaultKey,

    /// Shares to redeem (decimal, 18 decimals on-chain).
    #[serde(with = "rust_decimal::serde::float")]
    pub shares_amount: Decimal,

    /// `shares_amount * share_price` at request time. Advisory only.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub estimated_usdc_value: Option<Decimal>,

    pub status: RedemptionStatus,

    /// Execution is allowed from this instant on.
    pub unlock_at: DateTime<Utc>,

    pub tx_hash: Option<String>,

    pub created_at: Option<DateTime<Utc>>,
}

impl RedemptionRequest {
    /// Milliseconds left until unlock, clamped at zero.
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        (self.unlock_at - now).num_milliseconds().max(0)
    }

    /// Pending and past its unlock time.
    pub fn is_unlocked(&self, now: DateTime<Utc>) -> bool {
        self.status == RedemptionStatus::Pending && now >= self.unlock_at
    }
}

/// Everything `?action=pending` reports for a wallet.
#[derive(Debug, Clone, Default)]
pub struct PendingSnapshot {
    pub records: Vec<RedemptionRecord>,
    pub cooldown_seconds: Option<u64>,
}

/// Body of `POST ?action=create`.
#[derive(Debug, Clone, Serialize)]
pub struct NewRedemption {
    pub wallet_address: String,
    pub vault: VaultKey,
    #[serde(serialize_with = "rust_decimal::serde::float::serialize")]
    pub shares_amount: Decimal,
    #[serde(serialize_with = "rust_decimal::serde::float::serialize")]
    pub estimated_usdc_value: Decimal,
}

/// Body of `PATCH ?action=update`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub id: String,
    pub status: RedemptionStatus,
    pub tx_hash: Option<String>,
}

// Envelopes. A non-null `error` is checked before these are decoded.

#[derive(Debug, Deserialize)]
pub(crate) struct PendingEnvelope {
    #[serde(default)]
    pub pending: Option<Vec<RedemptionRecord>>,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RequestEnvelope {
    pub request: RedemptionRecord,
}
