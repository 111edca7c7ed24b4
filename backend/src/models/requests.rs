//! # API Request Models
//!
//! Structures for incoming API request bodies.
//! Amounts are decimal numbers (or numeric strings) in whole units.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::VaultKey;

/// Request to open a dashboard session.
///
/// ## Example JSON
///
/// ```json
/// { "walletAddress": "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    pub wallet_address: String,
}

/// Request to start a redemption.
///
/// ## Example JSON
///
/// ```json
/// {
///     "walletAddress": "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
///     "vault": "arb",
///     "sharesAmount": 10.5
/// }
/// ```
///
/// ## Notes
///
/// - `sharesAmount` is in whole shares (18 decimals on-chain)
/// - The estimated USDC value is computed server-side from the
///   current share price
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRedemptionRequest {
    pub wallet_address: String,
    pub vault: VaultKey,
    pub shares_amount: Decimal,
}

/// Body of cancel, execute and reconcile.
///
/// ## Example JSON
///
/// ```json
/// { "walletAddress": "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", "vault": "base" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionActionRequest {
    pub wallet_address: String,
    pub vault: VaultKey,
}

/// Request to deposit USDC into a vault.
///
/// ## Example JSON
///
/// ```json
/// {
///     "walletAddress": "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
///     "vault": "arb",
///     "amount": 250.5
/// }
/// ```
///
/// `amount` is in USDC (6 decimals on-chain); finer fractions are truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub wallet_address: String,
    pub vault: VaultKey,
    pub amount: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_request_redemption_body() {
        let body: RequestRedemptionRequest = serde_json::from_str(
            r#"{"walletAddress": "0xabc", "vault": "arb", "sharesAmount": 10.5}"#,
        )
        .unwrap();
        assert_eq!(body.vault, VaultKey::Arb);
        assert_eq!(body.shares_amount, Decimal::from_str("10.5").unwrap());
    }

    #[test]
    fn test_amount_as_string() {
        let body: DepositRequest = serde_json::from_str(
            r#"{"walletAddress": "0xabc", "vault": "base", "amount": "250.50"}"#,
        )
        .unwrap();
        assert_eq!(body.amount, Decimal::from_str("250.5").unwrap());
    }

    #[test]
    fn test_unknown_vault_rejected() {
        let result: Result<RedemptionActionRequest, _> =
            serde_json::from_str(r#"{"walletAddress": "0xabc", "vault": "optimism"}"#);
        assert!(result.is_err());
    }
}
