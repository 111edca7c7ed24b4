//! # Redemption Record Store
//!
//! Client for the external redemption record store, the authoritative
//! persistence layer for redemption requests.
//!
//! ## Endpoints
//!
//! | Action | Method | Body | Returns |
//! |--------|--------|------|---------|
//! | `?action=pending&wallet=<address>` | GET | - | `{ pending, cooldown_seconds? }` |
//! | `?action=create` | POST | `{ wallet_address, vault, shares_amount, estimated_usdc_value }` | `{ request }` |
//! | `?action=update` | PATCH | `{ id, status, tx_hash? }` | `{ request }` |
//!
//! ## Error Handling
//!
//! Any response carrying a non-null `error` field is a failed call,
//! whatever its HTTP status. A non-2xx status without a JSON body is
//! a failed call as well.

pub mod models;

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AppConfig;

pub use models::{
    NewRedemption, PendingSnapshot, RedemptionRecord, RedemptionRequest, RedemptionStatus,
    StatusUpdate,
};
use models::{PendingEnvelope, RequestEnvelope};

/// Errors returned by the record store client.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transport failure (connection refused, timeout, TLS, ...).
    #[error("Record store unreachable: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with an `error` field or a failure status.
    #[error("Record store rejected the call: {0}")]
    Rejected(String),

    /// The store answered with something we cannot decode.
    #[error("Unexpected record store response: {0}")]
    InvalidResponse(String),
}

/// Operations the redemption lifecycle needs from the record store.
///
/// Implemented over HTTP by [`HttpRecordStore`]; tests use in-memory
/// fakes.
pub trait RecordStore: Send + Sync + 'static {
    /// All non-terminal requests of `wallet`, plus the store's cooldown.
    fn pending(&self, wallet: &str)
        -> impl Future<Output = Result<PendingSnapshot, StoreError>> + Send;

    /// Create a new pending request.
    fn create(&self, draft: &NewRedemption)
        -> impl Future<Output = Result<RedemptionRecord, StoreError>> + Send;

    /// Move a request to a new status.
    fn update_status(&self, update: &StatusUpdate)
        -> impl Future<Output = Result<RedemptionRecord, StoreError>> + Send;
}

/// HTTP client for the record store.
#[derive(Clone)]
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecordStore {
    /// Build a client from configuration.
    ///
    /// Every request carries the configured HTTP timeout; the lifecycle
    /// manager adds no timeout of its own.
    pub fn new(config: &AppConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, &config.redemption_api_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }

    /// Check that the store answers at all.
    ///
    /// Used by the health endpoint. Queries the pending list of the
    /// zero address, which is always empty.
    pub async fn ping(&self) -> bool {
        match self
            .pending("0x0000000000000000000000000000000000000000")
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Record store health check failed: {}", e);
                false
            }
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, StoreError> {
        let status = response.status();
        let body = response.text().await?;
        let value = check_envelope(status, &body)?;
        serde_json::from_value(value).map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }
}

impl RecordStore for HttpRecordStore {
    async fn pending(&self, wallet: &str) -> Result<PendingSnapshot, StoreError> {
        debug!("Fetching pending redemptions for {}", wallet);

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("action", "pending"), ("wallet", wallet)])
            .send()
            .await?;

        let envelope: PendingEnvelope = Self::decode(response).await?;
        Ok(PendingSnapshot {
            records: envelope.pending.unwrap_or_default(),
            cooldown_seconds: envelope.cooldown_seconds,
        })
    }

    async fn create(&self, draft: &NewRedemption) -> Result<RedemptionRecord, StoreError> {
        debug!(
            "Creating redemption request: {} shares on {} for {}",
            draft.shares_amount, draft.vault, draft.wallet_address
        );

        let response = self
            .client
            .post(&self.base_url)
            .query(&[("action", "create")])
            .json(draft)
            .send()
            .await?;

        let envelope: RequestEnvelope = Self::decode(response).await?;
        Ok(envelope.request)
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<RedemptionRecord, StoreError> {
        debug!("Updating redemption {} to {}", update.id, update.status);

        let response = self
            .client
            .patch(&self.base_url)
            .query(&[("action", "update")])
            .json(update)
            .send()
            .await?;

        let envelope: RequestEnvelope = Self::decode(response).await?;
        Ok(envelope.request)
    }
}

/// Validate a raw store response and return its JSON body.
///
/// The `error` field wins over the HTTP status: a 200 with an error is
/// a failure, and so is a 500 without a decodable body.
fn check_envelope(status: reqwest::StatusCode, body: &str) -> Result<Value, StoreError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            return Err(if status.is_success() {
                StoreError::InvalidResponse(e.to_string())
            } else {
                StoreError::Rejected(format!("HTTP {}", status))
            });
        }
    };

    match value.get("error") {
        None | Some(Value::Null) => {}
        Some(Value::String(message)) => return Err(StoreError::Rejected(message.clone())),
        Some(other) => return Err(StoreError::Rejected(other.to_string())),
    }

    if !status.is_success() {
        return Err(StoreError::Rejected(format!("HTTP {}", status)));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_error_field_wins_over_status() {
        let err = check_envelope(StatusCode::OK, r#"{"error": "already pending"}"#).unwrap_err();
        assert!(matches!(err, StoreError::Rejected(ref m) if m == "already pending"));
    }

    #[test]
    fn test_null_error_is_success() {
        let value = check_envelope(StatusCode::OK, r#"{"pending": [], "error": null}"#).unwrap();
        assert!(value["pending"].is_array());
    }

    #[test]
    fn test_failure_status_without_error_field() {
        let err = check_envelope(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        let err = check_envelope(StatusCode::INTERNAL_SERVER_ERROR, "{}").unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[test]
    fn test_garbage_success_body() {
        let err = check_envelope(StatusCode::OK, "not json").unwrap_err();
        assert!(matches!(err, StoreError::InvalidResponse(_)));
    }

    #[test]
    fn test_pending_envelope_decoding() {
        let value = check_envelope(
            StatusCode::OK,
            r#"{
                "pending": [
                    { "id": "r1", "vault": "arb", "shares_amount": 2, "status": "pending",
                      "unlock_at": "2025-01-15T12:02:00Z" }
                ],
                "cooldown_seconds": 120
            }"#,
        )
        .unwrap();
        let envelope: PendingEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(envelope.pending.map(|p| p.len()), Some(1));
        assert_eq!(envelope.cooldown_seconds, Some(120));
    }

    #[test]
    fn test_null_pending_list() {
        let envelope: PendingEnvelope =
            serde_json::from_str(r#"{"pending": null}"#).unwrap();
        assert!(envelope.pending.unwrap_or_default().is_empty());
        assert_eq!(envelope.cooldown_seconds, None);
    }
}
