//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::VaultKey;
use crate::services::{RedemptionSnapshot, SessionInfo};
use crate::store::RedemptionRequest;

/// Standard API response wrapper.
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "RECONCILIATION_REQUIRED",
///         "message": "Redemption executed on-chain (0xdead...beef) but the record was not updated: ...",
///         "txHash": "0xdead...beef"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
                tx_hash: None,
            }),
        }
    }

    /// Error for an action that may already have moved funds.
    pub fn reconciliation_error(code: &str, message: &str, tx_hash: &str) -> Self {
        let mut response = Self::error(code, message);
        if let Some(error) = response.error.as_mut() {
            error.tx_hash = Some(tx_hash.to_string());
        }
        response
    }
}

/// API error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// `VALIDATION_ERROR`, `NOT_READY`, `REMOTE_ERROR`, `CHAIN_ERROR`,
    /// `RECONCILIATION_REQUIRED`.
    pub code: String,
    pub message: String,
    /// Transaction to reconcile (`RECONCILIATION_REQUIRED` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// Response of `POST /session`.
///
/// ```json
/// {
///     "session": { "sessionId": "550e8400-...", "wallet": "0xabc...", "newlyOpened": true, ... },
///     "redemptions": { "wallet": "0xabc...", "cooldownSeconds": 120, "vaults": [ ... ] }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session: SessionInfo,
    pub redemptions: RedemptionSnapshot,
}

/// Result of a redemption action.
///
/// `request` is the affected request (absent for a cancel with nothing
/// pending); `txHash` is set by execute and reconcile.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionActionResponse {
    pub vault: VaultKey,
    pub request: Option<RedemptionRequest>,
    pub tx_hash: Option<String>,
    pub message: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// "healthy" or "degraded".
    pub status: String,
    pub record_store: bool,
    pub chain_rpc: bool,
    pub active_sessions: usize,
    pub ws_connections: usize,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}
