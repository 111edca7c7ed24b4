//! # API Request Handlers
//!
//! Each handler:
//! 1. Normalizes the wallet address
//! 2. Calls the appropriate service
//! 3. Pushes the outcome to the wallet's WebSocket connections
//! 4. Returns a formatted response
//!
//! ## Error Codes
//!
//! | Code | HTTP | Meaning |
//! |------|------|---------|
//! | `VALIDATION_ERROR` | 400 | Precondition failed; nothing was sent |
//! | `NOT_READY` | 409 | Cooldown not elapsed |
//! | `REMOTE_ERROR` | 502 | Record store refused or unreachable |
//! | `CHAIN_ERROR` | 502 | Transaction failed or was rejected |
//! | `RECONCILIATION_REQUIRED` | 500 | Funds may have moved; carries `txHash` |

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::VaultKey;
use crate::models::{
    ApiResponse, DepositRequest, HealthResponse, OpenSessionRequest, RedemptionActionRequest,
    RedemptionActionResponse, RequestRedemptionRequest, SessionResponse,
};
use crate::services::{PortfolioError, RedemptionError};
use crate::store::RedemptionRequest;
use crate::utils::{format_timestamp, normalize_address};
use crate::websocket::{NotificationData, NotificationLevel, WsEventType};
use crate::AppState;

/// API information endpoint (root).
///
/// ## Endpoint
///
/// `GET /`
pub async fn api_info() -> HttpResponse {
    let info = json!({
        "name": "Yield Vault Dashboard API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Vault metrics, positions, deposits and share redemptions",
        "endpoints": {
            "health": { "method": "GET", "path": "/health" },
            "vaults": { "method": "GET", "path": "/vaults" },
            "portfolio": {
                "position": { "method": "GET", "path": "/portfolio/{wallet}" },
                "deposit": { "method": "POST", "path": "/portfolio/deposit" }
            },
            "session": {
                "open": { "method": "POST", "path": "/session" },
                "close": { "method": "DELETE", "path": "/session/{wallet}" }
            },
            "redemptions": {
                "list": { "method": "GET", "path": "/redemptions/{wallet}" },
                "request": { "method": "POST", "path": "/redemptions/request" },
                "cancel": { "method": "POST", "path": "/redemptions/cancel" },
                "execute": { "method": "POST", "path": "/redemptions/execute" },
                "reconcile": { "method": "POST", "path": "/redemptions/reconcile" }
            },
            "websocket": { "path": "/ws/{wallet}" }
        }
    });

    HttpResponse::Ok().json(ApiResponse::success(info))
}

/// Health check endpoint.
///
/// ## Endpoint
///
/// `GET /health`
///
/// ## Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "status": "healthy",
///         "recordStore": true,
///         "chainRpc": true,
///         "activeSessions": 3,
///         "wsConnections": 4,
///         "version": "0.1.0",
///         "timestamp": "2025-01-15T12:00:00Z"
///     }
/// }
/// ```
pub async fn health_check(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let (record_store, chain_rpc) =
        futures::join!(state.record_store.ping(), state.portfolio.chain_reachable());
    let healthy = record_store && chain_rpc;

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        record_store,
        chain_rpc,
        active_sessions: state.sessions.active_sessions().await,
        ws_connections: state.ws_registry.total_connections().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    HttpResponse::build(status).json(ApiResponse::success(response))
}

/// Vault overview cards.
///
/// ## Endpoint
///
/// `GET /vaults`
pub async fn get_vaults(state: web::Data<Arc<AppState>>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.portfolio.vault_overview().await))
}

/// Wallet position across vaults.
///
/// ## Endpoint
///
/// `GET /portfolio/:wallet`
pub async fn get_portfolio(state: web::Data<Arc<AppState>>, path: web::Path<String>) -> HttpResponse {
    let wallet = match parse_wallet(&path) {
        Ok(wallet) => wallet,
        Err(response) => return response,
    };
    HttpResponse::Ok().json(ApiResponse::success(state.portfolio.position(&wallet).await))
}

/// Deposit USDC into a vault.
///
/// Approves the vault's comptroller for the amount, then buys shares.
/// Both transactions are sent from the wallet and awaited.
///
/// ## Endpoint
///
/// `POST /portfolio/deposit`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/portfolio/deposit \
///   -H "Content-Type: application/json" \
///   -d '{ "walletAddress": "0x5aAe...BeAed", "vault": "arb", "amount": 250 }'
/// ```
pub async fn deposit(state: web::Data<Arc<AppState>>, body: web::Json<DepositRequest>) -> HttpResponse {
    let request = body.into_inner();
    let wallet = match parse_wallet(&request.wallet_address) {
        Ok(wallet) => wallet,
        Err(response) => return response,
    };
    info!("Deposit request: {} USDC into {} for {}", request.amount, request.vault, wallet);

    match state.portfolio.deposit(&wallet, request.vault, request.amount).await {
        Ok(receipt) => {
            notify(
                &state,
                &wallet,
                NotificationData {
                    level: NotificationLevel::Success,
                    action: "deposit".to_string(),
                    vault: Some(request.vault),
                    message: format!("Deposited {} USDC", request.amount),
                    code: None,
                    tx_hash: Some(receipt.deposit_tx_hash.clone()),
                },
            )
            .await;
            HttpResponse::Ok().json(ApiResponse::success(receipt))
        }
        Err(e) => portfolio_failure(&state, &wallet, "deposit", Some(request.vault), e).await,
    }
}

/// Open a dashboard session.
///
/// Loads the wallet's pending redemptions and starts its polling and
/// countdown task. Idempotent.
///
/// ## Endpoint
///
/// `POST /session`
pub async fn open_session(
    state: web::Data<Arc<AppState>>,
    body: web::Json<OpenSessionRequest>,
) -> HttpResponse {
    let wallet = match parse_wallet(&body.wallet_address) {
        Ok(wallet) => wallet,
        Err(response) => return response,
    };

    let session = state.sessions.open(&wallet).await;
    let redemptions = state.redemptions.snapshot(&wallet);
    HttpResponse::Ok().json(ApiResponse::success(SessionResponse { session, redemptions }))
}

/// Close a dashboard session and stop its task.
///
/// ## Endpoint
///
/// `DELETE /session/:wallet`
pub async fn close_session(state: web::Data<Arc<AppState>>, path: web::Path<String>) -> HttpResponse {
    let wallet = match parse_wallet(&path) {
        Ok(wallet) => wallet,
        Err(response) => return response,
    };

    let closed = state.sessions.close(&wallet).await;
    HttpResponse::Ok().json(ApiResponse::success(json!({ "wallet": wallet, "closed": closed })))
}

/// Cached redemptions with countdowns.
///
/// ## Endpoint
///
/// `GET /redemptions/:wallet`
///
/// ## Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "wallet": "0xabc...",
///         "cooldownSeconds": 120,
///         "refreshedAt": "2025-01-15T12:00:00Z",
///         "vaults": [
///             { "vault": "arb", "request": { ... }, "remainingMs": 61000, "countdown": "1m 1s", "ready": false, "reconciliation": null },
///             { "vault": "base", "request": null, "remainingMs": null, "countdown": null, "ready": false, "reconciliation": null }
///         ]
///     }
/// }
/// ```
pub async fn get_redemptions(state: web::Data<Arc<AppState>>, path: web::Path<String>) -> HttpResponse {
    let wallet = match parse_wallet(&path) {
        Ok(wallet) => wallet,
        Err(response) => return response,
    };
    HttpResponse::Ok().json(ApiResponse::success(state.redemptions.snapshot(&wallet)))
}

/// Request a redemption.
///
/// The current share balance and price are read first; the request is
/// refused before reaching the record store when it cannot succeed.
///
/// ## Endpoint
///
/// `POST /redemptions/request`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/redemptions/request \
///   -H "Content-Type: application/json" \
///   -d '{ "walletAddress": "0x5aAe...BeAed", "vault": "arb", "sharesAmount": 10.5 }'
/// ```
pub async fn request_redemption(
    state: web::Data<Arc<AppState>>,
    body: web::Json<RequestRedemptionRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    let wallet = match parse_wallet(&request.wallet_address) {
        Ok(wallet) => wallet,
        Err(response) => return response,
    };
    let vault = request.vault;

    let order = match state
        .portfolio
        .quote_redemption(&wallet, vault, request.shares_amount)
        .await
    {
        Ok(order) => order,
        Err(e) => return portfolio_failure(&state, &wallet, "request", Some(vault), e).await,
    };

    match state.redemptions.request_redemption(&wallet, order).await {
        Ok(created) => {
            let message = format!(
                "Redemption of {} shares requested; unlocks at {}",
                created.shares_amount,
                format_timestamp(created.unlock_at)
            );
            redemption_success(&state, &wallet, "request", vault, Some(created), None, message).await
        }
        Err(e) => redemption_failure(&state, &wallet, "request", vault, e).await,
    }
}

/// Cancel a pending redemption.
///
/// Succeeds without effect when nothing is pending.
///
/// ## Endpoint
///
/// `POST /redemptions/cancel`
pub async fn cancel_redemption(
    state: web::Data<Arc<AppState>>,
    body: web::Json<RedemptionActionRequest>,
) -> HttpResponse {
    let wallet = match parse_wallet(&body.wallet_address) {
        Ok(wallet) => wallet,
        Err(response) => return response,
    };
    let vault = body.vault;

    match state.redemptions.cancel_redemption(&wallet, vault).await {
        Ok(Some(cancelled)) => {
            redemption_success(&state, &wallet, "cancel", vault, Some(cancelled), None, "Redemption cancelled".to_string()).await
        }
        Ok(None) => HttpResponse::Ok().json(ApiResponse::success(RedemptionActionResponse {
            vault,
            request: None,
            tx_hash: None,
            message: "No pending redemption".to_string(),
        })),
        Err(e) => redemption_failure(&state, &wallet, "cancel", vault, e).await,
    }
}

/// Execute an unlocked redemption.
///
/// ## Endpoint
///
/// `POST /redemptions/execute`
///
/// ## Errors
///
/// - `NOT_READY` - cooldown not elapsed
/// - `CHAIN_ERROR` - transaction failed; the request is still pending
/// - `RECONCILIATION_REQUIRED` - funds may have moved; do not retry,
///   use `/redemptions/reconcile`
pub async fn execute_redemption(
    state: web::Data<Arc<AppState>>,
    body: web::Json<RedemptionActionRequest>,
) -> HttpResponse {
    let wallet = match parse_wallet(&body.wallet_address) {
        Ok(wallet) => wallet,
        Err(response) => return response,
    };
    let vault = body.vault;

    match state.redemptions.execute_redemption(&wallet, vault).await {
        Ok(tx_hash) => {
            let message = format!("Redemption executed: {}", tx_hash);
            redemption_success(&state, &wallet, "execute", vault, None, Some(tx_hash), message).await
        }
        Err(e) => redemption_failure(&state, &wallet, "execute", vault, e).await,
    }
}

/// Settle a redemption left out of sync by an earlier execution.
///
/// An unconfirmed transaction is looked up on-chain before the record
/// is completed; a reverted or dropped one reopens the request.
///
/// ## Endpoint
///
/// `POST /redemptions/reconcile`
pub async fn reconcile_redemption(
    state: web::Data<Arc<AppState>>,
    body: web::Json<RedemptionActionRequest>,
) -> HttpResponse {
    let wallet = match parse_wallet(&body.wallet_address) {
        Ok(wallet) => wallet,
        Err(response) => return response,
    };
    let vault = body.vault;

    match state.redemptions.reconcile_redemption(&wallet, vault).await {
        Ok(Some(tx_hash)) => {
            let message = format!("Redemption {} recorded as completed", tx_hash);
            redemption_success(&state, &wallet, "reconcile", vault, None, Some(tx_hash), message).await
        }
        Ok(None) => HttpResponse::Ok().json(ApiResponse::success(RedemptionActionResponse {
            vault,
            request: None,
            tx_hash: None,
            message: "Nothing to reconcile".to_string(),
        })),
        Err(e) => redemption_failure(&state, &wallet, "reconcile", vault, e).await,
    }
}

// ==========================================
// HELPERS
// ==========================================

fn parse_wallet(raw: &str) -> Result<String, HttpResponse> {
    normalize_address(raw).map_err(|message| {
        HttpResponse::BadRequest().json(ApiResponse::<()>::error("VALIDATION_ERROR", &message))
    })
}

/// HTTP status of a redemption error.
pub fn redemption_status(error: &RedemptionError) -> StatusCode {
    match error {
        RedemptionError::Validation(_) => StatusCode::BAD_REQUEST,
        RedemptionError::NotReady { .. } => StatusCode::CONFLICT,
        RedemptionError::Remote(_) | RedemptionError::Chain(_) => StatusCode::BAD_GATEWAY,
        RedemptionError::PartialSuccess { .. } | RedemptionError::Unconfirmed { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// HTTP status of a portfolio error.
pub fn portfolio_status(error: &PortfolioError) -> StatusCode {
    match error {
        PortfolioError::Validation(_) => StatusCode::BAD_REQUEST,
        PortfolioError::Chain(_) => StatusCode::BAD_GATEWAY,
    }
}

async fn notify(state: &AppState, wallet: &str, notification: NotificationData) {
    state.ws_registry.notify(wallet, notification).await;
}

/// Push the fresh snapshot and a success notification, then respond.
async fn redemption_success(
    state: &AppState,
    wallet: &str,
    action: &str,
    vault: VaultKey,
    request: Option<RedemptionRequest>,
    tx_hash: Option<String>,
    message: String,
) -> HttpResponse {
    info!("{} on {} for {}: {}", action, vault, wallet, message);

    if let Err(e) = state
        .ws_registry
        .send_to_wallet(wallet, WsEventType::RedemptionUpdate, state.redemptions.snapshot(wallet))
        .await
    {
        warn!("Failed to push redemption update to {}: {}", wallet, e);
    }
    notify(
        state,
        wallet,
        NotificationData {
            level: NotificationLevel::Success,
            action: action.to_string(),
            vault: Some(vault),
            message: message.clone(),
            code: None,
            tx_hash: tx_hash.clone(),
        },
    )
    .await;

    HttpResponse::Ok().json(ApiResponse::success(RedemptionActionResponse {
        vault,
        request,
        tx_hash,
        message,
    }))
}

async fn redemption_failure(
    state: &AppState,
    wallet: &str,
    action: &str,
    vault: VaultKey,
    e: RedemptionError,
) -> HttpResponse {
    let code = e.code();
    let tx_hash = e.reconciliation_tx().map(str::to_string);
    let message = match &tx_hash {
        Some(_) => format!("{}. Funds may have moved; do not retry, reconcile instead.", e),
        None => e.to_string(),
    };

    match &e {
        RedemptionError::PartialSuccess { .. } | RedemptionError::Unconfirmed { .. } => {
            error!("{} on {} for {} needs reconciliation: {}", action, vault, wallet, e)
        }
        _ => warn!("{} on {} for {} failed: {}", action, vault, wallet, e),
    }

    notify(
        state,
        wallet,
        NotificationData {
            level: NotificationLevel::Error,
            action: action.to_string(),
            vault: Some(vault),
            message: message.clone(),
            code: Some(code.to_string()),
            tx_hash: tx_hash.clone(),
        },
    )
    .await;

    let body = match &tx_hash {
        Some(tx_hash) => ApiResponse::<()>::reconciliation_error(code, &message, tx_hash),
        None => ApiResponse::<()>::error(code, &message),
    };
    HttpResponse::build(redemption_status(&e)).json(body)
}

async fn portfolio_failure(
    state: &AppState,
    wallet: &str,
    action: &str,
    vault: Option<VaultKey>,
    e: PortfolioError,
) -> HttpResponse {
    warn!("{} for {} failed: {}", action, wallet, e);
    let message = e.to_string();

    notify(
        state,
        wallet,
        NotificationData {
            level: NotificationLevel::Error,
            action: action.to_string(),
            vault,
            message: message.clone(),
            code: Some(e.code().to_string()),
            tx_hash: None,
        },
    )
    .await;

    HttpResponse::build(portfolio_status(&e)).json(ApiResponse::<()>::error(e.code(), &message))
}
