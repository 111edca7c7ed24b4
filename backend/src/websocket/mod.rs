//! # WebSocket Module
//!
//! Pushes live dashboard updates to the browser of each connected wallet.
//!
//! ## Events
//!
//! - `countdown_tick` - remaining cooldown per pending vault, every tick
//! - `redemption_update` - the wallet's redemption snapshot after a poll
//! - `notification` - outcome of a user action (success or failure)
//!
//! ## Connection Flow
//!
//! ```text
//! 1. Client connects to /ws/:wallet
//!              ↓
//! 2. Server registers the connection under the lowercase wallet
//!              ↓
//! 3. Pollers and API handlers push events as they occur
//!              ↓
//! 4. Disconnect drops the connection's channel
//! ```
//!
//! ## Message Format
//!
//! ```json
//! {
//!     "event": "countdown_tick",
//!     "data": {
//!         "wallet": "0xabc...",
//!         "vaults": [{ "vault": "arb", "remainingMs": 61000, "countdown": "1m 1s", "ready": false }]
//!     },
//!     "timestamp": "2025-01-15T12:00:59Z"
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::VaultKey;
use crate::services::RedemptionSnapshot;
use crate::AppState;

/// Per-connection buffer. Slow clients lose the oldest events.
const CHANNEL_CAPACITY: usize = 100;

/// WebSocket event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsEventType {
    /// Connection established.
    Connected,
    /// Cooldown countdown for pending redemptions.
    CountdownTick,
    /// Redemption state after a refresh.
    RedemptionUpdate,
    /// Result of a user action.
    Notification,
    /// Keepalive echo.
    Ping,
    /// Error message.
    Error,
}

/// WebSocket message wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage<T> {
    pub event: WsEventType,
    pub data: T,
    pub timestamp: chrono::DateTime<Utc>,
}

impl<T: Serialize> WsMessage<T> {
    pub fn new(event: WsEventType, data: T) -> Self {
        Self {
            event,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One vault in a countdown tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultCountdown {
    pub vault: VaultKey,
    pub remaining_ms: i64,
    pub countdown: String,
    pub ready: bool,
}

/// Countdown tick event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountdownTickData {
    pub wallet: String,
    pub vaults: Vec<VaultCountdown>,
}

impl CountdownTickData {
    /// Countdowns of the snapshot's pending vaults; `None` when nothing is pending.
    pub fn from_snapshot(snapshot: &RedemptionSnapshot) -> Option<Self> {
        let vaults: Vec<VaultCountdown> = snapshot
            .vaults
            .iter()
            .filter_map(|v| {
                Some(VaultCountdown {
                    vault: v.vault,
                    remaining_ms: v.remaining_ms?,
                    countdown: v.countdown.clone()?,
                    ready: v.ready,
                })
            })
            .collect();

        if vaults.is_empty() {
            None
        } else {
            Some(Self {
                wallet: snapshot.wallet.clone(),
                vaults,
            })
        }
    }
}

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Success,
    Error,
}

/// Notification event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub level: NotificationLevel,
    /// `request`, `cancel`, `execute`, `reconcile`, `deposit`.
    pub action: String,
    pub vault: Option<VaultKey>,
    pub message: String,
    /// API error code for failures.
    pub code: Option<String>,
    pub tx_hash: Option<String>,
}

/// WebSocket connection registry.
///
/// Tracks the open connections of each wallet. A wallet may have several
/// (tabs, devices); every one of them gets every event.
#[derive(Clone, Default)]
pub struct WsRegistry {
    /// Lowercase wallet -> one sender per connection
    sessions: Arc<Mutex<HashMap<String, Vec<broadcast::Sender<String>>>>>,
}

impl WsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its event receiver.
    pub async fn register(&self, wallet: &str) -> broadcast::Receiver<String> {
        let wallet = wallet.to_lowercase();
        let mut sessions = self.sessions.lock().await;
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);

        let senders = sessions.entry(wallet.clone()).or_default();
        senders.push(tx);

        info!(
            "Registered WebSocket for {} (connections: {})",
            wallet,
            senders.len()
        );
        rx
    }

    /// Drop the senders of closed connections.
    pub async fn unregister(&self, wallet: &str) {
        let wallet = wallet.to_lowercase();
        let mut sessions = self.sessions.lock().await;
        if let Some(senders) = sessions.get_mut(&wallet) {
            senders.retain(|tx| tx.receiver_count() > 0);

            if senders.is_empty() {
                sessions.remove(&wallet);
                info!("Unregistered all WebSocket connections for {}", wallet);
            } else {
                debug!("WebSocket connection closed for {} (remaining: {})", wallet, senders.len());
            }
        }
    }

    /// Send an event to every connection of a wallet.
    ///
    /// ## Arguments
    ///
    /// * `wallet` - Wallet address (any case)
    /// * `event` - Event type
    /// * `data` - Event data
    ///
    /// ## Returns
    ///
    /// * `Ok(n)` - Number of connections reached (0 when not connected)
    /// * `Err(String)` - The message could not be serialized
    pub async fn send_to_wallet<T: Serialize>(
        &self,
        wallet: &str,
        event: WsEventType,
        data: T,
    ) -> Result<usize, String> {
        let json = WsMessage::new(event, data)
            .to_json()
            .map_err(|e| format!("Failed to serialize message: {}", e))?;

        let wallet = wallet.to_lowercase();
        let mut sessions = self.sessions.lock().await;

        let Some(senders) = sessions.get_mut(&wallet) else {
            return Ok(0);
        };

        // A send fails only when the connection's receiver is gone.
        senders.retain(|sender| sender.send(json.clone()).is_ok());
        let sent = senders.len();

        if senders.is_empty() {
            sessions.remove(&wallet);
        }
        if sent > 0 {
            debug!("Sent {:?} to {} ({} connections)", event, wallet, sent);
        }
        Ok(sent)
    }

    /// Push a notification, logging (not returning) serialization failures.
    pub async fn notify(&self, wallet: &str, notification: NotificationData) {
        if let Err(e) = self
            .send_to_wallet(wallet, WsEventType::Notification, notification)
            .await
        {
            error!("Failed to push notification to {}: {}", wallet, e);
        }
    }

    pub async fn total_connections(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|v| v.len()).sum()
    }
}

/// Configure WebSocket routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/{wallet}", web::get().to(websocket_handler));
}

/// WebSocket connection handler.
///
/// ## Endpoint
///
/// `GET /ws/:wallet`
///
/// ## Example (JavaScript)
///
/// ```javascript
/// const ws = new WebSocket('ws://localhost:8080/ws/0xabc...');
///
/// ws.onmessage = (event) => {
///     const message = JSON.parse(event.data);
///     if (message.event === 'countdown_tick') renderCountdown(message.data);
/// };
/// ```
pub async fn websocket_handler(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let wallet = crate::utils::normalize_address(&path.into_inner())
        .map_err(actix_web::error::ErrorBadRequest)?;
    info!("WebSocket connection request for {}", wallet);

    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let registry = state.ws_registry.clone();
    let mut rx = registry.register(&wallet).await;

    actix_rt::spawn(async move {
        let welcome = WsMessage::new(
            WsEventType::Connected,
            serde_json::json!({
                "status": "connected",
                "wallet": wallet,
            }),
        );
        if let Ok(json) = welcome.to_json() {
            if let Err(e) = session.text(json).await {
                error!("Failed to send welcome message: {}", e);
            }
        }

        // Registry -> socket
        let mut outbound = session.clone();
        let forward_wallet = wallet.clone();
        actix_rt::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if let Err(e) = outbound.text(msg).await {
                            debug!("WebSocket for {} closed: {}", forward_wallet, e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket for {} lagging, dropped {} events", forward_wallet, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Socket -> server
        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Ping(bytes) => {
                    let _ = session.pong(&bytes).await;
                }
                Message::Pong(_) => {}
                Message::Text(text) => {
                    debug!("Received text from {}: {}", wallet, text);
                    let reply = WsMessage::new(
                        WsEventType::Ping,
                        serde_json::json!({ "received": text.to_string() }),
                    );
                    if let Ok(json) = reply.to_json() {
                        let _ = session.text(json).await;
                    }
                }
                Message::Binary(_) => {
                    warn!("Received unexpected binary message from {}", wallet);
                    let reply = WsMessage::new(
                        WsEventType::Error,
                        serde_json::json!({ "message": "Binary messages are not supported" }),
                    );
                    if let Ok(json) = reply.to_json() {
                        let _ = session.text(json).await;
                    }
                }
                Message::Close(reason) => {
                    info!("WebSocket closed for {}: {:?}", wallet, reason);
                    break;
                }
                _ => {}
            }
        }

        let _ = session.close(None).await;
        registry.unregister(&wallet).await;
        info!("WebSocket disconnected for {}", wallet);
    });

    Ok(response)
}
