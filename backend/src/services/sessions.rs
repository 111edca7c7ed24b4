//! # Dashboard Sessions
//!
//! A session is an open dashboard for one wallet. Each session owns one
//! background task that keeps the wallet's redemption cache fresh and
//! drives the countdown shown in the browser.
//!
//! ## Session Task
//!
//! ```text
//! open(wallet)
//!   ├── refresh_pending (awaited)
//!   └── spawn ─┬─ every POLL_INTERVAL_SECS ── refresh_pending ── redemption_update
//!              ├─ every COUNTDOWN_TICK_MS ─── snapshot ───────── countdown_tick
//!              └─ shutdown signal ─────────── exit
//! close(wallet)
//!   └── signal shutdown, await the task
//! ```
//!
//! No timer outlives its session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chain::VaultContractProxy;
use crate::store::RecordStore;
use crate::utils::short_address;
use crate::websocket::{CountdownTickData, WsEventType, WsRegistry};

use super::redemption_manager::{Clock, RedemptionManager};

/// Identity of an open session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub wallet: String,
    pub opened_at: DateTime<Utc>,
    /// False when the session was already open.
    pub newly_opened: bool,
}

struct SessionHandle {
    id: Uuid,
    opened_at: DateTime<Utc>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Open dashboard sessions, one polling task each.
pub struct SessionRegistry<S, P, C> {
    manager: Arc<RedemptionManager<S, P, C>>,
    ws: WsRegistry,
    poll_interval: Duration,
    tick_interval: Duration,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl<S, P, C> SessionRegistry<S, P, C>
where
    S: RecordStore,
    P: VaultContractProxy,
    C: Clock,
{
    pub fn new(
        manager: Arc<RedemptionManager<S, P, C>>,
        ws: WsRegistry,
        poll_interval: Duration,
        tick_interval: Duration,
    ) -> Self {
        Self {
            manager,
            ws,
            poll_interval,
            tick_interval,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session for `wallet`.
    ///
    /// Refreshes the wallet's cache before returning. Opening an already
    /// open session does nothing and returns the existing session.
    ///
    /// The registry lock is not held during the refresh; a slow store
    /// only delays this wallet.
    pub async fn open(&self, wallet: &str) -> SessionInfo {
        let wallet = wallet.to_lowercase();

        if let Some(existing) = self.running(&wallet).await {
            debug!("Session for {} already open", wallet);
            return existing;
        }

        self.manager.refresh_pending(&wallet).await;

        let mut sessions = self.sessions.lock().await;

        // Another open may have won the race during the refresh.
        if let Some(existing) = sessions.get(&wallet).filter(|h| !h.task.is_finished()) {
            return SessionInfo {
                session_id: existing.id,
                wallet,
                opened_at: existing.opened_at,
                newly_opened: false,
            };
        }
        if sessions.remove(&wallet).is_some() {
            warn!("Session task for {} had exited; restarting", wallet);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_session(
            self.manager.clone(),
            self.ws.clone(),
            wallet.clone(),
            self.poll_interval,
            self.tick_interval,
            shutdown_rx,
        ));

        let info = SessionInfo {
            session_id: Uuid::new_v4(),
            wallet: wallet.clone(),
            opened_at: Utc::now(),
            newly_opened: true,
        };
        sessions.insert(
            wallet.clone(),
            SessionHandle {
                id: info.session_id,
                opened_at: info.opened_at,
                shutdown,
                task,
            },
        );
        info!(
            "Opened dashboard session {} for {} ({} active)",
            info.session_id,
            short_address(&wallet),
            sessions.len()
        );
        info
    }

    /// The wallet's session, if its task is still running.
    async fn running(&self, wallet: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(wallet)
            .filter(|h| !h.task.is_finished())
            .map(|h| SessionInfo {
                session_id: h.id,
                wallet: wallet.to_string(),
                opened_at: h.opened_at,
                newly_opened: false,
            })
    }

    /// Close the session of `wallet` and wait for its task to exit.
    ///
    /// Returns `false` when no session was open.
    pub async fn close(&self, wallet: &str) -> bool {
        let wallet = wallet.to_lowercase();
        let handle = self.sessions.lock().await.remove(&wallet);

        match handle {
            Some(handle) => {
                stop(&wallet, handle).await;
                self.manager.evict(&wallet);
                info!("Closed dashboard session for {}", wallet);
                true
            }
            None => false,
        }
    }

    /// Close every session (service shutdown).
    pub async fn close_all(&self) {
        let handles: Vec<(String, SessionHandle)> = self.sessions.lock().await.drain().collect();
        let count = handles.len();

        for (wallet, handle) in handles {
            stop(&wallet, handle).await;
        }
        if count > 0 {
            info!("Closed {} dashboard sessions", count);
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

async fn stop(wallet: &str, handle: SessionHandle) {
    // Err only means the task already exited.
    let _ = handle.shutdown.send(true);
    if let Err(e) = handle.task.await {
        error!("Session task for {} failed: {}", wallet, e);
    }
}

/// Body of a session task.
async fn run_session<S, P, C>(
    manager: Arc<RedemptionManager<S, P, C>>,
    ws: WsRegistry,
    wallet: String,
    poll_interval: Duration,
    tick_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: RecordStore,
    P: VaultContractProxy,
    C: Clock,
{
    let start = Instant::now();
    let mut refresh = interval_at(start + poll_interval, poll_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut countdown = interval_at(start + tick_interval, tick_interval);
    countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!("Session task started for {}", wallet);

    loop {
        tokio::select! {
            _ = refresh.tick() => {
                // A slow store must not delay shutdown.
                let refreshed = tokio::select! {
                    refreshed = manager.refresh_pending(&wallet) => refreshed,
                    _ = shutdown.changed() => break,
                };
                if refreshed {
                    let snapshot = manager.snapshot(&wallet);
                    if let Err(e) = ws.send_to_wallet(&wallet, WsEventType::RedemptionUpdate, snapshot).await {
                        error!("Failed to push redemption update to {}: {}", wallet, e);
                    }
                }
            }

            _ = countdown.tick() => {
                if let Some(tick) = CountdownTickData::from_snapshot(&manager.snapshot(&wallet)) {
                    if let Err(e) = ws.send_to_wallet(&wallet, WsEventType::CountdownTick, tick).await {
                        error!("Failed to push countdown to {}: {}", wallet, e);
                    }
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Session task stopped for {}", wallet);
}
