//! # Yield Vault Dashboard Backend
//!
//! Backend of the yield-vault dashboard. It provides:
//!
//! - REST API for vault metrics, positions, deposits and redemptions
//! - WebSocket push of redemption countdowns and action outcomes
//! - One background polling task per open dashboard session
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         BACKEND SERVICE                           │
//! │                                                                   │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────────┐  │
//! │  │  REST API   │  │  WebSocket  │  │   Dashboard Sessions     │  │
//! │  │  (Actix)    │  │  /ws/:wallet│  │  • refresh every 15s     │  │
//! │  │ /redemptions│  │             │  │  • countdown every 1s    │  │
//! │  │ /portfolio  │  │             │  │                          │  │
//! │  └─────────────┘  └─────────────┘  └──────────────────────────┘  │
//! │         │                ▲                     │                  │
//! │         └────────────────┴─────────────────────┘                  │
//! │                          │                                        │
//! │  ┌───────────────────────┴────────────────────────────────────┐  │
//! │  │                      SERVICE LAYER                          │  │
//! │  │  ┌───────────────────┐  ┌──────────────────┐               │  │
//! │  │  │ RedemptionManager │  │ PortfolioService │               │  │
//! │  │  └───────────────────┘  └──────────────────┘               │  │
//! │  └─────────────────────────────────────────────────────────────┘  │
//! │         │                         │                    │          │
//! │  ┌──────┴───────┐         ┌───────┴──────┐     ┌──────┴───────┐  │
//! │  │ Record Store │         │ EVM JSON-RPC │     │  Vault Data  │  │
//! │  │    (HTTP)    │         │ (Arb / Base) │     │    (HTTP)    │  │
//! │  └──────────────┘         └──────────────┘     └──────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! 1. Copy `.env.example` to `.env` and set the two service URLs
//! 2. Start the server: `cargo run`
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod chain;
mod config;
mod models;
mod services;
mod store;
mod utils;
mod websocket;

use chain::EnzymeVaultProxy;
use config::AppConfig;
use services::{PortfolioService, RedemptionManager, SessionRegistry, SystemClock, VaultDataClient};
use store::HttpRecordStore;
use websocket::WsRegistry;

/// Redemption manager wired to the live record store and chain.
pub type LiveRedemptionManager = RedemptionManager<HttpRecordStore, EnzymeVaultProxy, SystemClock>;

/// Application state shared across all handlers.
pub struct AppState {
    pub config: AppConfig,

    /// Record store client (health checks)
    pub record_store: HttpRecordStore,

    /// Redemption lifecycle and cache
    pub redemptions: Arc<LiveRedemptionManager>,

    /// Open dashboard sessions and their polling tasks
    pub sessions: SessionRegistry<HttpRecordStore, EnzymeVaultProxy, SystemClock>,

    /// Vault metrics, positions and deposits
    pub portfolio: PortfolioService,

    /// WebSocket connection registry for real-time updates
    pub ws_registry: WsRegistry,
}

/// Main entry point for the backend service.
///
/// 1. Loads configuration from environment
/// 2. Builds the record store, chain and vault data clients
/// 3. Wires the services
/// 4. Runs the HTTP server until shutdown
/// 5. Stops every session task
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // =========================================
    // STEP 1: Load Configuration
    // =========================================
    dotenvy::dotenv().ok(); // It's okay if .env doesn't exist

    // =========================================
    // STEP 2: Initialize Logging
    // =========================================
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_line_number(true)
        .init();

    info!("🚀 Starting Yield Vault Dashboard Backend");

    let config = AppConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    info!("📋 Configuration loaded");
    info!("   Record store: {}", config.redemption_api_url);
    info!("   Vault data: {}", config.vault_data_api_url);
    info!("   Poll interval: {}s", config.poll_interval_secs);

    // =========================================
    // STEP 3: Initialize Clients
    // =========================================
    let record_store = HttpRecordStore::new(&config).map_err(to_io_error)?;
    let chain = EnzymeVaultProxy::new(&config).map_err(to_io_error)?;
    let vault_data = VaultDataClient::new(&config).map_err(to_io_error)?;

    info!("⛓️  Clients initialized");

    // =========================================
    // STEP 4: Initialize Services
    // =========================================
    let ws_registry = WsRegistry::new();

    let redemptions = Arc::new(RedemptionManager::new(
        record_store.clone(),
        chain.clone(),
        SystemClock,
        config.vaults.clone(),
        config.default_cooldown_secs,
    ));

    let sessions = SessionRegistry::new(
        redemptions.clone(),
        ws_registry.clone(),
        Duration::from_secs(config.poll_interval_secs),
        Duration::from_millis(config.countdown_tick_ms),
    );

    let portfolio = PortfolioService::new(config.vaults.clone(), chain, vault_data);

    info!("🔧 Services initialized");

    let app_state = Arc::new(AppState {
        config: config.clone(),
        record_store,
        redemptions,
        sessions,
        portfolio,
        ws_registry,
    });

    // =========================================
    // STEP 5: Start HTTP Server
    // =========================================
    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    info!("🌐 Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let result = HttpServer::new(move || {
        let cors = match &server_state.config.cors_allowed_origin {
            Some(origin) => Cors::default()
                .allowed_origin(origin)
                .allow_any_method()
                .allow_any_header(),
            None => Cors::permissive(),
        };

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .configure(api::configure_routes)
            .configure(websocket::configure_routes)
    })
    .bind(&bind_addr)?
    .run()
    .await;

    // =========================================
    // STEP 6: Stop Session Tasks
    // =========================================
    app_state.sessions.close_all().await;
    info!("👋 Shutdown complete");

    result
}

fn to_io_error<E: std::fmt::Display>(e: E) -> std::io::Error {
    error!("Startup failed: {}", e);
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}
