//! # API Route Configuration

use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health                   GET - Health check
/// ├── /vaults                   GET - Vault overview
/// ├── /portfolio
/// │   ├── /{wallet}             GET - Wallet position
/// │   └── /deposit              POST - Deposit USDC
/// ├── /session                  POST - Open dashboard session
/// │   └── /{wallet}             DELETE - Close dashboard session
/// └── /redemptions
///     ├── /{wallet}             GET - Pending redemptions with countdowns
///     ├── /request              POST - Request redemption
///     ├── /cancel               POST - Cancel redemption
///     ├── /execute              POST - Execute redemption
///     └── /reconcile            POST - Record an already-executed redemption
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        .route("/", web::get().to(handlers::api_info))
        .route("/health", web::get().to(handlers::health_check))
        .route("/vaults", web::get().to(handlers::get_vaults))
        .service(
            web::scope("/portfolio")
                // Registered before /{wallet} so "deposit" is not taken for a wallet
                .route("/deposit", web::post().to(handlers::deposit))
                .route("/{wallet}", web::get().to(handlers::get_portfolio)),
        )
        .route("/session", web::post().to(handlers::open_session))
        .route("/session/{wallet}", web::delete().to(handlers::close_session))
        .service(
            web::scope("/redemptions")
                .route("/request", web::post().to(handlers::request_redemption))
                .route("/cancel", web::post().to(handlers::cancel_redemption))
                .route("/execute", web::post().to(handlers::execute_redemption))
                .route("/reconcile", web::post().to(handlers::reconcile_redemption))
                .route("/{wallet}", web::get().to(handlers::get_redemptions)),
        );
}
