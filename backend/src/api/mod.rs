//! # REST API Module
//!
//! HTTP endpoints of the dashboard backend.
//!
//! ## Endpoint Overview
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Record store and chain RPC reachability |
//! | GET | `/vaults` | Vault metrics |
//! | GET | `/portfolio/:wallet` | Wallet position |
//! | POST | `/portfolio/deposit` | Deposit USDC |
//! | POST | `/session` | Open dashboard session |
//! | DELETE | `/session/:wallet` | Close dashboard session |
//! | GET | `/redemptions/:wallet` | Pending redemptions |
//! | POST | `/redemptions/request` | Request redemption |
//! | POST | `/redemptions/cancel` | Cancel redemption |
//! | POST | `/redemptions/execute` | Execute redemption |
//! | POST | `/redemptions/reconcile` | Record an executed redemption |
//!
//! ## Request/Response Format
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "NOT_READY",
//!         "message": "Redemption on arb is not ready"
//!     }
//! }
//! ```

pub mod handlers;
pub mod routes;

pub use routes::configure_routes;
