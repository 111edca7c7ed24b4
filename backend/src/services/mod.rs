//! # Services Module
//!
//! Business logic of the dashboard backend.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `RedemptionManager` | Redemption lifecycle: request, cancel, execute, cache |
//! | `SessionRegistry` | One polling + countdown task per open dashboard |
//! | `PortfolioService` | Vault metrics, wallet positions, deposits |
//! | `VaultDataClient` | Share price, monthly return and AUM per vault |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                         │
//! │                                                               │
//! │  ┌─────────────────┐        ┌──────────────────────────────┐  │
//! │  │ SessionRegistry │──poll─▶│      RedemptionManager       │  │
//! │  │  (per wallet)   │        │ • request  • cancel          │  │
//! │  └─────────────────┘        │ • execute  • refresh_pending │  │
//! │                             └──────────────────────────────┘  │
//! │                                  │                  │         │
//! │  ┌──────────────────┐            ▼                  ▼         │
//! │  │ PortfolioService │      RecordStore      VaultContractProxy│
//! │  │ • overview       │                               ▲         │
//! │  │ • position       │───────────────────────────────┘         │
//! │  │ • deposit        │──▶ VaultDataClient                      │
//! │  └──────────────────┘                                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod portfolio;
pub mod redemption_manager;
pub mod sessions;
pub mod vault_data;

pub use portfolio::{PortfolioError, PortfolioService};
pub use redemption_manager::{
    Clock, RedemptionError, RedemptionManager, RedemptionOrder, RedemptionSnapshot, SystemClock,
};
pub use sessions::{SessionInfo, SessionRegistry};
pub use vault_data::VaultDataClient;
