//! # Configuration Module
//!
//! This module handles loading and validating configuration from
//! environment variables. All settings are centralized here.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let config = AppConfig::from_env()?;
//! println!("Record store: {}", config.redemption_api_url);
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description | Example |
//! |----------|-------------|---------|
//! | `REDEMPTION_API_URL` | Redemption record store endpoint | `https://<project>.supabase.co/functions/v1/REDEMPTION_API` |
//! | `VAULT_DATA_API_URL` | Vault metrics endpoint | `https://<project>.supabase.co/functions/v1/FIRECRAWL_DATA` |
//! | `ARBITRUM_RPC_URL` | Arbitrum JSON-RPC endpoint | `https://arb1.arbitrum.io/rpc` |
//! | `BASE_RPC_URL` | Base JSON-RPC endpoint | `https://mainnet.base.org` |
//! | `SIGNER_RPC_URL` | Wallet signer endpoint for `eth_sendTransaction` | `http://127.0.0.1:1248` |
//! | `SERVER_HOST` | HTTP server host | `127.0.0.1` |
//! | `SERVER_PORT` | HTTP server port | `8080` |
//! | `POLL_INTERVAL_SECS` | Redemption refresh interval | `15` |
//! | `DEFAULT_COOLDOWN_SECS` | Cooldown used until the store reports one | `120` |

pub mod vaults;

use std::env;
use std::str::FromStr;
use thiserror::Error;

pub use vaults::{VaultDefinition, VaultKey, VaultRegistry};

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is missing
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    /// Failed to parse a value
    #[error("Failed to parse {0}: {1}")]
    ParseError(String, String),
}

/// Application configuration loaded from environment variables.
///
/// Values are loaded once at startup and shared (cloned) into every
/// service that needs them.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // ==========================================
    // EXTERNAL SERVICES
    // ==========================================

    /// Redemption record store endpoint.
    ///
    /// Actions are selected with the `action` query parameter
    /// (`pending`, `create`, `update`).
    pub redemption_api_url: String,

    /// Vault metrics endpoint (`?action=get&network=...`).
    pub vault_data_api_url: String,

    /// Timeout applied to every outbound HTTP request (seconds).
    pub http_timeout_secs: u64,

    // ==========================================
    // CHAIN SETTINGS
    // ==========================================

    /// Optional wallet signer endpoint.
    ///
    /// Transactions are sent with `eth_sendTransaction` from the
    /// connected wallet. When unset, the vault's chain RPC is used
    /// (which only works against a node that manages the account).
    pub signer_rpc_url: Option<String>,

    /// How long to wait for a transaction receipt (seconds).
    pub tx_confirmation_timeout_secs: u64,

    /// Delay between receipt polls (milliseconds).
    pub receipt_poll_interval_ms: u64,

    /// The fixed set of vaults the dashboard knows about.
    pub vaults: VaultRegistry,

    // ==========================================
    // SERVER SETTINGS
    // ==========================================

    /// HTTP server host address.
    pub server_host: String,

    /// HTTP server port number.
    ///
    /// Default: 8080
    pub server_port: u16,

    /// Browser origin allowed by CORS. Any origin when unset.
    pub cors_allowed_origin: Option<String>,

    // ==========================================
    // REDEMPTION SETTINGS
    // ==========================================

    /// How often a dashboard session refreshes pending redemptions (seconds).
    pub poll_interval_secs: u64,

    /// Countdown tick pushed to WebSocket subscribers (milliseconds).
    pub countdown_tick_ms: u64,

    /// Cooldown assumed until the record store reports its own value.
    pub default_cooldown_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Use `dotenvy::dotenv()` before calling this to load from `.env` file.
    ///
    /// ## Returns
    ///
    /// - `Ok(AppConfig)` - Configuration loaded successfully
    /// - `Err(ConfigError)` - A required variable is missing or invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        let arbitrum_rpc_url = get_env_or_default("ARBITRUM_RPC_URL", "https://arb1.arbitrum.io/rpc");
        let base_rpc_url = get_env_or_default("BASE_RPC_URL", "https://mainnet.base.org");

        let vaults = VaultRegistry::new(vec![
            VaultDefinition {
                key: VaultKey::Arb,
                name: "DeFi Yield".to_string(),
                network: "Arbitrum".to_string(),
                data_network: "arbitrum".to_string(),
                vault_proxy: get_optional_env("ARB_VAULT_PROXY")
                    .or_else(|| Some("0x591e7194fee6f5615ea89000318e630eab92fbe1".to_string()))
                    .map(|v| parse_address("ARB_VAULT_PROXY", &v))
                    .transpose()?,
                denomination_asset: parse_address(
                    "ARB_USDC",
                    &get_env_or_default("ARB_USDC", "0xaf88d065e77c8cC2239327C5EDb3A432268e5831"),
                )?,
                rpc_url: arbitrum_rpc_url,
            },
            VaultDefinition {
                key: VaultKey::Base,
                name: "Stable Yield".to_string(),
                network: "Base".to_string(),
                data_network: "base".to_string(),
                vault_proxy: get_optional_env("BASE_VAULT_PROXY")
                    .map(|v| parse_address("BASE_VAULT_PROXY", &v))
                    .transpose()?,
                denomination_asset: parse_address(
                    "BASE_USDC",
                    &get_env_or_default("BASE_USDC", "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
                )?,
                rpc_url: base_rpc_url,
            },
        ]);

        Ok(Self {
            // External services
            redemption_api_url: get_env("REDEMPTION_API_URL")?,
            vault_data_api_url: get_env("VAULT_DATA_API_URL")?,
            http_timeout_secs: parse_env_or_default("HTTP_TIMEOUT_SECS", 30)?,

            // Chain
            signer_rpc_url: get_optional_env("SIGNER_RPC_URL"),
            tx_confirmation_timeout_secs: parse_env_or_default("TX_CONFIRMATION_TIMEOUT_SECS", 180)?,
            receipt_poll_interval_ms: parse_env_or_default("RECEIPT_POLL_INTERVAL_MS", 2000)?,
            vaults,

            // Server
            server_host: get_env_or_default("SERVER_HOST", "127.0.0.1"),
            server_port: parse_env_or_default("SERVER_PORT", 8080)?,
            cors_allowed_origin: get_optional_env("CORS_ALLOWED_ORIGIN"),

            // Redemptions
            poll_interval_secs: positive("POLL_INTERVAL_SECS", parse_env_or_default("POLL_INTERVAL_SECS", 15)?)?,
            countdown_tick_ms: positive("COUNTDOWN_TICK_MS", parse_env_or_default("COUNTDOWN_TICK_MS", 1000)?)?,
            default_cooldown_secs: parse_env_or_default("DEFAULT_COOLDOWN_SECS", 120)?,
        })
    }
}

/// Get a required environment variable.
///
/// Returns an error if the variable is not set.
fn get_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get an environment variable with a default value.
///
/// Returns the default if the variable is not set.
fn get_env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get an optional environment variable. Empty values count as unset.
fn get_optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, falling back to `default` when unset.
fn parse_env_or_default<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_optional_env(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::ParseError(key.to_string(), e.to_string()))
}

fn parse_address(key: &str, raw: &str) -> Result<alloy_primitives::Address, ConfigError> {
    parse_value(key, raw)
}

fn positive(key: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be greater than 0".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_or_default() {
        // Should return default when not set
        let value = get_env_or_default("NONEXISTENT_VAR_12345", "default_value");
        assert_eq!(value, "default_value");
    }

    #[test]
    fn test_parse_value() {
        let port: u16 = parse_value("SERVER_PORT", " 9090 ").unwrap();
        assert_eq!(port, 9090);

        let err = parse_value::<u16>("SERVER_PORT", "eighty").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(ref key, _) if key == "SERVER_PORT"));
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address("ARB_USDC", "0xaf88d065e77c8cC2239327C5EDb3A432268e5831").is_ok());
        assert!(parse_address("ARB_USDC", "not-an-address").is_err());
    }

    #[test]
    fn test_positive_rejects_zero() {
        assert!(positive("POLL_INTERVAL_SECS", 0).is_err());
        assert_eq!(positive("POLL_INTERVAL_SECS", 15).unwrap(), 15);
    }

    #[test]
    fn test_missing_required_var() {
        let err = get_env("NONEXISTENT_REQUIRED_VAR_12345").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: NONEXISTENT_REQUIRED_VAR_12345"
        );
    }
}
