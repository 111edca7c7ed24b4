//! Fixed vault registry.
//!
//! The dashboard only ever deals with a small, known set of Enzyme
//! vaults. Each one is identified by a [`VaultKey`], which is also the
//! `vault` value used on the record store wire format.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

/// Identifies one of the dashboard's vaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultKey {
    /// "DeFi Yield" vault on Arbitrum.
    Arb,
    /// "Stable Yield" vault on Base.
    Base,
}

impl VaultKey {
    /// All known vault keys, in display order.
    pub const ALL: [VaultKey; 2] = [VaultKey::Arb, VaultKey::Base];

    pub fn as_str(&self) -> &'static str {
        match self {
            VaultKey::Arb => "arb",
            VaultKey::Base => "base",
        }
    }
}

impl fmt::Display for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VaultKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arb" => Ok(VaultKey::Arb),
            "base" => Ok(VaultKey::Base),
            other => Err(format!("Unknown vault: {}", other)),
        }
    }
}

/// Static description of a vault.
#[derive(Debug, Clone)]
pub struct VaultDefinition {
    pub key: VaultKey,

    /// Display name, e.g. "DeFi Yield".
    pub name: String,

    /// Display network, e.g. "Arbitrum".
    pub network: String,

    /// Network name understood by the vault data service.
    pub data_network: String,

    /// Enzyme vault proxy. `None` means the vault is not live yet and
    /// every deposit/redemption on it is refused.
    pub vault_proxy: Option<Address>,

    /// USDC on the vault's chain.
    pub denomination_asset: Address,

    /// JSON-RPC endpoint of the vault's chain.
    pub rpc_url: String,
}

impl VaultDefinition {
    pub fn is_available(&self) -> bool {
        self.vault_proxy.is_some()
    }
}

/// The set of configured vaults.
#[derive(Debug, Clone, Default)]
pub struct VaultRegistry {
    vaults: Vec<VaultDefinition>,
}

impl VaultRegistry {
    pub fn new(vaults: Vec<VaultDefinition>) -> Self {
        Self { vaults }
    }

    pub fn get(&self, key: VaultKey) -> Option<&VaultDefinition> {
        self.vaults.iter().find(|v| v.key == key)
    }

    /// Whether the vault exists and has a deployed proxy.
    pub fn is_available(&self, key: VaultKey) -> bool {
        self.get(key).map(VaultDefinition::is_available).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VaultDefinition> {
        self.vaults.iter()
    }
}

#[cfg(test)]
pub(crate) fn test_registry() -> VaultRegistry {
    VaultRegistry::new(vec![
        VaultDefinition {
            key: VaultKey::Arb,
            name: "DeFi Yield".to_string(),
            network: "Arbitrum".to_string(),
            data_network: "arbitrum".to_string(),
            vault_proxy: Some(Address::repeat_byte(0x11)),
            denomination_asset: Address::repeat_byte(0x22),
            rpc_url: "http://127.0.0.1:8545".to_string(),
        },
        VaultDefinition {
            key: VaultKey::Base,
            name: "Stable Yield".to_string(),
            network: "Base".to_string(),
            data_network: "base".to_string(),
            vault_proxy: None,
            denomination_asset: Address::repeat_byte(0x33),
            rpc_url: "http://127.0.0.1:8546".to_string(),
        },
    ])
}
