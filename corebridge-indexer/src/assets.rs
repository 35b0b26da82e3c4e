// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide asset metadata cache.
//!
//! Maps token names, system addresses and token indexes to EVM scaling
//! information. Populated once at startup and refreshed on demand when an
//! unknown system address shows up. Readers are lock-free except for the
//! brief `Arc` swap inside a populate; the three maps are replaced
//! atomically so no reader ever sees a partially-built view.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core_client::{CoreClient, TokenMeta};
use crate::error::FetchError;

/// System address of the native token: twenty bytes of 0x22.
pub const NATIVE_SYSTEM_ADDRESS: &str = "0x2222222222222222222222222222222222222222";

/// Contract-token system addresses are this prefix plus the token index as
/// three lowercase hex digits.
pub const CONTRACT_SYSTEM_ADDRESS_PREFIX: &str = "0x2000000000000000000000000000000000000";

/// The native token is always 18 decimals on the EVM side, whatever the
/// upstream metadata claims.
pub const NATIVE_EVM_DECIMALS: u32 = 18;

/// Fallback when a system address stays unknown even after a refresh.
pub const DEFAULT_EVM_DECIMALS: u32 = 18;

/// Derive the system address for a contract token index.
pub fn system_address_for_index(index: u32) -> String {
    format!("{CONTRACT_SYSTEM_ADDRESS_PREFIX}{index:03x}")
}

/// Whether `address` is a system address (native or contract-token).
pub fn is_system_address(address: &str) -> bool {
    let lower = address.to_ascii_lowercase();
    lower == NATIVE_SYSTEM_ADDRESS || lower.starts_with(CONTRACT_SYSTEM_ADDRESS_PREFIX)
}

#[derive(Debug, Clone)]
pub struct Asset {
    pub name: String,
    pub index: u32,
    pub system_address: String,
    pub evm_decimals: u32,
    /// ERC-20 contract on the EVM side; None for the native token and for
    /// tokens that have not been linked yet.
    pub evm_contract: Option<String>,
}

#[derive(Debug, Default)]
struct AssetMaps {
    by_name: HashMap<String, Arc<Asset>>,
    by_system_address: HashMap<String, Arc<Asset>>,
    by_index: HashMap<u32, Arc<Asset>>,
}

impl AssetMaps {
    fn build(native_token: &str, tokens: &[TokenMeta]) -> Self {
        let mut maps = AssetMaps::default();
        for token in tokens {
            let is_native = token.name == native_token;
            let system_address = if is_native {
                NATIVE_SYSTEM_ADDRESS.to_string()
            } else {
                system_address_for_index(token.index)
            };
            let evm_decimals = if is_native {
                NATIVE_EVM_DECIMALS
            } else {
                let extra = token
                    .evm_contract
                    .as_ref()
                    .map(|c| c.evm_extra_wei_decimals)
                    .unwrap_or(0);
                (token.wei_decimals as i64 + extra as i64).max(0) as u32
            };
            let asset = Arc::new(Asset {
                name: token.name.clone(),
                index: token.index,
                system_address: system_address.clone(),
                evm_decimals,
                evm_contract: token
                    .evm_contract
                    .as_ref()
                    .map(|c| c.address.to_ascii_lowercase()),
            });
            maps.by_name.insert(asset.name.clone(), asset.clone());
            maps.by_system_address.insert(system_address, asset.clone());
            maps.by_index.insert(asset.index, asset);
        }
        maps
    }
}

pub struct AssetCache {
    client: Option<Arc<CoreClient>>,
    native_token: String,
    maps: RwLock<Arc<AssetMaps>>,
}

impl AssetCache {
    pub fn new(client: Arc<CoreClient>, native_token: impl Into<String>) -> Self {
        Self {
            client: Some(client),
            native_token: native_token.into(),
            maps: RwLock::new(Arc::new(AssetMaps::default())),
        }
    }

    /// Build a cache directly from a token listing, with no upstream client.
    pub fn from_tokens(native_token: &str, tokens: &[TokenMeta]) -> Self {
        Self {
            client: None,
            native_token: native_token.to_string(),
            maps: RwLock::new(Arc::new(AssetMaps::build(native_token, tokens))),
        }
    }

    /// Fetch the token listing and atomically replace all three maps.
    pub async fn populate(&self) -> Result<(), FetchError> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        let meta = client.spot_meta().await?;
        let maps = Arc::new(AssetMaps::build(&self.native_token, &meta.tokens));
        let count = maps.by_name.len();
        *self.maps.write().await = maps;
        info!("[ASSETS] Populated metadata for {count} tokens");
        Ok(())
    }

    pub async fn by_name(&self, name: &str) -> Option<Arc<Asset>> {
        self.maps.read().await.by_name.get(name).cloned()
    }

    pub async fn by_system_address(&self, address: &str) -> Option<Arc<Asset>> {
        self.maps
            .read()
            .await
            .by_system_address
            .get(&address.to_ascii_lowercase())
            .cloned()
    }

    pub async fn by_index(&self, index: u32) -> Option<Arc<Asset>> {
        self.maps.read().await.by_index.get(&index).cloned()
    }

    /// EVM decimals for a system address. An unknown address triggers one
    /// metadata refresh before falling back to the default of 18.
    pub async fn evm_decimals_for_system_address(&self, address: &str) -> u32 {
        if let Some(asset) = self.by_system_address(address).await {
            return asset.evm_decimals;
        }
        if let Err(e) = self.populate().await {
            warn!("[ASSETS] Refresh for unknown system address {address} failed: {e}");
        }
        match self.by_system_address(address).await {
            Some(asset) => asset.evm_decimals,
            None => {
                warn!("[ASSETS] System address {address} unknown after refresh, assuming {DEFAULT_EVM_DECIMALS} decimals");
                DEFAULT_EVM_DECIMALS
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_client::EvmContractMeta;

    fn token(name: &str, index: u32, wei_decimals: u32, extra: Option<i32>) -> TokenMeta {
        TokenMeta {
            name: name.to_string(),
            index,
            wei_decimals,
            evm_contract: extra.map(|evm_extra_wei_decimals| EvmContractMeta {
                address: format!("0x{:040x}", index),
                evm_extra_wei_decimals,
            }),
        }
    }

    #[test]
    fn test_system_address_derivation() {
        assert_eq!(
            system_address_for_index(0),
            "0x2000000000000000000000000000000000000000"
        );
        assert_eq!(
            system_address_for_index(5),
            "0x2000000000000000000000000000000000000005"
        );
        assert_eq!(
            system_address_for_index(222),
            "0x20000000000000000000000000000000000000de"
        );
        assert_eq!(
            system_address_for_index(268),
            "0x200000000000000000000000000000000000010c"
        );
        assert_eq!(system_address_for_index(0).len(), 42);
    }

    #[test]
    fn test_is_system_address() {
        assert!(is_system_address(NATIVE_SYSTEM_ADDRESS));
        assert!(is_system_address(
            "0x2222222222222222222222222222222222222222"
        ));
        assert!(is_system_address(&system_address_for_index(268)));
        assert!(!is_system_address(
            "0x1111111111111111111111111111111111111111"
        ));
        // A user address that merely starts with 0x2 is not a system address.
        assert!(!is_system_address(
            "0x2abc000000000000000000000000000000000005"
        ));
    }

    #[tokio::test]
    async fn test_native_token_decimals_are_forced_to_18() {
        let cache = AssetCache::from_tokens("HYPE", &[token("HYPE", 150, 8, None)]);
        let native = cache.by_name("HYPE").await.unwrap();
        assert_eq!(native.evm_decimals, NATIVE_EVM_DECIMALS);
        assert_eq!(native.system_address, NATIVE_SYSTEM_ADDRESS);
    }

    #[tokio::test]
    async fn test_evm_decimals_sum_wei_and_extra() {
        let cache = AssetCache::from_tokens(
            "HYPE",
            &[token("UBTC", 5, 8, Some(2)), token("USDT0", 268, 8, Some(-2))],
        );
        assert_eq!(cache.by_name("UBTC").await.unwrap().evm_decimals, 10);
        assert_eq!(cache.by_name("USDT0").await.unwrap().evm_decimals, 6);
        // Lookup by derived system address works too.
        let by_addr = cache
            .by_system_address("0x2000000000000000000000000000000000000005")
            .await
            .unwrap();
        assert_eq!(by_addr.name, "UBTC");
    }

    #[tokio::test]
    async fn test_unknown_address_falls_back_to_default() {
        let cache = AssetCache::from_tokens("HYPE", &[token("UBTC", 5, 8, Some(2))]);
        let decimals = cache
            .evm_decimals_for_system_address("0x20000000000000000000000000000000000000ff")
            .await;
        assert_eq!(decimals, DEFAULT_EVM_DECIMALS);
    }
}
