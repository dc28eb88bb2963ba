use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// A single executed trade decoded from chain logs.
///
/// Amounts are base-unit integers; decimals are applied by the trade
/// enricher. `ip` and `country` are filled in by the geolocation lookup
/// before the log is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLog {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
    pub block_number: u64,
    pub tx_hash: B256,
    pub user_address: Address,
    pub src_address: Address,
    pub dest_address: Address,
    pub src_amount: U256,
    pub dest_amount: U256,
    pub reserve_address: Address,
    pub wallet_address: Address,
    #[serde(default)]
    pub burn_fee: Option<U256>,
    #[serde(default)]
    pub wallet_fee: Option<U256>,
    #[serde(default)]
    pub fiat_amount: f64,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub country: String,
}

/// Address categorisation event. Confirms pending address claims in the
/// user identity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatLog {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
    pub block_number: u64,
    pub tx_hash: B256,
    pub address: Address,
    pub category: String,
}
