use alloy::primitives::Address;
use config::{Config, ConfigError, File};
use serde::Deserialize;

use crate::models::Token;
use crate::store::DEFAULT_MAX_RANGE_NS;

/// Embedded store location.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub path: String,
}

/// Chain endpoint and the contract addresses the log decoder listens to.
#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
    pub endpoint: String,
    /// Block the network contract was deployed at; log fetching never goes
    /// further back than this.
    pub deploy_block: u64,
    pub network_address: Address,
    pub burner_address: Address,
    pub whitelist_address: Address,
    pub wrapper_address: Address,
    pub reserve_address: Address,
    #[serde(default)]
    pub third_party_reserves: Vec<Address>,
}

/// Geolocation endpoints.
#[derive(Debug, Deserialize, Clone)]
pub struct GeoSettings {
    #[serde(default = "default_broadcast_url")]
    pub broadcast_url: String,
    /// Optional `start,end,country` CSV for the IP fallback.
    #[serde(default)]
    pub ip_ranges_path: Option<String>,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            broadcast_url: default_broadcast_url(),
            ip_ranges_path: None,
        }
    }
}

fn default_broadcast_url() -> String {
    "https://broadcast.kyber.network".to_string()
}

/// Tick cadence of the five workers plus the pipeline pull bound.
#[derive(Debug, Deserialize, Clone)]
pub struct FetcherSettings {
    #[serde(default = "default_block_interval_secs")]
    pub block_interval_secs: u64,
    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: u64,
    #[serde(default = "default_rate_interval_secs")]
    pub rate_interval_secs: u64,
    #[serde(default = "default_trade_log_interval_secs")]
    pub trade_log_interval_secs: u64,
    #[serde(default = "default_cat_log_interval_secs")]
    pub cat_log_interval_secs: u64,
    #[serde(default = "default_max_range_ns")]
    pub max_range_ns: u64,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            block_interval_secs: default_block_interval_secs(),
            log_interval_secs: default_log_interval_secs(),
            rate_interval_secs: default_rate_interval_secs(),
            trade_log_interval_secs: default_trade_log_interval_secs(),
            cat_log_interval_secs: default_cat_log_interval_secs(),
            max_range_ns: default_max_range_ns(),
        }
    }
}

fn default_block_interval_secs() -> u64 {
    7
}

fn default_log_interval_secs() -> u64 {
    7
}

fn default_rate_interval_secs() -> u64 {
    10
}

fn default_trade_log_interval_secs() -> u64 {
    2
}

fn default_cat_log_interval_secs() -> u64 {
    2
}

fn default_max_range_ns() -> u64 {
    DEFAULT_MAX_RANGE_NS
}

/// Root application configuration, loaded from `config.yaml` at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub store: StoreSettings,
    pub chain: ChainSettings,
    #[serde(default)]
    pub geo: Option<GeoSettings>,
    #[serde(default)]
    pub fetcher: FetcherSettings,
    pub tokens: Vec<Token>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("config"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;

        Ok(settings)
    }
}
