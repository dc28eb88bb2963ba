//! Trade geolocation.
//!
//! Each trade's origin country comes from the broadcast endpoint's
//! `get-tx-info` lookup, falling back to a local IP-range table when the
//! endpoint knows the IP but not the country. Lookups run while logs are
//! persisted, never during aggregation, and any failure resolves to
//! `"unknown"` so a flaky endpoint cannot hold the log fetcher back.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::warn;
use moka::future::Cache;
use serde::Deserialize;

/// Country used when no lookup succeeds.
pub const UNKNOWN_COUNTRY: &str = "unknown";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_CAPACITY: u64 = 100_000;
const CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default, Deserialize)]
pub struct TxGeoData {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub country: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TxGeoResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: TxGeoData,
}

pub struct GeoResolver {
    client: reqwest::Client,
    broadcast_url: String,
    /// Resolved (ip, country) per tx hash so retried windows do not re-hit
    /// the endpoint.
    cache: Cache<String, (String, String)>,
    ip_table: IpCountryTable,
}

impl GeoResolver {
    pub fn new(broadcast_url: String, ip_table: IpCountryTable) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build geo HTTP client")?;
        let cache = Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .time_to_live(CACHE_TTL)
            .build();
        Ok(Self {
            client,
            broadcast_url,
            cache,
            ip_table,
        })
    }

    /// `(ip, country)` of the trade, `("", "unknown")` when the lookup fails.
    pub async fn trade_geo(&self, tx_hash: &str) -> (String, String) {
        if let Some(hit) = self.cache.get(tx_hash).await {
            return hit;
        }
        match self.lookup(tx_hash).await {
            Ok(geo) => {
                self.cache.insert(tx_hash.to_string(), geo.clone()).await;
                geo
            },
            Err(e) => {
                warn!("geo lookup for {tx_hash} failed: {e:#}");
                (String::new(), UNKNOWN_COUNTRY.to_string())
            },
        }
    }

    async fn lookup(&self, tx_hash: &str) -> Result<(String, String)> {
        let url = format!("{}/get-tx-info/{}", self.broadcast_url, tx_hash);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            bail!("broadcast endpoint returned {}", resp.status());
        }
        let body: TxGeoResponse = resp.json().await?;
        if !body.success {
            return Ok((String::new(), UNKNOWN_COUNTRY.to_string()));
        }
        if !body.data.country.is_empty() {
            return Ok((body.data.ip, body.data.country));
        }
        let country = self
            .ip_table
            .country_of(&body.data.ip)
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
        Ok((body.data.ip, country))
    }
}

/// Sorted IPv4 ranges to country codes, loaded from a
/// `start,end,country` CSV.
#[derive(Debug, Default)]
pub struct IpCountryTable {
    ranges: Vec<(u32, u32, String)>,
}

impl IpCountryTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        let mut ranges = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(',');
            let (Some(start), Some(end), Some(country)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let (Some(start), Some(end)) = (parse_ip(start), parse_ip(end)) else {
                continue;
            };
            ranges.push((start, end, country.trim().to_string()));
        }
        ranges.sort_by_key(|(start, _, _)| *start);
        Ok(Self { ranges })
    }

    pub fn country_of(&self, ip: &str) -> Option<String> {
        let ip = parse_ip(ip)?;
        let idx = self.ranges.partition_point(|(start, _, _)| *start <= ip);
        let (_, end, country) = self.ranges.get(idx.checked_sub(1)?)?;
        (ip <= *end).then(|| country.clone())
    }
}

fn parse_ip(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<Ipv4Addr>() {
        return Some(u32::from(addr));
    }
    s.parse::<u32>().ok()
}
