//! Aggregate statistics storage.
//!
//! Every aggregate lives under `<statKey>/<freq>/<bucket>` where the bucket
//! key is the truncated timepoint as 8 big-endian bytes. Values are JSON.
//! Each setter merges a pipeline tick's deltas read-modify-write and persists
//! the pipeline checkpoint inside the same transaction, so a tick either
//! lands completely or not at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;

use crate::models::{BurnFeeStats, FreqStats, MetricStats, TimezoneStats, VolumeStats};
use crate::store::client::{StoreClient, StoreTxn};
use crate::utils::time::{
    bytes_to_u64, timezones, to_millis, u64_to_bytes, Freq, NANOS_PER_DAY,
};

const TRADELOG_PROCESSOR_STATE: &str = "tradelog_processor_state";
const TRADE_STATS: &str = "trade_stats";
const WALLET_ADDRESS: &str = "wallet_address";
const COUNTRY: &str = "country";
const USER_FIRST_TRADE_EVER: &str = "user_first_trade_ever";
const USER_STAT: &str = "user_stat";

/// Key under which the global trade summary is aggregated.
pub const TRADE_SUMMARY_KEY: &str = "trade_summary";

/// First-in-day entries older than this are pruned.
const DAILY_EXPIRY_NS: u64 = 7 * NANOS_PER_DAY;

/// Ranged read result: bucket start in milliseconds to stats.
pub type StatTicks<T> = BTreeMap<u64, T>;

pub struct StatStorage {
    store: Arc<StoreClient>,
}

impl StatStorage {
    pub fn new(store: Arc<StoreClient>) -> Result<Self> {
        store.namespace(&[TRADELOG_PROCESSOR_STATE])?;
        store.namespace(&[WALLET_ADDRESS])?;
        store.namespace(&[COUNTRY])?;
        store.namespace(&[USER_FIRST_TRADE_EVER])?;
        store.namespace(&[USER_STAT])?;
        for freq in [Freq::Minute, Freq::Hour, Freq::Day] {
            store.namespace(&[TRADE_STATS, &freq.bucket_name()])?;
        }
        for tz in timezones() {
            let name = Freq::Utc(tz).bucket_name();
            store.namespace(&[&name])?;
            store.namespace(&[TRADE_STATS, &name])?;
            store.namespace(&[USER_STAT, &name])?;
        }
        Ok(Self { store })
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub fn get_last_processed_trade_log_timepoint(&self, pipeline: &str) -> Result<u64> {
        Ok(self
            .store
            .get(TRADELOG_PROCESSOR_STATE, pipeline.as_bytes())?
            .map(|v| bytes_to_u64(&v))
            .unwrap_or(0))
    }

    pub fn set_last_processed_trade_log_timepoint(&self, pipeline: &str, t: u64) -> Result<()> {
        self.store
            .put(TRADELOG_PROCESSOR_STATE, pipeline.as_bytes(), &u64_to_bytes(t))
    }

    fn write_checkpoint(txn: &mut StoreTxn<'_>, pipeline: &str, t: u64) -> Result<()> {
        txn.put(TRADELOG_PROCESSOR_STATE, pipeline.as_bytes(), &u64_to_bytes(t))
    }

    // ------------------------------------------------------------------
    // First-trade markers
    // ------------------------------------------------------------------

    /// Records the observed trades of a pipeline tick into the first-ever and
    /// first-in-day maps, keeping the earliest timepoint per address (and per
    /// offset day), then advances the pipeline checkpoint. One transaction.
    pub fn set_first_trade_markers(
        &self,
        observed: &[(String, u64)],
        pipeline: &str,
        last: u64,
    ) -> Result<()> {
        let mut ever: FxHashMap<&str, u64> = FxHashMap::default();
        for (addr, t) in observed {
            let entry = ever.entry(addr).or_insert(*t);
            if *t < *entry {
                *entry = *t;
            }
        }

        // pre-reduce per (offset, day, address) so every store key is
        // compared and written exactly once
        let mut daily: FxHashMap<(i64, u64, &str), u64> = FxHashMap::default();
        for (addr, t) in observed {
            for tz in timezones() {
                let day = Freq::Utc(tz).truncate(*t);
                let entry = daily.entry((tz, day, addr)).or_insert(*t);
                if *t < *entry {
                    *entry = *t;
                }
            }
        }

        self.store.update(|txn| {
            for (addr, t) in &ever {
                let key = addr.as_bytes();
                let existing = txn
                    .get(USER_FIRST_TRADE_EVER, key)?
                    .map(|v| bytes_to_u64(&v));
                if existing.map_or(true, |cur| *t < cur) {
                    txn.put(USER_FIRST_TRADE_EVER, key, &u64_to_bytes(*t))?;
                }
            }
            for ((tz, day, addr), t) in &daily {
                let ns = txn.namespace(&[USER_STAT, &Freq::Utc(*tz).bucket_name()])?;
                let key = daily_key(*day, addr);
                let existing = txn.get(&ns, &key)?.map(|v| bytes_to_u64(&v));
                if existing.map_or(true, |cur| *t < cur) {
                    txn.put(&ns, &key, &u64_to_bytes(*t))?;
                }
            }
            Self::write_checkpoint(txn, pipeline, last)
        })
    }

    pub fn get_first_trade_ever(&self, user_addr: &str) -> Result<u64> {
        Ok(self
            .store
            .get(USER_FIRST_TRADE_EVER, user_addr.as_bytes())?
            .map(|v| bytes_to_u64(&v))
            .unwrap_or(0))
    }

    pub fn get_all_first_trade_ever(&self) -> Result<FxHashMap<String, u64>> {
        let mut out = FxHashMap::default();
        for (k, v) in self.store.scan_all(USER_FIRST_TRADE_EVER)? {
            out.insert(String::from_utf8_lossy(&k).into_owned(), bytes_to_u64(&v));
        }
        Ok(out)
    }

    /// Earliest trade of `user_addr` within the offset day containing
    /// `timepoint`, or 0 when unknown.
    pub fn get_first_trade_in_day(
        &self,
        user_addr: &str,
        timepoint: u64,
        timezone: i64,
    ) -> Result<u64> {
        let ns = self
            .store
            .namespace(&[USER_STAT, &Freq::Utc(timezone).bucket_name()])?;
        let day = Freq::Utc(timezone).truncate(timepoint);
        Ok(self
            .store
            .get(&ns, &daily_key(day, user_addr))?
            .map(|v| bytes_to_u64(&v))
            .unwrap_or(0))
    }

    /// Drops first-in-day entries for `timezone` whose day bucket lies more
    /// than seven days before `timepoint`. Returns the number removed.
    pub fn prune_daily_buckets(&self, timepoint: u64, timezone: i64) -> Result<usize> {
        let ns = self
            .store
            .namespace(&[USER_STAT, &Freq::Utc(timezone).bucket_name()])?;
        let current = Freq::Utc(timezone).truncate(timepoint);
        let expired = current.saturating_sub(DAILY_EXPIRY_NS);
        self.store.update(|txn| {
            let doomed = txn.scan_below(&ns, &u64_to_bytes(expired))?;
            let removed = doomed.len();
            for (key, _) in doomed {
                txn.delete(&ns, &key)?;
            }
            Ok(removed)
        })
    }

    // ------------------------------------------------------------------
    // Wallet and country sets
    // ------------------------------------------------------------------

    pub fn get_wallet_addresses(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .scan_all(WALLET_ADDRESS)?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    pub fn get_countries(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .scan_all(COUNTRY)?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    // ------------------------------------------------------------------
    // Aggregate setters
    // ------------------------------------------------------------------

    pub fn set_burn_fee_stats(
        &self,
        stats: &FxHashMap<String, FreqStats<BurnFeeStats>>,
        pipeline: &str,
        last: u64,
    ) -> Result<()> {
        self.store.update(|txn| {
            for (key, freqs) in stats {
                for (freq, buckets) in freqs {
                    let ns = txn.namespace(&[key, &freq.bucket_name()])?;
                    for (bucket, delta) in buckets {
                        let bkey = u64_to_bytes(*bucket);
                        let mut current: BurnFeeStats = read_json(txn, &ns, &bkey)?;
                        current.absorb(delta);
                        txn.put(&ns, &bkey, &to_json(&current)?)?;
                    }
                }
            }
            Self::write_checkpoint(txn, pipeline, last)
        })
    }

    pub fn set_volume_stats(
        &self,
        stats: &FxHashMap<String, FreqStats<VolumeStats>>,
        pipeline: &str,
        last: u64,
    ) -> Result<()> {
        self.store.update(|txn| {
            for (key, freqs) in stats {
                for (freq, buckets) in freqs {
                    let ns = txn.namespace(&[key, &freq.bucket_name()])?;
                    for (bucket, delta) in buckets {
                        let bkey = u64_to_bytes(*bucket);
                        let mut current: VolumeStats = read_json(txn, &ns, &bkey)?;
                        current.absorb(delta);
                        txn.put(&ns, &bkey, &to_json(&current)?)?;
                    }
                }
            }
            Self::write_checkpoint(txn, pipeline, last)
        })
    }

    pub fn set_trade_summary(
        &self,
        stats: &FxHashMap<String, TimezoneStats>,
        pipeline: &str,
        last: u64,
    ) -> Result<()> {
        self.store.update(|txn| {
            Self::merge_metric_stats(txn, stats)?;
            Self::write_checkpoint(txn, pipeline, last)
        })
    }

    /// Wallet metrics plus the set of fee-sharing wallet addresses seen in
    /// this tick, one transaction.
    pub fn set_wallet_stats(
        &self,
        stats: &FxHashMap<String, TimezoneStats>,
        wallet_addrs: &[String],
        pipeline: &str,
        last: u64,
    ) -> Result<()> {
        self.store.update(|txn| {
            for addr in wallet_addrs {
                txn.put(WALLET_ADDRESS, addr.as_bytes(), b"1")?;
            }
            Self::merge_metric_stats(txn, stats)?;
            Self::write_checkpoint(txn, pipeline, last)
        })
    }

    /// Country metrics plus the country set, one transaction.
    pub fn set_country_stats(
        &self,
        stats: &FxHashMap<String, TimezoneStats>,
        countries: &[String],
        pipeline: &str,
        last: u64,
    ) -> Result<()> {
        self.store.update(|txn| {
            for country in countries {
                txn.put(COUNTRY, country.as_bytes(), b"1")?;
            }
            Self::merge_metric_stats(txn, stats)?;
            Self::write_checkpoint(txn, pipeline, last)
        })
    }

    fn merge_metric_stats(
        txn: &mut StoreTxn<'_>,
        stats: &FxHashMap<String, TimezoneStats>,
    ) -> Result<()> {
        for (key, tz_stats) in stats {
            for (tz, buckets) in tz_stats {
                let ns = txn.namespace(&[key, &Freq::Utc(*tz).bucket_name()])?;
                for (bucket, delta) in buckets {
                    let bkey = u64_to_bytes(*bucket);
                    let mut current: MetricStats = read_json(txn, &ns, &bkey)?;
                    current.absorb(delta);
                    txn.put(&ns, &bkey, &to_json(&current)?)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ranged reads (nanosecond bounds in, millisecond keys out)
    // ------------------------------------------------------------------

    pub fn get_trade_summary(
        &self,
        from: u64,
        to: u64,
        timezone: i64,
    ) -> Result<StatTicks<MetricStats>> {
        self.ranged_metrics(TRADE_SUMMARY_KEY, from, to, timezone)
    }

    pub fn get_wallet_stats(
        &self,
        from: u64,
        to: u64,
        wallet_addr: &str,
        timezone: i64,
    ) -> Result<StatTicks<MetricStats>> {
        self.ranged_metrics(wallet_addr, from, to, timezone)
    }

    pub fn get_country_stats(
        &self,
        from: u64,
        to: u64,
        country: &str,
        timezone: i64,
    ) -> Result<StatTicks<MetricStats>> {
        self.ranged_metrics(country, from, to, timezone)
    }

    pub fn get_asset_volume(
        &self,
        from: u64,
        to: u64,
        freq: Freq,
        asset_addr: &str,
    ) -> Result<StatTicks<VolumeStats>> {
        self.ranged_volume(asset_addr, from, to, freq)
    }

    pub fn get_user_volume(
        &self,
        from: u64,
        to: u64,
        freq: Freq,
        user_addr: &str,
    ) -> Result<StatTicks<VolumeStats>> {
        self.ranged_volume(user_addr, from, to, freq)
    }

    pub fn get_burn_fee(
        &self,
        from: u64,
        to: u64,
        freq: Freq,
        reserve_addr: &str,
    ) -> Result<StatTicks<f64>> {
        self.ranged_burn_fee(reserve_addr, from, to, freq)
    }

    pub fn get_wallet_fee(
        &self,
        from: u64,
        to: u64,
        freq: Freq,
        reserve_addr: &str,
        wallet_addr: &str,
    ) -> Result<StatTicks<f64>> {
        self.ranged_burn_fee(&format!("{reserve_addr}_{wallet_addr}"), from, to, freq)
    }

    fn ranged_metrics(
        &self,
        key: &str,
        from: u64,
        to: u64,
        timezone: i64,
    ) -> Result<StatTicks<MetricStats>> {
        let ns = self
            .store
            .namespace(&[key, &Freq::Utc(timezone).bucket_name()])?;
        let mut out = BTreeMap::new();
        for (k, v) in self.store.scan(&ns, &u64_to_bytes(from), &u64_to_bytes(to))? {
            let stats: MetricStats = serde_json::from_slice(&v).unwrap_or_default();
            out.insert(to_millis(bytes_to_u64(&k)), stats);
        }
        Ok(out)
    }

    fn ranged_volume(
        &self,
        key: &str,
        from: u64,
        to: u64,
        freq: Freq,
    ) -> Result<StatTicks<VolumeStats>> {
        let ns = self.store.namespace(&[key, &freq.bucket_name()])?;
        let mut out = BTreeMap::new();
        for (k, v) in self.store.scan(&ns, &u64_to_bytes(from), &u64_to_bytes(to))? {
            let stats: VolumeStats = serde_json::from_slice(&v).unwrap_or_default();
            out.insert(to_millis(bytes_to_u64(&k)), stats);
        }
        Ok(out)
    }

    fn ranged_burn_fee(
        &self,
        key: &str,
        from: u64,
        to: u64,
        freq: Freq,
    ) -> Result<StatTicks<f64>> {
        let ns = self.store.namespace(&[key, &freq.bucket_name()])?;
        let mut out = BTreeMap::new();
        for (k, v) in self.store.scan(&ns, &u64_to_bytes(from), &u64_to_bytes(to))? {
            let stats: BurnFeeStats = serde_json::from_slice(&v).unwrap_or_default();
            out.insert(to_millis(bytes_to_u64(&k)), stats.total_burn_fee);
        }
        Ok(out)
    }
}

fn daily_key(day: u64, addr: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + addr.len());
    key.extend_from_slice(&u64_to_bytes(day));
    key.extend_from_slice(addr.as_bytes());
    key
}

fn read_json<T: Default + serde::de::DeserializeOwned>(
    txn: &StoreTxn<'_>,
    ns: &str,
    key: &[u8],
) -> Result<T> {
    Ok(txn
        .get(ns, key)?
        .map(|v| serde_json::from_slice(&v).unwrap_or_default())
        .unwrap_or_default())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).context("Failed to encode stats")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_stats() -> (StatStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StoreClient::open(dir.path()).unwrap());
        (StatStorage::new(store).unwrap(), dir)
    }

    const PIPELINE: &str = "test_aggregation";

    #[test]
    fn test_checkpoint_roundtrip() {
        let (stats, _dir) = open_stats();
        assert_eq!(
            stats.get_last_processed_trade_log_timepoint(PIPELINE).unwrap(),
            0
        );
        stats
            .set_last_processed_trade_log_timepoint(PIPELINE, 42)
            .unwrap();
        assert_eq!(
            stats.get_last_processed_trade_log_timepoint(PIPELINE).unwrap(),
            42
        );
    }

    #[test]
    fn test_first_trade_ever_keeps_minimum() {
        let (stats, _dir) = open_stats();
        let addr = "0xabc".to_string();
        stats
            .set_first_trade_markers(&[(addr.clone(), 500)], PIPELINE, 500)
            .unwrap();
        stats
            .set_first_trade_markers(&[(addr.clone(), 900)], PIPELINE, 900)
            .unwrap();
        assert_eq!(stats.get_first_trade_ever(&addr).unwrap(), 500);
        stats
            .set_first_trade_markers(&[(addr.clone(), 300)], PIPELINE, 900)
            .unwrap();
        assert_eq!(stats.get_first_trade_ever(&addr).unwrap(), 300);
        let all = stats.get_all_first_trade_ever().unwrap();
        assert_eq!(all.get(&addr), Some(&300));
    }

    #[test]
    fn test_first_trade_in_day_per_offset() {
        let (stats, _dir) = open_stats();
        let addr = "0xabc".to_string();
        let t = 1_520_825_136_556_000_000u64;
        stats
            .set_first_trade_markers(&[(addr.clone(), t), (addr.clone(), t + 10)], PIPELINE, t + 10)
            .unwrap();
        for tz in timezones() {
            assert_eq!(stats.get_first_trade_in_day(&addr, t + 10, tz).unwrap(), t);
        }
        // a different day has its own first trade
        let next_day = t + NANOS_PER_DAY;
        stats
            .set_first_trade_markers(&[(addr.clone(), next_day)], PIPELINE, next_day)
            .unwrap();
        assert_eq!(
            stats.get_first_trade_in_day(&addr, next_day, 0).unwrap(),
            next_day
        );
        assert_eq!(stats.get_first_trade_in_day(&addr, t, 0).unwrap(), t);
    }

    #[test]
    fn test_daily_prune_drops_expired_entries() {
        let (stats, _dir) = open_stats();
        let now = 100 * NANOS_PER_DAY;
        let fresh = now - NANOS_PER_DAY;
        let stale = now - 9 * NANOS_PER_DAY;
        stats
            .set_first_trade_markers(
                &[("0xold".to_string(), stale), ("0xnew".to_string(), fresh)],
                PIPELINE,
                fresh,
            )
            .unwrap();
        let removed = stats.prune_daily_buckets(now, 0).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(stats.get_first_trade_in_day("0xold", stale, 0).unwrap(), 0);
        assert_eq!(
            stats.get_first_trade_in_day("0xnew", fresh, 0).unwrap(),
            fresh
        );
    }

    #[test]
    fn test_metric_merge_accumulates_across_ticks() {
        let (stats, _dir) = open_stats();
        let t = 1_520_825_136_556_000_000u64;
        let bucket = Freq::Utc(0).truncate(t);
        let delta = MetricStats {
            eth_volume: 1.0,
            usd_volume: 100.0,
            trade_count: 1,
            unique_addr: 1,
            new_unique_addresses: 1,
            ..Default::default()
        };
        let mut tick: FxHashMap<String, TimezoneStats> = FxHashMap::default();
        tick.entry(TRADE_SUMMARY_KEY.to_string())
            .or_default()
            .entry(0)
            .or_default()
            .insert(bucket, delta);
        stats.set_trade_summary(&tick, PIPELINE, t).unwrap();
        stats.set_trade_summary(&tick, PIPELINE, t + 1).unwrap();

        let ticks = stats.get_trade_summary(bucket, bucket, 0).unwrap();
        let merged = ticks.get(&to_millis(bucket)).unwrap();
        assert_eq!(merged.trade_count, 2);
        assert_eq!(merged.eth_volume, 2.0);
        assert_eq!(merged.eth_per_trade, 1.0);
        assert_eq!(
            stats.get_last_processed_trade_log_timepoint(PIPELINE).unwrap(),
            t + 1
        );
    }

    #[test]
    fn test_volume_and_burn_fee_reads() {
        let (stats, _dir) = open_stats();
        let t = 1_520_825_136_556_000_000u64;
        let bucket = Freq::Minute.truncate(t);

        let mut volumes: FxHashMap<String, FreqStats<VolumeStats>> = FxHashMap::default();
        volumes
            .entry("0xasset".to_string())
            .or_default()
            .entry(Freq::Minute)
            .or_default()
            .insert(
                bucket,
                VolumeStats {
                    volume: 5.0,
                    eth_volume: 1.5,
                    usd_amount: 700.0,
                },
            );
        stats.set_volume_stats(&volumes, PIPELINE, t).unwrap();

        let mut fees: FxHashMap<String, FreqStats<BurnFeeStats>> = FxHashMap::default();
        fees.entry("0xreserve".to_string())
            .or_default()
            .entry(Freq::Minute)
            .or_default()
            .insert(bucket, BurnFeeStats { total_burn_fee: 0.25 });
        stats.set_burn_fee_stats(&fees, PIPELINE, t).unwrap();

        let vol = stats
            .get_asset_volume(bucket, bucket, Freq::Minute, "0xasset")
            .unwrap();
        assert_eq!(vol.get(&to_millis(bucket)).unwrap().volume, 5.0);

        let fee = stats
            .get_burn_fee(bucket, bucket, Freq::Minute, "0xreserve")
            .unwrap();
        assert_eq!(fee.get(&to_millis(bucket)), Some(&0.25));

        // unknown keys read as empty maps
        let none = stats
            .get_burn_fee(bucket, bucket, Freq::Minute, "0xnobody")
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_wallet_and_country_sets() {
        let (stats, _dir) = open_stats();
        stats
            .set_wallet_stats(
                &FxHashMap::default(),
                &["0xwallet".to_string()],
                PIPELINE,
                1,
            )
            .unwrap();
        stats
            .set_country_stats(&FxHashMap::default(), &["DE".to_string()], PIPELINE, 2)
            .unwrap();
        assert_eq!(stats.get_wallet_addresses().unwrap(), vec!["0xwallet"]);
        assert_eq!(stats.get_countries().unwrap(), vec!["DE"]);
    }
}
