//! Trade log aggregation pipelines.
//!
//! Seven pipelines share one skeleton: load the pipeline checkpoint, pull a
//! bounded window of trade logs, fold them into an in-memory reducer and
//! merge the result into the store together with the new checkpoint. Each
//! pipeline owns its checkpoint, so a lagging aggregate simply falls behind
//! without affecting the others.
//!
//! The user pipeline must run first within a tick: the metric reducers read
//! the first-trade markers it maintains.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rustc_hash::FxHashMap;

use crate::models::{BurnFeeStats, FreqStats, TimezoneStats, VolumeStats};
use crate::store::stat::TRADE_SUMMARY_KEY;
use crate::store::{LogStorage, StatStorage};
use crate::utils::addr_key;
use crate::utils::time::{timepoint_ns, timezones, Freq};
use crate::worker::enricher::{is_countable_wallet, TradeEnricher, TradeInfo};

pub const TRADE_SUMMARY_AGGREGATION: &str = "trade_summary_aggregation";
pub const WALLET_AGGREGATION: &str = "wallet_aggregation";
pub const COUNTRY_AGGREGATION: &str = "country_aggregation";
pub const USER_AGGREGATION: &str = "user_aggregation";
pub const VOLUME_STAT_AGGREGATION: &str = "volume_stat_aggregation";
pub const BURNFEE_AGGREGATION: &str = "burn_fee_aggregation";
pub const RESERVE_VOLUME_AGGREGATION: &str = "reserve_volume_aggregation";

const FIXED_FREQUENCIES: [Freq; 3] = [Freq::Minute, Freq::Hour, Freq::Day];

pub struct TradeLogProcessor {
    stats: Arc<StatStorage>,
    logs: Arc<LogStorage>,
    enricher: TradeEnricher,
}

impl TradeLogProcessor {
    pub fn new(stats: Arc<StatStorage>, logs: Arc<LogStorage>, enricher: TradeEnricher) -> Self {
        Self {
            stats,
            logs,
            enricher,
        }
    }

    /// Runs every pipeline once, in dependency order. A failing pipeline is
    /// logged and does not block the ones after it; its checkpoint simply
    /// stays put until the next tick.
    pub fn run_all(&self, tick: DateTime<Utc>) {
        let pipelines: [(&str, fn(&Self, DateTime<Utc>) -> Result<()>); 7] = [
            (USER_AGGREGATION, Self::run_user_aggregation),
            (BURNFEE_AGGREGATION, Self::run_burn_fee_aggregation),
            (VOLUME_STAT_AGGREGATION, Self::run_volume_aggregation),
            (TRADE_SUMMARY_AGGREGATION, Self::run_trade_summary_aggregation),
            (WALLET_AGGREGATION, Self::run_wallet_aggregation),
            (COUNTRY_AGGREGATION, Self::run_country_aggregation),
            (RESERVE_VOLUME_AGGREGATION, Self::run_reserve_volume_aggregation),
        ];
        for (name, run) in pipelines {
            if let Err(e) = run(self, tick) {
                error!("{name} failed: {e:#}");
            }
        }
    }

    /// Window of trade log timestamps to process next, `(from, to)`
    /// inclusive, bounded by the store's maximum pull range.
    fn trade_log_time_range(&self, mut from: u64, tick: DateTime<Utc>) -> Result<(u64, u64)> {
        from += 1;
        if from == 1 {
            // nothing processed yet; start just before the first known log
            if let Some(first) = self.logs.get_first_trade_log()? {
                from = first.timestamp - 1;
            }
        }
        let mut to = timepoint_ns(tick);
        if to.saturating_sub(from) > self.logs.max_range() {
            to = from + self.logs.max_range();
        }
        Ok((from, to))
    }

    /// Empty-window bookkeeping: when the window lies entirely behind the
    /// newest known trade, the checkpoint still moves to `to` so the
    /// pipeline catches up over gaps.
    fn advance_over_empty_range(&self, pipeline: &str, to: u64) -> Result<()> {
        if let Some(last) = self.logs.get_last_trade_log()? {
            if to < last.timestamp {
                self.stats.set_last_processed_trade_log_timepoint(pipeline, to)?;
            }
        }
        Ok(())
    }

    pub fn run_user_aggregation(&self, tick: DateTime<Utc>) -> Result<()> {
        let checkpoint = self
            .stats
            .get_last_processed_trade_log_timepoint(USER_AGGREGATION)?;
        let (from, to) = self.trade_log_time_range(checkpoint, tick)?;
        let trade_logs = self.logs.get_trade_logs(from, to)?;
        if trade_logs.is_empty() {
            return self.advance_over_empty_range(USER_AGGREGATION, to);
        }

        let mut observed: Vec<(String, u64)> = Vec::with_capacity(trade_logs.len());
        let mut last = 0u64;
        for trade in &trade_logs {
            observed.push((addr_key(&trade.user_address), trade.timestamp));
            last = last.max(trade.timestamp);
        }
        self.stats
            .set_first_trade_markers(&observed, USER_AGGREGATION, last)?;

        let now = timepoint_ns(tick);
        for tz in timezones() {
            self.stats.prune_daily_buckets(now, tz)?;
        }
        Ok(())
    }

    pub fn run_burn_fee_aggregation(&self, tick: DateTime<Utc>) -> Result<()> {
        let checkpoint = self
            .stats
            .get_last_processed_trade_log_timepoint(BURNFEE_AGGREGATION)?;
        let (from, to) = self.trade_log_time_range(checkpoint, tick)?;
        let trade_logs = self.logs.get_trade_logs(from, to)?;
        if trade_logs.is_empty() {
            return self.advance_over_empty_range(BURNFEE_AGGREGATION, to);
        }
        info!("aggregating burn fees over {} trades", trade_logs.len());

        let mut stats: FxHashMap<String, FreqStats<BurnFeeStats>> = FxHashMap::default();
        let mut last = 0u64;
        for trade in &trade_logs {
            // a failed enrichment still counts against the checkpoint, so
            // fold zeroes rather than leaving the trade out of the window
            let info = self.enricher.trade_info(trade).unwrap_or_else(|e| {
                warn!("enriching trade {} failed: {e:#}", trade.tx_hash);
                TradeInfo::default()
            });
            let reserve = addr_key(&trade.reserve_address);
            let wallet = addr_key(&trade.wallet_address);
            fold_burn_fee(&mut stats, &reserve, info.burn_fee, trade.timestamp);
            fold_burn_fee(
                &mut stats,
                &format!("{reserve}_{wallet}"),
                info.wallet_fee,
                trade.timestamp,
            );
            last = last.max(trade.timestamp);
        }
        if last == 0 {
            return Ok(());
        }
        self.stats
            .set_burn_fee_stats(&stats, BURNFEE_AGGREGATION, last)
    }

    pub fn run_volume_aggregation(&self, tick: DateTime<Utc>) -> Result<()> {
        let checkpoint = self
            .stats
            .get_last_processed_trade_log_timepoint(VOLUME_STAT_AGGREGATION)?;
        let (from, to) = self.trade_log_time_range(checkpoint, tick)?;
        let trade_logs = self.logs.get_trade_logs(from, to)?;
        if trade_logs.is_empty() {
            return self.advance_over_empty_range(VOLUME_STAT_AGGREGATION, to);
        }
        info!("aggregating volumes over {} trades", trade_logs.len());

        let mut stats: FxHashMap<String, FreqStats<VolumeStats>> = FxHashMap::default();
        let mut last = 0u64;
        for trade in &trade_logs {
            // a failed enrichment still counts against the checkpoint, so
            // fold zeroes rather than leaving the trade out of the window
            let info = self.enricher.trade_info(trade).unwrap_or_else(|e| {
                warn!("enriching trade {} failed: {e:#}", trade.tx_hash);
                TradeInfo::default()
            });
            let src = addr_key(&trade.src_address);
            let dst = addr_key(&trade.dest_address);
            let user = addr_key(&trade.user_address);
            // token volumes on both legs, then the user's own volume
            fold_volume(
                &mut stats,
                &src,
                info.src_amount,
                info.eth_amount,
                trade.fiat_amount,
                trade.timestamp,
            );
            fold_volume(
                &mut stats,
                &dst,
                info.dest_amount,
                info.eth_amount,
                trade.fiat_amount,
                trade.timestamp,
            );
            fold_volume(
                &mut stats,
                &user,
                info.src_amount,
                info.eth_amount,
                trade.fiat_amount,
                trade.timestamp,
            );
            last = last.max(trade.timestamp);
        }
        if last == 0 {
            return Ok(());
        }
        self.stats
            .set_volume_stats(&stats, VOLUME_STAT_AGGREGATION, last)
    }

    pub fn run_trade_summary_aggregation(&self, tick: DateTime<Utc>) -> Result<()> {
        let checkpoint = self
            .stats
            .get_last_processed_trade_log_timepoint(TRADE_SUMMARY_AGGREGATION)?;
        let (from, to) = self.trade_log_time_range(checkpoint, tick)?;
        let trade_logs = self.logs.get_trade_logs(from, to)?;
        if trade_logs.is_empty() {
            return self.advance_over_empty_range(TRADE_SUMMARY_AGGREGATION, to);
        }
        info!("aggregating trade summary over {} trades", trade_logs.len());

        let first_trade_ever = self.stats.get_all_first_trade_ever()?;
        let mut stats: FxHashMap<String, TimezoneStats> = FxHashMap::default();
        let mut last = 0u64;
        for trade in &trade_logs {
            // a failed enrichment still counts against the checkpoint, so
            // fold zeroes rather than leaving the trade out of the window
            let info = self.enricher.trade_info(trade).unwrap_or_else(|e| {
                warn!("enriching trade {} failed: {e:#}", trade.tx_hash);
                TradeInfo::default()
            });
            self.fold_metric(&mut stats, TRADE_SUMMARY_KEY, trade, &info, &first_trade_ever)?;
            last = last.max(trade.timestamp);
        }
        if last == 0 {
            return Ok(());
        }
        self.stats
            .set_trade_summary(&stats, TRADE_SUMMARY_AGGREGATION, last)
    }

    pub fn run_wallet_aggregation(&self, tick: DateTime<Utc>) -> Result<()> {
        let checkpoint = self
            .stats
            .get_last_processed_trade_log_timepoint(WALLET_AGGREGATION)?;
        let (from, to) = self.trade_log_time_range(checkpoint, tick)?;
        let trade_logs = self.logs.get_trade_logs(from, to)?;
        if trade_logs.is_empty() {
            return self.advance_over_empty_range(WALLET_AGGREGATION, to);
        }
        info!("aggregating wallet stats over {} trades", trade_logs.len());

        let first_trade_ever = self.stats.get_all_first_trade_ever()?;
        let mut stats: FxHashMap<String, TimezoneStats> = FxHashMap::default();
        let mut wallets: Vec<String> = Vec::new();
        let mut last = 0u64;
        for trade in &trade_logs {
            // a failed enrichment still counts against the checkpoint, so
            // fold zeroes rather than leaving the trade out of the window
            let info = self.enricher.trade_info(trade).unwrap_or_else(|e| {
                warn!("enriching trade {} failed: {e:#}", trade.tx_hash);
                TradeInfo::default()
            });
            if is_countable_wallet(&trade.wallet_address) {
                let wallet = addr_key(&trade.wallet_address);
                self.fold_metric(&mut stats, &wallet, trade, &info, &first_trade_ever)?;
                if !wallets.contains(&wallet) {
                    wallets.push(wallet);
                }
            }
            last = last.max(trade.timestamp);
        }
        if last == 0 {
            return Ok(());
        }
        self.stats
            .set_wallet_stats(&stats, &wallets, WALLET_AGGREGATION, last)
    }

    pub fn run_country_aggregation(&self, tick: DateTime<Utc>) -> Result<()> {
        let checkpoint = self
            .stats
            .get_last_processed_trade_log_timepoint(COUNTRY_AGGREGATION)?;
        let (from, to) = self.trade_log_time_range(checkpoint, tick)?;
        let trade_logs = self.logs.get_trade_logs(from, to)?;
        if trade_logs.is_empty() {
            return self.advance_over_empty_range(COUNTRY_AGGREGATION, to);
        }
        info!("aggregating country stats over {} trades", trade_logs.len());

        let first_trade_ever = self.stats.get_all_first_trade_ever()?;
        let mut stats: FxHashMap<String, TimezoneStats> = FxHashMap::default();
        let mut countries: Vec<String> = Vec::new();
        let mut last = 0u64;
        for trade in &trade_logs {
            // a failed enrichment still counts against the checkpoint, so
            // fold zeroes rather than leaving the trade out of the window
            let info = self.enricher.trade_info(trade).unwrap_or_else(|e| {
                warn!("enriching trade {} failed: {e:#}", trade.tx_hash);
                TradeInfo::default()
            });
            self.fold_metric(&mut stats, &trade.country, trade, &info, &first_trade_ever)?;
            if !countries.contains(&trade.country) {
                countries.push(trade.country.clone());
            }
            last = last.max(trade.timestamp);
        }
        if last == 0 {
            return Ok(());
        }
        self.stats
            .set_country_stats(&stats, &countries, COUNTRY_AGGREGATION, last)
    }

    /// Placeholder pipeline: consumes its input range and keeps position but
    /// writes no aggregates yet.
    pub fn run_reserve_volume_aggregation(&self, tick: DateTime<Utc>) -> Result<()> {
        let checkpoint = self
            .stats
            .get_last_processed_trade_log_timepoint(RESERVE_VOLUME_AGGREGATION)?;
        let (from, to) = self.trade_log_time_range(checkpoint, tick)?;
        let trade_logs = self.logs.get_trade_logs(from, to)?;
        if trade_logs.is_empty() {
            return self.advance_over_empty_range(RESERVE_VOLUME_AGGREGATION, to);
        }
        let last = trade_logs.iter().map(|t| t.timestamp).max().unwrap_or(0);
        if last == 0 {
            return Ok(());
        }
        self.stats
            .set_last_processed_trade_log_timepoint(RESERVE_VOLUME_AGGREGATION, last)
    }

    /// Folds one trade into a metric reducer under `stat_key`, once per UTC
    /// offset. Unique-address counters come from the first-trade markers:
    /// the first trade ever also counts as the first of its day.
    fn fold_metric(
        &self,
        stats: &mut FxHashMap<String, TimezoneStats>,
        stat_key: &str,
        trade: &crate::models::TradeLog,
        info: &TradeInfo,
        first_trade_ever: &FxHashMap<String, u64>,
    ) -> Result<()> {
        let user = addr_key(&trade.user_address);
        for tz in timezones() {
            let bucket = Freq::Utc(tz).truncate(trade.timestamp);
            let entry = stats
                .entry(stat_key.to_string())
                .or_default()
                .entry(tz)
                .or_default()
                .entry(bucket)
                .or_default();
            if first_trade_ever.get(&user).copied() == Some(trade.timestamp) {
                entry.new_unique_addresses += 1;
                entry.unique_addr += 1;
                if info.kyc_ed {
                    entry.kyc_ed += 1;
                }
            } else {
                let first_in_day =
                    self.stats
                        .get_first_trade_in_day(&user, trade.timestamp, tz)?;
                if first_in_day == trade.timestamp {
                    entry.unique_addr += 1;
                    if info.kyc_ed {
                        entry.kyc_ed += 1;
                    }
                }
            }
            entry.eth_volume += info.eth_amount;
            entry.burn_fee += info.burn_fee;
            entry.trade_count += 1;
            entry.usd_volume += trade.fiat_amount;
        }
        Ok(())
    }
}

fn fold_burn_fee(
    stats: &mut FxHashMap<String, FreqStats<BurnFeeStats>>,
    key: &str,
    fee: f64,
    timestamp: u64,
) {
    for freq in FIXED_FREQUENCIES {
        let bucket = freq.truncate(timestamp);
        let entry = stats
            .entry(key.to_string())
            .or_default()
            .entry(freq)
            .or_default()
            .entry(bucket)
            .or_default();
        entry.total_burn_fee += fee;
    }
}

fn fold_volume(
    stats: &mut FxHashMap<String, FreqStats<VolumeStats>>,
    key: &str,
    amount: f64,
    eth_amount: f64,
    fiat_amount: f64,
    timestamp: u64,
) {
    for freq in FIXED_FREQUENCIES {
        let bucket = freq.truncate(timestamp);
        let entry = stats
            .entry(key.to_string())
            .or_default()
            .entry(freq)
            .or_default()
            .entry(bucket)
            .or_default();
        entry.volume += amount;
        entry.eth_volume += eth_amount;
        entry.usd_amount += fiat_amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Token, TokenTable, TradeLog};
    use crate::store::{StoreClient, UserStorage, DEFAULT_MAX_RANGE_NS};
    use crate::utils::time::to_millis;
    use alloy::primitives::{Address, B256, U256};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const ETH: u8 = 0xee;
    const KNC: u8 = 0x01;

    struct Fixture {
        processor: TradeLogProcessor,
        stats: Arc<StatStorage>,
        logs: Arc<LogStorage>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StoreClient::open(dir.path()).unwrap());
        let stats = Arc::new(StatStorage::new(store.clone()).unwrap());
        let logs = Arc::new(LogStorage::new(store.clone(), DEFAULT_MAX_RANGE_NS).unwrap());
        let users = Arc::new(UserStorage::new(store).unwrap());
        let tokens = TokenTable::new(vec![
            Token {
                id: "ETH".to_string(),
                address: Address::repeat_byte(ETH),
                decimals: 18,
            },
            Token {
                id: "KNC".to_string(),
                address: Address::repeat_byte(KNC),
                decimals: 18,
            },
        ]);
        let enricher = TradeEnricher::new(tokens, users);
        Fixture {
            processor: TradeLogProcessor::new(stats.clone(), logs.clone(), enricher),
            stats,
            logs,
            _dir: dir,
        }
    }

    fn eth(amount: f64) -> U256 {
        U256::from((amount * 1e18) as u128)
    }

    fn trade(timestamp: u64, user: u8, eth_amount: f64, seed: u8) -> TradeLog {
        TradeLog {
            timestamp,
            block_number: 100,
            tx_hash: B256::repeat_byte(seed),
            user_address: Address::repeat_byte(user),
            src_address: Address::repeat_byte(KNC),
            dest_address: Address::repeat_byte(ETH),
            src_amount: eth(10.0),
            dest_amount: eth(eth_amount),
            reserve_address: Address::repeat_byte(0x03),
            wallet_address: Address::repeat_byte(0xaa),
            burn_fee: Some(eth(0.1)),
            wallet_fee: Some(eth(0.05)),
            fiat_amount: eth_amount * 400.0,
            ip: String::new(),
            country: "DE".to_string(),
        }
    }

    fn tick_after(t: u64) -> DateTime<Utc> {
        Utc.timestamp_nanos(t as i64 + 1_000_000_000)
    }

    #[test]
    fn test_two_trades_in_one_minute() {
        let f = fixture();
        let t = 1_520_825_136_556_000_000u64;
        f.logs.store_trade_log(&trade(t, 0x99, 1.0, 1)).unwrap();
        f.logs
            .store_trade_log(&trade(t + 10_000_000_000, 0x99, 2.0, 2))
            .unwrap();

        let tick = tick_after(t + 10_000_000_000);
        f.processor.run_user_aggregation(tick).unwrap();
        f.processor.run_trade_summary_aggregation(tick).unwrap();

        let bucket = Freq::Utc(0).truncate(t);
        let ticks = f.stats.get_trade_summary(bucket, bucket, 0).unwrap();
        let summary = ticks.get(&to_millis(bucket)).unwrap();
        assert_eq!(summary.trade_count, 2);
        assert_eq!(summary.eth_volume, 3.0);
        assert_eq!(summary.eth_per_trade, 1.5);
        assert_eq!(summary.unique_addr, 1);
        assert_eq!(summary.new_unique_addresses, 1);
        assert_eq!(
            f.stats
                .get_last_processed_trade_log_timepoint(TRADE_SUMMARY_AGGREGATION)
                .unwrap(),
            t + 10_000_000_000
        );
    }

    #[test]
    fn test_two_users_same_day_unique_counts() {
        let f = fixture();
        let t = 1_520_825_136_556_000_000u64;
        f.logs.store_trade_log(&trade(t, 0x99, 1.0, 1)).unwrap();
        f.logs
            .store_trade_log(&trade(t + 1_000, 0x98, 2.0, 2))
            .unwrap();

        let tick = tick_after(t + 1_000);
        f.processor.run_user_aggregation(tick).unwrap();
        f.processor.run_trade_summary_aggregation(tick).unwrap();

        let bucket = Freq::Utc(0).truncate(t);
        let ticks = f.stats.get_trade_summary(bucket, bucket, 0).unwrap();
        let summary = ticks.get(&to_millis(bucket)).unwrap();
        assert_eq!(summary.unique_addr, 2);
        assert_eq!(summary.new_unique_addresses, 2);
    }

    #[test]
    fn test_user_pipeline_replay_is_idempotent() {
        let f = fixture();
        let t = 1_520_825_136_556_000_000u64;
        f.logs.store_trade_log(&trade(t, 0x99, 1.0, 1)).unwrap();
        f.logs
            .store_trade_log(&trade(t + 5_000, 0x99, 2.0, 2))
            .unwrap();

        let tick = tick_after(t + 5_000);
        f.processor.run_user_aggregation(tick).unwrap();
        let first = f.stats.get_all_first_trade_ever().unwrap();
        let in_day = f
            .stats
            .get_first_trade_in_day(&addr_key(&Address::repeat_byte(0x99)), t, 7)
            .unwrap();

        // replay the same window
        f.stats
            .set_last_processed_trade_log_timepoint(USER_AGGREGATION, 0)
            .unwrap();
        f.processor.run_user_aggregation(tick).unwrap();
        assert_eq!(f.stats.get_all_first_trade_ever().unwrap(), first);
        assert_eq!(
            f.stats
                .get_first_trade_in_day(&addr_key(&Address::repeat_byte(0x99)), t, 7)
                .unwrap(),
            in_day
        );
    }

    #[test]
    fn test_empty_range_advances_checkpoint_when_behind() {
        let f = fixture();
        let t1 = 1_000_000u64;
        let t2 = 10 * crate::utils::time::NANOS_PER_DAY;
        f.logs.store_trade_log(&trade(t1, 0x99, 1.0, 1)).unwrap();
        f.logs.store_trade_log(&trade(t2, 0x98, 1.0, 2)).unwrap();

        // t1 already processed; the next bounded window ends long before t2
        f.stats
            .set_last_processed_trade_log_timepoint(VOLUME_STAT_AGGREGATION, t1)
            .unwrap();
        f.processor.run_volume_aggregation(Utc::now()).unwrap();
        assert_eq!(
            f.stats
                .get_last_processed_trade_log_timepoint(VOLUME_STAT_AGGREGATION)
                .unwrap(),
            t1 + 1 + DEFAULT_MAX_RANGE_NS
        );
    }

    #[test]
    fn test_checkpoint_stays_put_when_fully_caught_up() {
        let f = fixture();
        let t = 1_000_000u64;
        f.logs.store_trade_log(&trade(t, 0x99, 1.0, 1)).unwrap();
        f.stats
            .set_last_processed_trade_log_timepoint(VOLUME_STAT_AGGREGATION, t)
            .unwrap();
        // window reaches past the newest trade; nothing new, no advance
        f.processor
            .run_volume_aggregation(Utc.timestamp_nanos((t + 500_000) as i64))
            .unwrap();
        assert_eq!(
            f.stats
                .get_last_processed_trade_log_timepoint(VOLUME_STAT_AGGREGATION)
                .unwrap(),
            t
        );
    }

    #[test]
    fn test_burn_fee_and_volume_pipelines() {
        let f = fixture();
        let t = 1_520_825_136_556_000_000u64;
        f.logs.store_trade_log(&trade(t, 0x99, 2.0, 1)).unwrap();

        let tick = tick_after(t);
        f.processor.run_burn_fee_aggregation(tick).unwrap();
        f.processor.run_volume_aggregation(tick).unwrap();

        let reserve = addr_key(&Address::repeat_byte(0x03));
        let wallet = addr_key(&Address::repeat_byte(0xaa));
        let bucket = Freq::Minute.truncate(t);

        let burn = f
            .stats
            .get_burn_fee(bucket, bucket, Freq::Minute, &reserve)
            .unwrap();
        assert_eq!(burn.get(&to_millis(bucket)), Some(&0.1));

        let wallet_fee = f
            .stats
            .get_wallet_fee(bucket, bucket, Freq::Minute, &reserve, &wallet)
            .unwrap();
        assert_eq!(wallet_fee.get(&to_millis(bucket)), Some(&0.05));

        // the eth leg accumulates under the dest token and the user
        let dst = addr_key(&Address::repeat_byte(ETH));
        let vol = f
            .stats
            .get_asset_volume(bucket, bucket, Freq::Minute, &dst)
            .unwrap();
        assert_eq!(vol.get(&to_millis(bucket)).unwrap().volume, 2.0);

        let user_vol = f
            .stats
            .get_user_volume(
                bucket,
                bucket,
                Freq::Minute,
                &addr_key(&Address::repeat_byte(0x99)),
            )
            .unwrap();
        assert_eq!(user_vol.get(&to_millis(bucket)).unwrap().eth_volume, 2.0);
    }

    #[test]
    fn test_wallet_and_country_pipelines() {
        let f = fixture();
        let t = 1_520_825_136_556_000_000u64;
        f.logs.store_trade_log(&trade(t, 0x99, 1.0, 1)).unwrap();

        let tick = tick_after(t);
        f.processor.run_user_aggregation(tick).unwrap();
        f.processor.run_wallet_aggregation(tick).unwrap();
        f.processor.run_country_aggregation(tick).unwrap();

        let wallet = addr_key(&Address::repeat_byte(0xaa));
        let bucket = Freq::Utc(7).truncate(t);
        let stats = f.stats.get_wallet_stats(bucket, bucket, &wallet, 7).unwrap();
        assert_eq!(stats.get(&to_millis(bucket)).unwrap().trade_count, 1);
        assert_eq!(f.stats.get_wallet_addresses().unwrap(), vec![wallet]);

        let country = f.stats.get_country_stats(bucket, bucket, "DE", 7).unwrap();
        assert_eq!(country.get(&to_millis(bucket)).unwrap().unique_addr, 1);
        assert_eq!(f.stats.get_countries().unwrap(), vec!["DE"]);
    }

    #[test]
    fn test_reserve_volume_pipeline_only_moves_checkpoint() {
        let f = fixture();
        let t = 1_520_825_136_556_000_000u64;
        f.logs.store_trade_log(&trade(t, 0x99, 1.0, 1)).unwrap();
        f.processor
            .run_reserve_volume_aggregation(tick_after(t))
            .unwrap();
        assert_eq!(
            f.stats
                .get_last_processed_trade_log_timepoint(RESERVE_VOLUME_AGGREGATION)
                .unwrap(),
            t
        );
    }
}
