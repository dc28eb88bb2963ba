use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::utils::time::Freq;

/// Additive token volume totals for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeStats {
    pub volume: f64,
    pub eth_volume: f64,
    pub usd_amount: f64,
}

impl VolumeStats {
    pub fn absorb(&mut self, other: &VolumeStats) {
        self.volume += other.volume;
        self.eth_volume += other.eth_volume;
        self.usd_amount += other.usd_amount;
    }
}

/// Accumulated burn or wallet fees for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurnFeeStats {
    pub total_burn_fee: f64,
}

impl BurnFeeStats {
    pub fn absorb(&mut self, other: &BurnFeeStats) {
        self.total_burn_fee += other.total_burn_fee;
    }
}

/// Per-bucket trade metrics for the summary, wallet and country aggregates.
///
/// `eth_per_trade` and `usd_per_trade` are derived from the additive fields
/// and recomputed on every merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricStats {
    pub eth_volume: f64,
    pub usd_volume: f64,
    pub burn_fee: f64,
    pub trade_count: u64,
    pub unique_addr: u64,
    pub new_unique_addresses: u64,
    pub kyc_ed: u64,
    pub eth_per_trade: f64,
    pub usd_per_trade: f64,
}

impl MetricStats {
    /// Adds `other` into self and recomputes the per-trade averages.
    pub fn absorb(&mut self, other: &MetricStats) {
        self.eth_volume += other.eth_volume;
        self.usd_volume += other.usd_volume;
        self.burn_fee += other.burn_fee;
        self.trade_count += other.trade_count;
        self.unique_addr += other.unique_addr;
        self.new_unique_addresses += other.new_unique_addresses;
        self.kyc_ed += other.kyc_ed;
        if self.trade_count > 0 {
            self.eth_per_trade = self.eth_volume / self.trade_count as f64;
            self.usd_per_trade = self.usd_volume / self.trade_count as f64;
        }
    }
}

/// Bucket start (nanoseconds) to accumulated stats.
pub type BucketStats<T> = FxHashMap<u64, T>;

/// Per-frequency bucket maps, used by the volume and burn-fee reducers.
pub type FreqStats<T> = FxHashMap<Freq, BucketStats<T>>;

/// Per-UTC-offset bucket maps, used by the metric reducers.
pub type TimezoneStats = FxHashMap<i64, BucketStats<MetricStats>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_absorb_recomputes_averages() {
        let mut stats = MetricStats::default();
        stats.absorb(&MetricStats {
            eth_volume: 1.0,
            usd_volume: 400.0,
            trade_count: 1,
            ..Default::default()
        });
        stats.absorb(&MetricStats {
            eth_volume: 2.0,
            usd_volume: 800.0,
            trade_count: 1,
            ..Default::default()
        });
        assert_eq!(stats.trade_count, 2);
        assert_eq!(stats.eth_volume, 3.0);
        assert_eq!(stats.eth_per_trade, 1.5);
        assert_eq!(stats.usd_per_trade, 600.0);
    }

    #[test]
    fn test_stats_deserialize_from_partial_json() {
        let v: VolumeStats = serde_json::from_str(r#"{"eth_volume":2.0}"#).unwrap();
        assert_eq!(v.eth_volume, 2.0);
        assert_eq!(v.volume, 0.0);
    }
}
