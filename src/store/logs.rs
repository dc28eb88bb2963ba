//! Raw trade and category log storage.
//!
//! Logs are written once by the log fetcher and never mutated. Keys are the
//! 8-byte big-endian timestamp followed by a short hash suffix so two logs
//! landing in the same nanosecond cannot clobber each other while range
//! scans stay chronological.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::models::{CatLog, TradeLog};
use crate::store::client::StoreClient;
use crate::utils::time::{bytes_to_u64, u64_to_bytes, NANOS_PER_DAY};

const TRADE_LOGS: &str = "trade_logs";
const CAT_LOGS: &str = "cat_logs";
const LOG_STATE: &str = "log_state";
const LAST_BLOCK_KEY: &[u8] = b"last_block";

/// Widest timestamp window a single pipeline pull may request.
pub const DEFAULT_MAX_RANGE_NS: u64 = NANOS_PER_DAY;

const KEY_SUFFIX_LEN: usize = 4;

pub struct LogStorage {
    store: Arc<StoreClient>,
    max_range: u64,
}

impl LogStorage {
    pub fn new(store: Arc<StoreClient>, max_range: u64) -> Result<Self> {
        store.namespace(&[TRADE_LOGS])?;
        store.namespace(&[CAT_LOGS])?;
        store.namespace(&[LOG_STATE])?;
        Ok(Self { store, max_range })
    }

    /// Maximum window width accepted for a single pipeline run.
    pub fn max_range(&self) -> u64 {
        self.max_range
    }

    pub fn store_trade_log(&self, log: &TradeLog) -> Result<()> {
        let key = log_key(log.timestamp, &log.tx_hash.0);
        let value = serde_json::to_vec(log).context("Failed to encode trade log")?;
        self.store.put(TRADE_LOGS, &key, &value)
    }

    pub fn store_cat_log(&self, log: &CatLog) -> Result<()> {
        let key = log_key(log.timestamp, log.address.as_slice());
        let value = serde_json::to_vec(log).context("Failed to encode cat log")?;
        self.store.put(CAT_LOGS, &key, &value)
    }

    /// Trade logs with `from <= timestamp <= to`, in chronological order.
    pub fn get_trade_logs(&self, from: u64, to: u64) -> Result<Vec<TradeLog>> {
        let (lo, hi) = range_bounds(from, to);
        let mut out = Vec::new();
        for (_, v) in self.store.scan(TRADE_LOGS, &lo, &hi)? {
            let log: TradeLog = serde_json::from_slice(&v).context("Bad trade log entry")?;
            out.push(log);
        }
        Ok(out)
    }

    pub fn get_cat_logs(&self, from: u64, to: u64) -> Result<Vec<CatLog>> {
        let (lo, hi) = range_bounds(from, to);
        let mut out = Vec::new();
        for (_, v) in self.store.scan(CAT_LOGS, &lo, &hi)? {
            let log: CatLog = serde_json::from_slice(&v).context("Bad cat log entry")?;
            out.push(log);
        }
        Ok(out)
    }

    pub fn get_first_trade_log(&self) -> Result<Option<TradeLog>> {
        decode_edge(self.store.first(TRADE_LOGS)?)
    }

    pub fn get_last_trade_log(&self) -> Result<Option<TradeLog>> {
        decode_edge(self.store.last(TRADE_LOGS)?)
    }

    pub fn get_first_cat_log(&self) -> Result<Option<CatLog>> {
        decode_edge(self.store.first(CAT_LOGS)?)
    }

    pub fn get_last_cat_log(&self) -> Result<Option<CatLog>> {
        decode_edge(self.store.last(CAT_LOGS)?)
    }

    /// Highest fully fetched block, or 0 before the first fetch.
    pub fn last_block(&self) -> Result<u64> {
        Ok(self
            .store
            .get(LOG_STATE, LAST_BLOCK_KEY)?
            .map(|v| bytes_to_u64(&v))
            .unwrap_or(0))
    }

    pub fn update_log_block(&self, block: u64) -> Result<()> {
        self.store.put(LOG_STATE, LAST_BLOCK_KEY, &u64_to_bytes(block))
    }
}

fn log_key(timestamp: u64, disambiguator: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + KEY_SUFFIX_LEN);
    key.extend_from_slice(&u64_to_bytes(timestamp));
    key.extend_from_slice(&disambiguator[..KEY_SUFFIX_LEN.min(disambiguator.len())]);
    key
}

fn range_bounds(from: u64, to: u64) -> (Vec<u8>, Vec<u8>) {
    let mut lo = Vec::with_capacity(8 + KEY_SUFFIX_LEN);
    lo.extend_from_slice(&u64_to_bytes(from));
    lo.extend_from_slice(&[0x00; KEY_SUFFIX_LEN]);
    let mut hi = Vec::with_capacity(8 + KEY_SUFFIX_LEN);
    hi.extend_from_slice(&u64_to_bytes(to));
    hi.extend_from_slice(&[0xff; KEY_SUFFIX_LEN]);
    (lo, hi)
}

fn decode_edge<T: serde::de::DeserializeOwned>(entry: Option<(Vec<u8>, Vec<u8>)>) -> Result<Option<T>> {
    match entry {
        Some((_, v)) => Ok(Some(serde_json::from_slice(&v).context("Bad log entry")?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256, U256};
    use tempfile::TempDir;

    fn open_logs() -> (LogStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StoreClient::open(dir.path()).unwrap());
        (LogStorage::new(store, DEFAULT_MAX_RANGE_NS).unwrap(), dir)
    }

    fn trade(timestamp: u64, seed: u8) -> TradeLog {
        TradeLog {
            timestamp,
            block_number: 100,
            tx_hash: B256::repeat_byte(seed),
            user_address: Address::repeat_byte(seed),
            src_address: Address::repeat_byte(1),
            dest_address: Address::repeat_byte(2),
            src_amount: U256::from(10u64),
            dest_amount: U256::from(20u64),
            reserve_address: Address::repeat_byte(3),
            wallet_address: Address::repeat_byte(4),
            burn_fee: None,
            wallet_fee: None,
            fiat_amount: 0.0,
            ip: String::new(),
            country: String::new(),
        }
    }

    #[test]
    fn test_trade_log_range_query() {
        let (logs, _dir) = open_logs();
        for (t, seed) in [(100u64, 1u8), (200, 2), (300, 3)] {
            logs.store_trade_log(&trade(t, seed)).unwrap();
        }
        let hits = logs.get_trade_logs(100, 200).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].timestamp, 100);
        assert_eq!(hits[1].timestamp, 200);
        assert!(logs.get_trade_logs(400, 500).unwrap().is_empty());
    }

    #[test]
    fn test_same_nanosecond_logs_are_kept_apart() {
        let (logs, _dir) = open_logs();
        logs.store_trade_log(&trade(100, 1)).unwrap();
        logs.store_trade_log(&trade(100, 2)).unwrap();
        assert_eq!(logs.get_trade_logs(100, 100).unwrap().len(), 2);
    }

    #[test]
    fn test_first_and_last() {
        let (logs, _dir) = open_logs();
        assert!(logs.get_first_trade_log().unwrap().is_none());
        logs.store_trade_log(&trade(200, 2)).unwrap();
        logs.store_trade_log(&trade(100, 1)).unwrap();
        assert_eq!(logs.get_first_trade_log().unwrap().unwrap().timestamp, 100);
        assert_eq!(logs.get_last_trade_log().unwrap().unwrap().timestamp, 200);
    }

    #[test]
    fn test_last_block_checkpoint() {
        let (logs, _dir) = open_logs();
        assert_eq!(logs.last_block().unwrap(), 0);
        logs.update_log_block(93).unwrap();
        assert_eq!(logs.last_block().unwrap(), 93);
    }
}
