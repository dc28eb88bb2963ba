//! Worker orchestration.
//!
//! `Fetcher` owns the storages and the chain capability and runs five
//! long-running workers: block fetcher, log fetcher, reserve rate fetcher,
//! trade log processor and category log processor. Workers coordinate only
//! through the store; each one is a select loop over its tick channel and
//! the cancellation token, and one failing tick never kills the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy::primitives::Address;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chain::{Blockchain, RawLog};
use crate::config::ChainSettings;
use crate::geo::GeoResolver;
use crate::models::{Token, TokenTable};
use crate::store::{LogStorage, RateStorage, UserStorage};
use crate::utils::time::timepoint_ns;
use crate::utils::{addr_key, hex_encode};
use crate::worker::aggregation::TradeLogProcessor;
use crate::worker::ticker::TickerSource;

/// Blocks withheld from processing at the chain tip.
pub const REORG_BLOCK_SAFE: u64 = 7;

/// Upper bound on blocks fetched per log tick, roughly six hours of chain.
const LOG_FETCH_WINDOW: u64 = 1440;

pub struct Fetcher {
    logs: Arc<LogStorage>,
    users: Arc<UserStorage>,
    rates: Arc<RateStorage>,
    blockchain: Arc<dyn Blockchain>,
    geo: Arc<GeoResolver>,
    processor: TradeLogProcessor,
    tokens: TokenTable,
    deploy_block: u64,
    reserve_address: Address,
    third_party_reserves: Vec<Address>,
    current_block: AtomicU64,
    current_block_update_time: AtomicU64,
}

impl Fetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logs: Arc<LogStorage>,
        users: Arc<UserStorage>,
        rates: Arc<RateStorage>,
        blockchain: Arc<dyn Blockchain>,
        geo: Arc<GeoResolver>,
        processor: TradeLogProcessor,
        tokens: TokenTable,
        chain: &ChainSettings,
    ) -> Self {
        Self {
            logs,
            users,
            rates,
            blockchain,
            geo,
            processor,
            tokens,
            deploy_block: chain.deploy_block,
            reserve_address: chain.reserve_address,
            third_party_reserves: chain.third_party_reserves.clone(),
            current_block: AtomicU64::new(0),
            current_block_update_time: AtomicU64::new(0),
        }
    }

    /// Spawns the five workers. They exit at their next tick after the token
    /// is cancelled; await the returned handles for a clean shutdown.
    pub fn spawn_workers(
        self: &Arc<Self>,
        tickers: TickerSource,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let TickerSource {
            block_ticker,
            log_ticker,
            reserve_rates_ticker,
            trade_log_ticker,
            cat_log_ticker,
        } = tickers;
        vec![
            self.clone().spawn_block_fetcher(block_ticker, cancel.clone()),
            self.clone().spawn_log_fetcher(log_ticker, cancel.clone()),
            self.clone()
                .spawn_reserve_rates_fetcher(reserve_rates_ticker, cancel.clone()),
            self.clone()
                .spawn_trade_log_processor(trade_log_ticker, cancel.clone()),
            self.clone()
                .spawn_cat_log_processor(cat_log_ticker, cancel.clone()),
        ]
    }

    pub fn current_block(&self) -> u64 {
        self.current_block.load(Ordering::Acquire)
    }

    pub fn current_block_update_time(&self) -> u64 {
        self.current_block_update_time.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Block fetcher
    // ------------------------------------------------------------------

    fn spawn_block_fetcher(
        self: Arc<Self>,
        mut ticker: mpsc::Receiver<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = ticker.recv() => {
                        if tick.is_none() {
                            break;
                        }
                        self.fetch_current_block().await;
                    }
                }
            }
            info!("block fetcher stopped");
        })
    }

    async fn fetch_current_block(&self) {
        match self.blockchain.current_block().await {
            Ok(block) => {
                // freshness timestamp goes first so readers never pair a new
                // block with a stale update time
                self.current_block_update_time
                    .store(timepoint_ns(Utc::now()), Ordering::Release);
                self.current_block.store(block, Ordering::Release);
            },
            Err(e) => warn!("fetching current block failed: {e:#}"),
        }
    }

    // ------------------------------------------------------------------
    // Log fetcher
    // ------------------------------------------------------------------

    fn spawn_log_fetcher(
        self: Arc<Self>,
        mut ticker: mpsc::Receiver<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = ticker.recv() => {
                        let Some(t) = tick else { break };
                        if let Err(e) = self.run_log_fetch(t).await {
                            error!("log fetch tick failed: {e:#}");
                        }
                    }
                }
            }
            info!("log fetcher stopped");
        })
    }

    async fn run_log_fetch(&self, tick: DateTime<Utc>) -> Result<()> {
        let timepoint = timepoint_ns(tick);
        let mut last_block = self.logs.last_block()?;
        if last_block == 0 {
            last_block = self.deploy_block;
        }
        let safe_head = self.current_block().saturating_sub(REORG_BLOCK_SAFE);
        let Some((from_block, to_block)) = fetch_window(last_block, safe_head) else {
            return Ok(());
        };
        match self.fetch_logs(from_block, to_block, timepoint).await {
            Err(e) => {
                // roll back to the block before the window so the whole
                // window retries on the next tick
                warn!("fetching logs [{from_block}, {to_block}] failed, will retry: {e:#}");
            },
            Ok(mut next_block) => {
                if next_block == last_block && to_block < safe_head {
                    // empty window strictly behind the safe head: skip it.
                    // at the head we keep querying the same window so node
                    // inconsistencies cannot drop logs.
                    next_block = to_block;
                }
                if next_block > last_block {
                    self.logs.update_log_block(next_block)?;
                    info!("log fetcher advanced to block {next_block}");
                }
            },
        }
        Ok(())
    }

    /// Fetches and persists one window. Returns the highest block among the
    /// returned logs, or `from_block - 1` when the window held none.
    async fn fetch_logs(&self, from_block: u64, to_block: u64, _timepoint: u64) -> Result<u64> {
        let raw_logs = self.blockchain.get_logs(from_block, to_block).await?;
        // the checkpoint follows the returned logs, independent of whether
        // each individual store call below succeeds
        let max_block = raw_logs.iter().map(RawLog::block_number).max().unwrap_or(0);
        for raw in raw_logs {
            match raw {
                RawLog::Trade(mut trade) => {
                    let (ip, country) =
                        self.geo.trade_geo(&hex_encode(trade.tx_hash.as_slice())).await;
                    trade.ip = ip;
                    trade.country = country;
                    if let Err(e) = self.logs.store_trade_log(&trade) {
                        warn!(
                            "storing trade log {} failed, skipping it: {e:#}",
                            trade.tx_hash
                        );
                    }
                },
                RawLog::SetCategory(cat) => {
                    if let Err(e) = self.logs.store_cat_log(&cat) {
                        warn!("storing cat log {} failed, skipping it: {e:#}", cat.tx_hash);
                    }
                },
            }
        }
        Ok(if max_block == 0 {
            from_block - 1
        } else {
            max_block
        })
    }

    // ------------------------------------------------------------------
    // Reserve rates
    // ------------------------------------------------------------------

    fn spawn_reserve_rates_fetcher(
        self: Arc<Self>,
        mut ticker: mpsc::Receiver<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = ticker.recv() => {
                        let Some(t) = tick else { break };
                        // a store failure here means a broken version
                        // invariant; stop instead of overwriting blindly
                        if let Err(e) = self.fetch_reserve_rates(timepoint_ns(t)).await {
                            error!("reserve rate fetch failed, stopping worker: {e:#}");
                            break;
                        }
                    }
                }
            }
            info!("reserve rate fetcher stopped");
        })
    }

    async fn fetch_reserve_rates(&self, timepoint: u64) -> Result<()> {
        // one block snapshot for the whole fan-out keeps the reserves
        // comparable
        let block = self.current_block();
        if block <= 1 {
            return Ok(());
        }
        let tokens: Vec<Token> = self.tokens.non_eth();
        let mut reserves = self.third_party_reserves.clone();
        reserves.push(self.reserve_address);

        let lookups = reserves.into_iter().map(|reserve| {
            let blockchain = self.blockchain.clone();
            let tokens = tokens.clone();
            async move {
                let rates = blockchain
                    .get_reserve_rates(block - 1, block, reserve, &tokens)
                    .await;
                (reserve, rates)
            }
        });

        for (reserve, rates) in futures::future::join_all(lookups).await {
            match rates {
                Ok(rates) => {
                    self.rates
                        .store_reserve_rates(&addr_key(&reserve), &rates, timepoint)?;
                },
                Err(e) => warn!("fetching rates of reserve {reserve:#x} failed: {e:#}"),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trade and category log processors
    // ------------------------------------------------------------------

    fn spawn_trade_log_processor(
        self: Arc<Self>,
        mut ticker: mpsc::Receiver<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = ticker.recv() => {
                        let Some(t) = tick else { break };
                        self.processor.run_all(t);
                    }
                }
            }
            info!("trade log processor stopped");
        })
    }

    fn spawn_cat_log_processor(
        self: Arc<Self>,
        mut ticker: mpsc::Receiver<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = ticker.recv() => {
                        let Some(t) = tick else { break };
                        if let Err(e) = self.run_cat_log_processing(t) {
                            error!("cat log tick failed: {e:#}");
                        }
                    }
                }
            }
            info!("cat log processor stopped");
        })
    }

    fn run_cat_log_processing(&self, tick: DateTime<Utc>) -> Result<()> {
        let mut from = self.users.get_last_processed_cat_log_timepoint()? + 1;
        if from == 1 {
            match self.logs.get_first_cat_log()? {
                Some(first) => from = first.timestamp - 1,
                None => return Ok(()),
            }
        }
        let mut to = timepoint_ns(tick);
        if to.saturating_sub(from) > self.logs.max_range() {
            to = from + self.logs.max_range();
        }
        let cat_logs = self.logs.get_cat_logs(from, to)?;
        if cat_logs.is_empty() {
            if let Some(last) = self.logs.get_last_cat_log()? {
                if to < last.timestamp {
                    self.users.set_last_processed_cat_log_timepoint(to)?;
                }
            }
            return Ok(());
        }
        info!("processing {} cat logs from {from} to {to}", cat_logs.len());
        let mut last = 0u64;
        for log in &cat_logs {
            match self
                .users
                .update_address_category(&addr_key(&log.address), &log.category)
            {
                Ok(()) => last = last.max(log.timestamp),
                Err(e) => warn!("updating category of {:#x} failed: {e:#}", log.address),
            }
        }
        if last > 0 {
            self.users.set_last_processed_cat_log_timepoint(last)?;
        }
        Ok(())
    }
}

/// Next block window to fetch, honouring the per-tick block cap and the
/// reorg safety margin. `None` when there is nothing safe to fetch yet.
fn fetch_window(last_block: u64, safe_head: u64) -> Option<(u64, u64)> {
    let to_block = (last_block + 1 + LOG_FETCH_WINDOW).min(safe_head);
    (last_block + 1 <= to_block).then_some((last_block + 1, to_block))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_window_honours_reorg_margin() {
        // head 100 with 7 withheld blocks caps the window at 93
        assert_eq!(fetch_window(50, 100 - REORG_BLOCK_SAFE), Some((51, 93)));
        // after catching up to 93, head 101 yields exactly one new block
        assert_eq!(fetch_window(93, 101 - REORG_BLOCK_SAFE), Some((94, 94)));
    }

    #[test]
    fn test_fetch_window_caps_at_block_limit() {
        assert_eq!(fetch_window(0, 10_000), Some((1, 1441)));
    }

    #[test]
    fn test_fetch_window_empty_near_head() {
        assert_eq!(fetch_window(93, 93), None);
        assert_eq!(fetch_window(5, 0), None);
    }
}
