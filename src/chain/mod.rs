//! Blockchain capability.
//!
//! The rest of the pipeline only sees this trait: a source of decoded logs
//! in bounded block windows, the current head, and per-reserve rate queries.

pub mod abis;
pub mod rpc;

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;

use crate::models::{CatLog, ReserveRates, Token, TradeLog};

pub use rpc::RpcBlockchain;

/// A decoded chain log, dispatched by tag.
#[derive(Debug, Clone)]
pub enum RawLog {
    Trade(TradeLog),
    SetCategory(CatLog),
}

impl RawLog {
    pub fn block_number(&self) -> u64 {
        match self {
            RawLog::Trade(log) => log.block_number,
            RawLog::SetCategory(log) => log.block_number,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            RawLog::Trade(log) => log.timestamp,
            RawLog::SetCategory(log) => log.timestamp,
        }
    }
}

#[async_trait]
pub trait Blockchain: Send + Sync {
    /// Current head block number.
    async fn current_block(&self) -> Result<u64>;

    /// Decoded trade and category logs in `[from_block, to_block]`.
    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>>;

    /// Conversion rates offered by `reserve` for `tokens` over the given
    /// block window.
    async fn get_reserve_rates(
        &self,
        from_block: u64,
        to_block: u64,
        reserve: Address,
        tokens: &[Token],
    ) -> Result<ReserveRates>;
}
