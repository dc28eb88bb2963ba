//! JSON-RPC implementation of the [`Blockchain`] capability.
//!
//! Trade logs are assembled per transaction: the network contract emits
//! `ExecuteTrade` while the fee burner emits the burn and wallet fee shares
//! as separate logs in the same transaction. Logs that fail to decode are
//! skipped with a warning; the rest of the window still goes through.

use alloy::{
    eips::BlockId,
    primitives::{Address, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log},
    sol_types::SolEvent,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use rustc_hash::FxHashMap;
use url::Url;

use crate::chain::abis::{AssignBurnFees, AssignEtherShare, ExecuteTrade, IWrapper, UserCategorySet};
use crate::chain::{Blockchain, RawLog};
use crate::config::ChainSettings;
use crate::models::{CatLog, ReserveRates, Token, TradeLog};
use crate::utils::time::timepoint_ns;
use crate::utils::u256_to_f64;

/// Decimals of the rate values returned by the wrapper contract.
const RATE_DECIMALS: u8 = 18;

pub struct RpcBlockchain {
    provider: DynProvider,
    network_address: Address,
    burner_address: Address,
    whitelist_address: Address,
    wrapper_address: Address,
}

/// Fee events seen before their transaction's `ExecuteTrade`.
#[derive(Default)]
struct PendingFees {
    burn: Option<(Address, U256)>,
    wallet: Option<(Address, U256)>,
}

impl RpcBlockchain {
    pub fn new(settings: &ChainSettings) -> Result<Self> {
        let url = Url::parse(&settings.endpoint).context("Invalid RPC endpoint")?;
        let provider = DynProvider::new(ProviderBuilder::new().connect_http(url));
        Ok(Self {
            provider,
            network_address: settings.network_address,
            burner_address: settings.burner_address,
            whitelist_address: settings.whitelist_address,
            wrapper_address: settings.wrapper_address,
        })
    }

    /// Block timestamps for every block the logs touch, in seconds.
    async fn block_timestamps(&self, logs: &[Log]) -> Result<FxHashMap<u64, u64>> {
        let mut timestamps: FxHashMap<u64, u64> = FxHashMap::default();
        let mut missing: Vec<u64> = Vec::new();
        for log in logs {
            let Some(block_number) = log.block_number else {
                continue;
            };
            match log.block_timestamp {
                Some(ts) => {
                    timestamps.insert(block_number, ts);
                },
                None => {
                    if !timestamps.contains_key(&block_number) && !missing.contains(&block_number) {
                        missing.push(block_number);
                    }
                },
            }
        }
        for block_number in missing {
            let block = self
                .provider
                .get_block_by_number(block_number.into())
                .await?
                .with_context(|| format!("block {block_number} not found"))?;
            timestamps.insert(block_number, block.header.timestamp);
        }
        Ok(timestamps)
    }
}

#[async_trait]
impl Blockchain for RpcBlockchain {
    async fn current_block(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>> {
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .address(vec![
                self.network_address,
                self.burner_address,
                self.whitelist_address,
            ]);
        let logs = self.provider.get_logs(&filter).await?;
        let timestamps = self.block_timestamps(&logs).await?;

        let mut out: Vec<RawLog> = Vec::with_capacity(logs.len());
        let mut trade_index: FxHashMap<B256, usize> = FxHashMap::default();
        let mut pending_fees: FxHashMap<B256, PendingFees> = FxHashMap::default();

        for log in &logs {
            let Some(topic0) = log.inner.data.topics().first().copied() else {
                continue;
            };
            let block_number = log.block_number.unwrap_or(0);
            let log_index = log.log_index.unwrap_or(0);
            let tx_hash = log.transaction_hash.unwrap_or_default();
            let block_ts = timestamps.get(&block_number).copied().unwrap_or(0);
            // nanosecond timepoint, disambiguated by log index within the block
            let timestamp = block_ts * 1_000_000_000 + log_index;

            if topic0 == ExecuteTrade::SIGNATURE_HASH {
                let event = match ExecuteTrade::decode_log_data(&log.inner.data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("skipping undecodable trade log in tx {tx_hash}: {e}");
                        continue;
                    },
                };
                let mut trade = TradeLog {
                    timestamp,
                    block_number,
                    tx_hash,
                    user_address: event.trader,
                    src_address: event.src,
                    dest_address: event.dest,
                    src_amount: event.actualSrcAmount,
                    dest_amount: event.actualDestAmount,
                    reserve_address: Address::ZERO,
                    wallet_address: Address::ZERO,
                    burn_fee: None,
                    wallet_fee: None,
                    fiat_amount: 0.0,
                    ip: String::new(),
                    country: String::new(),
                };
                if let Some(fees) = pending_fees.remove(&tx_hash) {
                    if let Some((reserve, fee)) = fees.burn {
                        trade.reserve_address = reserve;
                        trade.burn_fee = Some(fee);
                    }
                    if let Some((wallet, fee)) = fees.wallet {
                        trade.wallet_address = wallet;
                        trade.wallet_fee = Some(fee);
                    }
                }
                out.push(RawLog::Trade(trade));
                trade_index.insert(tx_hash, out.len() - 1);
            } else if topic0 == AssignBurnFees::SIGNATURE_HASH {
                let event = match AssignBurnFees::decode_log_data(&log.inner.data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("skipping undecodable burn fee log in tx {tx_hash}: {e}");
                        continue;
                    },
                };
                match trade_index.get(&tx_hash) {
                    Some(&i) => {
                        if let RawLog::Trade(trade) = &mut out[i] {
                            trade.reserve_address = event.reserve;
                            trade.burn_fee = Some(event.burnFee);
                        }
                    },
                    None => {
                        let fees = pending_fees.entry(tx_hash).or_default();
                        fees.burn = Some((event.reserve, event.burnFee));
                    },
                }
            } else if topic0 == AssignEtherShare::SIGNATURE_HASH {
                let event = match AssignEtherShare::decode_log_data(&log.inner.data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("skipping undecodable wallet fee log in tx {tx_hash}: {e}");
                        continue;
                    },
                };
                match trade_index.get(&tx_hash) {
                    Some(&i) => {
                        if let RawLog::Trade(trade) = &mut out[i] {
                            trade.wallet_address = event.wallet;
                            trade.wallet_fee = Some(event.walletFee);
                        }
                    },
                    None => {
                        let fees = pending_fees.entry(tx_hash).or_default();
                        fees.wallet = Some((event.wallet, event.walletFee));
                    },
                }
            } else if topic0 == UserCategorySet::SIGNATURE_HASH {
                let event = match UserCategorySet::decode_log_data(&log.inner.data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("skipping undecodable category log in tx {tx_hash}: {e}");
                        continue;
                    },
                };
                out.push(RawLog::SetCategory(CatLog {
                    timestamp,
                    block_number,
                    tx_hash,
                    address: event.user,
                    category: format!("{:#x}", event.category),
                }));
            }
        }

        if !pending_fees.is_empty() {
            warn!(
                "{} fee logs had no matching trade in their transaction",
                pending_fees.len()
            );
        }
        Ok(out)
    }

    async fn get_reserve_rates(
        &self,
        _from_block: u64,
        to_block: u64,
        reserve: Address,
        tokens: &[Token],
    ) -> Result<ReserveRates> {
        let wrapper = IWrapper::new(self.wrapper_address, &self.provider);
        let srcs: Vec<Address> = tokens.iter().map(|t| t.address).collect();
        // every token is quoted against ether
        let dests: Vec<Address> = vec![ETH_PLACEHOLDER; srcs.len()];
        let ret = wrapper
            .getReserveRate(reserve, srcs, dests)
            .block(BlockId::number(to_block))
            .call()
            .await
            .with_context(|| format!("getReserveRate failed for {reserve:#x}"))?;

        let mut rates = ReserveRates {
            timestamp: timepoint_ns(Utc::now()),
            block_number: to_block,
            ..Default::default()
        };
        for (i, token) in tokens.iter().enumerate() {
            let rate = ret.rates.get(i).copied().unwrap_or(U256::ZERO);
            let sanity = ret.sanityRates.get(i).copied().unwrap_or(U256::ZERO);
            rates.rates.insert(
                token.id.clone(),
                crate::models::ReserveRateEntry {
                    rate: u256_to_f64(rate, RATE_DECIMALS),
                    sanity_rate: u256_to_f64(sanity, RATE_DECIMALS),
                },
            );
        }
        Ok(rates)
    }
}

/// Sentinel address the wrapper contract uses for the ether leg.
const ETH_PLACEHOLDER: Address = Address::repeat_byte(0xee);
