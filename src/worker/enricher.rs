//! Trade enrichment.
//!
//! Resolves a raw trade log into normalised amounts and the user's KYC
//! status. Amounts come out as floats (base units divided by 10^decimals);
//! the accumulated sums therefore carry float rounding and are not suitable
//! for accounting.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use anyhow::Result;

use crate::models::{TokenTable, TradeLog};
use crate::store::UserStorage;
use crate::utils::{addr_key, u256_to_f64};

/// Normalised amounts and identity flags for one trade.
#[derive(Debug, Clone, Copy, Default)]
pub struct TradeInfo {
    pub src_amount: f64,
    pub dest_amount: f64,
    pub eth_amount: f64,
    pub burn_fee: f64,
    pub wallet_fee: f64,
    pub kyc_ed: bool,
}

pub struct TradeEnricher {
    tokens: TokenTable,
    users: Arc<UserStorage>,
}

impl TradeEnricher {
    pub fn new(tokens: TokenTable, users: Arc<UserStorage>) -> Self {
        Self { tokens, users }
    }

    pub fn trade_info(&self, trade: &TradeLog) -> Result<TradeInfo> {
        let mut info = TradeInfo::default();

        if let Some(token) = self.tokens.by_address(&trade.src_address) {
            info.src_amount = u256_to_f64(trade.src_amount, token.decimals);
            if token.is_eth() {
                info.eth_amount = info.src_amount;
            }
        }
        if let Some(token) = self.tokens.by_address(&trade.dest_address) {
            info.dest_amount = u256_to_f64(trade.dest_amount, token.decimals);
            if token.is_eth() {
                info.eth_amount = info.dest_amount;
            }
        }

        let eth_decimals = self.tokens.eth().map(|t| t.decimals).unwrap_or(18);
        if let Some(fee) = trade.burn_fee {
            info.burn_fee = u256_to_f64(fee, eth_decimals);
        }
        if let Some(fee) = trade.wallet_fee {
            info.wallet_fee = u256_to_f64(fee, eth_decimals);
        }

        let user_addr = addr_key(&trade.user_address);
        let (email, registered_at) = self.users.get_user_of_address(&user_addr)?;
        // a trade counts as KYC-ed when its address maps to a real account
        // handle registered strictly before the trade
        info.kyc_ed =
            !email.is_empty() && email != user_addr && trade.timestamp > registered_at;

        Ok(info)
    }
}

/// Fee-sharing wallets live above 2^128; anything lower is an internal
/// sentinel and is excluded from the wallet aggregate.
pub fn is_countable_wallet(addr: &Address) -> bool {
    U256::from_be_slice(addr.as_slice()) >= (U256::from(1u64) << 128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Token;
    use crate::store::StoreClient;
    use alloy::primitives::B256;
    use tempfile::TempDir;

    fn table() -> TokenTable {
        TokenTable::new(vec![
            Token {
                id: "ETH".to_string(),
                address: Address::repeat_byte(0xee),
                decimals: 18,
            },
            Token {
                id: "KNC".to_string(),
                address: Address::repeat_byte(0x01),
                decimals: 18,
            },
        ])
    }

    fn enricher() -> (TradeEnricher, Arc<UserStorage>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StoreClient::open(dir.path()).unwrap());
        let users = Arc::new(UserStorage::new(store).unwrap());
        (TradeEnricher::new(table(), users.clone()), users, dir)
    }

    fn trade(timestamp: u64) -> TradeLog {
        TradeLog {
            timestamp,
            block_number: 1,
            tx_hash: B256::ZERO,
            user_address: Address::repeat_byte(0x99),
            src_address: Address::repeat_byte(0x01),
            dest_address: Address::repeat_byte(0xee),
            src_amount: U256::from(2_000_000_000_000_000_000u128),
            dest_amount: U256::from(1_000_000_000_000_000_000u128),
            reserve_address: Address::repeat_byte(0x03),
            wallet_address: Address::repeat_byte(0x04),
            burn_fee: Some(U256::from(500_000_000_000_000_000u128)),
            wallet_fee: None,
            fiat_amount: 400.0,
            ip: String::new(),
            country: String::new(),
        }
    }

    #[test]
    fn test_amount_normalisation() {
        let (enricher, _users, _dir) = enricher();
        let info = enricher.trade_info(&trade(100)).unwrap();
        assert_eq!(info.src_amount, 2.0);
        assert_eq!(info.dest_amount, 1.0);
        // the dest leg is the ether side
        assert_eq!(info.eth_amount, 1.0);
        assert_eq!(info.burn_fee, 0.5);
        assert_eq!(info.wallet_fee, 0.0);
    }

    #[test]
    fn test_kyc_requires_registration_before_trade() {
        let (enricher, users, _dir) = enricher();
        let user = addr_key(&Address::repeat_byte(0x99));

        // unclaimed address: never KYC-ed
        assert!(!enricher.trade_info(&trade(110)).unwrap().kyc_ed);

        users
            .update_address_category(&user, "0x4")
            .unwrap();
        users
            .update_user_addresses("v@example", &[user.clone()], &[100])
            .unwrap();

        assert!(!enricher.trade_info(&trade(90)).unwrap().kyc_ed);
        assert!(!enricher.trade_info(&trade(100)).unwrap().kyc_ed);
        assert!(enricher.trade_info(&trade(110)).unwrap().kyc_ed);
    }

    #[test]
    fn test_wallet_threshold() {
        assert!(!is_countable_wallet(&Address::repeat_byte(0x00)));
        // low half of the address space is reserved
        let mut low = [0u8; 20];
        low[19] = 0x7f;
        assert!(!is_countable_wallet(&Address::from(low)));
        assert!(is_countable_wallet(&Address::repeat_byte(0xaa)));
    }
}
