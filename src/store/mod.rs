pub mod client;
pub mod logs;
pub mod rates;
pub mod stat;
pub mod users;

pub use client::{StoreClient, StoreTxn};
pub use logs::{LogStorage, DEFAULT_MAX_RANGE_NS};
pub use rates::{RateStorage, MAX_VERSIONS};
pub use stat::{StatStorage, StatTicks, TRADE_SUMMARY_KEY};
pub use users::UserStorage;
