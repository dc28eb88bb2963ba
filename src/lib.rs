pub mod chain;
pub mod config;
pub mod geo;
pub mod models;
pub mod store;
pub mod utils;
pub mod worker;

pub use config::Settings;
pub use store::{LogStorage, RateStorage, StatStorage, StoreClient, UserStorage};
pub use worker::{Fetcher, TickerSource, TradeEnricher, TradeLogProcessor};
