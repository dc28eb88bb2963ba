mod config;

pub use config::{ChainSettings, FetcherSettings, GeoSettings, Settings, StoreSettings};
