use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Conversion and sanity rate for one token against ETH.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReserveRateEntry {
    pub rate: f64,
    pub sanity_rate: f64,
}

/// One snapshot of a reserve's token rates at a given block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReserveRates {
    /// Capture timepoint in nanoseconds.
    pub timestamp: u64,
    pub block_number: u64,
    /// Token id to rate entry.
    pub rates: HashMap<String, ReserveRateEntry>,
}
