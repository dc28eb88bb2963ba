//! Utility functions shared across the pipeline.
//!
//! - [`conversion`] - base-unit to f64 conversions and hex encoding
//! - [`time`] - timepoint bucketing and big-endian key codecs

pub mod conversion;
pub mod time;

use alloy::primitives::Address;

pub use conversion::{hex_encode, u256_to_f64, u256_to_f64_safe};

/// Canonical lowercase form of an address, used for store keys and user
/// identity comparisons.
pub fn addr_key(addr: &Address) -> String {
    format!("{addr:#x}")
}
