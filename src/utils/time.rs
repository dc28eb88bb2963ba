//! Timepoint bucketing for aggregate statistics.
//!
//! All internal timestamps are unsigned nanoseconds since the Unix epoch.
//! Aggregates are keyed by the bucket start encoded as 8 big-endian bytes so
//! that raw byte order in the store matches chronological order.

use std::fmt;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};

pub const NANOS_PER_MINUTE: u64 = 60 * 1_000_000_000;
pub const NANOS_PER_HOUR: u64 = 3_600 * 1_000_000_000;
pub const NANOS_PER_DAY: u64 = 86_400 * 1_000_000_000;

/// Westernmost supported day-boundary offset.
pub const START_TIMEZONE: i64 = -11;
/// Easternmost supported day-boundary offset.
pub const END_TIMEZONE: i64 = 14;

/// All supported UTC day-boundary offsets, west to east.
pub fn timezones() -> impl Iterator<Item = i64> {
    START_TIMEZONE..=END_TIMEZONE
}

/// Truncation frequency for a bucketed aggregate.
///
/// `Utc(n)` is a day frequency whose boundary is shifted by `n` hours, for
/// `n` in [-11, 14].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Freq {
    Minute,
    Hour,
    Day,
    Utc(i64),
}

impl Freq {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "m" | "M" => Ok(Freq::Minute),
            "h" | "H" => Ok(Freq::Hour),
            "d" | "D" => Ok(Freq::Day),
            _ => {
                let offset: i64 = s
                    .strip_prefix("utc")
                    .ok_or_else(|| anyhow!("unknown frequency: {s}"))?
                    .parse()
                    .map_err(|_| anyhow!("unknown frequency: {s}"))?;
                if !(START_TIMEZONE..=END_TIMEZONE).contains(&offset) {
                    bail!("timezone offset {offset} out of range");
                }
                Ok(Freq::Utc(offset))
            },
        }
    }

    /// Store namespace segment holding buckets of this frequency.
    pub fn bucket_name(&self) -> String {
        match self {
            Freq::Minute => "minute".to_string(),
            Freq::Hour => "hour".to_string(),
            Freq::Day => "day".to_string(),
            Freq::Utc(offset) => format!("utc{offset}"),
        }
    }

    /// Truncates a nanosecond timepoint to the start of its bucket.
    pub fn truncate(&self, t: u64) -> u64 {
        match *self {
            Freq::Minute => t / NANOS_PER_MINUTE * NANOS_PER_MINUTE,
            Freq::Hour => t / NANOS_PER_HOUR * NANOS_PER_HOUR,
            Freq::Day => t / NANOS_PER_DAY * NANOS_PER_DAY,
            Freq::Utc(offset) => {
                let shift = offset.unsigned_abs() * NANOS_PER_HOUR;
                if offset >= 0 {
                    (t + shift) / NANOS_PER_DAY * NANOS_PER_DAY + shift
                } else {
                    (t.saturating_sub(shift) / NANOS_PER_DAY * NANOS_PER_DAY)
                        .saturating_sub(shift)
                }
            },
        }
    }

    /// Bucket start of `t`, encoded as a store key.
    pub fn bucket_key(&self, t: u64) -> [u8; 8] {
        u64_to_bytes(self.truncate(t))
    }
}

impl fmt::Display for Freq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freq::Minute => write!(f, "M"),
            Freq::Hour => write!(f, "H"),
            Freq::Day => write!(f, "D"),
            Freq::Utc(offset) => write!(f, "utc{offset}"),
        }
    }
}

pub fn u64_to_bytes(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Decodes an 8-byte big-endian key. Returns 0 on any other length.
pub fn bytes_to_u64(b: &[u8]) -> u64 {
    match <[u8; 8]>::try_from(b) {
        Ok(arr) => u64::from_be_bytes(arr),
        Err(_) => 0,
    }
}

/// Millisecond form used by the read APIs.
pub fn to_millis(ns: u64) -> u64 {
    ns / 1_000_000
}

/// Nanosecond timepoint of a wall-clock instant.
pub fn timepoint_ns(t: DateTime<Utc>) -> u64 {
    t.timestamp_nanos_opt().unwrap_or_default().max(0) as u64
}
