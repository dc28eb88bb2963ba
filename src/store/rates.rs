//! Reserve rate snapshot storage.
//!
//! Snapshots are versioned under `reserve_rates/<reserveAddr>` keyed by
//! capture timepoint. A namespace is capped at [`MAX_VERSIONS`] entries;
//! older versions are pruned oldest-first on every write.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::models::ReserveRates;
use crate::store::client::StoreClient;
use crate::utils::time::{bytes_to_u64, to_millis, u64_to_bytes};

const RESERVE_RATES: &str = "reserve_rates";

/// Cap on retained snapshots per reserve.
pub const MAX_VERSIONS: usize = 1000;

pub struct RateStorage {
    store: Arc<StoreClient>,
}

impl RateStorage {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Persists one snapshot and prunes the namespace back under the version
    /// cap, oldest entries first. Pruning a namespace that claims versions it
    /// does not have is an invariant violation and aborts the write.
    pub fn store_reserve_rates(
        &self,
        reserve_addr: &str,
        rates: &ReserveRates,
        timepoint: u64,
    ) -> Result<()> {
        let ns = self.store.namespace(&[RESERVE_RATES, reserve_addr])?;
        self.store.update(|txn| {
            let keys = txn.keys(&ns)?;
            let mut count = keys.len();
            let mut doomed = keys.iter();
            while count >= MAX_VERSIONS {
                let Some(key) = doomed.next() else {
                    bail!("no versions left to prune in {ns}");
                };
                txn.delete(&ns, key)?;
                count -= 1;
            }
            let value = serde_json::to_vec(rates).context("Failed to encode reserve rates")?;
            txn.put(&ns, &u64_to_bytes(timepoint), &value)
        })
    }

    /// Snapshots captured within `[from, to]` nanoseconds, keyed by capture
    /// time in milliseconds.
    pub fn get_reserve_rates(
        &self,
        from: u64,
        to: u64,
        reserve_addr: &str,
    ) -> Result<BTreeMap<u64, ReserveRates>> {
        let ns = self.store.namespace(&[RESERVE_RATES, reserve_addr])?;
        let mut out = BTreeMap::new();
        for (k, v) in self.store.scan(&ns, &u64_to_bytes(from), &u64_to_bytes(to))? {
            let rates: ReserveRates =
                serde_json::from_slice(&v).context("Bad reserve rates entry")?;
            out.insert(to_millis(bytes_to_u64(&k)), rates);
        }
        Ok(out)
    }

    pub fn latest_reserve_rates(&self, reserve_addr: &str) -> Result<Option<ReserveRates>> {
        let ns = self.store.namespace(&[RESERVE_RATES, reserve_addr])?;
        match self.store.last(&ns)? {
            Some((_, v)) => Ok(Some(
                serde_json::from_slice(&v).context("Bad reserve rates entry")?,
            )),
            None => Ok(None),
        }
    }
}
