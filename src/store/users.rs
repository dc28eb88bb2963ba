//! User identity storage.
//!
//! Maps user addresses to account handles with a pending/confirmed
//! lifecycle: an address claimed by a user stays pending until a category
//! log is observed for it. The address-to-user and user-to-addresses
//! relations are kept as two independent indexes. All emails, addresses and
//! categories are compared in lower case.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::client::{StoreClient, StoreTxn};
use crate::utils::time::{bytes_to_u64, u64_to_bytes};

const ADDRESS_USER: &str = "address_user";
const USER_ADDRESSES: &str = "user_addresses";
const PENDING_ADDRESSES: &str = "pending_addresses";
const ADDRESS_CATEGORY: &str = "address_category";
const USER_STATE: &str = "user_state";
const CAT_LOG_TIMEPOINT_KEY: &[u8] = b"cat_log_timepoint";

/// A user's claim on one address.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddressClaim {
    user: String,
    timestamp: u64,
}

pub struct UserStorage {
    store: Arc<StoreClient>,
}

impl UserStorage {
    pub fn new(store: Arc<StoreClient>) -> Result<Self> {
        store.namespace(&[ADDRESS_USER])?;
        store.namespace(&[USER_ADDRESSES])?;
        store.namespace(&[PENDING_ADDRESSES])?;
        store.namespace(&[ADDRESS_CATEGORY])?;
        store.namespace(&[USER_STATE])?;
        Ok(Self { store })
    }

    /// Replaces the address list of `user`. Addresses the user claimed
    /// before but which are missing from the new list are dropped; addresses
    /// without an observed category go to the pending set, the rest are
    /// confirmed immediately.
    pub fn update_user_addresses(
        &self,
        user: &str,
        addresses: &[String],
        timestamps: &[u64],
    ) -> Result<()> {
        let user = user.to_lowercase();
        let claims: Vec<(String, u64)> = addresses
            .iter()
            .zip(timestamps)
            .map(|(a, t)| (a.to_lowercase(), *t))
            .collect();

        self.store.update(|txn| {
            // everything this user claimed before, confirmed or pending
            let mut previous: Vec<String> = read_address_list(txn, &user)?
                .into_iter()
                .map(|(addr, _)| addr)
                .collect();
            for (key, value) in txn.scan_all(PENDING_ADDRESSES)? {
                let claim: AddressClaim =
                    serde_json::from_slice(&value).context("Bad pending claim")?;
                if claim.user == user {
                    previous.push(String::from_utf8_lossy(&key).into_owned());
                }
            }

            for addr in &previous {
                if !claims.iter().any(|(a, _)| a == addr) {
                    txn.delete(ADDRESS_USER, addr.as_bytes())?;
                    txn.delete(PENDING_ADDRESSES, addr.as_bytes())?;
                }
            }

            let mut confirmed: Vec<(String, u64)> = Vec::with_capacity(claims.len());
            for (addr, timestamp) in &claims {
                let claim = AddressClaim {
                    user: user.clone(),
                    timestamp: *timestamp,
                };
                let encoded = serde_json::to_vec(&claim).context("Failed to encode claim")?;
                if txn.get(ADDRESS_CATEGORY, addr.as_bytes())?.is_some() {
                    txn.put(ADDRESS_USER, addr.as_bytes(), &encoded)?;
                    txn.delete(PENDING_ADDRESSES, addr.as_bytes())?;
                    confirmed.push((addr.clone(), *timestamp));
                } else {
                    txn.put(PENDING_ADDRESSES, addr.as_bytes(), &encoded)?;
                }
            }
            write_address_list(txn, &user, &confirmed)
        })
    }

    /// Records the latest category of `address`; if the address was pending
    /// for some user it becomes confirmed under that user.
    pub fn update_address_category(&self, address: &str, category: &str) -> Result<()> {
        let address = address.to_lowercase();
        let category = category.to_lowercase();

        self.store.update(|txn| {
            txn.put(ADDRESS_CATEGORY, address.as_bytes(), category.as_bytes())?;
            let Some(raw) = txn.get(PENDING_ADDRESSES, address.as_bytes())? else {
                return Ok(());
            };
            let claim: AddressClaim = serde_json::from_slice(&raw).context("Bad pending claim")?;
            txn.delete(PENDING_ADDRESSES, address.as_bytes())?;
            txn.put(
                ADDRESS_USER,
                address.as_bytes(),
                &serde_json::to_vec(&claim)?,
            )?;
            let mut list = read_address_list(txn, &claim.user)?;
            if !list.iter().any(|(a, _)| *a == address) {
                list.push((address.clone(), claim.timestamp));
            }
            write_address_list(txn, &claim.user, &list)
        })
    }

    /// Returns the account a confirmed address belongs to. An unclaimed
    /// address belongs to itself with timestamp 0.
    pub fn get_user_of_address(&self, address: &str) -> Result<(String, u64)> {
        let address = address.to_lowercase();
        match self.store.get(ADDRESS_USER, address.as_bytes())? {
            Some(raw) => {
                let claim: AddressClaim =
                    serde_json::from_slice(&raw).context("Bad address claim")?;
                Ok((claim.user, claim.timestamp))
            },
            None => Ok((address, 0)),
        }
    }

    /// Latest category observed for `address`, or empty when none.
    pub fn get_category(&self, address: &str) -> Result<String> {
        let address = address.to_lowercase();
        Ok(self
            .store
            .get(ADDRESS_CATEGORY, address.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default())
    }

    /// Confirmed addresses of `user` with their claim timestamps.
    pub fn get_addresses_of_user(&self, user: &str) -> Result<(Vec<String>, Vec<u64>)> {
        let user = user.to_lowercase();
        let list = match self.store.get(USER_ADDRESSES, user.as_bytes())? {
            Some(raw) => serde_json::from_slice::<Vec<(String, u64)>>(&raw)
                .context("Bad user address list")?,
            None => Vec::new(),
        };
        Ok(list.into_iter().unzip())
    }

    pub fn get_pending_addresses(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .scan_all(PENDING_ADDRESSES)?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    pub fn get_last_processed_cat_log_timepoint(&self) -> Result<u64> {
        Ok(self
            .store
            .get(USER_STATE, CAT_LOG_TIMEPOINT_KEY)?
            .map(|v| bytes_to_u64(&v))
            .unwrap_or(0))
    }

    pub fn set_last_processed_cat_log_timepoint(&self, timepoint: u64) -> Result<()> {
        self.store
            .put(USER_STATE, CAT_LOG_TIMEPOINT_KEY, &u64_to_bytes(timepoint))
    }
}

fn read_address_list(txn: &StoreTxn<'_>, user: &str) -> Result<Vec<(String, u64)>> {
    match txn.get(USER_ADDRESSES, user.as_bytes())? {
        Some(raw) => serde_json::from_slice(&raw).context("Bad user address list"),
        None => Ok(Vec::new()),
    }
}

fn write_address_list(txn: &mut StoreTxn<'_>, user: &str, list: &[(String, u64)]) -> Result<()> {
    txn.put(USER_ADDRESSES, user.as_bytes(), &serde_json::to_vec(list)?)
}
