//! RocksDB-backed bucketed key/value store.
//!
//! Namespaces are nestable paths (`trade_stats/minute`, `user_stat/utc7`)
//! mapped onto column families; creating one is idempotent. Keys compare as
//! raw bytes, so 8-byte big-endian bucket keys scan in chronological order.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rocksdb::{
    BoundColumnFamily, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    ReadOptions, SnapshotWithThreadMode, WriteBatch,
};

pub type Db = DBWithThreadMode<MultiThreaded>;

/// Shared handle to the embedded store. Opened once at startup; closing the
/// process releases it.
pub struct StoreClient {
    db: Db,
}

impl StoreClient {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let existing = Db::list_cf(&opts, &path).unwrap_or_default();
        let db = if existing.is_empty() {
            Db::open(&opts, &path)
        } else {
            Db::open_cf(&opts, &path, existing)
        }
        .context("Failed to open store")?;

        Ok(Self { db })
    }

    /// Create-or-open a namespace. Returns its flat name for subsequent calls.
    pub fn namespace(&self, path: &[&str]) -> Result<String> {
        let name = path.join("/");
        if self.db.cf_handle(&name).is_none() {
            if let Err(e) = self.db.create_cf(&name, &Options::default()) {
                // lost a creation race; the handle existing is all that matters
                if self.db.cf_handle(&name).is_none() {
                    return Err(e).context(format!("Failed to create namespace {name}"));
                }
            }
        }
        Ok(name)
    }

    fn cf(&self, ns: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(ns)
            .ok_or_else(|| anyhow!("namespace {ns} not found"))
    }

    pub fn put(&self, ns: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(ns)?;
        Ok(self.db.put_cf(&cf, key, value)?)
    }

    pub fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(ns)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    pub fn delete(&self, ns: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf(ns)?;
        Ok(self.db.delete_cf(&cf, key)?)
    }

    /// Inclusive ascending range scan over `[lo, hi]`.
    pub fn scan(&self, ns: &str, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(ns)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(lo, Direction::Forward));
        collect_range(iter, hi)
    }

    /// Every entry in the namespace, in key order.
    pub fn scan_all(&self, ns: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(ns)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (k, v) = item?;
            out.push((k.into_vec(), v.into_vec()));
        }
        Ok(out)
    }

    pub fn first(&self, ns: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(ns)?;
        match self.db.iterator_cf(&cf, IteratorMode::Start).next() {
            Some(item) => {
                let (k, v) = item?;
                Ok(Some((k.into_vec(), v.into_vec())))
            },
            None => Ok(None),
        }
    }

    pub fn last(&self, ns: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(ns)?;
        match self.db.iterator_cf(&cf, IteratorMode::End).next() {
            Some(item) => {
                let (k, v) = item?;
                Ok(Some((k.into_vec(), v.into_vec())))
            },
            None => Ok(None),
        }
    }

    pub fn count(&self, ns: &str) -> Result<usize> {
        let cf = self.cf(ns)?;
        let mut n = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            n += 1;
        }
        Ok(n)
    }

    /// Runs `f` against a transaction view: reads see one consistent
    /// snapshot, writes are buffered and committed atomically when `f`
    /// returns `Ok`. An `Err` discards every buffered write.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreTxn<'_>) -> Result<T>,
    {
        let mut txn = StoreTxn {
            client: self,
            snapshot: self.db.snapshot(),
            batch: WriteBatch::default(),
        };
        let out = f(&mut txn)?;
        let StoreTxn { batch, .. } = txn;
        self.db.write(batch).context("Failed to commit batch")?;
        Ok(out)
    }
}

/// Transaction view handed to [`StoreClient::update`] closures.
///
/// Reads go through the snapshot taken when the transaction began; buffered
/// writes are not visible to them.
pub struct StoreTxn<'a> {
    client: &'a StoreClient,
    snapshot: SnapshotWithThreadMode<'a, Db>,
    batch: WriteBatch,
}

impl StoreTxn<'_> {
    pub fn namespace(&self, path: &[&str]) -> Result<String> {
        self.client.namespace(path)
    }

    fn read_opts(&self) -> ReadOptions {
        let mut opts = ReadOptions::default();
        opts.set_snapshot(&self.snapshot);
        opts
    }

    pub fn get(&self, ns: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.client.cf(ns)?;
        Ok(self.client.db.get_cf_opt(&cf, key, &self.read_opts())?)
    }

    pub fn put(&mut self, ns: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.client.cf(ns)?;
        self.batch.put_cf(&cf, key, value);
        Ok(())
    }

    pub fn delete(&mut self, ns: &str, key: &[u8]) -> Result<()> {
        let cf = self.client.cf(ns)?;
        self.batch.delete_cf(&cf, key);
        Ok(())
    }

    /// Inclusive ascending range scan over `[lo, hi]` in the snapshot.
    pub fn scan(&self, ns: &str, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.client.cf(ns)?;
        let iter = self.client.db.iterator_cf_opt(
            &cf,
            self.read_opts(),
            IteratorMode::From(lo, Direction::Forward),
        );
        collect_range(iter, hi)
    }

    /// Entries with key strictly below `hi`, in key order.
    pub fn scan_below(&self, ns: &str, hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.client.cf(ns)?;
        let iter = self
            .client
            .db
            .iterator_cf_opt(&cf, self.read_opts(), IteratorMode::Start);
        let mut out = Vec::new();
        for item in iter {
            let (k, v) = item?;
            if k.as_ref() >= hi {
                break;
            }
            out.push((k.into_vec(), v.into_vec()));
        }
        Ok(out)
    }

    /// Every entry in the namespace visible to the snapshot, in key order.
    pub fn scan_all(&self, ns: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.client.cf(ns)?;
        let iter = self
            .client
            .db
            .iterator_cf_opt(&cf, self.read_opts(), IteratorMode::Start);
        let mut out = Vec::new();
        for item in iter {
            let (k, v) = item?;
            out.push((k.into_vec(), v.into_vec()));
        }
        Ok(out)
    }

    /// Keys of every entry in the namespace, in order.
    pub fn keys(&self, ns: &str) -> Result<Vec<Vec<u8>>> {
        let cf = self.client.cf(ns)?;
        let iter = self
            .client
            .db
            .iterator_cf_opt(&cf, self.read_opts(), IteratorMode::Start);
        let mut out = Vec::new();
        for item in iter {
            let (k, _) = item?;
            out.push(k.into_vec());
        }
        Ok(out)
    }
}

fn collect_range<I>(iter: I, hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
where
    I: Iterator<Item = std::result::Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>>,
{
    let mut out = Vec::new();
    for item in iter {
        let (k, v) = item?;
        if k.as_ref() > hi {
            break;
        }
        out.push((k.into_vec(), v.into_vec()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (StoreClient, TempDir) {
        let dir = TempDir::new().unwrap();
        (StoreClient::open(dir.path()).unwrap(), dir)
    }

    #[test]
    fn test_namespace_is_idempotent() {
        let (store, _dir) = open_store();
        let a = store.namespace(&["trade_stats", "minute"]).unwrap();
        let b = store.namespace(&["trade_stats", "minute"]).unwrap();
        assert_eq!(a, b);
        store.put(&a, b"k", b"v").unwrap();
        assert_eq!(store.get(&b, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_scan_is_inclusive_and_ordered() {
        let (store, _dir) = open_store();
        let ns = store.namespace(&["scan"]).unwrap();
        for v in [3u64, 1, 2, 5] {
            store.put(&ns, &v.to_be_bytes(), &[v as u8]).unwrap();
        }
        let hits = store
            .scan(&ns, &1u64.to_be_bytes(), &3u64.to_be_bytes())
            .unwrap();
        let keys: Vec<u64> = hits
            .iter()
            .map(|(k, _)| u64::from_be_bytes(k.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_first_last_count() {
        let (store, _dir) = open_store();
        let ns = store.namespace(&["fl"]).unwrap();
        assert!(store.first(&ns).unwrap().is_none());
        for v in [9u64, 4, 7] {
            store.put(&ns, &v.to_be_bytes(), b"x").unwrap();
        }
        assert_eq!(store.first(&ns).unwrap().unwrap().0, 4u64.to_be_bytes());
        assert_eq!(store.last(&ns).unwrap().unwrap().0, 9u64.to_be_bytes());
        assert_eq!(store.count(&ns).unwrap(), 3);
    }

    #[test]
    fn test_update_commits_atomically() {
        let (store, _dir) = open_store();
        let ns = store.namespace(&["txn"]).unwrap();
        store
            .update(|txn| {
                txn.put(&ns, b"a", b"1")?;
                txn.put(&ns, b"b", b"2")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get(&ns, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(&ns, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_update_discards_on_error() {
        let (store, _dir) = open_store();
        let ns = store.namespace(&["txn"]).unwrap();
        let res: Result<()> = store.update(|txn| {
            txn.put(&ns, b"a", b"1")?;
            anyhow::bail!("boom")
        });
        assert!(res.is_err());
        assert_eq!(store.get(&ns, b"a").unwrap(), None);
    }

    #[test]
    fn test_txn_reads_see_snapshot_not_buffered_writes() {
        let (store, _dir) = open_store();
        let ns = store.namespace(&["snap"]).unwrap();
        store.put(&ns, b"k", b"old").unwrap();
        store
            .update(|txn| {
                txn.put(&ns, b"k", b"new")?;
                assert_eq!(txn.get(&ns, b"k")?, Some(b"old".to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get(&ns, b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_scan_below_is_exclusive() {
        let (store, _dir) = open_store();
        let ns = store.namespace(&["below"]).unwrap();
        for v in [1u64, 2, 3] {
            store.put(&ns, &v.to_be_bytes(), b"x").unwrap();
        }
        store
            .update(|txn| {
                let hits = txn.scan_below(&ns, &3u64.to_be_bytes())?;
                assert_eq!(hits.len(), 2);
                Ok(())
            })
            .unwrap();
    }
}
