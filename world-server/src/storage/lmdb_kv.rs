//! LMDB backend for the world store
//!
//! One named database (`records`) holds every table: keys are the 32-byte
//! table id followed by the encoded record key, so LMDB's byte order gives
//! the per-table prefix scans the store relies on. A `WriteBatch` is applied
//! in a single write transaction.
//!
//! ## Usage
//! ```rust,ignore
//! use world_server::storage::lmdb_kv::LmdbKv;
//!
//! let kv = LmdbKv::open("./world_data", 1 << 30)?;
//! let store = Store::new(Arc::new(kv), "app");
//! ```

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use std::ops::Bound;
use std::path::Path;
use tracing::{debug, info};
use world_core::kv::BatchOp;
use world_core::{KvStore, StoreError, StoreResult, WriteBatch};

const RECORDS_DB: &str = "records";

/// LMDB error types
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    #[error("LMDB error: {0}")]
    Heed(#[from] heed::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbError> for StoreError {
    fn from(e: LmdbError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn backend(e: heed::Error) -> StoreError {
    StoreError::from(LmdbError::from(e))
}

/// Embedded, memory-mapped key/value backend
#[derive(Clone)]
pub struct LmdbKv {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbKv {
    /// Open (or create) the environment at `path`. `max_size_bytes` must be a
    /// multiple of the OS page size.
    pub fn open<P: AsRef<Path>>(path: P, max_size_bytes: usize) -> Result<Self, LmdbError> {
        info!(
            "Opening LMDB store at {:?} (max size: {} bytes)",
            path.as_ref(),
            max_size_bytes
        );
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_bytes)
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let db = env.create_database::<Bytes, Bytes>(&mut wtxn, Some(RECORDS_DB))?;
        wtxn.commit()?;

        Ok(Self { env, db })
    }

    pub fn stats(&self) -> Result<LmdbStats, LmdbError> {
        let rtxn = self.env.read_txn()?;
        let entries = self.db.len(&rtxn)?;
        let info = self.env.info();
        Ok(LmdbStats {
            entries,
            map_size: info.map_size,
            last_page: info.last_page_number,
            disk_size: self.env.real_disk_size()?,
        })
    }

    /// Flush to disk (explicit fsync)
    pub fn sync(&self) -> Result<(), LmdbError> {
        self.env.force_sync()?;
        debug!("LMDB synced to disk");
        Ok(())
    }
}

impl std::fmt::Debug for LmdbKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbKv")
            .field("path", &self.env.path())
            .finish()
    }
}

impl KvStore for LmdbKv {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let value = self.db.get(&rtxn, key).map_err(backend)?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let lower = match after {
            Some(after) if after >= prefix => Bound::Excluded(after),
            _ => Bound::Included(prefix),
        };
        let range = (lower, Bound::Unbounded);
        let limit = limit.unwrap_or(usize::MAX);

        let mut out = Vec::new();
        for entry in self.db.range(&rtxn, &range).map_err(backend)? {
            if out.len() >= limit {
                break;
            }
            let (k, v) = entry.map_err(backend)?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let ops = batch.len();
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => self
                    .db
                    .put(&mut wtxn, key.as_slice(), value.as_slice())
                    .map_err(backend)?,
                BatchOp::Delete { key } => {
                    self.db.delete(&mut wtxn, key.as_slice()).map_err(backend)?;
                }
            }
        }
        // Dropping the transaction on an early return aborts it
        wtxn.commit().map_err(backend)?;
        debug!(ops, "LMDB batch committed");
        Ok(())
    }

    fn entry_count(&self) -> StoreResult<u64> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        self.db.len(&rtxn).map_err(backend)
    }
}

/// LMDB statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct LmdbStats {
    pub entries: u64,
    pub map_size: usize,
    pub last_page: usize,
    pub disk_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (LmdbKv, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let kv = LmdbKv::open(dir.path(), 10 * 1024 * 1024).unwrap();
        (kv, dir)
    }

    fn put_all(kv: &LmdbKv, entries: &[(&str, &str)]) {
        let mut batch = WriteBatch::new();
        for (k, v) in entries {
            batch.put(k.as_bytes().to_vec(), v.as_bytes().to_vec());
        }
        kv.commit(batch).unwrap();
    }

    #[test]
    fn test_get_put_delete() {
        let (kv, _dir) = open_temp();
        assert_eq!(kv.get(b"a").unwrap(), None);

        put_all(&kv, &[("a", "1")]);
        assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));

        let mut batch = WriteBatch::new();
        batch.delete(b"a".to_vec());
        batch.delete(b"missing".to_vec());
        kv.commit(batch).unwrap();
        assert_eq!(kv.get(b"a").unwrap(), None);
        assert_eq!(kv.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_scan_prefix_after_limit() {
        let (kv, _dir) = open_temp();
        put_all(
            &kv,
            &[
                ("p1", "x"),
                ("t/a", "1"),
                ("t/b", "2"),
                ("t/c", "3"),
                ("u/a", "4"),
            ],
        );

        let keys: Vec<Vec<u8>> = kv
            .scan(b"t/", None, None)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"t/a".to_vec(), b"t/b".to_vec(), b"t/c".to_vec()]);

        let page = kv.scan(b"t/", Some(b"t/a".as_slice()), Some(1)).unwrap();
        assert_eq!(page, vec![(b"t/b".to_vec(), b"2".to_vec())]);

        assert!(kv.scan(b"t/", Some(b"t/c".as_slice()), None).unwrap().is_empty());
    }

    #[test]
    fn test_batch_is_atomic_in_order() {
        let (kv, _dir) = open_temp();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"old".to_vec());
        batch.delete(b"k".to_vec());
        batch.put(b"k".to_vec(), b"new".to_vec());
        kv.commit(batch).unwrap();
        assert_eq!(kv.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_stats_and_sync() {
        let (kv, _dir) = open_temp();
        put_all(&kv, &[("a", "1"), ("b", "2")]);
        kv.sync().unwrap();
        let stats = kv.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.map_size, 10 * 1024 * 1024);
    }
}
