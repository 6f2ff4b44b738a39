//! Byte-level key/value backend
//!
//! Every table row lives under `resource_id ++ encoded_key`. Mutations are
//! grouped into a [`WriteBatch`] and applied atomically by [`KvStore::commit`].

use crate::error::StoreResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Ordered list of mutations applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
    }

    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Storage backend. Implementations must apply a batch atomically and return
/// scans in ascending key order.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Entries whose key starts with `prefix`, strictly after `after` when
    /// given, at most `limit` of them
    fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn commit(&self, batch: WriteBatch) -> StoreResult<()>;

    fn entry_count(&self) -> StoreResult<u64>;
}

/// In-process backend over a sorted map
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry, for byte-level comparisons in tests and tooling
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.entries.read().clone()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read();
        let lower = match after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        let iter = entries
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut entries = self.entries.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn entry_count(&self) -> StoreResult<u64> {
        Ok(self.entries.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryKv {
        let kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a1".to_vec(), b"x".to_vec());
        batch.put(b"a2".to_vec(), b"y".to_vec());
        batch.put(b"a3".to_vec(), b"z".to_vec());
        batch.put(b"b1".to_vec(), b"w".to_vec());
        kv.commit(batch).unwrap();
        kv
    }

    #[test]
    fn test_scan_prefix() {
        let kv = seeded();
        let rows = kv.scan(b"a", None, None).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, b"a1".to_vec());
    }

    #[test]
    fn test_scan_after_and_limit() {
        let kv = seeded();
        let rows = kv.scan(b"a", Some(b"a1"), Some(1)).unwrap();
        assert_eq!(rows, vec![(b"a2".to_vec(), b"y".to_vec())]);
    }

    #[test]
    fn test_batch_applies_in_order() {
        let kv = seeded();
        let mut batch = WriteBatch::new();
        batch.put(b"c".to_vec(), b"1".to_vec());
        batch.delete(b"c".to_vec());
        batch.delete(b"a1".to_vec());
        assert_eq!(batch.len(), 3);
        kv.commit(batch).unwrap();
        assert_eq!(kv.get(b"c").unwrap(), None);
        assert_eq!(kv.get(b"a1").unwrap(), None);
        assert_eq!(kv.entry_count().unwrap(), 3);
    }
}
