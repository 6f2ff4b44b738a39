//! Typed record tables
//!
//! A [`RecordTable`] stores rows of one [`TableSchema`] under the table's
//! [`ResourceId`]. Rows are addressed by their key tuple; a table with an empty
//! key is a singleton holding at most one row.

pub mod catalog;

pub use catalog::Store;

use crate::codec::{decode_key, decode_record, encode_key, encode_key_prefix, encode_record};
use crate::error::{StoreError, StoreResult};
use crate::kv::{KvStore, WriteBatch};
use crate::schema::{Key, ResourceId, Row, TableSchema, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Rows fetched per backend round trip while scanning
const SCAN_PAGE: usize = 256;

#[derive(Clone)]
pub struct RecordTable {
    schema: Arc<TableSchema>,
    id: ResourceId,
    kv: Arc<dyn KvStore>,
}

impl std::fmt::Debug for RecordTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordTable")
            .field("name", &self.schema.name)
            .field("id", &self.id)
            .finish()
    }
}

impl RecordTable {
    pub(crate) fn new(schema: Arc<TableSchema>, id: ResourceId, kv: Arc<dyn KvStore>) -> Self {
        Self { schema, id, kv }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Full backend key of a row
    pub(crate) fn storage_key(&self, key: &[Value]) -> StoreResult<Vec<u8>> {
        let encoded = encode_key(&self.schema, key)?;
        Ok(self.prefixed(&encoded))
    }

    pub(crate) fn prefixed(&self, encoded: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(32 + encoded.len());
        full.extend_from_slice(self.id.as_bytes());
        full.extend_from_slice(encoded);
        full
    }

    pub fn get(&self, key: &[Value]) -> StoreResult<Option<Row>> {
        let storage_key = self.storage_key(key)?;
        match self.kv.get(&storage_key)? {
            Some(bytes) => Ok(Some(decode_record(&self.schema, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, key: &[Value]) -> StoreResult<bool> {
        let storage_key = self.storage_key(key)?;
        Ok(self.kv.get(&storage_key)?.is_some())
    }

    /// Create or overwrite a row
    pub fn put(&self, key: &[Value], row: &[Value]) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        self.put_in(&mut batch, key, row)?;
        self.kv.commit(batch)
    }

    /// Stage a put into `batch` without committing
    pub fn put_in(&self, batch: &mut WriteBatch, key: &[Value], row: &[Value]) -> StoreResult<()> {
        let storage_key = self.storage_key(key)?;
        let bytes = encode_record(&self.schema, row)?;
        batch.put(storage_key, bytes);
        Ok(())
    }

    /// Delete a row; deleting a missing key is a no-op
    pub fn delete(&self, key: &[Value]) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        self.delete_in(&mut batch, key)?;
        self.kv.commit(batch)
    }

    pub fn delete_in(&self, batch: &mut WriteBatch, key: &[Value]) -> StoreResult<()> {
        let storage_key = self.storage_key(key)?;
        batch.delete(storage_key);
        Ok(())
    }

    /// Lazily iterate rows whose key starts with `prefix`, in key order
    pub fn scan(&self, prefix: &[Value]) -> StoreResult<Scan> {
        let encoded = encode_key_prefix(&self.schema, prefix)?;
        Ok(Scan {
            table: self.clone(),
            prefix: self.prefixed(&encoded),
            last: None,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Ordered scan of the whole table starting at the first row whose
    /// leading key fields are at or after `start`. `start` must be shorter
    /// than the full key.
    pub fn scan_from(&self, start: &[Value]) -> StoreResult<Scan> {
        if !start.is_empty() && start.len() >= self.schema.key.len() {
            return Err(StoreError::schema(
                &self.schema.name,
                "scan start must be a strict key prefix",
            ));
        }
        let encoded = encode_key_prefix(&self.schema, start)?;
        // Every full key under this prefix sorts after the bare prefix
        let last = (!encoded.is_empty()).then(|| self.prefixed(&encoded));
        Ok(Scan {
            table: self.clone(),
            prefix: self.id.as_bytes().to_vec(),
            last,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    /// One page of keys strictly after the encoded key `after`. Records are
    /// left undecoded so a corrupt row does not stall the caller.
    pub(crate) fn scan_keys_after(
        &self,
        after: Option<&[u8]>,
        limit: usize,
    ) -> StoreResult<Vec<(Vec<u8>, Key)>> {
        let after_full = after.map(|a| self.prefixed(a));
        let entries = self
            .kv
            .scan(self.id.as_bytes(), after_full.as_deref(), Some(limit))?;
        entries
            .into_iter()
            .map(|(k, _)| {
                let encoded = k[32..].to_vec();
                let key = decode_key(&self.schema, &encoded)?;
                Ok((encoded, key))
            })
            .collect()
    }

    pub fn count(&self) -> StoreResult<u64> {
        let mut total = 0u64;
        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = self
                .kv
                .scan(self.id.as_bytes(), after.as_deref(), Some(SCAN_PAGE))?;
            total += page.len() as u64;
            if page.len() < SCAN_PAGE {
                return Ok(total);
            }
            after = page.last().map(|(k, _)| k.clone());
        }
    }

    /// Value of the named field in a row of this table
    pub fn field<'r>(&self, row: &'r [Value], name: &str) -> StoreResult<&'r Value> {
        self.schema
            .value_index(name)
            .and_then(|i| row.get(i))
            .ok_or_else(|| StoreError::schema(&self.schema.name, format!("no field '{}'", name)))
    }

    /// Row of a singleton table
    pub fn singleton(&self) -> StoreResult<Option<Row>> {
        if !self.schema.is_singleton() {
            return Err(StoreError::schema(
                &self.schema.name,
                "table has key fields, not a singleton",
            ));
        }
        self.get(&[])
    }
}

/// Lazy prefix scan over a table
pub struct Scan {
    table: RecordTable,
    prefix: Vec<u8>,
    last: Option<Vec<u8>>,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
}

impl Scan {
    fn refill(&mut self) -> StoreResult<()> {
        let page = self
            .table
            .kv
            .scan(&self.prefix, self.last.as_deref(), Some(SCAN_PAGE))?;
        if page.len() < SCAN_PAGE {
            self.exhausted = true;
        }
        if let Some((k, _)) = page.last() {
            self.last = Some(k.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for Scan {
    type Item = StoreResult<(Key, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let (k, v) = self.buffer.pop_front()?;
        let schema = &self.table.schema;
        let decoded = decode_key(schema, &k[32..])
            .and_then(|key| decode_record(schema, &v).map(|row| (key, row)));
        Some(decoded)
    }
}
