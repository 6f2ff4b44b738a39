//! Table catalog and the shared store handle
//!
//! Declared tables are recorded in the `Tables` system table (id ->
//! fingerprint, name) so a reopened store refuses a table whose layout
//! changed underneath existing data.

use super::RecordTable;
use crate::error::{StoreError, StoreResult};
use crate::kv::{KvStore, MemoryKv, WriteBatch};
use crate::locks::KeyedLocks;
use crate::schema::{FieldType, ResourceId, TableSchema, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const TABLES_TABLE: &str = "Tables";

fn tables_schema() -> TableSchema {
    TableSchema::new(TABLES_TABLE)
        .key_field("tableId", FieldType::BYTES32)
        .value_field("fingerprint", FieldType::BYTES32)
        .value_field("name", FieldType::Str)
}

#[derive(Default)]
struct Catalog {
    by_name: HashMap<String, RecordTable>,
    by_id: HashMap<ResourceId, String>,
}

struct StoreInner {
    kv: Arc<dyn KvStore>,
    namespace: String,
    catalog: RwLock<Catalog>,
    meta: RecordTable,
    locks: KeyedLocks,
}

/// Cheap-to-clone handle over one backend and namespace
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("namespace", &self.inner.namespace)
            .field("tables", &self.tables())
            .finish()
    }
}

impl Store {
    pub fn new(kv: Arc<dyn KvStore>, namespace: &str) -> Self {
        let meta_schema = Arc::new(tables_schema());
        let meta_id = ResourceId::table(namespace, TABLES_TABLE);
        let meta = RecordTable::new(meta_schema, meta_id, kv.clone());
        let mut catalog = Catalog::default();
        catalog.by_id.insert(meta_id, TABLES_TABLE.to_string());
        catalog.by_name.insert(TABLES_TABLE.to_string(), meta.clone());
        Self {
            inner: Arc::new(StoreInner {
                kv,
                namespace: namespace.to_string(),
                catalog: RwLock::new(catalog),
                meta,
                locks: KeyedLocks::new(),
            }),
        }
    }

    pub fn in_memory(namespace: &str) -> Self {
        Self::new(Arc::new(MemoryKv::new()), namespace)
    }

    /// Register a table. Redeclaring the same shape returns the existing
    /// handle; a different shape under the same name or id is rejected.
    pub fn declare(&self, schema: TableSchema) -> StoreResult<RecordTable> {
        schema.validate()?;
        let fingerprint = schema.fingerprint();
        let id = ResourceId::table(&self.inner.namespace, &schema.name);

        let mut catalog = self.inner.catalog.write();
        if let Some(existing) = catalog.by_name.get(&schema.name) {
            if existing.schema().fingerprint() == fingerprint {
                return Ok(existing.clone());
            }
            return Err(StoreError::schema(
                &schema.name,
                "table already declared with a different layout",
            ));
        }
        if let Some(other) = catalog.by_id.get(&id) {
            return Err(StoreError::schema(
                &schema.name,
                format!("resource id {:?} collides with table '{}'", id, other),
            ));
        }

        let id_key = [Value::Bytes32(*id.as_bytes())];
        match self.inner.meta.get(&id_key)? {
            Some(row) => {
                if row.first() != Some(&Value::Bytes32(fingerprint)) {
                    return Err(StoreError::schema(
                        &schema.name,
                        "stored rows were written with a different layout",
                    ));
                }
            }
            None => {
                self.inner.meta.put(
                    &id_key,
                    &[Value::Bytes32(fingerprint), Value::Str(schema.name.clone())],
                )?;
            }
        }

        debug!(table = %schema.name, id = ?id, "Declared table");
        let name = schema.name.clone();
        let table = RecordTable::new(Arc::new(schema), id, self.inner.kv.clone());
        catalog.by_id.insert(id, name.clone());
        catalog.by_name.insert(name, table.clone());
        Ok(table)
    }

    pub fn table(&self, name: &str) -> StoreResult<RecordTable> {
        self.inner
            .catalog
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::schema(name, "table not declared"))
    }

    /// Declared table names, sorted
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.catalog.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.inner.kv.commit(batch)
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.inner.kv
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.inner.locks
    }
}
