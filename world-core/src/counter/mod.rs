//! Monotonic id allocation per scope
//!
//! A scope is either global (`CityCounter`) or tied to a parent id
//! (`KingdomCityCounter` for kingdom 3). Each scope holds one persisted u64;
//! an unseen scope starts at 0 so its first id is 1.

use crate::error::{StoreError, StoreResult};
use crate::schema::{FieldType, Key, TableSchema, Value};
use crate::table::{RecordTable, Store};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

pub const COUNTER_TABLE: &str = "Counter";

pub fn counter_schema() -> TableSchema {
    TableSchema::new(COUNTER_TABLE)
        .key_field("name", FieldType::BYTES32)
        .key_field("scoped", FieldType::BOOL)
        .key_field("parent", FieldType::U64)
        .value_field("value", FieldType::U64)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterScope {
    pub name: String,
    pub parent: Option<u64>,
}

impl CounterScope {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    pub fn child(name: impl Into<String>, parent: u64) -> Self {
        Self {
            name: name.into(),
            parent: Some(parent),
        }
    }

    fn key(&self) -> StoreResult<Key> {
        let name = Value::bytes32_from_str(&self.name).ok_or_else(|| {
            StoreError::schema(COUNTER_TABLE, format!("scope name '{}' exceeds 32 bytes", self.name))
        })?;
        Ok(vec![
            name,
            Value::Bool(self.parent.is_some()),
            Value::U64(self.parent.unwrap_or(0)),
        ])
    }
}

impl fmt::Display for CounterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) => write!(f, "{}[{}]", self.name, parent),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CounterAllocator {
    store: Store,
    table: RecordTable,
}

impl CounterAllocator {
    pub fn new(store: &Store) -> StoreResult<Self> {
        let table = store.declare(counter_schema())?;
        Ok(Self {
            store: store.clone(),
            table,
        })
    }

    /// Next id of a scope. The incremented value is persisted before it is
    /// returned; overflow fails instead of wrapping.
    pub fn next(&self, scope: &CounterScope) -> StoreResult<u64> {
        let key = scope.key()?;
        let lock_key = self.table.storage_key(&key)?;
        let _guard = self.store.locks().lock(&lock_key);

        let current = self.read(&key)?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| StoreError::CounterExhausted {
                scope: scope.to_string(),
            })?;
        self.table.put(&key, &[Value::U64(next)])?;
        debug!(scope = %scope, id = next, "Allocated id");
        Ok(next)
    }

    /// Alias of [`CounterAllocator::next`] for call sites that read better
    /// with the noun
    pub fn next_id(&self, scope: &CounterScope) -> StoreResult<u64> {
        self.next(scope)
    }

    /// Last issued id (0 when none)
    pub fn current(&self, scope: &CounterScope) -> StoreResult<u64> {
        self.read(&scope.key()?)
    }

    /// Raise a counter to at least `floor`, e.g. after importing rows with
    /// existing ids. Never lowers it.
    pub fn advance_to(&self, scope: &CounterScope, floor: u64) -> StoreResult<u64> {
        let key = scope.key()?;
        let lock_key = self.table.storage_key(&key)?;
        let _guard = self.store.locks().lock(&lock_key);

        let current = self.read(&key)?;
        if floor > current {
            self.table.put(&key, &[Value::U64(floor)])?;
            debug!(scope = %scope, from = current, to = floor, "Advanced counter");
            return Ok(floor);
        }
        Ok(current)
    }

    fn read(&self, key: &[Value]) -> StoreResult<u64> {
        match self.table.get(key)? {
            Some(row) => row
                .first()
                .and_then(Value::as_u64)
                .ok_or_else(|| StoreError::schema(COUNTER_TABLE, "counter row has no value")),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> CounterAllocator {
        CounterAllocator::new(&Store::in_memory("app")).unwrap()
    }

    #[test]
    fn test_first_id_is_one() {
        let counters = allocator();
        let scope = CounterScope::global("CityCounter");
        assert_eq!(counters.current(&scope).unwrap(), 0);
        assert_eq!(counters.next(&scope).unwrap(), 1);
        assert_eq!(counters.next(&scope).unwrap(), 2);
        assert_eq!(counters.current(&scope).unwrap(), 2);
    }

    #[test]
    fn test_child_scopes_are_independent() {
        let counters = allocator();
        let k1 = CounterScope::child("KingdomCityCounter", 1);
        let k2 = CounterScope::child("KingdomCityCounter", 2);
        let global = CounterScope::global("KingdomCityCounter");
        assert_eq!(counters.next(&k1).unwrap(), 1);
        assert_eq!(counters.next(&k1).unwrap(), 2);
        assert_eq!(counters.next(&k2).unwrap(), 1);
        assert_eq!(counters.next(&global).unwrap(), 1);
    }

    #[test]
    fn test_overflow_is_exhausted() {
        let counters = allocator();
        let scope = CounterScope::global("OrderCounter");
        counters.advance_to(&scope, u64::MAX).unwrap();
        let err = counters.next(&scope).unwrap_err();
        assert!(matches!(err, StoreError::CounterExhausted { .. }));
        assert_eq!(counters.current(&scope).unwrap(), u64::MAX);
    }

    #[test]
    fn test_advance_never_lowers() {
        let counters = allocator();
        let scope = CounterScope::global("GuildCounter");
        assert_eq!(counters.advance_to(&scope, 50).unwrap(), 50);
        assert_eq!(counters.advance_to(&scope, 10).unwrap(), 50);
        assert_eq!(counters.next_id(&scope).unwrap(), 51);
    }

    #[test]
    fn test_long_scope_name_rejected() {
        let counters = allocator();
        let scope = CounterScope::global("x".repeat(40));
        assert!(counters.next(&scope).is_err());
    }
}
