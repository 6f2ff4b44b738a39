//! Indexed collections - unordered id sets stored inline on an owner row
//!
//! A collection is one array field of an owner table (a character's
//! `toolIds`, a tile's `monsterIds`) paired with a satellite index table keyed
//! by `(owner..., element)` whose single value is the element's position in
//! the array. The two always agree:
//!
//! - every element at position `p` has exactly one index row holding `p`
//! - every index row points at the element stored at its position
//!
//! Removal is swap-remove: the last element fills the hole, so order is not
//! preserved. Every mutation is staged into one [`WriteBatch`] and committed
//! atomically under the owner row's lock; a rejected call writes nothing.

use crate::error::{StoreError, StoreResult};
use crate::kv::WriteBatch;
use crate::schema::{display_key, FieldType, Key, Row, ScalarType, TableSchema, Value};
use crate::table::{RecordTable, Store};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use tracing::{debug, warn};

// ============================================================================
// Owner and element shapes
// ============================================================================

/// Key tuple of an owner row
pub trait OwnerKey: Clone + fmt::Debug + Send + Sync {
    fn to_key(&self) -> Key;
    fn from_key(key: &[Value]) -> Option<Self>;
}

impl OwnerKey for u64 {
    fn to_key(&self) -> Key {
        vec![Value::U64(*self)]
    }

    fn from_key(key: &[Value]) -> Option<Self> {
        match key {
            [Value::U64(v)] => Some(*v),
            _ => None,
        }
    }
}

impl OwnerKey for (u64, u64) {
    fn to_key(&self) -> Key {
        vec![Value::U64(self.0), Value::U64(self.1)]
    }

    fn from_key(key: &[Value]) -> Option<Self> {
        match key {
            [Value::U64(a), Value::U64(b)] => Some((*a, *b)),
            _ => None,
        }
    }
}

/// Scalar id stored in a collection
pub trait Element: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync {
    const TYPE: ScalarType;

    fn to_value(&self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
}

impl Element for u64 {
    const TYPE: ScalarType = ScalarType::U64;

    fn to_value(&self) -> Value {
        Value::U64(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }
}

impl Element for u32 {
    const TYPE: ScalarType = ScalarType::U32;

    fn to_value(&self) -> Value {
        Value::U32(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }
}

// ============================================================================
// Definition
// ============================================================================

/// Which owner field a collection lives in and where its index is kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDef {
    pub owner_table: String,
    pub field: String,
    /// Name of the element column in the index table
    pub element_field: String,
    pub index_table: String,
    /// Companion array fields that move in lockstep with the elements
    pub parallel: Vec<String>,
}

impl CollectionDef {
    /// `CharInventory` + `toolIds` -> element `toolId`, index
    /// `CharInventoryToolIndex`
    pub fn new(owner_table: impl Into<String>, field: impl Into<String>) -> Self {
        let owner_table = owner_table.into();
        let field = field.into();
        let element_field = singular(&field);
        let stem = element_field
            .strip_suffix("Id")
            .filter(|s| !s.is_empty())
            .unwrap_or(element_field.as_str());
        let index_table = format!("{}{}Index", owner_table, capitalize(stem));
        Self {
            owner_table,
            field,
            element_field,
            index_table,
            parallel: Vec::new(),
        }
    }

    /// Keep a historical index table name
    pub fn with_index_table(mut self, name: impl Into<String>) -> Self {
        self.index_table = name.into();
        self
    }

    pub fn with_element_field(mut self, name: impl Into<String>) -> Self {
        self.element_field = name.into();
        self
    }

    pub fn with_parallel(mut self, fields: &[&str]) -> Self {
        self.parallel = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// `Owner.field`, used in errors and logs
    pub fn label(&self) -> String {
        format!("{}.{}", self.owner_table, self.field)
    }

    /// Owner key fields plus the element, mapping to its position
    pub fn index_schema(&self, owner: &TableSchema, element: ScalarType) -> TableSchema {
        let mut schema = TableSchema::new(&self.index_table);
        for field in &owner.key {
            schema = schema.key_field(&field.name, field.ty);
        }
        schema
            .key_field(&self.element_field, FieldType::Scalar(element))
            .value_field("index", FieldType::U64)
    }
}

fn singular(field: &str) -> String {
    field
        .strip_suffix('s')
        .filter(|s| !s.is_empty())
        .unwrap_or(field)
        .to_string()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ============================================================================
// Audit
// ============================================================================

/// A break in the element/index agreement found by an audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexFault {
    MissingEntry { element: String, position: u64 },
    WrongPosition { element: String, expected: u64, found: u64 },
    DanglingEntry { element: String, position: u64 },
    Duplicate { element: String },
    ParallelLength { field: String, len: u64, expected: u64 },
}

impl fmt::Display for IndexFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexFault::MissingEntry { element, position } => {
                write!(f, "{} at position {} has no index entry", element, position)
            }
            IndexFault::WrongPosition { element, expected, found } => write!(
                f,
                "{} index says {}, element is at {}",
                element, found, expected
            ),
            IndexFault::DanglingEntry { element, position } => write!(
                f,
                "index entry {} -> {} points at a different element",
                element, position
            ),
            IndexFault::Duplicate { element } => write!(f, "{} appears more than once", element),
            IndexFault::ParallelLength { field, len, expected } => write!(
                f,
                "companion {} has {} entries, expected {}",
                field, len, expected
            ),
        }
    }
}

/// Result of re-pointing a collection at remapped ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelinkOutcome {
    pub relinked: u64,
    pub conflicts: Vec<String>,
}

/// A satellite index that must follow id remaps of a migrated entity
pub trait IndexDependent: Send + Sync {
    fn label(&self) -> String;
    fn relink(&self, remap: &HashMap<Value, Value>) -> StoreResult<RelinkOutcome>;
}

// ============================================================================
// Collection
// ============================================================================

pub struct IndexedCollection<O, E> {
    def: CollectionDef,
    store: Store,
    owner: RecordTable,
    index: RecordTable,
    field_pos: usize,
    parallel_pos: Vec<(usize, ScalarType)>,
    _marker: PhantomData<fn() -> (O, E)>,
}

/// Collection handle as seen by gameplay systems
pub type CollectionHandle<O, E> = IndexedCollection<O, E>;

impl<O, E> Clone for IndexedCollection<O, E> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            store: self.store.clone(),
            owner: self.owner.clone(),
            index: self.index.clone(),
            field_pos: self.field_pos,
            parallel_pos: self.parallel_pos.clone(),
            _marker: PhantomData,
        }
    }
}

impl<O, E> fmt::Debug for IndexedCollection<O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedCollection")
            .field("collection", &self.def.label())
            .field("index", &self.def.index_table)
            .finish()
    }
}

impl<O: OwnerKey, E: Element> IndexedCollection<O, E> {
    /// Bind to a declared owner table and declare the index table
    pub fn open(store: &Store, def: CollectionDef) -> StoreResult<Self> {
        let owner = store.table(&def.owner_table)?;
        let schema = owner.schema();
        let field_pos = schema.value_index(&def.field).ok_or_else(|| {
            StoreError::schema(&def.owner_table, format!("no field '{}'", def.field))
        })?;
        if schema.value[field_pos].ty != FieldType::Array(E::TYPE) {
            return Err(StoreError::schema(
                &def.owner_table,
                format!(
                    "collection field '{}' is {}, expected {}[]",
                    def.field,
                    schema.value[field_pos].ty,
                    E::TYPE.as_str()
                ),
            ));
        }
        let mut parallel_pos = Vec::with_capacity(def.parallel.len());
        for name in &def.parallel {
            let pos = schema.value_index(name).ok_or_else(|| {
                StoreError::schema(&def.owner_table, format!("no companion field '{}'", name))
            })?;
            match schema.value[pos].ty {
                FieldType::Array(scalar) => parallel_pos.push((pos, scalar)),
                other => {
                    return Err(StoreError::schema(
                        &def.owner_table,
                        format!("companion field '{}' is {}, not an array", name, other),
                    ))
                }
            }
        }
        let index = store.declare(def.index_schema(schema, E::TYPE))?;
        Ok(Self {
            def,
            store: store.clone(),
            owner,
            index,
            field_pos,
            parallel_pos,
            _marker: PhantomData,
        })
    }

    pub fn def(&self) -> &CollectionDef {
        &self.def
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn owner_table(&self) -> &RecordTable {
        &self.owner
    }

    pub fn index_table(&self) -> &RecordTable {
        &self.index
    }

    pub fn contains(&self, owner: &O, element: E) -> StoreResult<bool> {
        self.index.exists(&self.index_key(&owner.to_key(), element.to_value()))
    }

    pub fn position_of(&self, owner: &O, element: E) -> StoreResult<Option<u64>> {
        let ikey = self.index_key(&owner.to_key(), element.to_value());
        match self.index.get(&ikey)? {
            Some(row) => Ok(Some(self.position_value(&row)?)),
            None => Ok(None),
        }
    }

    /// Elements in storage order
    pub fn elements(&self, owner: &O) -> StoreResult<Vec<E>> {
        let row = match self.owner.get(&owner.to_key())? {
            Some(row) => row,
            None => return Ok(Vec::new()),
        };
        self.items(&row)?
            .iter()
            .map(|v| {
                E::from_value(v).ok_or_else(|| self.corrupted(format!("element {} has wrong type", v)))
            })
            .collect()
    }

    pub fn len(&self, owner: &O) -> StoreResult<u64> {
        match self.owner.get(&owner.to_key())? {
            Some(row) => Ok(self.items(&row)?.len() as u64),
            None => Ok(0),
        }
    }

    pub fn is_empty(&self, owner: &O) -> StoreResult<bool> {
        Ok(self.len(owner)? == 0)
    }

    /// Add an element at the end; returns its position
    pub fn append(&self, owner: &O, element: E) -> StoreResult<u64> {
        self.append_inner(owner, element, None)
    }

    /// Add an element with one value per companion field
    pub fn append_with(&self, owner: &O, element: E, companions: &[Value]) -> StoreResult<u64> {
        self.append_inner(owner, element, Some(companions))
    }

    fn append_inner(&self, owner: &O, element: E, companions: Option<&[Value]>) -> StoreResult<u64> {
        let key = owner.to_key();
        let lock_key = self.owner.storage_key(&key)?;
        let _guard = self.store.locks().lock(&lock_key);

        let mut batch = WriteBatch::new();
        let position = self.stage_append(&mut batch, &key, element.to_value(), companions)?;
        self.store.commit(batch)?;
        debug!(
            collection = %self.def.label(),
            owner = %display_key(&key),
            element = %element,
            position,
            "Appended element"
        );
        Ok(position)
    }

    /// Swap-remove an element
    pub fn remove_by_value(&self, owner: &O, element: E) -> StoreResult<()> {
        let key = owner.to_key();
        let lock_key = self.owner.storage_key(&key)?;
        let _guard = self.store.locks().lock(&lock_key);

        let mut batch = WriteBatch::new();
        self.stage_remove(&mut batch, &key, element.to_value())?;
        self.store.commit(batch)?;
        debug!(
            collection = %self.def.label(),
            owner = %display_key(&key),
            element = %element,
            "Removed element"
        );
        Ok(())
    }

    /// Companion values stored alongside the element at `position`
    pub fn companions_at(&self, owner: &O, position: u64) -> StoreResult<Option<Vec<Value>>> {
        let row = match self.owner.get(&owner.to_key())? {
            Some(row) => row,
            None => return Ok(None),
        };
        if position >= self.items(&row)?.len() as u64 {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(self.parallel_pos.len());
        for (pos, _) in &self.parallel_pos {
            let value = row[*pos]
                .as_array()
                .and_then(|arr| arr.get(position as usize))
                .cloned()
                .ok_or_else(|| self.corrupted(format!("companion {} too short", pos)))?;
            values.push(value);
        }
        Ok(Some(values))
    }

    /// Owners with a stored row
    pub fn owners(&self) -> StoreResult<Vec<O>> {
        let mut owners = Vec::new();
        for entry in self.owner.scan(&[])? {
            let (key, _) = entry?;
            if let Some(owner) = O::from_key(&key) {
                owners.push(owner);
            }
        }
        Ok(owners)
    }

    /// Audit one owner's array against its index rows
    pub fn check_consistency(&self, owner: &O) -> StoreResult<Vec<IndexFault>> {
        let key = owner.to_key();
        let row = self.owner.get(&key)?;
        let items: Vec<Value> = match &row {
            Some(row) => self.items(row)?.clone(),
            None => Vec::new(),
        };

        let mut faults = Vec::new();
        let mut seen = HashSet::new();
        for (position, value) in items.iter().enumerate() {
            if !seen.insert(value.clone()) {
                faults.push(IndexFault::Duplicate {
                    element: value.to_string(),
                });
                continue;
            }
            match self.index.get(&self.index_key(&key, value.clone()))? {
                None => faults.push(IndexFault::MissingEntry {
                    element: value.to_string(),
                    position: position as u64,
                }),
                Some(entry) => {
                    let found = self.position_value(&entry)?;
                    if found != position as u64 {
                        faults.push(IndexFault::WrongPosition {
                            element: value.to_string(),
                            expected: position as u64,
                            found,
                        });
                    }
                }
            }
        }

        for entry in self.index.scan(&key)? {
            let (ikey, irow) = entry?;
            let element = ikey.last().cloned().unwrap_or(Value::Bool(false));
            let position = self.position_value(&irow)?;
            if items.get(position as usize) != Some(&element) && !seen.contains(&element) {
                faults.push(IndexFault::DanglingEntry {
                    element: element.to_string(),
                    position,
                });
            }
        }

        if let Some(row) = &row {
            for (pos, _) in &self.parallel_pos {
                let len = row[*pos].as_array().map(|a| a.len()).unwrap_or(0) as u64;
                if len != items.len() as u64 {
                    faults.push(IndexFault::ParallelLength {
                        field: self.owner.schema().value[*pos].name.clone(),
                        len,
                        expected: items.len() as u64,
                    });
                }
            }
        }
        Ok(faults)
    }

    /// Apply an id remap to one owner's whole array in a single commit.
    /// Positions are kept. An element whose new id would clash with another
    /// element's final id keeps its old id and is returned as `(old, new)`.
    pub(crate) fn relink_owner(
        &self,
        owner: &O,
        remap: &HashMap<Value, Value>,
    ) -> StoreResult<(u64, Vec<(Value, Value)>)> {
        let key = owner.to_key();
        let lock_key = self.owner.storage_key(&key)?;
        let _guard = self.store.locks().lock(&lock_key);

        let mut row = match self.owner.get(&key)? {
            Some(row) => row,
            None => return Ok((0, Vec::new())),
        };
        let items = self.items(&row)?.clone();
        let mut mapped: Vec<Value> = items
            .iter()
            .map(|v| remap.get(v).cloned().unwrap_or_else(|| v.clone()))
            .collect();

        let mut counts: HashMap<Value, usize> = HashMap::new();
        for value in &mapped {
            *counts.entry(value.clone()).or_default() += 1;
        }
        // Reverting one element can make its old id clash again, so repeat
        // until the mapped array has no duplicates
        let mut conflicts = Vec::new();
        let mut reverted = true;
        while reverted {
            reverted = false;
            for i in 0..mapped.len() {
                let clashes = counts.get(&mapped[i]).copied().unwrap_or(0) > 1;
                if mapped[i] == items[i] || !clashes {
                    continue;
                }
                if let Some(count) = counts.get_mut(&mapped[i]) {
                    *count -= 1;
                }
                *counts.entry(items[i].clone()).or_default() += 1;
                let new = std::mem::replace(&mut mapped[i], items[i].clone());
                conflicts.push((items[i].clone(), new));
                reverted = true;
            }
        }

        let changed: Vec<usize> = (0..items.len()).filter(|&i| mapped[i] != items[i]).collect();
        if changed.is_empty() {
            return Ok((0, conflicts));
        }
        let mut batch = WriteBatch::new();
        // Deletes go first so an id that moves between elements ends up present
        for &i in &changed {
            self.index
                .delete_in(&mut batch, &self.index_key(&key, items[i].clone()))?;
        }
        for &i in &changed {
            self.index.put_in(
                &mut batch,
                &self.index_key(&key, mapped[i].clone()),
                &[Value::U64(i as u64)],
            )?;
        }
        row[self.field_pos] = Value::Array(mapped);
        self.owner.put_in(&mut batch, &key, &row)?;
        self.store.commit(batch)?;
        Ok((changed.len() as u64, conflicts))
    }

    // ------------------------------------------------------------------------
    // Staging (caller holds the owner lock)
    // ------------------------------------------------------------------------

    pub(crate) fn stage_append(
        &self,
        batch: &mut WriteBatch,
        key: &Key,
        element: Value,
        companions: Option<&[Value]>,
    ) -> StoreResult<u64> {
        let ikey = self.index_key(key, element.clone());
        if self.index.exists(&ikey)? {
            return Err(StoreError::DuplicateElement {
                collection: self.def.label(),
                owner: display_key(key),
                element: element.to_string(),
            });
        }
        if let Some(values) = companions {
            if values.len() != self.parallel_pos.len() {
                return Err(StoreError::schema(
                    &self.def.owner_table,
                    format!(
                        "{} companion value(s) given, {} declared",
                        values.len(),
                        self.parallel_pos.len()
                    ),
                ));
            }
        }

        let mut row = match self.owner.get(key)? {
            Some(row) => row,
            None => self.owner.schema().default_row(),
        };
        let items = row[self.field_pos]
            .as_array_mut()
            .ok_or_else(|| self.corrupted("collection field is not an array"))?;
        let position = items.len() as u64;
        items.push(element);

        for (i, (pos, scalar)) in self.parallel_pos.iter().enumerate() {
            let value = match companions {
                Some(values) => values[i].clone(),
                None => scalar.zero(),
            };
            row[*pos]
                .as_array_mut()
                .ok_or_else(|| self.corrupted("companion field is not an array"))?
                .push(value);
        }

        self.owner.put_in(batch, key, &row)?;
        self.index.put_in(batch, &ikey, &[Value::U64(position)])?;
        Ok(position)
    }

    /// Stage a swap-remove; returns the removed companion values
    pub(crate) fn stage_remove(
        &self,
        batch: &mut WriteBatch,
        key: &Key,
        element: Value,
    ) -> StoreResult<Vec<Value>> {
        let ikey = self.index_key(key, element.clone());
        let position = match self.index.get(&ikey)? {
            Some(row) => self.position_value(&row)? as usize,
            None => {
                return Err(StoreError::ElementNotFound {
                    collection: self.def.label(),
                    owner: display_key(key),
                    element: element.to_string(),
                })
            }
        };
        let mut row = self
            .owner
            .get(key)?
            .ok_or_else(|| self.corrupted(format!("index entry for {} without owner row", element)))?;

        let moved = {
            let items = row[self.field_pos]
                .as_array_mut()
                .ok_or_else(|| self.corrupted("collection field is not an array"))?;
            if items.get(position) != Some(&element) {
                return Err(self.corrupted(format!(
                    "index says {} is at {}, array disagrees",
                    element, position
                )));
            }
            items.swap_remove(position);
            items.get(position).cloned()
        };

        let mut removed = Vec::with_capacity(self.parallel_pos.len());
        for (pos, _) in &self.parallel_pos {
            let companion = row[*pos]
                .as_array_mut()
                .filter(|arr| position < arr.len())
                .ok_or_else(|| self.corrupted("companion array shorter than elements"))?;
            removed.push(companion.swap_remove(position));
        }

        // The former last element now sits at the hole
        if let Some(moved) = moved {
            self.index
                .put_in(batch, &self.index_key(key, moved), &[Value::U64(position as u64)])?;
        }
        self.index.delete_in(batch, &ikey)?;
        self.owner.put_in(batch, key, &row)?;
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn index_key(&self, owner_key: &Key, element: Value) -> Key {
        let mut key = owner_key.clone();
        key.push(element);
        key
    }

    fn items<'r>(&self, row: &'r Row) -> StoreResult<&'r Vec<Value>> {
        row.get(self.field_pos)
            .and_then(Value::as_array)
            .ok_or_else(|| self.corrupted("collection field is not an array"))
    }

    fn position_value(&self, row: &Row) -> StoreResult<u64> {
        row.first()
            .and_then(Value::as_u64)
            .ok_or_else(|| self.corrupted("index row has no position"))
    }

    fn corrupted(&self, reason: impl Into<String>) -> StoreError {
        StoreError::IndexCorrupted {
            collection: self.def.label(),
            reason: reason.into(),
        }
    }
}

impl<O: OwnerKey + 'static, E: Element + 'static> IndexDependent for IndexedCollection<O, E> {
    fn label(&self) -> String {
        self.def.label()
    }

    fn relink(&self, remap: &HashMap<Value, Value>) -> StoreResult<RelinkOutcome> {
        let mut outcome = RelinkOutcome::default();
        if remap.is_empty() {
            return Ok(outcome);
        }
        for owner in self.owners()? {
            let (relinked, conflicts) = self.relink_owner(&owner, remap)?;
            outcome.relinked += relinked;
            if conflicts.is_empty() {
                continue;
            }
            let owner_label = display_key(&owner.to_key());
            for (old, new) in conflicts {
                warn!(
                    collection = %self.def.label(),
                    owner = %owner_label,
                    old = %old,
                    new = %new,
                    "Relink target already present, keeping old id"
                );
                outcome
                    .conflicts
                    .push(format!("{} {}: {} -> {}", self.def.label(), owner_label, old, new));
            }
        }
        Ok(outcome)
    }
}
