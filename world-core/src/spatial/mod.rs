//! Spatial layers - indexed collections keyed by tile coordinate
//!
//! Each layer (monsters, dropped items, dropped equipment) is its own
//! collection over the shared coordinate domain. Moves between tiles commit
//! the removal and the append as one batch with both tiles locked.

use crate::collection::{CollectionDef, Element, IndexedCollection, OwnerKey};
use crate::error::{StoreError, StoreResult};
use crate::kv::WriteBatch;
use crate::schema::{Key, Value};
use crate::table::Store;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl From<(i32, i32)> for Coord {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

impl OwnerKey for Coord {
    fn to_key(&self) -> Key {
        vec![Value::I32(self.x), Value::I32(self.y)]
    }

    fn from_key(key: &[Value]) -> Option<Self> {
        match key {
            [Value::I32(x), Value::I32(y)] => Some(Coord::new(*x, *y)),
            _ => None,
        }
    }
}

pub struct SpatialIndex<E> {
    collection: IndexedCollection<Coord, E>,
}

/// Layer handle as seen by gameplay systems
pub type SpatialHandle<E> = SpatialIndex<E>;

impl<E> Clone for SpatialIndex<E> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
        }
    }
}

impl<E> fmt::Debug for SpatialIndex<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("layer", &self.collection)
            .finish()
    }
}

impl<E: Element> SpatialIndex<E> {
    pub fn open(store: &Store, def: CollectionDef) -> StoreResult<Self> {
        Ok(Self {
            collection: IndexedCollection::open(store, def)?,
        })
    }

    pub fn layer(&self) -> String {
        self.collection.def().label()
    }

    pub fn collection(&self) -> &IndexedCollection<Coord, E> {
        &self.collection
    }

    pub fn occupants_at(&self, x: i32, y: i32) -> StoreResult<Vec<E>> {
        self.collection.elements(&Coord::new(x, y))
    }

    pub fn contains(&self, at: Coord, element: E) -> StoreResult<bool> {
        self.collection.contains(&at, element)
    }

    pub fn append(&self, at: Coord, element: E) -> StoreResult<u64> {
        self.collection.append(&at, element)
    }

    pub fn remove_by_value(&self, at: Coord, element: E) -> StoreResult<()> {
        self.collection.remove_by_value(&at, element)
    }

    /// Move an element between tiles. Fails with `ElementNotFound` when it is
    /// not at `from` and `MoveConflict` when it is already at `to`; on failure
    /// nothing is written.
    pub fn move_element(&self, element: E, from: Coord, to: Coord) -> StoreResult<()> {
        if from == to {
            return if self.collection.contains(&from, element)? {
                Ok(())
            } else {
                Err(self.not_found(element, from))
            };
        }

        let owner = self.collection.owner_table();
        let from_key = from.to_key();
        let to_key = to.to_key();
        let from_lock = owner.storage_key(&from_key)?;
        let to_lock = owner.storage_key(&to_key)?;
        let _guards = self
            .collection
            .store()
            .locks()
            .lock_many(&[from_lock.as_slice(), to_lock.as_slice()]);

        if !self.collection.contains(&from, element)? {
            return Err(self.not_found(element, from));
        }
        if self.collection.contains(&to, element)? {
            return Err(StoreError::MoveConflict {
                layer: self.layer(),
                element: element.to_string(),
                to: to.to_string(),
            });
        }

        let mut batch = WriteBatch::new();
        let companions = self
            .collection
            .stage_remove(&mut batch, &from_key, element.to_value())?;
        self.collection
            .stage_append(&mut batch, &to_key, element.to_value(), Some(&companions))?;
        self.collection.store().commit(batch)?;
        debug!(layer = %self.layer(), element = %element, %from, %to, "Moved element");
        Ok(())
    }

    /// Occupied tiles inside the inclusive rectangle, in coordinate order.
    /// One ordered pass over the rows from column `min.x` to `max.x`.
    pub fn occupants_in_rect(&self, min: Coord, max: Coord) -> StoreResult<Vec<(Coord, Vec<E>)>> {
        let mut found = Vec::new();
        if min.x > max.x || min.y > max.y {
            return Ok(found);
        }
        for entry in self.collection.owner_table().scan_from(&[Value::I32(min.x)])? {
            let (key, _) = entry?;
            let coord = match Coord::from_key(&key) {
                Some(coord) => coord,
                None => continue,
            };
            if coord.x > max.x {
                break;
            }
            if coord.y < min.y || coord.y > max.y {
                continue;
            }
            let occupants = self.collection.elements(&coord)?;
            if !occupants.is_empty() {
                found.push((coord, occupants));
            }
        }
        Ok(found)
    }

    fn not_found(&self, element: E, at: Coord) -> StoreError {
        StoreError::ElementNotFound {
            collection: self.layer(),
            owner: at.to_string(),
            element: element.to_string(),
        }
    }
}
