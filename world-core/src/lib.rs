//! World Store - Core Library
//!
//! Persistent-state core for the game world:
//! - Typed record tables with MUD-style ids and packed record encoding
//! - Indexed collections (swap-remove sets with a satellite position index)
//! - Spatial layers keyed by tile coordinate
//! - Monotonic id counters per scope
//! - Schema version registry with resumable, batched migrations
//!
//! Everything runs against the [`kv::KvStore`] trait; [`kv::MemoryKv`] is the
//! in-process backend, the server crate provides LMDB.

pub mod codec;
pub mod collection;
pub mod config;
pub mod counter;
pub mod error;
pub mod kv;
pub mod locks;
pub mod logging;
pub mod registry;
pub mod schema;
pub mod spatial;
pub mod table;
pub mod world;

pub use collection::{
    CollectionDef, CollectionHandle, Element, IndexFault, IndexedCollection, OwnerKey,
};
pub use config::StoreConfig;
pub use counter::{CounterAllocator, CounterScope};
pub use error::{StoreError, StoreResult};
pub use kv::{KvStore, MemoryKv, WriteBatch};
pub use registry::{
    MappedRow, MigrationReport, MigrationStatus, RowMapping, SchemaVersionRegistry,
};
pub use schema::{FieldType, Key, ResourceId, Row, ScalarType, TableSchema, Value};
pub use spatial::{Coord, SpatialHandle, SpatialIndex};
pub use table::{RecordTable, Store};
pub use world::{AuditFinding, World};
