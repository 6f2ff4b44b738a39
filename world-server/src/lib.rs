//! World Store Server Library
//!
//! Durable side of the world store:
//! - LMDB embedded database backend (`KvStore` over heed)
//! - Storage initialization from `StoreConfig` plus `WORLD_*` environment overrides
//! - Maintenance commands (stats, index audit, migrations) used by the `world-store` binary

pub mod maintenance;
pub mod storage;

pub use storage::lmdb_kv::{LmdbError, LmdbKv, LmdbStats};
pub use storage::{config_from_env, init_storage, StorageError, WorldStorage};
