//! Storage Layer - durable world store
//!
//! Opens the LMDB backend and binds the world tables on top of it:
//! ```text
//! [Gameplay / maintenance tool]
//!       ↓
//! [World handles: collections, spatial layers, counters, registry]
//!       ↓
//! [Store (catalog + KeyedLocks)]
//!       ↓
//! [LmdbKv]
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! let config = storage::config_from_env(StoreConfig::default());
//! let storage = storage::init_storage(&config)?;
//! storage.world.inventory_tools.append(&character_id, tool_id)?;
//! ```

pub mod lmdb_kv;

use std::sync::Arc;
use tracing::info;
use world_core::{Store, StoreConfig, StoreError, World};

use self::lmdb_kv::{LmdbError, LmdbKv};

/// LMDB requires the map size to be a multiple of the OS page size
pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Lmdb(#[from] LmdbError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// An opened world together with its backend handle
#[derive(Debug, Clone)]
pub struct WorldStorage {
    pub world: World,
    pub kv: Arc<LmdbKv>,
}

/// Open the LMDB environment from `config` and bind the world tables
pub fn init_storage(config: &StoreConfig) -> Result<WorldStorage, StorageError> {
    let kv = Arc::new(LmdbKv::open(&config.lmdb_path, config.lmdb_max_size)?);
    let store = Store::new(kv.clone(), &config.namespace);
    let world = World::open(store, config)?;
    info!(
        path = %config.lmdb_path,
        namespace = %config.namespace,
        "World storage initialized"
    );
    Ok(WorldStorage { world, kv })
}

/// Round `bytes` up to a whole number of pages
pub fn page_aligned(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Overlay `WORLD_*` environment variables on `base`
pub fn config_from_env(base: StoreConfig) -> StoreConfig {
    config_from_vars(base, |name| std::env::var(name).ok())
}

/// Same as [`config_from_env`] with an injectable variable source
pub fn config_from_vars<F>(mut config: StoreConfig, var: F) -> StoreConfig
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = var("WORLD_DB_PATH") {
        config.lmdb_path = path;
    }
    if let Some(size) = var("WORLD_DB_MAX_SIZE").and_then(|s| s.parse::<usize>().ok()) {
        config.lmdb_max_size = size;
    }
    config.lmdb_max_size = page_aligned(config.lmdb_max_size);
    if let Some(namespace) = var("WORLD_NAMESPACE") {
        config.namespace = namespace;
    }
    if let Some(batch) = var("WORLD_MIGRATION_BATCH").and_then(|s| s.parse::<usize>().ok()) {
        config.migration.batch_size = batch.max(1);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_page_aligned() {
        assert_eq!(page_aligned(0), 0);
        assert_eq!(page_aligned(1), 4096);
        assert_eq!(page_aligned(4096), 4096);
        assert_eq!(page_aligned(500_000_000), 500_002_816);
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from_vars(
            StoreConfig::default(),
            vars(&[
                ("WORLD_DB_PATH", "/tmp/world"),
                ("WORLD_DB_MAX_SIZE", "10000"),
                ("WORLD_NAMESPACE", "staging"),
                ("WORLD_MIGRATION_BATCH", "50"),
            ]),
        );
        assert_eq!(config.lmdb_path, "/tmp/world");
        assert_eq!(config.lmdb_max_size, 12288);
        assert_eq!(config.namespace, "staging");
        assert_eq!(config.migration.batch_size, 50);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = config_from_vars(
            StoreConfig::default(),
            vars(&[("WORLD_DB_MAX_SIZE", "lots"), ("WORLD_MIGRATION_BATCH", "-1")]),
        );
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn test_init_storage_opens_world() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            lmdb_path: dir.path().to_string_lossy().into_owned(),
            lmdb_max_size: 10 * 1024 * 1024,
            ..StoreConfig::default()
        };
        let storage = init_storage(&config).unwrap();
        assert!(storage.world.store.tables().contains(&"InventoryToolIndex".to_string()));
        assert!(storage.kv.stats().unwrap().entries > 0);
    }
}
