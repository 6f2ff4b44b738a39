//! Store configuration
//!
//! Loaded from JSON or built from defaults; the server overlays environment
//! variables on top.

use crate::logging::TracingConfig;
use crate::registry::MigrationConfig;
use crate::schema::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default LMDB map size (1 GiB)
pub const DEFAULT_LMDB_MAX_SIZE: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Table namespace, first 14 bytes of every table id
    pub namespace: String,
    pub migration: MigrationConfig,
    pub lmdb_path: String,
    pub lmdb_max_size: usize,
    /// Version taking writes per versioned entity on a fresh store
    pub authoritative_versions: BTreeMap<String, u16>,
    pub tracing: TracingConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let authoritative_versions = [("Equipment2Info", 2u16), ("Tool", 2u16)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            migration: MigrationConfig::default(),
            lmdb_path: "./world_data".to_string(),
            lmdb_max_size: DEFAULT_LMDB_MAX_SIZE,
            authoritative_versions,
            tracing: TracingConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Configured authoritative version, falling back to `latest`
    pub fn authoritative_for(&self, entity: &str, latest: u16) -> u16 {
        self.authoritative_versions
            .get(entity)
            .copied()
            .unwrap_or(latest)
    }

    pub fn with_authoritative(mut self, entity: &str, version: u16) -> Self {
        self.authoritative_versions
            .insert(entity.to_string(), version);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Option<Self> {
        serde_json::from_str(json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.namespace, "app");
        assert_eq!(config.migration.batch_size, 500);
        assert_eq!(config.authoritative_for("Tool", 9), 2);
        assert_eq!(config.authoritative_for("Unknown", 9), 9);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = StoreConfig::default().with_authoritative("Tool", 1);
        let restored = StoreConfig::from_json(&config.to_json()).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = StoreConfig::from_json(r#"{"namespace": "test"}"#).unwrap();
        assert_eq!(config.namespace, "test");
        assert_eq!(config.lmdb_max_size, DEFAULT_LMDB_MAX_SIZE);
    }

    #[test]
    fn test_invalid_json() {
        assert!(StoreConfig::from_json("not json").is_none());
    }
}
