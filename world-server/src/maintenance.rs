//! Maintenance commands behind the `world-store` binary

use crate::storage::lmdb_kv::LmdbStats;
use crate::storage::{StorageError, WorldStorage};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;
use world_core::registry::EntityStatus;
use world_core::world::{builtin_mapping, World};
use world_core::{AuditFinding, MigrationReport, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stats,
    Check,
    Migrate { entity: String },
    Config,
}

impl Command {
    pub const USAGE: &'static str = "usage: world-store <stats | check | migrate <entity> | config>";

    /// Parse the arguments after the program name
    pub fn parse(args: &[String]) -> Result<Self, String> {
        match args {
            [] => Ok(Command::Stats),
            [cmd] if cmd == "stats" => Ok(Command::Stats),
            [cmd] if cmd == "check" => Ok(Command::Check),
            [cmd] if cmd == "config" => Ok(Command::Config),
            [cmd, entity] if cmd == "migrate" => Ok(Command::Migrate {
                entity: entity.clone(),
            }),
            [cmd] if cmd == "migrate" => Err("migrate needs an entity name".to_string()),
            _ => Err(format!("unknown command: {}", args.join(" "))),
        }
    }
}

/// Snapshot of what the store holds
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub tables: BTreeMap<String, u64>,
    pub counters: BTreeMap<String, u64>,
    pub entities: Vec<EntityStatus>,
    pub lmdb: LmdbStats,
}

pub fn collect_stats(storage: &WorldStorage) -> Result<StoreStats, StorageError> {
    let world = &storage.world;
    let mut tables = BTreeMap::new();
    for name in world.store.tables() {
        tables.insert(name.clone(), world.store.table(&name)?.count()?);
    }
    let mut counters = BTreeMap::new();
    for scope in World::counter_scopes() {
        counters.insert(scope.to_string(), world.counters.current(&scope)?);
    }
    let mut entities = Vec::new();
    for entity in world.registry.entities() {
        entities.push(world.registry.state_of(&entity)?);
    }
    Ok(StoreStats {
        tables,
        counters,
        entities,
        lmdb: storage.kv.stats()?,
    })
}

pub fn run_check(world: &World) -> StoreResult<Vec<AuditFinding>> {
    let findings = world.audit()?;
    info!(faults = findings.len(), "Index audit finished");
    Ok(findings)
}

/// Migrate `entity` to its latest version with the built-in mapping. Blocks
/// until done or until the registry's control is paused.
pub fn run_migration(world: &World, entity: &str) -> StoreResult<MigrationReport> {
    let (to, mapping) =
        builtin_mapping(entity).ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
    info!(entity, to, "Starting migration");
    world.registry.migrate(entity, to, mapping)
}
