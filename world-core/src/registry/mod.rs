//! Schema version registry and resumable table migrations
//!
//! A versioned entity (`Equipment2Info`, `Tool`) is one logical concept
//! backed by successive tables. Exactly one version is authoritative for
//! writes. Moving to a new version:
//!
//! 1. `begin_migration` - `Active(from) -> Migrating { from, to }`
//! 2. `step` - copy a batch of old rows through a [`RowMapping`], one atomic
//!    write per row (new row, id remap or skip record, checkpoint)
//! 3. `complete_migration` - relink dependent indices for remapped ids,
//!    `Migrating -> Active(to)`, old version retired
//!
//! State, checkpoint, remaps and skips live in system tables, so a paused or
//! interrupted migration resumes from the last migrated row after a restart.
//! Old rows are never deleted.
//!
//! Versioned writes hold the entity's gate shared; migration batches and
//! state transitions hold it exclusively, so the checkpoint never moves past
//! a row while that row is being written.

use crate::collection::IndexDependent;
use crate::error::{StoreError, StoreResult};
use crate::kv::WriteBatch;
use crate::logging::TimingSpan;
use crate::schema::{display_key, hex, FieldType, Key, Row, ScalarType, TableSchema, Value};
use crate::table::{RecordTable, Store};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SCHEMA_VERSION_TABLE: &str = "SchemaVersion";
pub const MIGRATION_REMAP_TABLE: &str = "MigrationRemap";
pub const MIGRATION_SKIP_TABLE: &str = "MigrationSkip";

fn version_schema() -> TableSchema {
    TableSchema::new(SCHEMA_VERSION_TABLE)
        .key_field("entity", FieldType::BYTES32)
        .value_field("active", FieldType::U16)
        .value_field("migrating", FieldType::BOOL)
        .value_field("target", FieldType::U16)
        .value_field("hasCheckpoint", FieldType::BOOL)
        .value_field("migrated", FieldType::U64)
        .value_field("skipped", FieldType::U64)
        .value_field("seq", FieldType::U64)
        .value_field("checkpoint", FieldType::Bytes)
        .value_field("retired", FieldType::Array(ScalarType::U16))
}

fn remap_schema() -> TableSchema {
    TableSchema::new(MIGRATION_REMAP_TABLE)
        .key_field("entity", FieldType::BYTES32)
        .key_field("to", FieldType::U16)
        .key_field("seq", FieldType::U64)
        .value_field("oldKey", FieldType::Bytes)
        .value_field("newKey", FieldType::Bytes)
}

fn skip_schema() -> TableSchema {
    TableSchema::new(MIGRATION_SKIP_TABLE)
        .key_field("entity", FieldType::BYTES32)
        .key_field("to", FieldType::U16)
        .key_field("seq", FieldType::U64)
        .value_field("from", FieldType::U16)
        .value_field("oldKey", FieldType::Bytes)
        .value_field("reason", FieldType::Str)
}

// ============================================================================
// Public types
// ============================================================================

/// Batch and retry limits for migrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub batch_size: usize,
    pub max_row_attempts: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_row_attempts: 3,
        }
    }
}

/// Pause switch checked between migration batches
#[derive(Debug, Clone, Default)]
pub struct MigrationControl {
    paused: Arc<AtomicBool>,
}

impl MigrationControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionState {
    Active {
        version: u16,
    },
    Migrating {
        from: u16,
        to: u16,
        /// Encoded key of the last old row processed
        checkpoint: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub entity: String,
    pub state: VersionState,
    pub retired: Vec<u16>,
    /// Rows migrated by the current (or last) migration
    pub migrated: u64,
    pub skipped: u64,
    /// Last sequence number given to a remap or skip record
    pub seq: u64,
}

impl EntityStatus {
    /// Version that currently takes writes
    pub fn authoritative(&self) -> u16 {
        match self.state {
            VersionState::Active { version } => version,
            VersionState::Migrating { from, .. } => from,
        }
    }
}

/// Output of a row mapping: the row's key and value fields under the new
/// version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRow {
    pub key: Key,
    pub row: Row,
}

/// Pure old-row -> new-row transformation. An `Err` skips the row.
pub trait RowMapping: Send + Sync {
    fn map_row(&self, key: &Key, row: &Row) -> Result<MappedRow, String>;
}

impl<F> RowMapping for F
where
    F: Fn(&Key, &Row) -> Result<MappedRow, String> + Send + Sync,
{
    fn map_row(&self, key: &Key, row: &Row) -> Result<MappedRow, String> {
        self(key, row)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Completed,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub entity: String,
    pub from: u16,
    pub to: u16,
    pub migrated: u64,
    pub skipped: Vec<SkippedRow>,
    pub relinked: u64,
    pub relink_conflicts: Vec<String>,
    pub status: MigrationStatus,
}

impl MigrationReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Progress of one `step` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub processed: usize,
    pub migrated: usize,
    pub skipped: usize,
    /// No old rows remain after the checkpoint
    pub done: bool,
}

/// Relink totals of `complete_migration`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub relinked: u64,
    pub conflicts: Vec<String>,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone)]
struct Dependent {
    key_field: String,
    target: Arc<dyn IndexDependent>,
}

struct EntityEntry {
    tables: BTreeMap<u16, RecordTable>,
    /// Shared by versioned writes, exclusive for batches and transitions
    gate: Arc<RwLock<()>>,
    status: EntityStatus,
    mapping: Option<Arc<dyn RowMapping>>,
    dependents: Vec<Dependent>,
}

/// Tables and mapping of a running migration
struct Plan {
    from: RecordTable,
    to: RecordTable,
    from_version: u16,
    to_version: u16,
    mapping: Arc<dyn RowMapping>,
}

enum RowOutcome {
    Migrated,
    Skipped(String),
    Vanished,
}

pub struct SchemaVersionRegistry {
    store: Store,
    versions: RecordTable,
    remaps: RecordTable,
    skips: RecordTable,
    entities: RwLock<HashMap<String, EntityEntry>>,
    /// Held around every read-modify-write of an `EntityStatus`
    status_lock: Mutex<()>,
    config: MigrationConfig,
    control: MigrationControl,
}

impl std::fmt::Debug for SchemaVersionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaVersionRegistry")
            .field("entities", &self.entities())
            .field("config", &self.config)
            .finish()
    }
}

impl SchemaVersionRegistry {
    pub fn new(store: &Store, config: MigrationConfig) -> StoreResult<Self> {
        Ok(Self {
            store: store.clone(),
            versions: store.declare(version_schema())?,
            remaps: store.declare(remap_schema())?,
            skips: store.declare(skip_schema())?,
            entities: RwLock::new(HashMap::new()),
            status_lock: Mutex::new(()),
            config,
            control: MigrationControl::default(),
        })
    }

    pub fn config(&self) -> MigrationConfig {
        self.config
    }

    pub fn control(&self) -> MigrationControl {
        self.control.clone()
    }

    /// Registered entity names, sorted
    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entities.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register an entity with its version tables. `authoritative` names the
    /// version taking writes on a fresh store; once state has been persisted
    /// the stored state is used instead.
    pub fn register(
        &self,
        entity: &str,
        versions: Vec<(u16, TableSchema)>,
        authoritative: u16,
    ) -> StoreResult<EntityStatus> {
        let entity_key = entity_key(entity)?;
        if versions.is_empty() {
            return Err(StoreError::transition(entity, "no versions given"));
        }
        if self.entities.read().contains_key(entity) {
            return Err(StoreError::transition(entity, "already registered"));
        }

        let mut tables = BTreeMap::new();
        for (version, schema) in versions {
            let table = self.store.declare(schema)?;
            if tables.insert(version, table).is_some() {
                return Err(StoreError::transition(
                    entity,
                    format!("version {} listed twice", version),
                ));
            }
        }
        if !tables.contains_key(&authoritative) {
            return Err(StoreError::transition(
                entity,
                format!("authoritative version {} is not registered", authoritative),
            ));
        }

        let status = match self.versions.get(&[entity_key.clone()])? {
            Some(row) => {
                let status = status_from_row(entity, &row)?;
                let referenced = match &status.state {
                    VersionState::Active { version } => vec![*version],
                    VersionState::Migrating { from, to, .. } => vec![*from, *to],
                };
                if let Some(missing) = referenced.iter().find(|v| !tables.contains_key(v)) {
                    return Err(StoreError::transition(
                        entity,
                        format!("stored state references unregistered version {}", missing),
                    ));
                }
                if status.authoritative() != authoritative {
                    warn!(
                        entity,
                        configured = authoritative,
                        stored = status.authoritative(),
                        "Configured authoritative version differs from stored state, using stored"
                    );
                }
                status
            }
            None => {
                let status = EntityStatus {
                    entity: entity.to_string(),
                    state: VersionState::Active {
                        version: authoritative,
                    },
                    retired: Vec::new(),
                    migrated: 0,
                    skipped: 0,
                    seq: 0,
                };
                self.versions.put(&[entity_key], &status_row(&status))?;
                status
            }
        };

        info!(entity, state = ?status.state, "Registered versioned entity");
        self.entities.write().insert(
            entity.to_string(),
            EntityEntry {
                tables,
                gate: Arc::new(RwLock::new(())),
                status: status.clone(),
                mapping: None,
                dependents: Vec::new(),
            },
        );
        Ok(status)
    }

    /// Attach an index whose elements are ids of `entity`, taken from key
    /// field `key_field`
    pub fn add_dependent(
        &self,
        entity: &str,
        key_field: &str,
        target: Arc<dyn IndexDependent>,
    ) -> StoreResult<()> {
        let mut entities = self.entities.write();
        let entry = entities
            .get_mut(entity)
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
        if let Some((version, _)) = entry
            .tables
            .iter()
            .find(|(_, t)| t.schema().key_index(key_field).is_none())
        {
            return Err(StoreError::schema(
                entity,
                format!("version {} has no key field '{}'", version, key_field),
            ));
        }
        entry.dependents.push(Dependent {
            key_field: key_field.to_string(),
            target,
        });
        Ok(())
    }

    pub fn state_of(&self, entity: &str) -> StoreResult<EntityStatus> {
        self.entities
            .read()
            .get(entity)
            .map(|e| e.status.clone())
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))
    }

    /// Current write table
    pub fn authoritative(&self, entity: &str) -> StoreResult<RecordTable> {
        let entities = self.entities.read();
        let entry = entities
            .get(entity)
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
        table_of(entity, entry, entry.status.authoritative())
    }

    pub fn version_table(&self, entity: &str, version: u16) -> StoreResult<RecordTable> {
        let entities = self.entities.read();
        let entry = entities
            .get(entity)
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
        table_of(entity, entry, version)
    }

    pub fn is_retired(&self, entity: &str, version: u16) -> StoreResult<bool> {
        Ok(self.state_of(entity)?.retired.contains(&version))
    }

    // ------------------------------------------------------------------------
    // Versioned row access
    // ------------------------------------------------------------------------

    pub fn get(&self, entity: &str, key: &[Value]) -> StoreResult<Option<Row>> {
        self.authoritative(entity)?.get(key)
    }

    /// Write to the authoritative version. While migrating, rows at or before
    /// the checkpoint are also mapped into the new version.
    pub fn put(&self, entity: &str, key: &[Value], row: &[Value]) -> StoreResult<()> {
        let gate = self.gate(entity)?;
        let _writer = gate.read();
        let table = self.authoritative(entity)?;
        let lock_key = table.storage_key(key)?;
        let _guard = self.store.locks().lock(&lock_key);

        let mut batch = WriteBatch::new();
        table.put_in(&mut batch, key, row)?;
        let plan = match self.dual_write_plan(entity, &lock_key[32..])? {
            Some(plan) => plan,
            None => return self.store.commit(batch),
        };

        let encoded = &lock_key[32..];
        let key: Key = key.to_vec();
        if let Some(previous) = table.get(&key)? {
            if let Ok(stale) = map_checked(&plan, &key, &previous) {
                plan.to.delete_in(&mut batch, &stale.key)?;
            }
        }

        let _status = self.status_lock.lock();
        let mut status = self.state_of(entity)?;
        match map_checked(&plan, &key, &row.to_vec()) {
            Ok(mapped) => {
                plan.to.put_in(&mut batch, &mapped.key, &mapped.row)?;
                let new_encoded = crate::codec::encode_key(plan.to.schema(), &mapped.key)?;
                if new_encoded == encoded {
                    return self.store.commit(batch);
                }
                status.seq += 1;
                self.stage_remap(&mut batch, entity, &plan, status.seq, encoded, new_encoded)?;
            }
            Err(reason) => {
                warn!(entity, key = %display_key(&key), %reason, "Dual write skipped");
                status.skipped += 1;
                status.seq += 1;
                self.stage_skip(&mut batch, entity, &plan, status.seq, encoded, &reason)?;
            }
        }
        self.versions
            .put_in(&mut batch, &[entity_key(entity)?], &status_row(&status))?;
        self.store.commit(batch)?;
        self.set_status(entity, status);
        Ok(())
    }

    pub fn delete(&self, entity: &str, key: &[Value]) -> StoreResult<()> {
        let gate = self.gate(entity)?;
        let _writer = gate.read();
        let table = self.authoritative(entity)?;
        let lock_key = table.storage_key(key)?;
        let _guard = self.store.locks().lock(&lock_key);

        let mut batch = WriteBatch::new();
        if let Some(plan) = self.dual_write_plan(entity, &lock_key[32..])? {
            let key: Key = key.to_vec();
            if let Some(previous) = table.get(&key)? {
                if let Ok(mapped) = map_checked(&plan, &key, &previous) {
                    plan.to.delete_in(&mut batch, &mapped.key)?;
                }
            }
        }
        table.delete_in(&mut batch, key)?;
        self.store.commit(batch)
    }

    /// Migration plan when `encoded` is at or before the checkpoint
    fn dual_write_plan(&self, entity: &str, encoded: &[u8]) -> StoreResult<Option<Plan>> {
        let entities = self.entities.read();
        let entry = entities
            .get(entity)
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
        let (from, to, checkpoint) = match &entry.status.state {
            VersionState::Migrating { from, to, checkpoint } => (*from, *to, checkpoint),
            VersionState::Active { .. } => return Ok(None),
        };
        let covered = matches!(checkpoint, Some(cp) if encoded <= cp.as_slice());
        let mapping = match (&entry.mapping, covered) {
            (Some(mapping), true) => mapping.clone(),
            (None, true) => {
                return Err(StoreError::transition(
                    entity,
                    "migration in progress without a row mapping; resume it first",
                ))
            }
            _ => return Ok(None),
        };
        Ok(Some(Plan {
            from: table_of(entity, entry, from)?,
            to: table_of(entity, entry, to)?,
            from_version: from,
            to_version: to,
            mapping,
        }))
    }

    // ------------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------------

    /// Start migrating `entity` to version `to`. Calling it again for the
    /// same target re-attaches the mapping and resumes.
    pub fn begin_migration(
        &self,
        entity: &str,
        to: u16,
        mapping: Arc<dyn RowMapping>,
    ) -> StoreResult<EntityStatus> {
        let gate = self.gate(entity)?;
        let _exclusive = gate.write();

        let status = self.state_of(entity)?;
        let next = match status.state.clone() {
            VersionState::Migrating { to: target, .. } if target == to => {
                info!(entity, to, "Resuming migration");
                self.attach_mapping(entity, mapping);
                return Ok(status);
            }
            VersionState::Migrating { from, to: target, .. } => {
                return Err(StoreError::transition(
                    entity,
                    format!("already migrating {} -> {}", from, target),
                ))
            }
            VersionState::Active { version } => {
                let from = version;
                if from == to {
                    return Err(StoreError::transition(
                        entity,
                        format!("version {} is already active", to),
                    ));
                }
                if status.retired.contains(&to) {
                    return Err(StoreError::transition(
                        entity,
                        format!("version {} is retired", to),
                    ));
                }
                self.version_table(entity, to)?;
                EntityStatus {
                    state: VersionState::Migrating {
                        from,
                        to,
                        checkpoint: None,
                    },
                    migrated: 0,
                    skipped: 0,
                    ..status
                }
            }
        };

        self.versions
            .put(&[entity_key(entity)?], &status_row(&next))?;
        self.set_status(entity, next.clone());
        self.attach_mapping(entity, mapping);
        info!(entity, state = ?next.state, "Migration started");
        Ok(next)
    }

    /// Migrate up to `batch_size` old rows after the checkpoint. Versioned
    /// writes to the entity wait until the batch is done.
    pub fn step(&self, entity: &str, batch_size: usize) -> StoreResult<StepOutcome> {
        let gate = self.gate(entity)?;
        let _exclusive = gate.write();
        self.step_locked(entity, batch_size)
    }

    fn step_locked(&self, entity: &str, batch_size: usize) -> StoreResult<StepOutcome> {
        let (plan, checkpoint) = self.plan(entity)?;
        let page = plan
            .from
            .scan_keys_after(checkpoint.as_deref(), batch_size.max(1))?;

        let mut outcome = StepOutcome {
            done: page.len() < batch_size.max(1),
            ..StepOutcome::default()
        };
        for (encoded, key) in page {
            match self.migrate_row(entity, &plan, &encoded, &key)? {
                RowOutcome::Migrated => outcome.migrated += 1,
                RowOutcome::Skipped(_) => outcome.skipped += 1,
                RowOutcome::Vanished => {}
            }
            outcome.processed += 1;
        }
        info!(
            entity,
            processed = outcome.processed,
            migrated = outcome.migrated,
            skipped = outcome.skipped,
            done = outcome.done,
            "Migration batch"
        );
        Ok(outcome)
    }

    /// Relink dependents, activate the new version and retire the old one
    pub fn complete_migration(&self, entity: &str) -> StoreResult<CompletionOutcome> {
        let gate = self.gate(entity)?;
        let _exclusive = gate.write();
        self.complete_locked(entity)
    }

    fn complete_locked(&self, entity: &str) -> StoreResult<CompletionOutcome> {
        let status = self.state_of(entity)?;
        let (from, to, checkpoint) = match status.state.clone() {
            VersionState::Migrating { from, to, checkpoint } => (from, to, checkpoint),
            VersionState::Active { .. } => {
                return Err(StoreError::transition(entity, "no migration in progress"))
            }
        };
        let from_table = self.version_table(entity, from)?;
        let to_table = self.version_table(entity, to)?;
        if !from_table
            .scan_keys_after(checkpoint.as_deref(), 1)?
            .is_empty()
        {
            return Err(StoreError::transition(
                entity,
                "old rows remain after the checkpoint",
            ));
        }

        let dependents = self
            .entities
            .read()
            .get(entity)
            .map(|e| e.dependents.clone())
            .unwrap_or_default();
        let mut outcome = CompletionOutcome::default();
        if !dependents.is_empty() {
            let pairs = self.remap_pairs(entity, to, &from_table, &to_table)?;
            for dependent in &dependents {
                let remap = field_remap(&pairs, &from_table, &to_table, &dependent.key_field);
                let relinked = dependent.target.relink(&remap)?;
                debug!(
                    entity,
                    dependent = %dependent.target.label(),
                    relinked = relinked.relinked,
                    "Relinked dependent index"
                );
                outcome.relinked += relinked.relinked;
                outcome.conflicts.extend(relinked.conflicts);
            }
        }

        let mut retired: BTreeSet<u16> = status.retired.iter().copied().collect();
        retired.insert(from);
        let next = EntityStatus {
            state: VersionState::Active { version: to },
            retired: retired.into_iter().collect(),
            ..status
        };
        self.versions
            .put(&[entity_key(entity)?], &status_row(&next))?;
        self.set_status(entity, next);
        if let Some(entry) = self.entities.write().get_mut(entity) {
            entry.mapping = None;
        }
        info!(entity, from, to, relinked = outcome.relinked, "Migration completed");
        Ok(outcome)
    }

    /// Run a migration to completion unless paused
    pub fn migrate(
        &self,
        entity: &str,
        to: u16,
        mapping: Arc<dyn RowMapping>,
    ) -> StoreResult<MigrationReport> {
        let _span = TimingSpan::new("migrate");
        let started = self.begin_migration(entity, to, mapping)?;
        let from = started.authoritative();

        loop {
            if self.control.is_paused() {
                let status = self.state_of(entity)?;
                info!(entity, migrated = status.migrated, "Migration paused");
                return Ok(MigrationReport {
                    entity: entity.to_string(),
                    from,
                    to,
                    migrated: status.migrated,
                    skipped: self.skipped_rows(entity, to)?,
                    relinked: 0,
                    relink_conflicts: Vec::new(),
                    status: MigrationStatus::Paused,
                });
            }
            if self.step(entity, self.config.batch_size)?.done {
                break;
            }
        }

        // Rows written ahead of the checkpoint since the last batch are
        // drained with writers held off, then the new version takes over
        let completion = {
            let gate = self.gate(entity)?;
            let _exclusive = gate.write();
            while !self.step_locked(entity, self.config.batch_size)?.done {}
            self.complete_locked(entity)?
        };
        let status = self.state_of(entity)?;
        Ok(MigrationReport {
            entity: entity.to_string(),
            from,
            to,
            migrated: status.migrated,
            skipped: self.skipped_rows(entity, to)?,
            relinked: completion.relinked,
            relink_conflicts: completion.conflicts,
            status: MigrationStatus::Completed,
        })
    }

    /// Rows skipped while migrating `entity` to `to`
    pub fn skipped_rows(&self, entity: &str, to: u16) -> StoreResult<Vec<SkippedRow>> {
        let tables = self
            .entities
            .read()
            .get(entity)
            .map(|e| e.tables.clone())
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
        let mut rows = Vec::new();
        for entry in self.skips.scan(&[entity_key(entity)?, Value::U16(to)])? {
            let (_, row) = entry?;
            let (from, old_key, reason) = match row.as_slice() {
                [Value::U16(from), Value::Bytes(old_key), Value::Str(reason)] => {
                    (*from, old_key, reason.clone())
                }
                _ => {
                    return Err(StoreError::Codec(format!(
                        "malformed {} row for {}",
                        MIGRATION_SKIP_TABLE, entity
                    )))
                }
            };
            let key = tables
                .get(&from)
                .and_then(|t| crate::codec::decode_key(t.schema(), old_key).ok())
                .map(|k| display_key(&k))
                .unwrap_or_else(|| format!("0x{}", hex(old_key)));
            rows.push(SkippedRow { key, reason });
        }
        Ok(rows)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn plan(&self, entity: &str) -> StoreResult<(Plan, Option<Vec<u8>>)> {
        let entities = self.entities.read();
        let entry = entities
            .get(entity)
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
        let (from, to, checkpoint) = match &entry.status.state {
            VersionState::Migrating { from, to, checkpoint } => (*from, *to, checkpoint.clone()),
            VersionState::Active { .. } => {
                return Err(StoreError::transition(entity, "no migration in progress"))
            }
        };
        let mapping = entry.mapping.clone().ok_or_else(|| {
            StoreError::transition(entity, "no row mapping attached; call begin_migration to resume")
        })?;
        Ok((
            Plan {
                from: table_of(entity, entry, from)?,
                to: table_of(entity, entry, to)?,
                from_version: from,
                to_version: to,
                mapping,
            },
            checkpoint,
        ))
    }

    fn migrate_row(
        &self,
        entity: &str,
        plan: &Plan,
        encoded: &[u8],
        key: &Key,
    ) -> StoreResult<RowOutcome> {
        let attempts = self.config.max_row_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.try_migrate_row(entity, plan, encoded, key, None) {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(
                        entity,
                        key = %display_key(key),
                        attempt,
                        error = %e,
                        "Row migration attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }
        self.try_migrate_row(
            entity,
            plan,
            encoded,
            key,
            Some(format!("failed after {} attempts: {}", attempts, last_error)),
        )
    }

    /// Migrate (or, with `forced_skip`, skip) one row and advance the
    /// checkpoint in a single commit
    fn try_migrate_row(
        &self,
        entity: &str,
        plan: &Plan,
        encoded: &[u8],
        key: &Key,
        forced_skip: Option<String>,
    ) -> StoreResult<RowOutcome> {
        let lock_key = plan.from.prefixed(encoded);
        let _guard = self.store.locks().lock(&lock_key);

        let _status = self.status_lock.lock();
        let mut status = self.state_of(entity)?;
        let mut batch = WriteBatch::new();
        let outcome = match forced_skip {
            Some(reason) => RowOutcome::Skipped(reason),
            None => match plan.from.get(key)? {
                None => RowOutcome::Vanished,
                Some(row) => match map_checked(plan, key, &row) {
                    Err(reason) => RowOutcome::Skipped(reason),
                    Ok(mapped) => {
                        if plan.to.exists(&mapped.key)? {
                            RowOutcome::Skipped(format!(
                                "target key {} already exists",
                                display_key(&mapped.key)
                            ))
                        } else {
                            plan.to.put_in(&mut batch, &mapped.key, &mapped.row)?;
                            status.migrated += 1;
                            let new_encoded = crate::codec::encode_key(plan.to.schema(), &mapped.key)?;
                            if new_encoded != encoded {
                                status.seq += 1;
                                self.stage_remap(
                                    &mut batch,
                                    entity,
                                    plan,
                                    status.seq,
                                    encoded,
                                    new_encoded,
                                )?;
                            }
                            RowOutcome::Migrated
                        }
                    }
                },
            },
        };

        if let RowOutcome::Skipped(reason) = &outcome {
            status.skipped += 1;
            status.seq += 1;
            self.stage_skip(&mut batch, entity, plan, status.seq, encoded, reason)?;
        }
        if let VersionState::Migrating { checkpoint, .. } = &mut status.state {
            *checkpoint = Some(encoded.to_vec());
        }
        self.versions
            .put_in(&mut batch, &[entity_key(entity)?], &status_row(&status))?;
        self.store.commit(batch)?;
        self.set_status(entity, status);

        if let RowOutcome::Skipped(reason) = &outcome {
            warn!(entity, key = %display_key(key), %reason, "Row skipped");
        }
        Ok(outcome)
    }

    fn stage_skip(
        &self,
        batch: &mut WriteBatch,
        entity: &str,
        plan: &Plan,
        seq: u64,
        encoded: &[u8],
        reason: &str,
    ) -> StoreResult<()> {
        self.skips.put_in(
            batch,
            &[entity_key(entity)?, Value::U16(plan.to_version), Value::U64(seq)],
            &[
                Value::U16(plan.from_version),
                Value::Bytes(encoded.to_vec()),
                Value::Str(reason.to_string()),
            ],
        )
    }

    fn stage_remap(
        &self,
        batch: &mut WriteBatch,
        entity: &str,
        plan: &Plan,
        seq: u64,
        old_encoded: &[u8],
        new_encoded: Vec<u8>,
    ) -> StoreResult<()> {
        self.remaps.put_in(
            batch,
            &[entity_key(entity)?, Value::U16(plan.to_version), Value::U64(seq)],
            &[Value::Bytes(old_encoded.to_vec()), Value::Bytes(new_encoded)],
        )
    }

    fn remap_pairs(
        &self,
        entity: &str,
        to: u16,
        from_table: &RecordTable,
        to_table: &RecordTable,
    ) -> StoreResult<Vec<(Key, Key)>> {
        let mut pairs = Vec::new();
        for entry in self.remaps.scan(&[entity_key(entity)?, Value::U16(to)])? {
            let (_, row) = entry?;
            if let [Value::Bytes(old), Value::Bytes(new)] = row.as_slice() {
                let old_key = crate::codec::decode_key(from_table.schema(), old)?;
                let new_key = crate::codec::decode_key(to_table.schema(), new)?;
                pairs.push((old_key, new_key));
            }
        }
        Ok(pairs)
    }

    fn gate(&self, entity: &str) -> StoreResult<Arc<RwLock<()>>> {
        self.entities
            .read()
            .get(entity)
            .map(|e| e.gate.clone())
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))
    }

    fn attach_mapping(&self, entity: &str, mapping: Arc<dyn RowMapping>) {
        if let Some(entry) = self.entities.write().get_mut(entity) {
            entry.mapping = Some(mapping);
        }
    }

    fn set_status(&self, entity: &str, status: EntityStatus) {
        if let Some(entry) = self.entities.write().get_mut(entity) {
            entry.status = status;
        }
    }
}

fn table_of(entity: &str, entry: &EntityEntry, version: u16) -> StoreResult<RecordTable> {
    entry.tables.get(&version).cloned().ok_or_else(|| {
        StoreError::transition(entity, format!("version {} is not registered", version))
    })
}

fn map_checked(plan: &Plan, key: &Key, row: &Row) -> Result<MappedRow, String> {
    let mapped = plan.mapping.map_row(key, row)?;
    let schema = plan.to.schema();
    schema
        .check_key(&mapped.key)
        .and_then(|_| schema.check_row(&mapped.row))
        .map_err(|e| e.to_string())?;
    Ok(mapped)
}

/// Old id -> new id of one key field, for pairs where it changed
fn field_remap(
    pairs: &[(Key, Key)],
    from_table: &RecordTable,
    to_table: &RecordTable,
    field: &str,
) -> HashMap<Value, Value> {
    let (old_idx, new_idx) = match (
        from_table.schema().key_index(field),
        to_table.schema().key_index(field),
    ) {
        (Some(o), Some(n)) => (o, n),
        _ => return HashMap::new(),
    };
    pairs
        .iter()
        .filter_map(|(old, new)| {
            let (o, n) = (old.get(old_idx)?, new.get(new_idx)?);
            (o != n).then(|| (o.clone(), n.clone()))
        })
        .collect()
}

fn entity_key(entity: &str) -> StoreResult<Value> {
    Value::bytes32_from_str(entity).ok_or_else(|| {
        StoreError::schema(
            SCHEMA_VERSION_TABLE,
            format!("entity name '{}' exceeds 32 bytes", entity),
        )
    })
}

fn status_row(status: &EntityStatus) -> Row {
    let (active, migrating, target, checkpoint) = match &status.state {
        VersionState::Active { version } => (*version, false, 0, None),
        VersionState::Migrating { from, to, checkpoint } => (*from, true, *to, checkpoint.clone()),
    };
    vec![
        Value::U16(active),
        Value::Bool(migrating),
        Value::U16(target),
        Value::Bool(checkpoint.is_some()),
        Value::U64(status.migrated),
        Value::U64(status.skipped),
        Value::U64(status.seq),
        Value::Bytes(checkpoint.unwrap_or_default()),
        Value::Array(status.retired.iter().map(|v| Value::U16(*v)).collect()),
    ]
}

fn status_from_row(entity: &str, row: &Row) -> StoreResult<EntityStatus> {
    let bad = || StoreError::Codec(format!("malformed {} row for {}", SCHEMA_VERSION_TABLE, entity));
    match row.as_slice() {
        [Value::U16(active), Value::Bool(migrating), Value::U16(target), Value::Bool(has_checkpoint), Value::U64(migrated), Value::U64(skipped), Value::U64(seq), Value::Bytes(checkpoint), Value::Array(retired)] =>
        {
            let state = if *migrating {
                VersionState::Migrating {
                    from: *active,
                    to: *target,
                    checkpoint: has_checkpoint.then(|| checkpoint.clone()),
                }
            } else {
                VersionState::Active { version: *active }
            };
            let retired = retired
                .iter()
                .map(|v| match v {
                    Value::U16(v) => Ok(*v),
                    _ => Err(bad()),
                })
                .collect::<StoreResult<Vec<u16>>>()?;
            Ok(EntityStatus {
                entity: entity.to_string(),
                state,
                retired,
                migrated: *migrated,
                skipped: *skipped,
                seq: *seq,
            })
        }
        _ => Err(bad()),
    }
}
