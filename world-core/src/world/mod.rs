//! World tables and the handles gameplay systems use
//!
//! Declares the owner tables, binds every collection and spatial layer to
//! its satellite index (keeping the historical index table names), registers
//! the versioned entities and exposes the counter scopes.

use crate::collection::{
    CollectionDef, CollectionHandle, Element, IndexFault, IndexedCollection, OwnerKey,
};
use crate::config::StoreConfig;
use crate::counter::{CounterAllocator, CounterScope};
use crate::error::StoreResult;
use crate::registry::{MappedRow, RowMapping, SchemaVersionRegistry};
use crate::schema::{display_key, FieldType, Key, Row, ScalarType, TableSchema, Value};
use crate::spatial::{SpatialHandle, SpatialIndex};
use crate::table::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const CHAR_INVENTORY: &str = "CharInventory";
pub const CHAR_STORAGE: &str = "CharStorage";
pub const TILE_INFO: &str = "TileInfo3";
pub const TILE_INVENTORY: &str = "TileInventory";
pub const GACHA: &str = "GachaV4";
pub const GUILD: &str = "Guild";

pub const EQUIPMENT_INFO_ENTITY: &str = "Equipment2Info";
pub const TOOL_ENTITY: &str = "Tool";

const U64_LIST: FieldType = FieldType::Array(ScalarType::U64);

// ============================================================================
// Owner tables
// ============================================================================

pub fn char_inventory_schema() -> TableSchema {
    TableSchema::new(CHAR_INVENTORY)
        .key_field("characterId", FieldType::U64)
        .value_field("toolIds", U64_LIST)
        .value_field("equipmentIds", U64_LIST)
}

pub fn char_storage_schema() -> TableSchema {
    TableSchema::new(CHAR_STORAGE)
        .key_field("characterId", FieldType::U64)
        .key_field("cityId", FieldType::U64)
        .value_field("maxWeight", FieldType::U32)
        .value_field("weight", FieldType::U32)
        .value_field("toolIds", U64_LIST)
        .value_field("equipmentIds", U64_LIST)
}

pub fn tile_info_schema() -> TableSchema {
    TableSchema::new(TILE_INFO)
        .key_field("x", FieldType::I32)
        .key_field("y", FieldType::I32)
        .value_field("kingdomId", FieldType::U8)
        .value_field("farmSlot", FieldType::U8)
        .value_field("zoneType", FieldType::U8)
        .value_field("occupiedTime", FieldType::U64)
        .value_field("replenishTime", FieldType::U64)
        .value_field("itemIds", U64_LIST)
        .value_field("farmingQuotas", FieldType::Array(ScalarType::U16))
        .value_field("monsterIds", U64_LIST)
}

/// Loot dropped on a tile
pub fn tile_inventory_schema() -> TableSchema {
    TableSchema::new(TILE_INVENTORY)
        .key_field("x", FieldType::I32)
        .key_field("y", FieldType::I32)
        .value_field("otherItemIds", U64_LIST)
        .value_field("equipmentIds", U64_LIST)
}

pub fn gacha_schema() -> TableSchema {
    TableSchema::new(GACHA)
        .key_field("id", FieldType::U64)
        .value_field("gachaType", FieldType::U8)
        .value_field("startTime", FieldType::U64)
        .value_field("endTime", FieldType::U64)
        .value_field("ticketValue", FieldType::U64)
        .value_field("ticketItemId", FieldType::U64)
        .value_field("itemIds", U64_LIST)
        .value_field("amounts", FieldType::Array(ScalarType::U32))
        .value_field("percents", FieldType::Array(ScalarType::U16))
}

pub fn guild_schema() -> TableSchema {
    TableSchema::new(GUILD)
        .key_field("id", FieldType::U64)
        .value_field("leaderId", FieldType::U64)
        .value_field("level", FieldType::U32)
        .value_field("createdAt", FieldType::U64)
        .value_field("point", FieldType::U32)
        .value_field("name", FieldType::Str)
        .value_field("memberIds", U64_LIST)
}

// ============================================================================
// Versioned entities
// ============================================================================

pub fn equipment_info_v1_schema() -> TableSchema {
    TableSchema::new("EquipmentInfo2")
        .key_field("itemId", FieldType::U64)
        .value_field("dmgPercent", FieldType::U16)
        .value_field("maxLevel", FieldType::U8)
        .value_field("counter", FieldType::U8)
}

pub fn equipment_info_v2_schema() -> TableSchema {
    TableSchema::new("EquipmentInfo2V2")
        .key_field("itemId", FieldType::U64)
        .value_field("maxLevel", FieldType::U8)
        .value_field("counter", FieldType::U8)
        .value_field("dmgPercent", FieldType::U16)
        .value_field("bonusWeight", FieldType::U32)
        .value_field("shieldBarrier", FieldType::U32)
}

pub fn tool_v1_schema() -> TableSchema {
    TableSchema::new("Tool")
        .key_field("id", FieldType::U64)
        .value_field("itemId", FieldType::U64)
        .value_field("characterId", FieldType::U64)
        .value_field("durability", FieldType::U8)
}

pub fn tool_v2_schema() -> TableSchema {
    TableSchema::new("Tool2")
        .key_field("id", FieldType::U64)
        .value_field("itemId", FieldType::U64)
        .value_field("characterId", FieldType::U64)
        .value_field("durability", FieldType::U16)
}

/// EquipmentInfo2 -> EquipmentInfo2V2: fields reordered, new stats zeroed
pub fn equipment_info_v1_to_v2(key: &Key, row: &Row) -> Result<MappedRow, String> {
    match row.as_slice() {
        [dmg @ Value::U16(_), max_level @ Value::U8(_), counter @ Value::U8(_)] => Ok(MappedRow {
            key: key.clone(),
            row: vec![
                max_level.clone(),
                counter.clone(),
                dmg.clone(),
                Value::U32(0),
                Value::U32(0),
            ],
        }),
        _ => Err(format!("unexpected EquipmentInfo2 row shape ({} fields)", row.len())),
    }
}

/// Tool -> Tool2: durability widened to u16
pub fn tool_v1_to_v2(key: &Key, row: &Row) -> Result<MappedRow, String> {
    match row.as_slice() {
        [item @ Value::U64(_), owner @ Value::U64(_), Value::U8(durability)] => Ok(MappedRow {
            key: key.clone(),
            row: vec![item.clone(), owner.clone(), Value::U16(*durability as u16)],
        }),
        _ => Err(format!("unexpected Tool row shape ({} fields)", row.len())),
    }
}

/// Built-in mapping to the latest version of an entity
pub fn builtin_mapping(entity: &str) -> Option<(u16, Arc<dyn RowMapping>)> {
    let mapping: Arc<dyn RowMapping> = match entity {
        EQUIPMENT_INFO_ENTITY => Arc::new(equipment_info_v1_to_v2),
        TOOL_ENTITY => Arc::new(tool_v1_to_v2),
        _ => return None,
    };
    Some((2, mapping))
}

// ============================================================================
// Counter scopes
// ============================================================================

pub mod scopes {
    use crate::counter::CounterScope;

    pub fn city() -> CounterScope {
        CounterScope::global("CityCounter")
    }

    pub fn kingdom_city(kingdom_id: u8) -> CounterScope {
        CounterScope::child("KingdomCityCounter", kingdom_id as u64)
    }

    pub fn history(city_id: u64) -> CounterScope {
        CounterScope::child("HistoryCounter", city_id)
    }

    pub fn gacha() -> CounterScope {
        CounterScope::global("GachaCounter")
    }

    pub fn guild() -> CounterScope {
        CounterScope::global("GuildCounter")
    }

    pub fn order() -> CounterScope {
        CounterScope::global("OrderCounter")
    }

    pub fn chat() -> CounterScope {
        CounterScope::global("ChatCounter")
    }

    pub fn pvp_battle() -> CounterScope {
        CounterScope::global("PvPBattleCounter")
    }
}

// ============================================================================
// World
// ============================================================================

#[derive(Debug, Clone)]
pub struct World {
    pub store: Store,
    pub counters: CounterAllocator,
    pub registry: Arc<SchemaVersionRegistry>,
    pub inventory_tools: CollectionHandle<u64, u64>,
    pub inventory_equipment: CollectionHandle<u64, u64>,
    pub storage_tools: CollectionHandle<(u64, u64), u64>,
    pub storage_equipment: CollectionHandle<(u64, u64), u64>,
    /// Farmable resources with their remaining quota
    pub tile_resources: SpatialHandle<u64>,
    pub tile_monsters: SpatialHandle<u64>,
    pub tile_items: SpatialHandle<u64>,
    pub tile_equipment: SpatialHandle<u64>,
    pub gacha_items: CollectionHandle<u64, u64>,
    pub guild_members: CollectionHandle<u64, u64>,
}

impl World {
    pub fn open(store: Store, config: &StoreConfig) -> StoreResult<Self> {
        for schema in [
            char_inventory_schema(),
            char_storage_schema(),
            tile_info_schema(),
            tile_inventory_schema(),
            gacha_schema(),
            guild_schema(),
        ] {
            store.declare(schema)?;
        }

        let inventory_tools = IndexedCollection::open(
            &store,
            CollectionDef::new(CHAR_INVENTORY, "toolIds").with_index_table("InventoryToolIndex"),
        )?;
        let inventory_equipment = IndexedCollection::open(
            &store,
            CollectionDef::new(CHAR_INVENTORY, "equipmentIds")
                .with_index_table("InventoryEquipmentIndex"),
        )?;
        let storage_tools = IndexedCollection::open(
            &store,
            CollectionDef::new(CHAR_STORAGE, "toolIds").with_index_table("StorageToolIndex"),
        )?;
        let storage_equipment = IndexedCollection::open(
            &store,
            CollectionDef::new(CHAR_STORAGE, "equipmentIds")
                .with_index_table("StorageEquipmentIndex"),
        )?;
        let tile_resources = SpatialIndex::open(
            &store,
            CollectionDef::new(TILE_INFO, "itemIds")
                .with_index_table("TileResourceIndex")
                .with_parallel(&["farmingQuotas"]),
        )?;
        let tile_monsters = SpatialIndex::open(
            &store,
            CollectionDef::new(TILE_INFO, "monsterIds").with_index_table("MonsterIndexLocation"),
        )?;
        let tile_items = SpatialIndex::open(
            &store,
            CollectionDef::new(TILE_INVENTORY, "otherItemIds")
                .with_element_field("itemId")
                .with_index_table("TileOtherItemIndex"),
        )?;
        let tile_equipment = SpatialIndex::open(
            &store,
            CollectionDef::new(TILE_INVENTORY, "equipmentIds")
                .with_index_table("TileEquipmentIndex"),
        )?;
        let gacha_items = IndexedCollection::open(
            &store,
            CollectionDef::new(GACHA, "itemIds")
                .with_index_table("GachaItemIndex")
                .with_parallel(&["amounts", "percents"]),
        )?;
        let guild_members = IndexedCollection::open(&store, CollectionDef::new(GUILD, "memberIds"))?;

        let counters = CounterAllocator::new(&store)?;
        let registry = Arc::new(SchemaVersionRegistry::new(&store, config.migration)?);
        registry.register(
            EQUIPMENT_INFO_ENTITY,
            vec![(1, equipment_info_v1_schema()), (2, equipment_info_v2_schema())],
            config.authoritative_for(EQUIPMENT_INFO_ENTITY, 2),
        )?;
        registry.register(
            TOOL_ENTITY,
            vec![(1, tool_v1_schema()), (2, tool_v2_schema())],
            config.authoritative_for(TOOL_ENTITY, 2),
        )?;
        registry.add_dependent(TOOL_ENTITY, "id", Arc::new(inventory_tools.clone()))?;
        registry.add_dependent(TOOL_ENTITY, "id", Arc::new(storage_tools.clone()))?;

        info!(
            namespace = %store.namespace(),
            tables = store.tables().len(),
            "World store opened"
        );
        Ok(Self {
            store,
            counters,
            registry,
            inventory_tools,
            inventory_equipment,
            storage_tools,
            storage_equipment,
            tile_resources,
            tile_monsters,
            tile_items,
            tile_equipment,
            gacha_items,
            guild_members,
        })
    }

    /// In-memory world, mainly for tests and tooling dry runs
    pub fn in_memory(config: &StoreConfig) -> StoreResult<Self> {
        Self::open(Store::in_memory(&config.namespace), config)
    }

    /// Allocate a guild id and create its row with the leader as first member
    pub fn create_guild(&self, leader_id: u64, name: &str, created_at: u64) -> StoreResult<u64> {
        let guild_id = self.counters.next(&scopes::guild())?;
        self.store.table(GUILD)?.put(
            &[Value::U64(guild_id)],
            &[
                Value::U64(leader_id),
                Value::U32(1),
                Value::U64(created_at),
                Value::U32(0),
                Value::Str(name.to_string()),
                Value::Array(Vec::new()),
            ],
        )?;
        self.guild_members.append(&guild_id, leader_id)?;
        Ok(guild_id)
    }

    /// Check every collection of every owner against its satellite index
    pub fn audit(&self) -> StoreResult<Vec<AuditFinding>> {
        let mut findings = Vec::new();
        audit_collection(&self.inventory_tools, &mut findings)?;
        audit_collection(&self.inventory_equipment, &mut findings)?;
        audit_collection(&self.storage_tools, &mut findings)?;
        audit_collection(&self.storage_equipment, &mut findings)?;
        audit_collection(self.tile_resources.collection(), &mut findings)?;
        audit_collection(self.tile_monsters.collection(), &mut findings)?;
        audit_collection(self.tile_items.collection(), &mut findings)?;
        audit_collection(self.tile_equipment.collection(), &mut findings)?;
        audit_collection(&self.gacha_items, &mut findings)?;
        audit_collection(&self.guild_members, &mut findings)?;
        Ok(findings)
    }

    /// Counter scope names the maintenance tool reports on
    pub fn counter_scopes() -> Vec<CounterScope> {
        vec![
            scopes::city(),
            scopes::gacha(),
            scopes::guild(),
            scopes::order(),
            scopes::chat(),
            scopes::pvp_battle(),
        ]
    }
}

/// One fault found by [`World::audit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub collection: String,
    pub owner: String,
    pub fault: IndexFault,
}

fn audit_collection<O: OwnerKey, E: Element>(
    collection: &IndexedCollection<O, E>,
    findings: &mut Vec<AuditFinding>,
) -> StoreResult<()> {
    for owner in collection.owners()? {
        for fault in collection.check_consistency(&owner)? {
            let finding = AuditFinding {
                collection: collection.def().label(),
                owner: display_key(&owner.to_key()),
                fault,
            };
            warn!(
                collection = %finding.collection,
                owner = %finding.owner,
                fault = %finding.fault,
                "Index fault"
            );
            findings.push(finding);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::Coord;

    #[test]
    fn test_audit_clean_world() {
        let world = World::in_memory(&StoreConfig::default()).unwrap();
        world.inventory_tools.append(&1, 10).unwrap();
        world.inventory_tools.append(&1, 11).unwrap();
        world.tile_monsters.append(Coord::new(0, 0), 5).unwrap();
        world
            .gacha_items
            .append_with(&2, 77, &[Value::U32(1), Value::U16(100)])
            .unwrap();
        assert!(world.audit().unwrap().is_empty());
    }

    #[test]
    fn test_audit_reports_tampered_row() {
        let world = World::in_memory(&StoreConfig::default()).unwrap();
        world.inventory_tools.append(&1, 10).unwrap();
        world.inventory_tools.append(&1, 11).unwrap();
        // Swap the array behind the index's back
        let table = world.store.table(CHAR_INVENTORY).unwrap();
        let mut row = table.get(&[Value::U64(1)]).unwrap().unwrap();
        row[0] = Value::Array(vec![Value::U64(11), Value::U64(10)]);
        table.put(&[Value::U64(1)], &row).unwrap();

        let findings = world.audit().unwrap();
        assert!(!findings.is_empty());
        assert_eq!(findings[0].owner, "(1)");
    }

    fn legacy_config() -> StoreConfig {
        StoreConfig::default()
            .with_authoritative(EQUIPMENT_INFO_ENTITY, 1)
            .with_authoritative(TOOL_ENTITY, 1)
    }

    #[test]
    fn test_open_declares_historical_index_names() {
        let world = World::in_memory(&StoreConfig::default()).unwrap();
        let tables = world.store.tables();
        for name in [
            "InventoryToolIndex",
            "InventoryEquipmentIndex",
            "StorageToolIndex",
            "StorageEquipmentIndex",
            "MonsterIndexLocation",
            "TileOtherItemIndex",
            "TileEquipmentIndex",
            "GachaItemIndex",
            "GuildMemberIndex",
        ] {
            assert!(tables.contains(&name.to_string()), "missing {}", name);
        }
    }

    #[test]
    fn test_fresh_store_uses_configured_versions() {
        let world = World::in_memory(&legacy_config()).unwrap();
        assert_eq!(
            world.registry.authoritative(TOOL_ENTITY).unwrap().name(),
            "Tool"
        );
        let world = World::in_memory(&StoreConfig::default()).unwrap();
        assert_eq!(
            world.registry.authoritative(TOOL_ENTITY).unwrap().name(),
            "Tool2"
        );
    }

    #[test]
    fn test_create_guild_adds_leader() {
        let world = World::in_memory(&StoreConfig::default()).unwrap();
        let first = world.create_guild(42, "Wardens", 1_700_000_000).unwrap();
        let second = world.create_guild(43, "Drifters", 1_700_000_100).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(world.guild_members.elements(&first).unwrap(), vec![42]);
    }

    #[test]
    fn test_tile_resources_carry_quota() {
        let world = World::in_memory(&StoreConfig::default()).unwrap();
        let tile = Coord::new(3, -2);
        world
            .tile_resources
            .collection()
            .append_with(&tile, 1001, &[Value::U16(40)])
            .unwrap();
        world
            .tile_resources
            .collection()
            .append_with(&tile, 1002, &[Value::U16(15)])
            .unwrap();
        world
            .tile_resources
            .move_element(1001, tile, Coord::new(4, -2))
            .unwrap();
        assert_eq!(
            world
                .tile_resources
                .collection()
                .companions_at(&Coord::new(4, -2), 0)
                .unwrap(),
            Some(vec![Value::U16(40)])
        );
        assert_eq!(
            world.tile_resources.collection().companions_at(&tile, 0).unwrap(),
            Some(vec![Value::U16(15)])
        );
    }

    #[test]
    fn test_tool_migration_relinks_inventory() {
        let world = World::in_memory(&legacy_config()).unwrap();
        world
            .registry
            .put(
                TOOL_ENTITY,
                &[Value::U64(7)],
                &[Value::U64(300), Value::U64(1), Value::U8(90)],
            )
            .unwrap();
        world.inventory_tools.append(&1, 7).unwrap();

        let (to, mapping) = builtin_mapping(TOOL_ENTITY).unwrap();
        let report = world.registry.migrate(TOOL_ENTITY, to, mapping).unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.relinked, 0);
        assert_eq!(
            world.registry.get(TOOL_ENTITY, &[Value::U64(7)]).unwrap(),
            Some(vec![Value::U64(300), Value::U64(1), Value::U16(90)])
        );
        assert_eq!(world.inventory_tools.elements(&1).unwrap(), vec![7]);
    }

    #[test]
    fn test_equipment_mapping_shape() {
        let mapped = equipment_info_v1_to_v2(
            &vec![Value::U64(5)],
            &vec![Value::U16(120), Value::U8(10), Value::U8(2)],
        )
        .unwrap();
        assert!(equipment_info_v2_schema().check_row(&mapped.row).is_ok());
        assert_eq!(mapped.row[2], Value::U16(120));
        assert!(equipment_info_v1_to_v2(&vec![Value::U64(5)], &vec![]).is_err());
    }
}
