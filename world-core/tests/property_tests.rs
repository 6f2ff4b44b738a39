//! Property-based tests using proptest
//!
//! Invariants that must hold for ALL inputs:
//! - Collections: elements unique, every position_of matches the array
//! - Collections: swap-remove order matches a Vec model exactly
//! - Rejected mutations leave every stored byte unchanged
//! - Key encoding: byte order equals tuple order
//! - Records: decode(encode(row)) == row for arbitrary shapes

use proptest::prelude::*;
use std::sync::Arc;
use world_core::codec::{decode_record, encode_key, encode_record};
use world_core::{
    CollectionDef, CollectionHandle, Coord, FieldType, IndexedCollection, MemoryKv, ScalarType,
    SpatialIndex, Store, StoreError, TableSchema, Value,
};

// ============================================================
// Helpers
// ============================================================

fn inventory_store() -> (Arc<MemoryKv>, Store, CollectionHandle<u64, u64>) {
    let kv = Arc::new(MemoryKv::new());
    let store = Store::new(kv.clone(), "app");
    store
        .declare(
            TableSchema::new("CharInventory")
                .key_field("characterId", FieldType::U64)
                .value_field("toolIds", FieldType::Array(ScalarType::U64))
                .value_field("equipmentIds", FieldType::Array(ScalarType::U64)),
        )
        .unwrap();
    let tools = IndexedCollection::open(
        &store,
        CollectionDef::new("CharInventory", "toolIds").with_index_table("InventoryToolIndex"),
    )
    .unwrap();
    (kv, store, tools)
}

#[derive(Debug, Clone)]
enum Op {
    Append(u64, u64),
    Remove(u64, u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..3, 0u64..12).prop_map(|(o, e)| Op::Append(o, e)),
        (0u64..3, 0u64..12).prop_map(|(o, e)| Op::Remove(o, e)),
    ]
}

// ============================================================
// Collection Properties
// ============================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_collection_matches_swap_remove_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let (_kv, _store, tools) = inventory_store();
        let mut model: Vec<Vec<u64>> = vec![Vec::new(); 3];

        for op in &ops {
            match *op {
                Op::Append(owner, element) => {
                    let list = &mut model[owner as usize];
                    let result = tools.append(&owner, element);
                    if list.contains(&element) {
                        let is_duplicate = matches!(result, Err(StoreError::DuplicateElement { .. }));
                        prop_assert!(is_duplicate);
                    } else {
                        prop_assert_eq!(result.unwrap(), list.len() as u64);
                        list.push(element);
                    }
                }
                Op::Remove(owner, element) => {
                    let list = &mut model[owner as usize];
                    let result = tools.remove_by_value(&owner, element);
                    match list.iter().position(|e| *e == element) {
                        Some(p) => {
                            prop_assert!(result.is_ok());
                            list.swap_remove(p);
                        }
                        None => {
                            let is_missing = matches!(result, Err(StoreError::ElementNotFound { .. }));
                            prop_assert!(is_missing);
                        }
                    }
                }
            }
        }

        for owner in 0u64..3 {
            let elements = tools.elements(&owner).unwrap();
            prop_assert_eq!(&elements, &model[owner as usize]);
            for (p, e) in elements.iter().enumerate() {
                prop_assert_eq!(tools.position_of(&owner, *e).unwrap(), Some(p as u64));
                prop_assert!(tools.contains(&owner, *e).unwrap());
            }
            prop_assert!(tools.check_consistency(&owner).unwrap().is_empty());
        }
        let total: usize = model.iter().map(|l| l.len()).sum();
        prop_assert_eq!(tools.index_table().count().unwrap(), total as u64);
    }

    #[test]
    fn prop_rejected_mutation_is_byte_identical(
        seed in prop::collection::vec(0u64..20, 0..15),
        candidate in 0u64..20,
    ) {
        let (kv, _store, tools) = inventory_store();
        for e in &seed {
            let _ = tools.append(&1, *e);
        }
        let before = kv.snapshot();
        if tools.contains(&1, candidate).unwrap() {
            prop_assert!(tools.append(&1, candidate).is_err());
        } else {
            prop_assert!(tools.remove_by_value(&1, candidate).is_err());
        }
        prop_assert_eq!(before, kv.snapshot());
    }

    #[test]
    fn prop_move_conflict_is_byte_identical(x in -5i32..5, y in -5i32..5, element in 0u64..100) {
        let kv = Arc::new(MemoryKv::new());
        let store = Store::new(kv.clone(), "app");
        store
            .declare(
                TableSchema::new("TileInfo3")
                    .key_field("x", FieldType::I32)
                    .key_field("y", FieldType::I32)
                    .value_field("monsterIds", FieldType::Array(ScalarType::U64)),
            )
            .unwrap();
        let layer: SpatialIndex<u64> = SpatialIndex::open(
            &store,
            CollectionDef::new("TileInfo3", "monsterIds").with_index_table("MonsterIndexLocation"),
        )
        .unwrap();
        let from = Coord::new(x, y);
        let to = Coord::new(x + 1, y - 1);
        layer.append(from, element).unwrap();
        layer.append(to, element).unwrap();
        let before = kv.snapshot();
        let is_conflict = matches!(
            layer.move_element(element, from, to),
            Err(StoreError::MoveConflict { .. })
        );
        prop_assert!(is_conflict);
        prop_assert_eq!(before, kv.snapshot());
    }
}

// ============================================================
// Encoding Properties
// ============================================================

fn coord_schema() -> TableSchema {
    TableSchema::new("Cell")
        .key_field("x", FieldType::I32)
        .key_field("y", FieldType::I64)
        .key_field("id", FieldType::U64)
        .value_field("v", FieldType::U8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_key_bytes_preserve_order(
        a in (any::<i32>(), any::<i64>(), any::<u64>()),
        b in (any::<i32>(), any::<i64>(), any::<u64>()),
    ) {
        let schema = coord_schema();
        let ka = encode_key(&schema, &[Value::I32(a.0), Value::I64(a.1), Value::U64(a.2)]).unwrap();
        let kb = encode_key(&schema, &[Value::I32(b.0), Value::I64(b.1), Value::U64(b.2)]).unwrap();
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }

    #[test]
    fn prop_record_decodes_to_same_row(
        flag in any::<bool>(),
        level in any::<u16>(),
        name in "[a-zA-Z ]{0,24}",
        ids in prop::collection::vec(any::<u64>(), 0..16),
        quotas in prop::collection::vec(any::<u16>(), 0..16),
        delta in any::<i32>(),
    ) {
        let schema = TableSchema::new("Mixed")
            .key_field("id", FieldType::U64)
            .value_field("flag", FieldType::BOOL)
            .value_field("name", FieldType::Str)
            .value_field("level", FieldType::U16)
            .value_field("ids", FieldType::Array(ScalarType::U64))
            .value_field("delta", FieldType::I32)
            .value_field("quotas", FieldType::Array(ScalarType::U16));
        let row = vec![
            Value::Bool(flag),
            Value::Str(name),
            Value::U16(level),
            Value::Array(ids.into_iter().map(Value::U64).collect()),
            Value::I32(delta),
            Value::Array(quotas.into_iter().map(Value::U16).collect()),
        ];
        let bytes = encode_record(&schema, &row).unwrap();
        prop_assert_eq!(decode_record(&schema, &bytes).unwrap(), row);
    }
}
