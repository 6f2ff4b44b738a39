//! Table schemas - field types, values and table identity
//!
//! A table is a named record set with an ordered key tuple (possibly empty,
//! denoting a singleton) and an ordered list of value fields. Key fields are
//! always static (fixed width); value fields may be dynamic (strings, bytes,
//! arrays of scalars).

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::HashSet;
use std::fmt;

/// Maximum number of dynamic value fields in one table (packed length limit)
pub const MAX_DYNAMIC_FIELDS: usize = 5;

/// Default namespace for world tables
pub const DEFAULT_NAMESPACE: &str = "app";

/// Key tuple of a row
pub type Key = Vec<Value>;

/// Value fields of a row, in declaration order
pub type Row = Vec<Value>;

/// Fixed-width scalar types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScalarType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    Bytes32,
}

impl ScalarType {
    /// Encoded width in bytes
    pub fn width(&self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::U8 => 1,
            ScalarType::U16 => 2,
            ScalarType::U32 | ScalarType::I32 => 4,
            ScalarType::U64 | ScalarType::I64 => 8,
            ScalarType::Bytes32 => 32,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::U8 => "uint8",
            ScalarType::U16 => "uint16",
            ScalarType::U32 => "uint32",
            ScalarType::U64 => "uint64",
            ScalarType::I32 => "int32",
            ScalarType::I64 => "int64",
            ScalarType::Bytes32 => "bytes32",
        }
    }

    pub fn zero(&self) -> Value {
        match self {
            ScalarType::Bool => Value::Bool(false),
            ScalarType::U8 => Value::U8(0),
            ScalarType::U16 => Value::U16(0),
            ScalarType::U32 => Value::U32(0),
            ScalarType::U64 => Value::U64(0),
            ScalarType::I32 => Value::I32(0),
            ScalarType::I64 => Value::I64(0),
            ScalarType::Bytes32 => Value::Bytes32([0u8; 32]),
        }
    }
}

/// Field types: static scalars or dynamic fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Scalar(ScalarType),
    Str,
    Bytes,
    Array(ScalarType),
}

impl FieldType {
    pub const BOOL: FieldType = FieldType::Scalar(ScalarType::Bool);
    pub const U8: FieldType = FieldType::Scalar(ScalarType::U8);
    pub const U16: FieldType = FieldType::Scalar(ScalarType::U16);
    pub const U32: FieldType = FieldType::Scalar(ScalarType::U32);
    pub const U64: FieldType = FieldType::Scalar(ScalarType::U64);
    pub const I32: FieldType = FieldType::Scalar(ScalarType::I32);
    pub const I64: FieldType = FieldType::Scalar(ScalarType::I64);
    pub const BYTES32: FieldType = FieldType::Scalar(ScalarType::Bytes32);

    pub fn is_static(&self) -> bool {
        matches!(self, FieldType::Scalar(_))
    }

    pub fn zero(&self) -> Value {
        match self {
            FieldType::Scalar(s) => s.zero(),
            FieldType::Str => Value::Str(String::new()),
            FieldType::Bytes => Value::Bytes(Vec::new()),
            FieldType::Array(_) => Value::Array(Vec::new()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Scalar(s) => write!(f, "{}", s.as_str()),
            FieldType::Str => write!(f, "string"),
            FieldType::Bytes => write!(f, "bytes"),
            FieldType::Array(s) => write!(f, "{}[]", s.as_str()),
        }
    }
}

/// A typed field value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    Bytes32([u8; 32]),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            Value::Bool(_) => Some(ScalarType::Bool),
            Value::U8(_) => Some(ScalarType::U8),
            Value::U16(_) => Some(ScalarType::U16),
            Value::U32(_) => Some(ScalarType::U32),
            Value::U64(_) => Some(ScalarType::U64),
            Value::I32(_) => Some(ScalarType::I32),
            Value::I64(_) => Some(ScalarType::I64),
            Value::Bytes32(_) => Some(ScalarType::Bytes32),
            Value::Str(_) | Value::Bytes(_) | Value::Array(_) => None,
        }
    }

    /// Whether this value is a well-formed instance of `ty`
    pub fn matches(&self, ty: &FieldType) -> bool {
        match (ty, self) {
            (FieldType::Scalar(s), v) => v.scalar_type() == Some(*s),
            (FieldType::Str, Value::Str(_)) => true,
            (FieldType::Bytes, Value::Bytes(_)) => true,
            (FieldType::Array(s), Value::Array(items)) => {
                items.iter().all(|item| item.scalar_type() == Some(*s))
            }
            _ => false,
        }
    }

    /// Any unsigned integer widened to u64
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(v) => Some(*v as u64),
            Value::U16(v) => Some(*v as u64),
            Value::U32(v) => Some(*v as u64),
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Left-aligned, zero padded 32-byte value (names, hashes)
    pub fn bytes32_from_str(s: &str) -> Option<Value> {
        let bytes = s.as_bytes();
        if bytes.len() > 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out[..bytes.len()].copy_from_slice(bytes);
        Some(Value::Bytes32(out))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::Bytes32(b) => write!(f, "0x{}", hex(b)),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "0x{}", hex(b)),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Render a key tuple as `(a, b, c)`
pub fn display_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}

/// A named, typed field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Declared shape of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub key: Vec<FieldDef>,
    pub value: Vec<FieldDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn key_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.key.push(FieldDef::new(name, ty));
        self
    }

    pub fn value_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.value.push(FieldDef::new(name, ty));
        self
    }

    pub fn is_singleton(&self) -> bool {
        self.key.is_empty()
    }

    pub fn key_width(&self) -> usize {
        self.key
            .iter()
            .map(|f| match f.ty {
                FieldType::Scalar(s) => s.width(),
                _ => 0,
            })
            .sum()
    }

    pub fn value_index(&self, name: &str) -> Option<usize> {
        self.value.iter().position(|f| f.name == name)
    }

    pub fn key_index(&self, name: &str) -> Option<usize> {
        self.key.iter().position(|f| f.name == name)
    }

    pub fn dynamic_count(&self) -> usize {
        self.value.iter().filter(|f| !f.ty.is_static()).count()
    }

    /// Row with every value field at its zero value
    pub fn default_row(&self) -> Row {
        self.value.iter().map(|f| f.ty.zero()).collect()
    }

    /// Check the declaration itself
    pub fn validate(&self) -> StoreResult<()> {
        if self.name.is_empty() {
            return Err(StoreError::schema("<unnamed>", "table name is empty"));
        }
        let mut seen = HashSet::new();
        for field in self.key.iter().chain(self.value.iter()) {
            if !seen.insert(field.name.as_str()) {
                return Err(StoreError::schema(
                    &self.name,
                    format!("duplicate field name '{}'", field.name),
                ));
            }
        }
        if let Some(field) = self.key.iter().find(|f| !f.ty.is_static()) {
            return Err(StoreError::schema(
                &self.name,
                format!("key field '{}' has dynamic type {}", field.name, field.ty),
            ));
        }
        if self.dynamic_count() > MAX_DYNAMIC_FIELDS {
            return Err(StoreError::schema(
                &self.name,
                format!(
                    "{} dynamic fields declared, at most {} allowed",
                    self.dynamic_count(),
                    MAX_DYNAMIC_FIELDS
                ),
            ));
        }
        Ok(())
    }

    /// Check a key tuple against the declared key fields
    pub fn check_key(&self, key: &[Value]) -> StoreResult<()> {
        if key.len() != self.key.len() {
            return Err(StoreError::schema(
                &self.name,
                format!(
                    "expected {} key field(s), got {}",
                    self.key.len(),
                    key.len()
                ),
            ));
        }
        self.check_key_prefix(key)
    }

    /// Check a leading portion of a key tuple
    pub fn check_key_prefix(&self, prefix: &[Value]) -> StoreResult<()> {
        if prefix.len() > self.key.len() {
            return Err(StoreError::schema(
                &self.name,
                format!(
                    "key prefix has {} field(s), table key has {}",
                    prefix.len(),
                    self.key.len()
                ),
            ));
        }
        for (field, value) in self.key.iter().zip(prefix) {
            if !value.matches(&field.ty) {
                return Err(StoreError::schema(
                    &self.name,
                    format!("key field '{}' expects {}, got {}", field.name, field.ty, value),
                ));
            }
        }
        Ok(())
    }

    /// Check a row against the declared value fields
    pub fn check_row(&self, row: &[Value]) -> StoreResult<()> {
        if row.len() != self.value.len() {
            return Err(StoreError::schema(
                &self.name,
                format!(
                    "expected {} value field(s), got {}",
                    self.value.len(),
                    row.len()
                ),
            ));
        }
        for (field, value) in self.value.iter().zip(row) {
            if !value.matches(&field.ty) {
                return Err(StoreError::schema(
                    &self.name,
                    format!("field '{}' expects {}, got {}", field.name, field.ty, value),
                ));
            }
        }
        Ok(())
    }

    /// SHA3-256 over the table name and its field layout
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        hasher.update(self.name.as_bytes());
        for (section, fields) in [(b'k', &self.key), (b'v', &self.value)] {
            for field in fields {
                hasher.update([section]);
                hasher.update(field.name.as_bytes());
                hasher.update([0u8]);
                hasher.update(field.ty.to_string().as_bytes());
            }
        }
        hasher.finalize().into()
    }
}

/// 32-byte table identifier: `"tb" ++ namespace[14] ++ name[16]`
///
/// Names longer than 16 bytes are truncated, so two long names can collide;
/// the catalog rejects such declarations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId([u8; 32]);

impl ResourceId {
    pub const TABLE_TYPE: [u8; 2] = *b"tb";
    pub const NAMESPACE_LEN: usize = 14;
    pub const NAME_LEN: usize = 16;

    pub fn table(namespace: &str, name: &str) -> Self {
        let mut id = [0u8; 32];
        id[..2].copy_from_slice(&Self::TABLE_TYPE);
        let ns = namespace.as_bytes();
        let ns_len = ns.len().min(Self::NAMESPACE_LEN);
        id[2..2 + ns_len].copy_from_slice(&ns[..ns_len]);
        let nm = name.as_bytes();
        let nm_len = nm.len().min(Self::NAME_LEN);
        id[16..16 + nm_len].copy_from_slice(&nm[..nm_len]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn namespace(&self) -> String {
        trim_zeros(&self.0[2..16])
    }

    /// Stored (possibly truncated) table name
    pub fn name(&self) -> String {
        trim_zeros(&self.0[16..32])
    }
}

fn trim_zeros(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({}:{})", self.namespace(), self.name())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> TableSchema {
        TableSchema::new("CharInventory")
            .key_field("characterId", FieldType::U64)
            .value_field("toolIds", FieldType::Array(ScalarType::U64))
            .value_field("equipmentIds", FieldType::Array(ScalarType::U64))
    }

    #[test]
    fn test_valid_schema() {
        assert!(inventory().validate().is_ok());
        assert!(!inventory().is_singleton());
        assert_eq!(inventory().key_width(), 8);
    }

    #[test]
    fn test_dynamic_key_rejected() {
        let schema = TableSchema::new("Bad")
            .key_field("name", FieldType::Str)
            .value_field("v", FieldType::U8);
        assert!(matches!(
            schema.validate(),
            Err(StoreError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_too_many_dynamic_fields_rejected() {
        let mut schema = TableSchema::new("Wide").key_field("id", FieldType::U64);
        for i in 0..6 {
            schema = schema.value_field(format!("list{}", i), FieldType::Array(ScalarType::U32));
        }
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let schema = TableSchema::new("Dup")
            .key_field("id", FieldType::U64)
            .value_field("id", FieldType::U32);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_check_key_arity_and_type() {
        let schema = inventory();
        assert!(schema.check_key(&[Value::U64(1)]).is_ok());
        assert!(schema.check_key(&[]).is_err());
        assert!(schema.check_key(&[Value::U32(1)]).is_err());
        assert!(schema.check_key(&[Value::U64(1), Value::U64(2)]).is_err());
    }

    #[test]
    fn test_check_row_array_element_types() {
        let schema = inventory();
        let good = vec![
            Value::Array(vec![Value::U64(1)]),
            Value::Array(vec![]),
        ];
        let bad = vec![
            Value::Array(vec![Value::U32(1)]),
            Value::Array(vec![]),
        ];
        assert!(schema.check_row(&good).is_ok());
        assert!(schema.check_row(&bad).is_err());
    }

    #[test]
    fn test_default_row_is_zeroed() {
        let row = inventory().default_row();
        assert_eq!(row, vec![Value::Array(vec![]), Value::Array(vec![])]);
    }

    #[test]
    fn test_fingerprint_tracks_shape() {
        let a = inventory();
        let b = inventory().value_field("extra", FieldType::U8);
        assert_eq!(a.fingerprint(), inventory().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_resource_id_layout() {
        let id = ResourceId::table("app", "CharInventory");
        let bytes = id.as_bytes();
        assert_eq!(&bytes[..2], b"tb");
        assert_eq!(&bytes[2..5], b"app");
        assert_eq!(bytes[5], 0);
        assert_eq!(&bytes[16..29], b"CharInventory");
        assert_eq!(id.namespace(), "app");
        assert_eq!(id.name(), "CharInventory");
    }

    #[test]
    fn test_resource_id_truncates_long_names() {
        let a = ResourceId::table("app", "InventoryEquipmentIndex");
        let b = ResourceId::table("app", "InventoryEquipmentIdx");
        assert_eq!(a.name(), "InventoryEquipme");
        assert_eq!(a, b);
    }

    #[test]
    fn test_bytes32_from_str() {
        assert!(Value::bytes32_from_str("GachaCounter").is_some());
        assert!(Value::bytes32_from_str(&"x".repeat(33)).is_none());
    }
}
