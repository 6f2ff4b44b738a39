//! Byte encodings for keys and records
//!
//! Keys: each scalar at its fixed width, big-endian, with the sign bit of
//! signed integers flipped. Byte order of an encoded key equals the order of
//! the key tuple, and a prefix of the tuple encodes to a prefix of the bytes.
//!
//! Records: static fields packed big-endian (two's complement), then, when the
//! table has dynamic fields, a 32-byte [`PackedCounter`] followed by the
//! concatenated dynamic data.

use crate::error::{StoreError, StoreResult};
use crate::schema::{FieldType, Key, Row, ScalarType, TableSchema, Value, MAX_DYNAMIC_FIELDS};

/// Largest dynamic field length representable in a packed counter (40 bits)
pub const MAX_FIELD_LENGTH: u64 = (1 << 40) - 1;

/// Largest total dynamic length (56 bits)
pub const MAX_TOTAL_LENGTH: u64 = (1 << 56) - 1;

/// Packed dynamic lengths: total in the low 56 bits, then one 40-bit length
/// per dynamic field, big-endian over 32 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedCounter([u8; 32]);

impl PackedCounter {
    pub const SIZE: usize = 32;

    pub fn pack(lengths: &[u64]) -> StoreResult<Self> {
        if lengths.len() > MAX_DYNAMIC_FIELDS {
            return Err(StoreError::Codec(format!(
                "{} dynamic lengths exceed the limit of {}",
                lengths.len(),
                MAX_DYNAMIC_FIELDS
            )));
        }
        let mut bytes = [0u8; 32];
        let mut total: u64 = 0;
        for (i, len) in lengths.iter().enumerate() {
            if *len > MAX_FIELD_LENGTH {
                return Err(StoreError::Codec(format!(
                    "dynamic field {} length {} exceeds 40 bits",
                    i, len
                )));
            }
            total = total
                .checked_add(*len)
                .filter(|t| *t <= MAX_TOTAL_LENGTH)
                .ok_or_else(|| StoreError::Codec("dynamic total exceeds 56 bits".into()))?;
            let end = 25 - 5 * i;
            bytes[end - 5..end].copy_from_slice(&len.to_be_bytes()[3..8]);
        }
        bytes[25..32].copy_from_slice(&total.to_be_bytes()[1..8]);
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| StoreError::Codec(format!("packed counter needs 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn total(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[1..8].copy_from_slice(&self.0[25..32]);
        u64::from_be_bytes(buf)
    }

    /// Length of dynamic field `index` (0-based)
    pub fn at(&self, index: usize) -> u64 {
        if index >= MAX_DYNAMIC_FIELDS {
            return 0;
        }
        let end = 25 - 5 * index;
        let mut buf = [0u8; 8];
        buf[3..8].copy_from_slice(&self.0[end - 5..end]);
        u64::from_be_bytes(buf)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Encode a full key tuple
pub fn encode_key(schema: &TableSchema, key: &[Value]) -> StoreResult<Vec<u8>> {
    schema.check_key(key)?;
    Ok(encode_key_values(key))
}

/// Encode a leading portion of a key tuple for prefix scans
pub fn encode_key_prefix(schema: &TableSchema, prefix: &[Value]) -> StoreResult<Vec<u8>> {
    schema.check_key_prefix(prefix)?;
    Ok(encode_key_values(prefix))
}

fn encode_key_values(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for value in values {
        match value {
            Value::I32(v) => out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes()),
            Value::I64(v) => {
                out.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes())
            }
            other => encode_scalar(other, &mut out),
        }
    }
    out
}

pub fn decode_key(schema: &TableSchema, bytes: &[u8]) -> StoreResult<Key> {
    if bytes.len() != schema.key_width() {
        return Err(StoreError::Codec(format!(
            "{} key is {} bytes, expected {}",
            schema.name,
            bytes.len(),
            schema.key_width()
        )));
    }
    let mut key = Vec::with_capacity(schema.key.len());
    let mut offset = 0;
    for field in &schema.key {
        let scalar = match field.ty {
            FieldType::Scalar(s) => s,
            _ => return Err(StoreError::schema(&schema.name, "dynamic key field")),
        };
        let chunk = &bytes[offset..offset + scalar.width()];
        let value = match scalar {
            ScalarType::I32 => {
                let raw = u32::from_be_bytes(fixed(chunk)?) ^ 0x8000_0000;
                Value::I32(raw as i32)
            }
            ScalarType::I64 => {
                let raw = u64::from_be_bytes(fixed(chunk)?) ^ 0x8000_0000_0000_0000;
                Value::I64(raw as i64)
            }
            other => decode_scalar(other, chunk)?,
        };
        key.push(value);
        offset += scalar.width();
    }
    Ok(key)
}

// ============================================================================
// Records
// ============================================================================

pub fn encode_record(schema: &TableSchema, row: &[Value]) -> StoreResult<Vec<u8>> {
    schema.check_row(row)?;
    let mut out = Vec::new();
    for (field, value) in schema.value.iter().zip(row) {
        if field.ty.is_static() {
            encode_scalar(value, &mut out);
        }
    }
    if schema.dynamic_count() == 0 {
        return Ok(out);
    }

    let mut lengths = Vec::with_capacity(schema.dynamic_count());
    let mut dynamic = Vec::new();
    for (field, value) in schema.value.iter().zip(row) {
        if field.ty.is_static() {
            continue;
        }
        let start = dynamic.len();
        match value {
            Value::Str(s) => dynamic.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => dynamic.extend_from_slice(b),
            Value::Array(items) => {
                for item in items {
                    encode_scalar(item, &mut dynamic);
                }
            }
            other => {
                return Err(StoreError::schema(
                    &schema.name,
                    format!("field '{}' expects {}, got {}", field.name, field.ty, other),
                ))
            }
        }
        lengths.push((dynamic.len() - start) as u64);
    }
    out.extend_from_slice(PackedCounter::pack(&lengths)?.as_bytes());
    out.extend_from_slice(&dynamic);
    Ok(out)
}

pub fn decode_record(schema: &TableSchema, bytes: &[u8]) -> StoreResult<Row> {
    let static_width: usize = schema
        .value
        .iter()
        .map(|f| match f.ty {
            FieldType::Scalar(s) => s.width(),
            _ => 0,
        })
        .sum();
    if bytes.len() < static_width {
        return Err(StoreError::Codec(format!(
            "{} record truncated: {} bytes, static section needs {}",
            schema.name,
            bytes.len(),
            static_width
        )));
    }

    let mut row = Vec::with_capacity(schema.value.len());
    let mut offset = 0;
    for field in &schema.value {
        match field.ty {
            FieldType::Scalar(s) => {
                row.push(decode_scalar(s, &bytes[offset..offset + s.width()])?);
                offset += s.width();
            }
            _ => row.push(Value::Bool(false)),
        }
    }

    if schema.dynamic_count() == 0 {
        if offset != bytes.len() {
            return Err(StoreError::Codec(format!(
                "{} record has {} trailing bytes",
                schema.name,
                bytes.len() - offset
            )));
        }
        return Ok(row);
    }

    if bytes.len() < offset + PackedCounter::SIZE {
        return Err(StoreError::Codec(format!(
            "{} record missing packed counter",
            schema.name
        )));
    }
    let counter = PackedCounter::from_bytes(&bytes[offset..offset + PackedCounter::SIZE])?;
    offset += PackedCounter::SIZE;
    let remaining = (bytes.len() - offset) as u64;
    let declared: u64 = (0..schema.dynamic_count()).map(|i| counter.at(i)).sum();
    if counter.total() != remaining || declared != remaining {
        return Err(StoreError::Codec(format!(
            "{} dynamic section is {} bytes, counter says {} (fields sum {})",
            schema.name,
            remaining,
            counter.total(),
            declared
        )));
    }

    let mut dyn_index = 0;
    for (slot, field) in schema.value.iter().enumerate() {
        if field.ty.is_static() {
            continue;
        }
        let len = counter.at(dyn_index) as usize;
        let chunk = &bytes[offset..offset + len];
        row[slot] = decode_dynamic(&field.ty, chunk)?;
        offset += len;
        dyn_index += 1;
    }
    Ok(row)
}

// ============================================================================
// Scalars
// ============================================================================

fn encode_scalar(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bool(v) => out.push(u8::from(*v)),
        Value::U8(v) => out.push(*v),
        Value::U16(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::U32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::U64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::I32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::I64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Bytes32(b) => out.extend_from_slice(b),
        // Callers validate shapes before encoding
        Value::Str(_) | Value::Bytes(_) | Value::Array(_) => {}
    }
}

fn fixed<const N: usize>(chunk: &[u8]) -> StoreResult<[u8; N]> {
    chunk
        .try_into()
        .map_err(|_| StoreError::Codec(format!("expected {} bytes, got {}", N, chunk.len())))
}

fn decode_scalar(ty: ScalarType, chunk: &[u8]) -> StoreResult<Value> {
    Ok(match ty {
        ScalarType::Bool => match chunk {
            [0] => Value::Bool(false),
            [1] => Value::Bool(true),
            _ => return Err(StoreError::Codec(format!("invalid bool byte {:?}", chunk))),
        },
        ScalarType::U8 => Value::U8(u8::from_be_bytes(fixed(chunk)?)),
        ScalarType::U16 => Value::U16(u16::from_be_bytes(fixed(chunk)?)),
        ScalarType::U32 => Value::U32(u32::from_be_bytes(fixed(chunk)?)),
        ScalarType::U64 => Value::U64(u64::from_be_bytes(fixed(chunk)?)),
        ScalarType::I32 => Value::I32(i32::from_be_bytes(fixed(chunk)?)),
        ScalarType::I64 => Value::I64(i64::from_be_bytes(fixed(chunk)?)),
        ScalarType::Bytes32 => Value::Bytes32(fixed(chunk)?),
    })
}

fn decode_dynamic(ty: &FieldType, chunk: &[u8]) -> StoreResult<Value> {
    match ty {
        FieldType::Str => String::from_utf8(chunk.to_vec())
            .map(Value::Str)
            .map_err(|e| StoreError::Codec(format!("invalid utf-8 string: {}", e))),
        FieldType::Bytes => Ok(Value::Bytes(chunk.to_vec())),
        FieldType::Array(scalar) => {
            let width = scalar.width();
            if chunk.len() % width != 0 {
                return Err(StoreError::Codec(format!(
                    "{}[] data of {} bytes is not a multiple of {}",
                    scalar.as_str(),
                    chunk.len(),
                    width
                )));
            }
            chunk
                .chunks_exact(width)
                .map(|item| decode_scalar(*scalar, item))
                .collect::<StoreResult<Vec<_>>>()
                .map(Value::Array)
        }
        FieldType::Scalar(s) => decode_scalar(*s, chunk),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gacha_schema() -> TableSchema {
        TableSchema::new("GachaV4")
            .key_field("gachaId", FieldType::U64)
            .value_field("active", FieldType::BOOL)
            .value_field("ticketValue", FieldType::U32)
            .value_field("name", FieldType::Str)
            .value_field("itemIds", FieldType::Array(ScalarType::U64))
            .value_field("percents", FieldType::Array(ScalarType::U32))
    }

    fn tile_schema() -> TableSchema {
        TableSchema::new("TileInfo3")
            .key_field("x", FieldType::I32)
            .key_field("y", FieldType::I32)
            .value_field("kingdomId", FieldType::U16)
            .value_field("farmerId", FieldType::U64)
    }

    #[test]
    fn test_packed_counter_layout() {
        let counter = PackedCounter::pack(&[8, 24]).unwrap();
        assert_eq!(counter.total(), 32);
        assert_eq!(counter.at(0), 8);
        assert_eq!(counter.at(1), 24);
        assert_eq!(counter.at(2), 0);
        let bytes = counter.as_bytes();
        // total occupies the low 7 bytes
        assert_eq!(bytes[31], 32);
        // field 0 ends at byte 25, field 1 at byte 20
        assert_eq!(bytes[24], 8);
        assert_eq!(bytes[19], 24);
    }

    #[test]
    fn test_packed_counter_too_many_fields() {
        assert!(PackedCounter::pack(&[1, 1, 1, 1, 1, 1]).is_err());
    }

    #[test]
    fn test_record_with_dynamic_fields() {
        let schema = gacha_schema();
        let row = vec![
            Value::Bool(true),
            Value::U32(150),
            Value::Str("Spring".into()),
            Value::Array(vec![Value::U64(3), Value::U64(9)]),
            Value::Array(vec![Value::U32(70), Value::U32(30)]),
        ];
        let bytes = encode_record(&schema, &row).unwrap();
        // 1 + 4 static, 32 counter, 6 + 16 + 8 dynamic
        assert_eq!(bytes.len(), 5 + 32 + 30);
        assert_eq!(decode_record(&schema, &bytes).unwrap(), row);
    }

    #[test]
    fn test_static_only_record() {
        let schema = tile_schema();
        let row = vec![Value::U16(4), Value::U64(77)];
        let bytes = encode_record(&schema, &row).unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(decode_record(&schema, &bytes).unwrap(), row);
    }

    #[test]
    fn test_corrupted_counter_is_codec_error() {
        let schema = gacha_schema();
        let row = vec![
            Value::Bool(false),
            Value::U32(0),
            Value::Str("x".into()),
            Value::Array(vec![]),
            Value::Array(vec![]),
        ];
        let mut bytes = encode_record(&schema, &row).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_record(&schema, &bytes),
            Err(StoreError::Codec(_))
        ));
    }

    #[test]
    fn test_invalid_bool_is_codec_error() {
        let schema = tile_schema().value_field("flag", FieldType::BOOL);
        let mut bytes = encode_record(
            &schema,
            &[Value::U16(0), Value::U64(0), Value::Bool(true)],
        )
        .unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 7;
        assert!(decode_record(&schema, &bytes).is_err());
    }

    #[test]
    fn test_wrong_shape_is_schema_violation() {
        let schema = tile_schema();
        assert!(matches!(
            encode_record(&schema, &[Value::U16(1)]),
            Err(StoreError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_signed_keys_sort_numerically() {
        let schema = tile_schema();
        let neg = encode_key(&schema, &[Value::I32(-5), Value::I32(0)]).unwrap();
        let zero = encode_key(&schema, &[Value::I32(0), Value::I32(0)]).unwrap();
        let pos = encode_key(&schema, &[Value::I32(3), Value::I32(-1)]).unwrap();
        assert!(neg < zero);
        assert!(zero < pos);
        assert_eq!(
            decode_key(&schema, &neg).unwrap(),
            vec![Value::I32(-5), Value::I32(0)]
        );
    }

    #[test]
    fn test_key_prefix_is_byte_prefix() {
        let schema = tile_schema();
        let full = encode_key(&schema, &[Value::I32(2), Value::I32(9)]).unwrap();
        let prefix = encode_key_prefix(&schema, &[Value::I32(2)]).unwrap();
        assert!(full.starts_with(&prefix));
    }

    #[test]
    fn test_decode_key_wrong_width() {
        let schema = tile_schema();
        assert!(matches!(
            decode_key(&schema, &[0u8; 7]),
            Err(StoreError::Codec(_))
        ));
    }
}
