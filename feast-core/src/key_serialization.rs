//! Canonical binary form of composite entity keys.
//!
//! Layout: `[format version: u8][pair count: u32 LE]`, then every join key name as
//! `[len: u32 LE][utf-8 bytes]` in the declared order, then every value as
//! `[tag: u8][len: u32 LE, variable-width only][payload]`. Fixed-width payloads are little
//! endian. List values carry the element tag with [`LIST_FLAG`] set, a `u32` element count and
//! the element payloads without per-element tags.
//!
//! Names are never sorted here: callers pass the join key order of the owning feature view, so
//! the bytes are a pure function of the ordered names and values and every backend addresses the
//! same logical row with the same key.

use crate::error::{FeastError, Result};
use crate::model::Field;
use crate::types::value::Val;
use crate::types::{
    BoolList, BytesList, DoubleList, EntityKey, FloatList, Int32List, Int64List, StringList, Value,
};

pub const KEY_FORMAT_VERSION: u8 = 1;
const LIST_FLAG: u8 = 0x80;

const TAG_INT32: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_BOOL: u8 = 7;
const TAG_UNIX_TIMESTAMP: u8 = 8;

fn canonical_f32(v: f32) -> u32 {
    if v == 0.0 {
        0
    } else if v.is_nan() {
        f32::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

fn canonical_f64(v: f64) -> u64 {
    if v == 0.0 {
        0
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| FeastError::encoding(format!("{} is too long: {}", what, len)))
}

struct KeyWriter {
    bytes: Vec<u8>,
}

impl KeyWriter {
    fn put_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.bytes.extend(v.to_le_bytes());
    }

    fn put_len_prefixed(&mut self, payload: &[u8], what: &str) -> Result<()> {
        self.put_u32(len_u32(payload.len(), what)?);
        self.bytes.extend_from_slice(payload);
        Ok(())
    }

    fn put_list_header(&mut self, element_tag: u8, len: usize) -> Result<()> {
        self.put_u8(element_tag | LIST_FLAG);
        self.put_u32(len_u32(len, "list value")?);
        Ok(())
    }

    fn put_value(&mut self, value: &Value) -> Result<()> {
        let val = match value.val.as_ref() {
            None | Some(Val::NullVal(_)) => {
                return Err(FeastError::encoding("entity key values cannot be null"));
            }
            Some(val) => val,
        };
        match val {
            Val::Int32Val(v) => {
                self.put_u8(TAG_INT32);
                self.bytes.extend(v.to_le_bytes());
            }
            Val::Int64Val(v) => {
                self.put_u8(TAG_INT64);
                self.bytes.extend(v.to_le_bytes());
            }
            Val::FloatVal(v) => {
                self.put_u8(TAG_FLOAT);
                self.bytes.extend(canonical_f32(*v).to_le_bytes());
            }
            Val::DoubleVal(v) => {
                self.put_u8(TAG_DOUBLE);
                self.bytes.extend(canonical_f64(*v).to_le_bytes());
            }
            Val::StringVal(v) => {
                self.put_u8(TAG_STRING);
                self.put_len_prefixed(v.as_bytes(), "string value")?;
            }
            Val::BytesVal(v) => {
                self.put_u8(TAG_BYTES);
                self.put_len_prefixed(v, "bytes value")?;
            }
            Val::BoolVal(v) => {
                self.put_u8(TAG_BOOL);
                self.put_u8(u8::from(*v));
            }
            Val::UnixTimestampVal(v) => {
                self.put_u8(TAG_UNIX_TIMESTAMP);
                self.bytes.extend(v.to_le_bytes());
            }
            Val::Int32ListVal(list) => {
                self.put_list_header(TAG_INT32, list.val.len())?;
                list.val.iter().for_each(|v| self.bytes.extend(v.to_le_bytes()));
            }
            Val::Int64ListVal(list) => {
                self.put_list_header(TAG_INT64, list.val.len())?;
                list.val.iter().for_each(|v| self.bytes.extend(v.to_le_bytes()));
            }
            Val::FloatListVal(list) => {
                self.put_list_header(TAG_FLOAT, list.val.len())?;
                list.val
                    .iter()
                    .for_each(|v| self.bytes.extend(canonical_f32(*v).to_le_bytes()));
            }
            Val::DoubleListVal(list) => {
                self.put_list_header(TAG_DOUBLE, list.val.len())?;
                list.val
                    .iter()
                    .for_each(|v| self.bytes.extend(canonical_f64(*v).to_le_bytes()));
            }
            Val::StringListVal(list) => {
                self.put_list_header(TAG_STRING, list.val.len())?;
                for v in &list.val {
                    self.put_len_prefixed(v.as_bytes(), "string list element")?;
                }
            }
            Val::BytesListVal(list) => {
                self.put_list_header(TAG_BYTES, list.val.len())?;
                for v in &list.val {
                    self.put_len_prefixed(v, "bytes list element")?;
                }
            }
            Val::BoolListVal(list) => {
                self.put_list_header(TAG_BOOL, list.val.len())?;
                list.val.iter().for_each(|v| self.put_u8(u8::from(*v)));
            }
            Val::UnixTimestampListVal(list) => {
                self.put_list_header(TAG_UNIX_TIMESTAMP, list.val.len())?;
                list.val.iter().for_each(|v| self.bytes.extend(v.to_le_bytes()));
            }
            Val::NullVal(_) => unreachable!("nulls are rejected above"),
        }
        Ok(())
    }
}

/// Encodes ordered join key names and values into the canonical key bytes.
pub fn encode<S: AsRef<str>>(names: &[S], values: &[Value]) -> Result<Vec<u8>> {
    if names.len() != values.len() {
        return Err(FeastError::encoding(format!(
            "{} join keys but {} values",
            names.len(),
            values.len()
        )));
    }
    for (i, name) in names.iter().enumerate() {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(FeastError::encoding("join key names cannot be empty"));
        }
        if names[..i].iter().any(|other| other.as_ref() == name) {
            return Err(FeastError::encoding(format!("duplicate join key {}", name)));
        }
    }
    let mut writer = KeyWriter {
        bytes: Vec::with_capacity(5 + names.len() * 24),
    };
    writer.put_u8(KEY_FORMAT_VERSION);
    writer.put_u32(len_u32(names.len(), "entity key")?);
    for name in names {
        writer.put_len_prefixed(name.as_ref().as_bytes(), "join key name")?;
    }
    for value in values {
        writer.put_value(value)?;
    }
    Ok(writer.bytes)
}

pub fn serialize_key(entity_key: &EntityKey) -> Result<Vec<u8>> {
    encode(&entity_key.join_keys, &entity_key.entity_values)
}

/// Encodes values against declared join key fields, rejecting any value whose runtime type
/// differs from the declared one.
pub fn serialize_key_with_schema(join_keys: &[Field], values: &[Value]) -> Result<Vec<u8>> {
    if join_keys.len() != values.len() {
        return Err(FeastError::encoding(format!(
            "{} join keys but {} values",
            join_keys.len(),
            values.len()
        )));
    }
    for (field, value) in join_keys.iter().zip(values) {
        match value.value_type() {
            Some(actual) if actual == field.value_type => {}
            Some(actual) => {
                return Err(FeastError::encoding(format!(
                    "join key {} is declared as {} but the value is {}",
                    field.name, field.value_type, actual
                )));
            }
            None => {
                return Err(FeastError::encoding(format!(
                    "join key {} is null",
                    field.name
                )));
            }
        }
    }
    let names: Vec<&str> = join_keys.iter().map(|f| f.name.as_str()).collect();
    encode(&names, values)
}

struct KeyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> KeyReader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(FeastError::encoding(format!(
                "truncated entity key: need {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(u32::from_le_bytes(self.array()?)))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(u64::from_le_bytes(self.array()?)))
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FeastError::encoding(format!("invalid bool byte {}", other))),
        }
    }

    fn bytes_prefixed(&mut self) -> Result<Vec<u8>> {
        let len = self.len()?;
        Ok(self.take(len)?.to_vec())
    }

    fn string_prefixed(&mut self) -> Result<String> {
        let bytes = self.bytes_prefixed()?;
        String::from_utf8(bytes)
            .map_err(|e| FeastError::encoding(format!("invalid utf-8 in entity key: {}", e)))
    }

    fn list<T>(&mut self, mut element: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.len()?;
        // Every element occupies at least one byte.
        if count > self.remaining() {
            return Err(FeastError::encoding(format!(
                "list of {} elements exceeds remaining {} bytes",
                count,
                self.remaining()
            )));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(element(self)?);
        }
        Ok(items)
    }

    fn value(&mut self) -> Result<Value> {
        let tag = self.u8()?;
        let val = if tag & LIST_FLAG == 0 {
            match tag {
                TAG_INT32 => Val::Int32Val(self.i32()?),
                TAG_INT64 => Val::Int64Val(self.i64()?),
                TAG_FLOAT => Val::FloatVal(self.f32()?),
                TAG_DOUBLE => Val::DoubleVal(self.f64()?),
                TAG_STRING => Val::StringVal(self.string_prefixed()?),
                TAG_BYTES => Val::BytesVal(self.bytes_prefixed()?),
                TAG_BOOL => Val::BoolVal(self.bool()?),
                TAG_UNIX_TIMESTAMP => Val::UnixTimestampVal(self.i64()?),
                other => {
                    return Err(FeastError::encoding(format!("unknown value tag {}", other)));
                }
            }
        } else {
            match tag & !LIST_FLAG {
                TAG_INT32 => Val::Int32ListVal(Int32List {
                    val: self.list(Self::i32)?,
                }),
                TAG_INT64 => Val::Int64ListVal(Int64List {
                    val: self.list(Self::i64)?,
                }),
                TAG_FLOAT => Val::FloatListVal(FloatList {
                    val: self.list(Self::f32)?,
                }),
                TAG_DOUBLE => Val::DoubleListVal(DoubleList {
                    val: self.list(Self::f64)?,
                }),
                TAG_STRING => Val::StringListVal(StringList {
                    val: self.list(Self::string_prefixed)?,
                }),
                TAG_BYTES => Val::BytesListVal(BytesList {
                    val: self.list(Self::bytes_prefixed)?,
                }),
                TAG_BOOL => Val::BoolListVal(BoolList {
                    val: self.list(Self::bool)?,
                }),
                TAG_UNIX_TIMESTAMP => Val::UnixTimestampListVal(Int64List {
                    val: self.list(Self::i64)?,
                }),
                other => {
                    return Err(FeastError::encoding(format!(
                        "unknown list element tag {}",
                        other
                    )));
                }
            }
        };
        Ok(Value { val: Some(val) })
    }
}

pub fn deserialize_key(bytes: &[u8]) -> Result<EntityKey> {
    let mut reader = KeyReader { bytes, pos: 0 };
    let version = reader.u8()?;
    if version != KEY_FORMAT_VERSION {
        return Err(FeastError::encoding(format!(
            "unsupported entity key format version {}",
            version
        )));
    }
    let count = reader.len()?;
    if count > reader.remaining() {
        return Err(FeastError::encoding(format!(
            "entity key claims {} pairs in {} bytes",
            count,
            reader.remaining()
        )));
    }
    let join_keys = (0..count)
        .map(|_| reader.string_prefixed())
        .collect::<Result<Vec<String>>>()?;
    let entity_values = (0..count)
        .map(|_| reader.value())
        .collect::<Result<Vec<Value>>>()?;
    if reader.remaining() != 0 {
        return Err(FeastError::encoding(format!(
            "{} trailing bytes after entity key",
            reader.remaining()
        )));
    }
    Ok(EntityKey {
        join_keys,
        entity_values,
    })
}

/// Inverse of [`encode`].
pub fn decode(bytes: &[u8]) -> Result<(Vec<String>, Vec<Value>)> {
    let key = deserialize_key(bytes)?;
    Ok((key.join_keys, key.entity_values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValueType;
    use proptest::prelude::*;

    fn std_hex(bytes: &[u8]) -> String {
        "0x".to_string()
            + &bytes
                .iter()
                .map(|b| format!("{:02x}", b).to_uppercase())
                .collect::<String>()
    }

    #[test]
    fn test_serialize_key() -> anyhow::Result<()> {
        let entity_key = EntityKey::single("driver_id", Value::int64(1005));
        let serialized = serialize_key(&entity_key)?;
        let expected = "0x0101000000090000006472697665725F696402ED03000000000000";
        assert_eq!(std_hex(&serialized), expected);
        assert_eq!(deserialize_key(&serialized)?, entity_key);
        Ok(())
    }

    #[test]
    fn names_are_not_reordered() -> anyhow::Result<()> {
        let forward = encode(
            &["driver_id", "customer_id"],
            &[Value::int64(1), Value::int64(2)],
        )?;
        let backward = encode(
            &["customer_id", "driver_id"],
            &[Value::int64(2), Value::int64(1)],
        )?;
        assert_ne!(forward, backward);
        let (names, values) = decode(&forward)?;
        assert_eq!(names, vec!["driver_id", "customer_id"]);
        assert_eq!(values, vec![Value::int64(1), Value::int64(2)]);
        Ok(())
    }

    #[test]
    fn length_prefixes_keep_adjacent_strings_apart() -> anyhow::Result<()> {
        let a = encode(&["k1", "k2"], &[Value::string("a"), Value::string("bc")])?;
        let b = encode(&["k1", "k2"], &[Value::string("ab"), Value::string("c")])?;
        assert_ne!(a, b);
        let int32 = encode(&["k"], &[Value::int32(1)])?;
        let int64 = encode(&["k"], &[Value::int64(1)])?;
        assert_ne!(int32, int64);
        Ok(())
    }

    #[test]
    fn negative_zero_and_nan_are_canonical() -> anyhow::Result<()> {
        assert_eq!(
            encode(&["k"], &[Value::double(-0.0)])?,
            encode(&["k"], &[Value::double(0.0)])?
        );
        let other_nan = f64::from_bits(f64::NAN.to_bits() | 1);
        assert_eq!(
            encode(&["k"], &[Value::double(other_nan)])?,
            encode(&["k"], &[Value::double(f64::NAN)])?
        );
        Ok(())
    }

    #[test]
    fn invalid_keys_are_rejected() {
        assert!(encode(&["a"], &[]).unwrap_err().is_encoding());
        assert!(encode(&["a"], &[Value::null()]).is_err());
        assert!(encode(&["a", "a"], &[Value::int32(1), Value::int32(2)]).is_err());
        assert!(encode(&[""], &[Value::int32(1)]).is_err());
    }

    #[test]
    fn schema_mismatch_is_an_encoding_error() {
        let schema = vec![Field::new("driver_id", ValueType::Int64)];
        let err = serialize_key_with_schema(&schema, &[Value::string("1001")]).unwrap_err();
        assert!(err.is_encoding());
        assert!(err.to_string().contains("driver_id"), "{}", err);
        assert!(serialize_key_with_schema(&schema, &[Value::int64(1001)]).is_ok());
    }

    #[test]
    fn malformed_bytes_fail_to_decode() -> anyhow::Result<()> {
        let bytes = serialize_key(&EntityKey::single("id", Value::string("abc")))?;
        assert!(deserialize_key(&bytes[..bytes.len() - 1]).is_err());
        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(deserialize_key(&trailing).is_err());
        let mut wrong_version = bytes;
        wrong_version[0] = 9;
        assert!(deserialize_key(&wrong_version).is_err());
        assert!(deserialize_key(&[]).is_err());
        Ok(())
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let finite_f64 = any::<f64>().prop_filter("NaN never compares equal", |v| !v.is_nan());
        let finite_f32 = any::<f32>().prop_filter("NaN never compares equal", |v| !v.is_nan());
        prop_oneof![
            any::<i32>().prop_map(Value::int32),
            any::<i64>().prop_map(Value::int64),
            finite_f32.clone().prop_map(Value::float),
            finite_f64.clone().prop_map(Value::double),
            ".{0,16}".prop_map(Value::string),
            prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::bytes),
            any::<bool>().prop_map(Value::bool),
            any::<i64>().prop_map(Value::unix_timestamp),
            prop::collection::vec(any::<i64>(), 0..8).prop_map(|val| Value {
                val: Some(Val::Int64ListVal(Int64List { val })),
            }),
            prop::collection::vec(finite_f32, 0..8).prop_map(|val| Value {
                val: Some(Val::FloatListVal(FloatList { val })),
            }),
            prop::collection::vec(".{0,8}", 0..8).prop_map(|val| Value {
                val: Some(Val::StringListVal(StringList { val })),
            }),
            prop::collection::vec(prop::collection::vec(any::<u8>(), 0..8), 0..4).prop_map(
                |val| Value {
                    val: Some(Val::BytesListVal(BytesList { val })),
                }
            ),
            prop::collection::vec(any::<bool>(), 0..8).prop_map(|val| Value {
                val: Some(Val::BoolListVal(BoolList { val })),
            }),
        ]
    }

    proptest! {
        #[test]
        fn round_trip(values in prop::collection::vec(arb_value(), 0..6)) {
            let names: Vec<String> = (0..values.len()).map(|i| format!("key_{}", i)).collect();
            let key = EntityKey::new(names, values);
            let bytes = serialize_key(&key).unwrap();
            prop_assert_eq!(deserialize_key(&bytes).unwrap(), key.clone());
            prop_assert_eq!(serialize_key(&key).unwrap(), bytes);
        }

        #[test]
        fn decoding_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = deserialize_key(&bytes);
        }
    }
}
