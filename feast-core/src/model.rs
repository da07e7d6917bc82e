use crate::error::{FeastError, Result};
use crate::types::value::Val;
use crate::types::{EntityKey, FloatList, Int32List, Value};
use chrono::{DateTime, Duration, Utc};
use serde::ser::Error as SerdeError;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Formatter;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Bytes,
    String,
    Int32,
    Int64,
    Double,
    Float,
    Bool,
    UnixTimestamp,
    BytesList,
    StringList,
    Int32List,
    Int64List,
    DoubleList,
    FloatList,
    BoolList,
    UnixTimestampList,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn type_name(value: &Value) -> String {
    value
        .value_type()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "Null".to_string())
}

fn narrow_i32(v: i64) -> Option<i32> {
    i32::try_from(v).ok()
}

// Integers past the mantissa would round onto a neighbour.
fn exact_f64(v: i64) -> Option<f64> {
    let f = v as f64;
    (f as i128 == i128::from(v)).then_some(f)
}

fn exact_f32(v: i64) -> Option<f32> {
    let f = v as f32;
    (f as i128 == i128::from(v)).then_some(f)
}

fn int_to_bool(v: i64) -> Option<bool> {
    match v {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

impl Value {
    /// Converts a value produced by a source into the declared type of its column.
    /// Nulls pass through unchanged; a conversion that would lose information fails.
    pub fn coerce_to(&self, target: ValueType) -> Result<Value> {
        let Some(val) = self.val.as_ref() else {
            return Ok(Value::null());
        };
        if self.value_type() == Some(target) {
            return Ok(self.clone());
        }
        let converted = match (val, target) {
            (Val::NullVal(_), _) => Some(Value::null()),
            (Val::Int64Val(v), ValueType::Int32) => narrow_i32(*v).map(Value::int32),
            (Val::Int32Val(v), ValueType::Int64) => Some(Value::int64(i64::from(*v))),
            (Val::Int64Val(v), ValueType::UnixTimestamp) => Some(Value::unix_timestamp(*v)),
            (Val::Int32Val(v), ValueType::UnixTimestamp) => {
                Some(Value::unix_timestamp(i64::from(*v)))
            }
            (Val::UnixTimestampVal(v), ValueType::Int64) => Some(Value::int64(*v)),
            (Val::Int64Val(v), ValueType::Bool) => int_to_bool(*v).map(Value::bool),
            (Val::Int32Val(v), ValueType::Bool) => int_to_bool(i64::from(*v)).map(Value::bool),
            (Val::DoubleVal(v), ValueType::Float) => Some(Value::float(*v as f32)),
            (Val::FloatVal(v), ValueType::Double) => Some(Value::double(f64::from(*v))),
            (Val::Int64Val(v), ValueType::Double) => exact_f64(*v).map(Value::double),
            (Val::Int64Val(v), ValueType::Float) => exact_f32(*v).map(Value::float),
            (Val::Int32Val(v), ValueType::Double) => Some(Value::double(f64::from(*v))),
            (Val::Int64ListVal(list), ValueType::UnixTimestampList) => Some(Value {
                val: Some(Val::UnixTimestampListVal(list.clone())),
            }),
            (Val::Int64ListVal(list), ValueType::Int32List) => list
                .val
                .iter()
                .map(|v| narrow_i32(*v))
                .collect::<Option<Vec<i32>>>()
                .map(|val| Value {
                    val: Some(Val::Int32ListVal(Int32List { val })),
                }),
            (Val::DoubleListVal(list), ValueType::FloatList) => Some(Value {
                val: Some(Val::FloatListVal(FloatList {
                    val: list.val.iter().map(|v| *v as f32).collect(),
                })),
            }),
            _ => None,
        };
        converted.ok_or_else(|| {
            FeastError::encoding(format!(
                "value of type {} cannot be used as {}",
                type_name(self),
                target
            ))
        })
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EntityIdValue {
    Int(i64),
    String(String),
}

impl EntityIdValue {
    pub fn to_proto_value(&self, output_type: ValueType) -> Result<Value> {
        match self {
            EntityIdValue::String(s) => match output_type {
                ValueType::String => Ok(Value::string(s.clone())),
                ValueType::Bytes => Ok(Value::bytes(s.as_bytes().to_vec())),
                other => Err(FeastError::encoding(format!(
                    "string entity value '{}' cannot be used as {}",
                    s, other
                ))),
            },
            EntityIdValue::Int(i) => match output_type {
                ValueType::String => Ok(Value::string(i.to_string())),
                other => Value::int64(*i).coerce_to(other),
            },
        }
    }
}

impl fmt::Display for EntityIdValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EntityIdValue::Int(i) => write!(f, "{}", i),
            EntityIdValue::String(s) => write!(f, "{}", s),
        }
    }
}

#[derive(PartialEq, Clone)]
pub struct ValueWrapper(pub Value);

impl From<EntityIdValue> for ValueWrapper {
    fn from(value: EntityIdValue) -> Self {
        match value {
            EntityIdValue::Int(v) => Self(Value::int64(v)),
            EntityIdValue::String(v) => Self(Value::string(v)),
        }
    }
}

impl Serialize for ValueWrapper {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match &self.0.val {
            None | Some(Val::NullVal(_)) => serializer.serialize_none(),
            Some(v) => match v {
                Val::Int32Val(i) => serializer.serialize_i32(*i),
                Val::Int64Val(i) => serializer.serialize_i64(*i),
                Val::FloatVal(f) => serializer.serialize_f32(*f),
                Val::DoubleVal(d) => serializer.serialize_f64(*d),
                Val::StringVal(s) => serializer.serialize_str(s),
                Val::BytesVal(b) => serializer.serialize_bytes(b),
                Val::BoolVal(b) => serializer.serialize_bool(*b),
                Val::UnixTimestampVal(ts) => serializer.serialize_i64(*ts),
                Val::StringListVal(l) => l.val.serialize(serializer),
                Val::Int32ListVal(l) => l.val.serialize(serializer),
                Val::Int64ListVal(l) | Val::UnixTimestampListVal(l) => l.val.serialize(serializer),
                Val::DoubleListVal(l) => l.val.serialize(serializer),
                Val::FloatListVal(l) => l.val.serialize(serializer),
                Val::BoolListVal(l) => l.val.serialize(serializer),
                other => Err(S::Error::custom(format!(
                    "unsupported value variant: {:?}",
                    other
                ))),
            },
        }
    }
}

impl fmt::Debug for ValueWrapper {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value_type: ValueType,
}

impl Field {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub join_key: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    /// Table (or query alias) in the offline store.
    pub table: String,
    pub event_timestamp_column: String,
    #[serde(default)]
    pub created_timestamp_column: Option<String>,
    /// Source column name to feature or join key name.
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
}

impl DataSource {
    /// Maps a feature or join key name back to the column it is read from.
    pub fn source_column<'a>(&'a self, name: &'a str) -> &'a str {
        self.field_mapping
            .iter()
            .find(|(_, target)| target.as_str() == name)
            .map(|(source, _)| source.as_str())
            .unwrap_or(name)
    }
}

/// A logical feature table: the unit of materialization and of online storage.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureView {
    pub name: String,
    pub entity_names: Vec<String>,
    /// Join keys in the canonical order used for entity key encoding.
    pub entity_columns: Vec<Field>,
    pub features: Vec<Field>,
    pub ttl: Duration,
    pub source: DataSource,
}

impl FeatureView {
    pub fn join_keys(&self) -> Vec<String> {
        self.entity_columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn feature(&self, name: &str) -> Option<&Field> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Online table identifier of this view within a project.
    pub fn table_id(&self, project: &str) -> String {
        format!("{}_{}", project, self.name)
    }

    /// Builds an entity key from values given in join key order, coercing each value to the
    /// declared join key type.
    pub fn entity_key(&self, values: Vec<Value>) -> Result<EntityKey> {
        if values.len() != self.entity_columns.len() {
            return Err(FeastError::encoding(format!(
                "feature view {} expects {} join key values, got {}",
                self.name,
                self.entity_columns.len(),
                values.len()
            )));
        }
        let entity_values = self
            .entity_columns
            .iter()
            .zip(values.iter())
            .map(|(column, value)| {
                if value.is_null() {
                    return Err(FeastError::encoding(format!(
                        "join key {} of feature view {} is null",
                        column.name, self.name
                    )));
                }
                value.coerce_to(column.value_type)
            })
            .collect::<Result<Vec<Value>>>()?;
        Ok(EntityKey::new(self.join_keys(), entity_values))
    }

    /// Checks that an entity key names exactly this view's join keys, in canonical order.
    pub fn check_entity_key(&self, entity_key: &EntityKey) -> Result<()> {
        let matches = entity_key.join_keys.len() == self.entity_columns.len()
            && entity_key
                .join_keys
                .iter()
                .zip(self.entity_columns.iter())
                .all(|(name, column)| name == &column.name);
        if matches {
            Ok(())
        } else {
            Err(FeastError::encoding(format!(
                "entity key {:?} does not match join keys {:?} of feature view {}",
                entity_key.join_keys,
                self.join_keys(),
                self.name
            )))
        }
    }
}

/// A single row headed for the online store.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub entity_key: EntityKey,
    pub values: BTreeMap<String, Value>,
    pub event_ts: DateTime<Utc>,
    /// Ingestion time, "now" at write time when absent.
    pub created_ts: Option<DateTime<Utc>>,
}

impl FeatureRow {
    pub fn new(entity_key: EntityKey, event_ts: DateTime<Utc>) -> Self {
        Self {
            entity_key,
            values: BTreeMap::new(),
            event_ts,
            created_ts: None,
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_created_ts(mut self, created_ts: DateTime<Utc>) -> Self {
        self.created_ts = Some(created_ts);
        self
    }
}

/// Ordering of records under last-write-wins by business time: event time first, creation
/// time as tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordVersion {
    pub event_ts: DateTime<Utc>,
    pub created_ts: DateTime<Utc>,
}

impl RecordVersion {
    pub fn new(event_ts: DateTime<Utc>, created_ts: DateTime<Utc>) -> Self {
        Self {
            event_ts,
            created_ts,
        }
    }

    /// An absent stored version behaves as (-inf, -inf). Equal versions never supersede.
    pub fn supersedes(&self, stored: Option<&RecordVersion>) -> bool {
        stored.is_none_or(|stored| self > stored)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub event_ts: DateTime<Utc>,
    pub created_ts: DateTime<Utc>,
    pub values: BTreeMap<String, Value>,
}

impl StoredRecord {
    pub fn version(&self) -> RecordVersion {
        RecordVersion::new(self.event_ts, self.created_ts)
    }
}

/// Hashing and equality for values that treat floats by their bit pattern, so values can be
/// used as hash map keys.
struct HashValue<'a>(&'a Value);

impl<'a> Hash for HashValue<'a> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0.val {
            None => {
                0u8.hash(state);
            }
            Some(v) => match v {
                Val::Int32Val(i) => {
                    1u8.hash(state);
                    i.hash(state);
                }
                Val::Int64Val(i) => {
                    2u8.hash(state);
                    i.hash(state);
                }
                Val::StringVal(s) => {
                    5u8.hash(state);
                    s.hash(state);
                }
                Val::BytesVal(b) => {
                    6u8.hash(state);
                    b.hash(state);
                }
                Val::BoolVal(b) => {
                    7u8.hash(state);
                    b.hash(state);
                }
                Val::UnixTimestampVal(ts) => {
                    8u8.hash(state);
                    ts.hash(state);
                }
                Val::FloatVal(f) => {
                    9u8.hash(state);
                    f.to_bits().hash(state);
                }
                Val::DoubleVal(d) => {
                    10u8.hash(state);
                    d.to_bits().hash(state);
                }
                Val::BytesListVal(lv) => {
                    11u8.hash(state);
                    lv.val.hash(state);
                }
                Val::StringListVal(lv) => {
                    12u8.hash(state);
                    lv.val.hash(state);
                }
                Val::Int32ListVal(lv) => {
                    13u8.hash(state);
                    lv.val.hash(state);
                }
                Val::Int64ListVal(lv) => {
                    14u8.hash(state);
                    lv.val.hash(state);
                }
                Val::DoubleListVal(lv) => {
                    15u8.hash(state);
                    lv.val.iter().for_each(|d| d.to_bits().hash(state));
                }
                Val::FloatListVal(lv) => {
                    16u8.hash(state);
                    lv.val.iter().for_each(|f| f.to_bits().hash(state));
                }
                Val::BoolListVal(lv) => {
                    17u8.hash(state);
                    lv.val.hash(state);
                }
                Val::UnixTimestampListVal(lv) => {
                    18u8.hash(state);
                    lv.val.hash(state);
                }
                Val::NullVal(n) => {
                    19u8.hash(state);
                    n.hash(state);
                }
            },
        }
    }
}

impl<'a> PartialEq for HashValue<'a> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0.val, &other.0.val) {
            (Some(Val::FloatVal(a)), Some(Val::FloatVal(b))) => a.to_bits() == b.to_bits(),
            (Some(Val::DoubleVal(a)), Some(Val::DoubleVal(b))) => a.to_bits() == b.to_bits(),
            (Some(Val::FloatListVal(a)), Some(Val::FloatListVal(b))) => {
                a.val.len() == b.val.len()
                    && a.val.iter().zip(&b.val).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Some(Val::DoubleListVal(a)), Some(Val::DoubleListVal(b))) => {
                a.val.len() == b.val.len()
                    && a.val.iter().zip(&b.val).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (a, b) => a == b,
        }
    }
}

/// Wrapper struct to implement custom hashing for EntityKey
/// Used as key in HashMap when grouping rows by entity
#[derive(Debug, Clone)]
pub struct HashEntityKey(pub Arc<EntityKey>);

impl Hash for HashEntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for join_key in &self.0.join_keys {
            join_key.hash(state);
        }
        for entity_value in &self.0.entity_values {
            HashValue(entity_value).hash(state);
        }
    }
}

impl PartialEq for HashEntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.join_keys == other.0.join_keys
            && self.0.entity_values.len() == other.0.entity_values.len()
            && self
                .0
                .entity_values
                .iter()
                .zip(other.0.entity_values.iter())
                .all(|(a, b)| HashValue(a) == HashValue(b))
    }
}

impl Eq for HashEntityKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn driver_view() -> FeatureView {
        FeatureView {
            name: "driver_locations".to_string(),
            entity_names: vec!["driver".to_string()],
            entity_columns: vec![Field::new("driver_id", ValueType::Int32)],
            features: vec![
                Field::new("lat", ValueType::Double),
                Field::new("lon", ValueType::String),
            ],
            ttl: Duration::zero(),
            source: DataSource::default(),
        }
    }

    #[test]
    fn coerce_narrows_integers_in_range_only() -> anyhow::Result<()> {
        assert_eq!(Value::int64(7).coerce_to(ValueType::Int32)?, Value::int32(7));
        let err = Value::int64(i64::MAX)
            .coerce_to(ValueType::Int32)
            .unwrap_err();
        assert!(err.is_encoding());
        assert!(Value::string("x").coerce_to(ValueType::Int64).is_err());
        assert_eq!(Value::int64(1).coerce_to(ValueType::Bool)?, Value::bool(true));
        assert!(Value::int64(2).coerce_to(ValueType::Bool).is_err());
        assert!(Value::null().coerce_to(ValueType::String)?.is_null());
        Ok(())
    }

    #[test]
    fn coerce_to_floating_point_rejects_rounded_integers() -> anyhow::Result<()> {
        assert_eq!(
            Value::int64(16_777_216).coerce_to(ValueType::Float)?,
            Value::float(16_777_216.0)
        );
        let err = Value::int64(16_777_217)
            .coerce_to(ValueType::Float)
            .unwrap_err();
        assert!(err.is_encoding());
        assert_eq!(
            Value::int64(1 << 53).coerce_to(ValueType::Double)?,
            Value::double(9_007_199_254_740_992.0)
        );
        assert!(Value::int64((1 << 53) + 1).coerce_to(ValueType::Double).is_err());
        assert!(Value::int64(i64::MAX).coerce_to(ValueType::Double).is_err());
        Ok(())
    }

    #[test]
    fn entity_key_follows_view_join_key_order() -> anyhow::Result<()> {
        let view = driver_view();
        let key = view.entity_key(vec![Value::int64(1001)])?;
        assert_eq!(key.join_keys, vec!["driver_id".to_string()]);
        assert_eq!(key.entity_values, vec![Value::int32(1001)]);
        view.check_entity_key(&key)?;

        assert!(view.entity_key(vec![Value::null()]).is_err());
        assert!(view.entity_key(vec![]).is_err());
        let other = EntityKey::single("rider_id", Value::int32(1));
        assert!(view.check_entity_key(&other).is_err());
        Ok(())
    }

    #[test]
    fn record_version_orders_event_time_before_created_time() {
        let t = Utc.with_ymd_and_hms(2021, 4, 12, 10, 0, 0).unwrap();
        let hour = Duration::hours(1);
        let stored = RecordVersion::new(t, t);
        assert!(RecordVersion::new(t, t).supersedes(None));
        assert!(!RecordVersion::new(t - hour, t + hour).supersedes(Some(&stored)));
        assert!(RecordVersion::new(t + hour, t - hour).supersedes(Some(&stored)));
        assert!(!RecordVersion::new(t, t - hour).supersedes(Some(&stored)));
        assert!(RecordVersion::new(t, t + hour).supersedes(Some(&stored)));
        assert!(!RecordVersion::new(t, t).supersedes(Some(&stored)));
    }

    #[test]
    fn hash_entity_key_treats_floats_bitwise() {
        let nan_key = |v: f64| {
            HashEntityKey(Arc::new(EntityKey::single("score", Value::double(v))))
        };
        let mut keys = HashSet::new();
        keys.insert(nan_key(f64::NAN));
        assert!(keys.contains(&nan_key(f64::NAN)));
        keys.insert(nan_key(1.0));
        keys.insert(nan_key(1.0));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn data_source_maps_features_back_to_columns() {
        let source = DataSource {
            table: "driver_stats".to_string(),
            event_timestamp_column: "event_timestamp".to_string(),
            created_timestamp_column: None,
            field_mapping: BTreeMap::from([("latitude".to_string(), "lat".to_string())]),
        };
        assert_eq!(source.source_column("lat"), "latitude");
        assert_eq!(source.source_column("lon"), "lon");
    }

    #[test]
    fn entity_id_values_convert_to_declared_type() -> anyhow::Result<()> {
        assert_eq!(
            EntityIdValue::Int(5).to_proto_value(ValueType::Int32)?,
            Value::int32(5)
        );
        assert_eq!(
            EntityIdValue::Int(5).to_proto_value(ValueType::String)?,
            Value::string("5")
        );
        assert!(
            EntityIdValue::String("a".to_string())
                .to_proto_value(ValueType::Int64)
                .is_err()
        );
        Ok(())
    }
}
