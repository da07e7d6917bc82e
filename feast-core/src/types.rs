//! Protobuf value model shared with the Feast `Value.proto` / `EntityKey.proto` wire form.
//! Feature values are persisted in online stores in this encoding.

use crate::model::ValueType;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Value {
    #[prost(
        oneof = "value::Val",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 11, 12, 13, 14, 15, 16, 17, 18, 19"
    )]
    pub val: ::core::option::Option<value::Val>,
}

pub mod value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Val {
        #[prost(bytes, tag = "1")]
        BytesVal(::prost::alloc::vec::Vec<u8>),
        #[prost(string, tag = "2")]
        StringVal(::prost::alloc::string::String),
        #[prost(int32, tag = "3")]
        Int32Val(i32),
        #[prost(int64, tag = "4")]
        Int64Val(i64),
        #[prost(double, tag = "5")]
        DoubleVal(f64),
        #[prost(float, tag = "6")]
        FloatVal(f32),
        #[prost(bool, tag = "7")]
        BoolVal(bool),
        #[prost(int64, tag = "8")]
        UnixTimestampVal(i64),
        #[prost(message, tag = "11")]
        BytesListVal(super::BytesList),
        #[prost(message, tag = "12")]
        StringListVal(super::StringList),
        #[prost(message, tag = "13")]
        Int32ListVal(super::Int32List),
        #[prost(message, tag = "14")]
        Int64ListVal(super::Int64List),
        #[prost(message, tag = "15")]
        DoubleListVal(super::DoubleList),
        #[prost(message, tag = "16")]
        FloatListVal(super::FloatList),
        #[prost(message, tag = "17")]
        BoolListVal(super::BoolList),
        #[prost(message, tag = "18")]
        UnixTimestampListVal(super::Int64List),
        #[prost(enumeration = "super::Null", tag = "19")]
        NullVal(i32),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BytesList {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringList {
    #[prost(string, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Int32List {
    #[prost(int32, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Int64List {
    #[prost(int64, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DoubleList {
    #[prost(double, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FloatList {
    #[prost(float, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BoolList {
    #[prost(bool, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Null {
    Null = 0,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntityKey {
    #[prost(string, repeated, tag = "1")]
    pub join_keys: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "2")]
    pub entity_values: ::prost::alloc::vec::Vec<Value>,
}

use value::Val;

impl Value {
    pub fn null() -> Self {
        Self { val: None }
    }

    pub fn int32(v: i32) -> Self {
        Self {
            val: Some(Val::Int32Val(v)),
        }
    }

    pub fn int64(v: i64) -> Self {
        Self {
            val: Some(Val::Int64Val(v)),
        }
    }

    pub fn float(v: f32) -> Self {
        Self {
            val: Some(Val::FloatVal(v)),
        }
    }

    pub fn double(v: f64) -> Self {
        Self {
            val: Some(Val::DoubleVal(v)),
        }
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self {
            val: Some(Val::StringVal(v.into())),
        }
    }

    pub fn bytes(v: impl Into<Vec<u8>>) -> Self {
        Self {
            val: Some(Val::BytesVal(v.into())),
        }
    }

    pub fn bool(v: bool) -> Self {
        Self {
            val: Some(Val::BoolVal(v)),
        }
    }

    pub fn unix_timestamp(seconds: i64) -> Self {
        Self {
            val: Some(Val::UnixTimestampVal(seconds)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.val, None | Some(Val::NullVal(_)))
    }

    /// Runtime type of the value, `None` for nulls.
    pub fn value_type(&self) -> Option<ValueType> {
        let value_type = match self.val.as_ref()? {
            Val::BytesVal(_) => ValueType::Bytes,
            Val::StringVal(_) => ValueType::String,
            Val::Int32Val(_) => ValueType::Int32,
            Val::Int64Val(_) => ValueType::Int64,
            Val::DoubleVal(_) => ValueType::Double,
            Val::FloatVal(_) => ValueType::Float,
            Val::BoolVal(_) => ValueType::Bool,
            Val::UnixTimestampVal(_) => ValueType::UnixTimestamp,
            Val::BytesListVal(_) => ValueType::BytesList,
            Val::StringListVal(_) => ValueType::StringList,
            Val::Int32ListVal(_) => ValueType::Int32List,
            Val::Int64ListVal(_) => ValueType::Int64List,
            Val::DoubleListVal(_) => ValueType::DoubleList,
            Val::FloatListVal(_) => ValueType::FloatList,
            Val::BoolListVal(_) => ValueType::BoolList,
            Val::UnixTimestampListVal(_) => ValueType::UnixTimestampList,
            Val::NullVal(_) => return None,
        };
        Some(value_type)
    }
}

impl EntityKey {
    pub fn new(join_keys: Vec<String>, entity_values: Vec<Value>) -> Self {
        Self {
            join_keys,
            entity_values,
        }
    }

    pub fn single(join_key: impl Into<String>, value: Value) -> Self {
        Self {
            join_keys: vec![join_key.into()],
            entity_values: vec![value],
        }
    }
}
