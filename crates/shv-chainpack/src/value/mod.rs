//! Dynamic, self-describing value model.
//!
//! An [`RpcValue`] is a [`Value`] plus optional [`MetaData`]. Values nest
//! recursively through `List`, `Map` (string keys) and `IMap` (integer keys).

mod datetime;
mod decimal;
mod metadata;

pub use datetime::DateTime;
pub use decimal::Decimal;
pub use metadata::{tag, MetaData, MetaKey};

use std::collections::BTreeMap;
use std::fmt;

pub type List = Vec<RpcValue>;
pub type Map = BTreeMap<String, RpcValue>;
pub type IMap = BTreeMap<i64, RpcValue>;

/// Payload of an [`RpcValue`].
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Decimal(Decimal),
    DateTime(DateTime),
    String(String),
    Blob(Vec<u8>),
    List(List),
    Map(Map),
    IMap(IMap),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::UInt(_) => "UInt",
            Value::Double(_) => "Double",
            Value::Decimal(_) => "Decimal",
            Value::DateTime(_) => "DateTime",
            Value::String(_) => "String",
            Value::Blob(_) => "Blob",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::IMap(_) => "IMap",
        }
    }
}

// NaN compares equal to NaN so that decoded values can be compared with the
// originals.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::IMap(a), Value::IMap(b)) => a == b,
            _ => false,
        }
    }
}

/// A value with optional metadata.
#[derive(Debug, Clone, Default)]
pub struct RpcValue {
    meta: Option<Box<MetaData>>,
    value: Value,
}

impl PartialEq for RpcValue {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
            && match (self.meta(), other.meta()) {
                (Some(a), Some(b)) => a == b,
                (None, None) => true,
                _ => false,
            }
    }
}

impl RpcValue {
    pub fn new(value: Value) -> Self {
        Self { meta: None, value }
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Metadata, if present and non-empty.
    pub fn meta(&self) -> Option<&MetaData> {
        self.meta.as_deref().filter(|m| !m.is_empty())
    }

    /// Metadata for editing, created on demand.
    pub fn meta_mut(&mut self) -> &mut MetaData {
        self.meta.get_or_insert_with(Default::default)
    }

    pub fn set_meta(&mut self, meta: Option<MetaData>) {
        self.meta = meta.filter(|m| !m.is_empty()).map(Box::new);
    }

    pub fn take_meta(&mut self) -> Option<MetaData> {
        self.meta.take().map(|m| *m).filter(|m| !m.is_empty())
    }

    pub fn with_meta(mut self, meta: MetaData) -> Self {
        self.set_meta(Some(meta));
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.value.type_name()
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Int, or UInt that fits into `i64`.
    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            Value::Int(n) => Some(n),
            Value::UInt(n) => i64::try_from(n).ok(),
            _ => None,
        }
    }

    /// UInt, or non-negative Int.
    pub fn as_uint(&self) -> Option<u64> {
        match self.value {
            Value::UInt(n) => Some(n),
            Value::Int(n) => u64::try_from(n).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            Value::Double(d) => Some(*d),
            Value::Int(n) => Some(*n as f64),
            Value::UInt(n) => Some(*n as f64),
            Value::Decimal(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime> {
        match self.value {
            Value::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self.value {
            Value::Decimal(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match &self.value {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match &self.value {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_imap(&self) -> Option<&IMap> {
        match &self.value {
            Value::IMap(m) => Some(m),
            _ => None,
        }
    }

    /// Lookup in a Map value.
    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Lookup in an IMap value.
    pub fn get_i(&self, key: i64) -> Option<&RpcValue> {
        self.as_imap().and_then(|m| m.get(&key))
    }
}

impl From<Value> for RpcValue {
    fn from(value: Value) -> Self {
        RpcValue::new(value)
    }
}

impl From<()> for RpcValue {
    fn from(_: ()) -> Self {
        RpcValue::null()
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for RpcValue {
                fn from(value: $ty) -> Self {
                    RpcValue::new(Value::$variant(value $(as $cast)?))
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i32 => Int as i64,
    i64 => Int,
    u32 => UInt as u64,
    u64 => UInt,
    f64 => Double,
    Decimal => Decimal,
    DateTime => DateTime,
    String => String,
    Vec<u8> => Blob,
    List => List,
    Map => Map,
    IMap => IMap,
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::new(Value::String(value.to_string()))
    }
}

impl From<&[u8]> for RpcValue {
    fn from(value: &[u8]) -> Self {
        RpcValue::new(Value::Blob(value.to_vec()))
    }
}

impl<T: Into<RpcValue>> From<Option<T>> for RpcValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// Cpon text.
impl fmt::Display for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::codec::cpon::to_cpon(self))
    }
}
