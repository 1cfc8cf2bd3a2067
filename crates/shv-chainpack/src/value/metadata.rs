//! Tag/value annotations attached to a value.

use super::RpcValue;
use std::collections::BTreeMap;

/// Well-known integer metadata tags.
pub mod tag {
    pub const META_TYPE_ID: i64 = 1;
    pub const META_TYPE_NAMESPACE_ID: i64 = 2;
}

/// Key of a metadata entry: integer tags and string keys live side by side.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaKey {
    Int(i64),
    Str(String),
}

impl From<i64> for MetaKey {
    fn from(value: i64) -> Self {
        MetaKey::Int(value)
    }
}

impl From<i32> for MetaKey {
    fn from(value: i32) -> Self {
        MetaKey::Int(i64::from(value))
    }
}

impl From<&str> for MetaKey {
    fn from(value: &str) -> Self {
        MetaKey::Str(value.to_string())
    }
}

impl From<String> for MetaKey {
    fn from(value: String) -> Self {
        MetaKey::Str(value)
    }
}

/// Metadata of a value. An empty `MetaData` is equivalent to none at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaData {
    entries: BTreeMap<MetaKey, RpcValue>,
}

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata naming a registered meta type.
    pub fn with_meta_type(namespace_id: i64, type_id: i64) -> Self {
        let mut meta = Self::new();
        meta.set_meta_type(namespace_id, type_id);
        meta
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, key: impl Into<MetaKey>, value: impl Into<RpcValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: impl Into<MetaKey>) -> Option<&RpcValue> {
        self.entries.get(&key.into())
    }

    pub fn remove(&mut self, key: impl Into<MetaKey>) -> Option<RpcValue> {
        self.entries.remove(&key.into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetaKey, &RpcValue)> {
        self.entries.iter()
    }

    pub fn meta_type_id(&self) -> Option<i64> {
        self.get(tag::META_TYPE_ID).and_then(RpcValue::as_int)
    }

    /// Namespace of the meta type; `0` when the tag is absent.
    pub fn meta_type_namespace_id(&self) -> i64 {
        self.get(tag::META_TYPE_NAMESPACE_ID)
            .and_then(RpcValue::as_int)
            .unwrap_or(0)
    }

    /// Namespace `0` is implied and therefore not stored.
    pub fn set_meta_type(&mut self, namespace_id: i64, type_id: i64) {
        self.insert(tag::META_TYPE_ID, type_id);
        if namespace_id == 0 {
            self.remove(tag::META_TYPE_NAMESPACE_ID);
        } else {
            self.insert(tag::META_TYPE_NAMESPACE_ID, namespace_id);
        }
    }
}

impl FromIterator<(MetaKey, RpcValue)> for MetaData {
    fn from_iter<T: IntoIterator<Item = (MetaKey, RpcValue)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
