//! Meta-type registry.
//!
//! A meta type names the fields of an IMap-encoded record so that a value
//! tagged with `MetaTypeId`/`MetaTypeNameSpaceId` metadata can be decoded
//! generically and printed with field names. Descriptors are immutable and
//! registered once per process; the registry is read-mostly.

use crate::error::{ChainPackError, Result};
use crate::value::{IMap, Map, RpcValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock, OnceLock, RwLock};
use tracing::debug;

/// Descriptor of a structured record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaType {
    name: String,
    namespace_id: i64,
    type_id: i64,
    keys: BTreeMap<i64, String>,
    tags: BTreeMap<i64, String>,
}

impl MetaType {
    pub fn new(name: impl Into<String>, namespace_id: i64, type_id: i64) -> Self {
        Self {
            name: name.into(),
            namespace_id,
            type_id,
            keys: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, key: i64, name: impl Into<String>) -> Self {
        self.keys.insert(key, name.into());
        self
    }

    pub fn with_tag(mut self, tag: i64, name: impl Into<String>) -> Self {
        self.tags.insert(tag, name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace_id(&self) -> i64 {
        self.namespace_id
    }

    pub fn type_id(&self) -> i64 {
        self.type_id
    }

    pub fn keys(&self) -> &BTreeMap<i64, String> {
        &self.keys
    }

    pub fn key_name(&self, key: i64) -> Option<&str> {
        self.keys.get(&key).map(String::as_str)
    }

    pub fn key_id(&self, name: &str) -> Option<i64> {
        self.keys
            .iter()
            .find_map(|(id, n)| (n == name).then_some(*id))
    }

    pub fn tag_name(&self, tag: i64) -> Option<&str> {
        self.tags.get(&tag).map(String::as_str)
    }

    /// Re-key an IMap record by field name. Unknown keys keep their number as
    /// the name.
    pub fn named_fields(&self, record: &IMap) -> Map {
        record
            .iter()
            .map(|(key, value)| {
                let name = self
                    .key_name(*key)
                    .map(str::to_string)
                    .unwrap_or_else(|| key.to_string());
                (name, value.clone())
            })
            .collect()
    }
}

/// Process-wide table of meta types keyed by `(namespace id, type id)`.
#[derive(Debug, Default)]
pub struct MetaTypeRegistry {
    types: RwLock<HashMap<(i64, i64), Arc<MetaType>>>,
}

impl MetaTypeRegistry {
    /// An empty registry; most code should use [`global`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for descriptor in [
            builtin::rpc_message_descriptor(),
            builtin::rpc_error_descriptor(),
            builtin::tunnel_handle_descriptor(),
        ] {
            // Fresh registry, ids are distinct.
            let _ = registry.register(descriptor);
        }
        registry
    }

    /// Register a descriptor. Registering an identical descriptor again is a
    /// no-op returning the stored one; a different descriptor under the same
    /// ids is a [`ChainPackError::TypeRegistrationConflict`].
    pub fn register(&self, descriptor: MetaType) -> Result<Arc<MetaType>> {
        let id = (descriptor.namespace_id, descriptor.type_id);
        let mut types = self.types.write().map_err(|_| {
            ChainPackError::Other("Failed to acquire write lock for meta types".to_string())
        })?;
        if let Some(existing) = types.get(&id) {
            if **existing == descriptor {
                return Ok(Arc::clone(existing));
            }
            return Err(ChainPackError::TypeRegistrationConflict {
                namespace_id: id.0,
                type_id: id.1,
                existing: existing.name.clone(),
                requested: descriptor.name,
            });
        }
        debug!(
            "Registering meta type {} ({}, {})",
            descriptor.name, id.0, id.1
        );
        let descriptor = Arc::new(descriptor);
        types.insert(id, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    pub fn lookup(&self, namespace_id: i64, type_id: i64) -> Option<Arc<MetaType>> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types.get(&(namespace_id, type_id)).cloned()
    }

    /// Resolve the meta type named by a value's metadata.
    pub fn lookup_value(&self, value: &RpcValue) -> Option<Arc<MetaType>> {
        let meta = value.meta()?;
        self.lookup(meta.meta_type_namespace_id(), meta.meta_type_id()?)
    }

    pub fn len(&self) -> usize {
        self.types.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static GLOBAL: LazyLock<MetaTypeRegistry> = LazyLock::new(MetaTypeRegistry::with_builtins);

/// The process-wide registry, populated with the built-in types on first use.
pub fn global() -> &'static MetaTypeRegistry {
    &GLOBAL
}

pub fn register(descriptor: MetaType) -> Result<Arc<MetaType>> {
    global().register(descriptor)
}

pub fn lookup(namespace_id: i64, type_id: i64) -> Option<Arc<MetaType>> {
    global().lookup(namespace_id, type_id)
}

/// Built-in meta types of namespace 0.
pub mod builtin {
    use super::*;

    pub const NAMESPACE_ID: i64 = 0;

    pub mod rpc_message {
        pub const TYPE_ID: i64 = 1;
        pub const METHOD: i64 = 1;
        pub const PARAMS: i64 = 2;
        pub const RESULT: i64 = 3;
        pub const ERROR: i64 = 4;
        pub const REQUEST_ID: i64 = 5;
        pub const SHV_PATH: i64 = 6;
        pub const CALLER_IDS: i64 = 7;
        pub const TUNNEL_HANDLE: i64 = 8;
        pub const ACCESS_GRANT: i64 = 9;
    }

    pub mod rpc_error {
        pub const TYPE_ID: i64 = 2;
        pub const CODE: i64 = 1;
        pub const MESSAGE: i64 = 2;
    }

    pub mod tunnel_handle {
        pub const TYPE_ID: i64 = 3;
        pub const CALLER_CLIENT_IDS: i64 = 1;
        pub const TUNNEL_CLIENT_ID: i64 = 2;
    }

    pub fn rpc_message_descriptor() -> MetaType {
        use rpc_message::*;
        MetaType::new("RpcMessage", NAMESPACE_ID, TYPE_ID)
            .with_key(METHOD, "method")
            .with_key(PARAMS, "params")
            .with_key(RESULT, "result")
            .with_key(ERROR, "error")
            .with_key(REQUEST_ID, "requestId")
            .with_key(SHV_PATH, "shvPath")
            .with_key(CALLER_IDS, "callerIds")
            .with_key(TUNNEL_HANDLE, "tunnelHandle")
            .with_key(ACCESS_GRANT, "accessGrant")
    }

    pub fn rpc_error_descriptor() -> MetaType {
        use rpc_error::*;
        MetaType::new("RpcError", NAMESPACE_ID, TYPE_ID)
            .with_key(CODE, "code")
            .with_key(MESSAGE, "message")
    }

    pub fn tunnel_handle_descriptor() -> MetaType {
        use tunnel_handle::*;
        MetaType::new("TunnelHandle", NAMESPACE_ID, TYPE_ID)
            .with_key(CALLER_CLIENT_IDS, "callerClientIds")
            .with_key(TUNNEL_CLIENT_ID, "tunnelClientId")
    }

    fn registered(cell: &'static OnceLock<Arc<MetaType>>, descriptor: fn() -> MetaType) -> Arc<MetaType> {
        Arc::clone(cell.get_or_init(|| {
            let descriptor = descriptor();
            global()
                .register(descriptor.clone())
                .unwrap_or_else(|_| Arc::new(descriptor))
        }))
    }

    /// `RpcMessage` descriptor, registered on first use.
    pub fn rpc_message() -> Arc<MetaType> {
        static CELL: OnceLock<Arc<MetaType>> = OnceLock::new();
        registered(&CELL, rpc_message_descriptor)
    }

    pub fn rpc_error() -> Arc<MetaType> {
        static CELL: OnceLock<Arc<MetaType>> = OnceLock::new();
        registered(&CELL, rpc_error_descriptor)
    }

    pub fn tunnel_handle() -> Arc<MetaType> {
        static CELL: OnceLock<Arc<MetaType>> = OnceLock::new();
        registered(&CELL, tunnel_handle_descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MetaData;

    #[test]
    fn test_register_is_idempotent() {
        let registry = MetaTypeRegistry::new();
        let first = registry
            .register(MetaType::new("Sensor", 7, 1).with_key(1, "temperature"))
            .unwrap();
        let again = registry
            .register(MetaType::new("Sensor", 7, 1).with_key(1, "temperature"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_registration_fails() {
        let registry = MetaTypeRegistry::new();
        registry
            .register(MetaType::new("Sensor", 7, 1).with_key(1, "temperature"))
            .unwrap();
        let err = registry
            .register(MetaType::new("Sensor", 7, 1).with_key(1, "humidity"))
            .unwrap_err();
        assert!(matches!(
            err,
            ChainPackError::TypeRegistrationConflict { namespace_id: 7, type_id: 1, .. }
        ));
        let stored = registry.lookup(7, 1).unwrap();
        assert_eq!(stored.key_name(1), Some("temperature"));
    }

    #[test]
    fn test_global_has_builtins() {
        let rpc = lookup(0, 1).unwrap();
        assert_eq!(rpc.name(), "RpcMessage");
        assert_eq!(rpc.key_name(1), Some("method"));
        assert_eq!(rpc.key_id("requestId"), Some(5));
        assert!(Arc::ptr_eq(&builtin::rpc_error(), &lookup(0, 2).unwrap()));
        assert_eq!(builtin::tunnel_handle().key_name(2), Some("tunnelClientId"));
    }

    #[test]
    fn test_lookup_value_defaults_namespace() {
        let value = RpcValue::from(IMap::new()).with_meta(MetaData::with_meta_type(0, 2));
        let mt = global().lookup_value(&value).unwrap();
        assert_eq!(mt.name(), "RpcError");
        assert!(global().lookup_value(&RpcValue::from(1)).is_none());
    }

    #[test]
    fn test_named_fields() {
        let record = IMap::from([(1, RpcValue::from("ls")), (42, RpcValue::from(1))]);
        let named = builtin::rpc_message_descriptor().named_fields(&record);
        assert!(named.contains_key("method"));
        assert!(named.contains_key("42"));
    }

    #[test]
    fn test_concurrent_lookups() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..1000).all(|_| lookup(0, 1).is_some())))
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
