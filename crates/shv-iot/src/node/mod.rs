//! Dispatch tree.
//!
//! A device or broker exposes its functionality as a tree of paths. Every
//! mounted [`ShvNode`] answers `ls`, `dir` and its own methods; the
//! [`ShvTree`] resolves a path to the node that serves it.

mod local_fs;
mod method_node;
mod tree;

pub use local_fs::LocalFsNode;
pub use method_node::{app_node, MethodHandler, MethodNode};
pub use tree::ShvTree;
pub(crate) use tree::{dir_result, ls_result};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use shv_chainpack::{Map, RpcValue};
use std::fmt;
use std::str::FromStr;

/// Access level of a caller or required by a method, ordered from least to
/// most privileged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum AccessLevel {
    #[serde(rename = "bws")]
    Browse,
    #[default]
    #[serde(rename = "rd")]
    Read,
    #[serde(rename = "wr")]
    Write,
    #[serde(rename = "cmd")]
    Command,
    #[serde(rename = "cfg")]
    Config,
    #[serde(rename = "srv")]
    Service,
    #[serde(rename = "su")]
    Admin,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Browse => "bws",
            AccessLevel::Read => "rd",
            AccessLevel::Write => "wr",
            AccessLevel::Command => "cmd",
            AccessLevel::Config => "cfg",
            AccessLevel::Service => "srv",
            AccessLevel::Admin => "su",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // A grant may list several roles; the first recognized one wins.
        s.split(',')
            .find_map(|part| match part.trim() {
                "bws" => Some(AccessLevel::Browse),
                "rd" => Some(AccessLevel::Read),
                "wr" => Some(AccessLevel::Write),
                "cmd" => Some(AccessLevel::Command),
                "cfg" => Some(AccessLevel::Config),
                "srv" => Some(AccessLevel::Service),
                "su" => Some(AccessLevel::Admin),
                _ => None,
            })
            .ok_or_else(|| format!("unknown access level '{}'", s))
    }
}

/// Parameter and result shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSignature {
    VoidVoid = 0,
    VoidParam = 1,
    RetVoid = 2,
    RetParam = 3,
}

/// Method flag bits reported by `dir`.
pub mod flags {
    pub const SIGNAL: u32 = 1;
    pub const GETTER: u32 = 2;
    pub const SETTER: u32 = 4;
    pub const LARGE_RESULT_HINT: u32 = 8;
}

/// Descriptor of one method as listed by `dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaMethod {
    pub name: String,
    pub signature: MethodSignature,
    pub flags: u32,
    pub access: AccessLevel,
}

impl MetaMethod {
    pub fn new(
        name: impl Into<String>,
        signature: MethodSignature,
        flags: u32,
        access: AccessLevel,
    ) -> Self {
        Self {
            name: name.into(),
            signature,
            flags,
            access,
        }
    }

    pub fn getter(name: impl Into<String>, access: AccessLevel) -> Self {
        Self::new(name, MethodSignature::RetVoid, flags::GETTER, access)
    }

    pub fn call(name: impl Into<String>, access: AccessLevel) -> Self {
        Self::new(name, MethodSignature::RetParam, 0, access)
    }

    pub fn signal(name: impl Into<String>) -> Self {
        Self::new(name, MethodSignature::VoidParam, flags::SIGNAL, AccessLevel::Read)
    }

    pub fn to_rpc_value(&self) -> RpcValue {
        let mut map = Map::new();
        map.insert("name".to_string(), RpcValue::from(self.name.as_str()));
        map.insert(
            "signature".to_string(),
            RpcValue::from(self.signature as i64),
        );
        map.insert("flags".to_string(), RpcValue::from(u64::from(self.flags)));
        map.insert(
            "accessGrant".to_string(),
            RpcValue::from(self.access.as_str()),
        );
        RpcValue::from(map)
    }
}

/// Methods every node answers.
pub(crate) fn builtin_methods() -> [MetaMethod; 2] {
    [
        MetaMethod::call(shv_chainpack::rpc::method::DIR, AccessLevel::Browse),
        MetaMethod::call(shv_chainpack::rpc::method::LS, AccessLevel::Browse),
    ]
}

/// Who is calling and with what rights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Connection the request arrived on, `None` for in-process calls.
    pub client_id: Option<i64>,
    pub caller_ids: Vec<i64>,
    pub access: AccessLevel,
}

impl CallContext {
    pub fn new(access: AccessLevel) -> Self {
        Self {
            client_id: None,
            caller_ids: Vec::new(),
            access,
        }
    }

    /// Context for calls made inside the process.
    pub fn local() -> Self {
        Self::new(AccessLevel::Admin)
    }
}

/// A node mounted in a [`ShvTree`].
///
/// `sub_path` is the part of the requested path below the mount point and is
/// empty for the node itself. Only nodes that return `true` from
/// [`ShvNode::owns_subtree`] ever see a non-empty `sub_path`.
#[async_trait::async_trait]
pub trait ShvNode: Send + Sync {
    fn owns_subtree(&self) -> bool {
        false
    }

    async fn children(&self, _sub_path: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn methods(&self, sub_path: &str) -> Result<Vec<MetaMethod>>;

    async fn invoke(
        &self,
        sub_path: &str,
        method: &str,
        params: Option<RpcValue>,
        ctx: &CallContext,
    ) -> Result<RpcValue>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_order() {
        assert!(AccessLevel::Browse < AccessLevel::Read);
        assert!(AccessLevel::Write < AccessLevel::Command);
        assert!(AccessLevel::Service < AccessLevel::Admin);
    }

    #[test]
    fn test_access_parse() {
        assert_eq!("wr".parse::<AccessLevel>(), Ok(AccessLevel::Write));
        assert_eq!("xyz, cfg".parse::<AccessLevel>(), Ok(AccessLevel::Config));
        assert!("nobody".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn test_meta_method_value() {
        let value = MetaMethod::getter("value", AccessLevel::Read).to_rpc_value();
        assert_eq!(value.get("name").and_then(RpcValue::as_str), Some("value"));
        assert_eq!(value.get("flags").and_then(RpcValue::as_uint), Some(2));
        assert_eq!(
            value.get("accessGrant").and_then(RpcValue::as_str),
            Some("rd")
        );
    }
}
