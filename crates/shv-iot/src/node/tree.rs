//! Path resolution over mounted nodes.

use super::{builtin_methods, CallContext, MetaMethod, ShvNode};
use crate::error::{Result, ShvError};
use shv_chainpack::rpc::{method, split_shv_path};
use shv_chainpack::RpcValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct TreeNode {
    node: Option<Arc<dyn ShvNode>>,
    children: BTreeMap<String, TreeNode>,
}

/// Target of a resolved path.
struct Resolved<'a> {
    entry: &'a TreeNode,
    node: Option<&'a Arc<dyn ShvNode>>,
    /// Remainder handed to a node that owns its subtree.
    sub_path: String,
}

/// Tree of mounted [`ShvNode`]s.
///
/// Static segments always win over a subtree-owning ancestor, so a node
/// mounted at `fs/special` is reachable even when `fs` serves its own
/// subtree.
#[derive(Default)]
pub struct ShvTree {
    root: TreeNode,
}

impl ShvTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `node` at `path`. The empty path is the root.
    pub fn mount(&mut self, path: &str, node: Arc<dyn ShvNode>) -> Result<()> {
        let mut entry = &mut self.root;
        for segment in split_shv_path(path) {
            entry = entry.children.entry(segment.to_string()).or_default();
        }
        if entry.node.is_some() {
            return Err(ShvError::Config {
                message: format!("A node is already mounted at '{}'", path),
            });
        }
        entry.node = Some(node);
        debug!("Mounted node at '{}'", path);
        Ok(())
    }

    pub fn with_node(mut self, path: &str, node: impl ShvNode + 'static) -> Result<Self> {
        self.mount(path, Arc::new(node))?;
        Ok(self)
    }

    fn resolve(&self, path: &str) -> Result<Resolved<'_>> {
        let segments = split_shv_path(path);
        let mut entry = &self.root;
        for (i, segment) in segments.iter().enumerate() {
            match entry.children.get(*segment) {
                Some(child) => entry = child,
                None => {
                    return match &entry.node {
                        Some(node) if node.owns_subtree() => Ok(Resolved {
                            entry,
                            node: Some(node),
                            sub_path: segments[i..].join("/"),
                        }),
                        _ => Err(ShvError::path_not_found(path)),
                    };
                }
            }
        }
        Ok(Resolved {
            entry,
            node: entry.node.as_ref(),
            sub_path: String::new(),
        })
    }

    /// Whether `path` resolves to something.
    pub fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }

    /// Child names of `path`: static children first, then the ones the node
    /// reports itself.
    pub async fn ls(&self, path: &str) -> Result<Vec<String>> {
        let resolved = self.resolve(path)?;
        let mut names: Vec<String> = if resolved.sub_path.is_empty() {
            resolved.entry.children.keys().cloned().collect()
        } else {
            Vec::new()
        };
        if let Some(node) = resolved.node {
            for name in node.children(&resolved.sub_path).await? {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// Method descriptors of `path`, `dir` and `ls` first.
    pub async fn dir(&self, path: &str) -> Result<Vec<MetaMethod>> {
        let resolved = self.resolve(path)?;
        let mut methods = builtin_methods().to_vec();
        if let Some(node) = resolved.node {
            for m in node.methods(&resolved.sub_path).await? {
                if m.name != method::DIR && m.name != method::LS {
                    methods.push(m);
                }
            }
        }
        Ok(methods)
    }

    /// Invoke a method with in-process rights.
    pub async fn invoke(
        &self,
        path: &str,
        method: &str,
        params: Option<RpcValue>,
    ) -> Result<RpcValue> {
        self.invoke_with(path, method, params, &CallContext::local())
            .await
    }

    /// Invoke a method on behalf of `ctx`.
    ///
    /// `ls` and `dir` are answered by the tree. Other methods must be listed
    /// by the node's `methods` and the caller's access must reach the
    /// method's level.
    pub async fn invoke_with(
        &self,
        path: &str,
        method_name: &str,
        params: Option<RpcValue>,
        ctx: &CallContext,
    ) -> Result<RpcValue> {
        match method_name {
            method::LS => {
                let names = self.ls(path).await?;
                Ok(ls_result(names, params.as_ref()))
            }
            method::DIR => {
                let methods = self.dir(path).await?;
                Ok(dir_result(&methods, params.as_ref()))
            }
            _ => {
                let resolved = self.resolve(path)?;
                let node = resolved
                    .node
                    .ok_or_else(|| ShvError::method_not_found(path, method_name))?;
                let meta = node
                    .methods(&resolved.sub_path)
                    .await?
                    .into_iter()
                    .find(|m| m.name == method_name)
                    .ok_or_else(|| ShvError::method_not_found(path, method_name))?;
                if ctx.access < meta.access {
                    return Err(ShvError::permission_denied(format!(
                        "'{}:{}' requires '{}', caller has '{}'",
                        path, method_name, meta.access, ctx.access
                    )));
                }
                node.invoke(&resolved.sub_path, method_name, params, ctx)
                    .await
            }
        }
    }
}

/// `ls` answers a List of names, or with a String param whether that child
/// exists.
pub(crate) fn ls_result(names: Vec<String>, params: Option<&RpcValue>) -> RpcValue {
    match params.and_then(RpcValue::as_str) {
        Some(name) => RpcValue::from(names.iter().any(|n| n == name)),
        None => RpcValue::from(names.into_iter().map(RpcValue::from).collect::<Vec<_>>()),
    }
}

/// `dir` answers a List of descriptors, or with a String param the matching
/// descriptor (Null when absent).
pub(crate) fn dir_result(methods: &[MetaMethod], params: Option<&RpcValue>) -> RpcValue {
    match params.and_then(RpcValue::as_str) {
        Some(name) => methods
            .iter()
            .find(|m| m.name == name)
            .map(MetaMethod::to_rpc_value)
            .unwrap_or_default(),
        None => RpcValue::from(
            methods
                .iter()
                .map(MetaMethod::to_rpc_value)
                .collect::<Vec<_>>(),
        ),
    }
}
