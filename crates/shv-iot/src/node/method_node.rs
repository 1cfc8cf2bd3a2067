//! Nodes backed by closures.

use super::{AccessLevel, CallContext, MetaMethod, ShvNode};
use crate::error::{Result, ShvError};
use shv_chainpack::rpc::method;
use shv_chainpack::RpcValue;
use std::sync::Arc;

/// Synchronous method implementation.
pub type MethodHandler =
    Arc<dyn Fn(Option<RpcValue>, &CallContext) -> Result<RpcValue> + Send + Sync>;

/// Leaf node whose methods are plain closures.
#[derive(Default, Clone)]
pub struct MethodNode {
    methods: Vec<(MetaMethod, MethodHandler)>,
}

impl MethodNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method<F>(mut self, meta: MetaMethod, handler: F) -> Self
    where
        F: Fn(Option<RpcValue>, &CallContext) -> Result<RpcValue> + Send + Sync + 'static,
    {
        self.methods.retain(|(m, _)| m.name != meta.name);
        self.methods.push((meta, Arc::new(handler)));
        self
    }
}

#[async_trait::async_trait]
impl ShvNode for MethodNode {
    async fn methods(&self, sub_path: &str) -> Result<Vec<MetaMethod>> {
        if !sub_path.is_empty() {
            return Err(ShvError::path_not_found(sub_path));
        }
        Ok(self.methods.iter().map(|(m, _)| m.clone()).collect())
    }

    async fn invoke(
        &self,
        sub_path: &str,
        method: &str,
        params: Option<RpcValue>,
        ctx: &CallContext,
    ) -> Result<RpcValue> {
        let (_, handler) = self
            .methods
            .iter()
            .find(|(m, _)| m.name == method)
            .ok_or_else(|| ShvError::method_not_found(sub_path, method))?;
        handler(params, ctx)
    }
}

/// Application node with `appName`, `deviceId`, `ping` and `echo`.
pub fn app_node(app_name: impl Into<String>, device_id: Option<String>) -> MethodNode {
    let app_name = app_name.into();
    MethodNode::new()
        .with_method(
            MetaMethod::getter(method::APP_NAME, AccessLevel::Browse),
            move |_, _| Ok(RpcValue::from(app_name.as_str())),
        )
        .with_method(
            MetaMethod::getter(method::DEVICE_ID, AccessLevel::Browse),
            move |_, _| Ok(RpcValue::from(device_id.clone())),
        )
        .with_method(
            MetaMethod::call(method::PING, AccessLevel::Browse),
            |_, _| Ok(RpcValue::null()),
        )
        .with_method(
            MetaMethod::call(method::ECHO, AccessLevel::Write),
            |params, _| Ok(params.unwrap_or_default()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_app_node_methods() {
        let node = app_node("demo-device", Some("dev-1".to_string()));
        let ctx = CallContext::local();
        assert_eq!(
            node.invoke("", "appName", None, &ctx).await.unwrap(),
            RpcValue::from("demo-device")
        );
        assert_eq!(
            node.invoke("", "deviceId", None, &ctx).await.unwrap(),
            RpcValue::from("dev-1")
        );
        assert!(node.invoke("", "ping", None, &ctx).await.unwrap().is_null());
        assert_eq!(
            node.invoke("", "echo", Some(RpcValue::from(7)), &ctx)
                .await
                .unwrap(),
            RpcValue::from(7)
        );
    }

    #[tokio::test]
    async fn test_missing_device_id_is_null() {
        let node = app_node("demo", None);
        let value = node
            .invoke("", "deviceId", None, &CallContext::local())
            .await
            .unwrap();
        assert!(value.is_null());
    }

    #[tokio::test]
    async fn test_leaf_has_no_sub_paths() {
        let node = MethodNode::new();
        assert!(matches!(
            node.methods("x").await,
            Err(ShvError::PathNotFound { .. })
        ));
    }
}
