//! The broker's own methods under `.broker/app`.

use super::state::BrokerState;
use crate::error::{Result, ShvError};
use crate::node::{AccessLevel, CallContext, MetaMethod, ShvNode};
use shv_chainpack::rpc::method;
use shv_chainpack::{Map, RpcValue, TunnelHandle};
use std::sync::Arc;

const CLIENT_IDS: &str = "clientIds";
const MOUNT_POINTS: &str = "mountPoints";
const TUNNELS: &str = "tunnels";

pub struct BrokerAppNode {
    state: Arc<BrokerState>,
}

impl BrokerAppNode {
    pub fn new(state: Arc<BrokerState>) -> Self {
        Self { state }
    }
}

fn caller(ctx: &CallContext) -> Result<i64> {
    ctx.client_id
        .ok_or_else(|| ShvError::invalid_params("Method needs a client connection"))
}

fn ids_value(ids: &[i64]) -> RpcValue {
    RpcValue::from(ids.iter().copied().map(RpcValue::from).collect::<Vec<_>>())
}

/// `{"path": ..., "method": ...}`, or a bare path String.
fn subscription_params(params: Option<&RpcValue>) -> Result<(String, Option<String>)> {
    let Some(params) = params else {
        return Ok((String::new(), None));
    };
    if let Some(path) = params.as_str() {
        return Ok((path.to_string(), None));
    }
    if params.as_map().is_none() {
        return Err(ShvError::invalid_params(
            "Expected {\"path\": String, \"method\": String}",
        ));
    }
    let path = params
        .get("path")
        .and_then(RpcValue::as_str)
        .unwrap_or_default()
        .to_string();
    let signal = params
        .get("method")
        .and_then(RpcValue::as_str)
        .map(str::to_string);
    Ok((path, signal))
}

#[async_trait::async_trait]
impl ShvNode for BrokerAppNode {
    async fn methods(&self, sub_path: &str) -> Result<Vec<MetaMethod>> {
        if !sub_path.is_empty() {
            return Err(ShvError::path_not_found(sub_path));
        }
        Ok(vec![
            MetaMethod::getter(CLIENT_IDS, AccessLevel::Service),
            MetaMethod::getter(MOUNT_POINTS, AccessLevel::Service),
            MetaMethod::getter(TUNNELS, AccessLevel::Service),
            MetaMethod::call(method::OPEN_TUNNEL, AccessLevel::Write),
            MetaMethod::call(method::CLOSE_TUNNEL, AccessLevel::Write),
            MetaMethod::call(method::SUBSCRIBE, AccessLevel::Read),
            MetaMethod::call(method::UNSUBSCRIBE, AccessLevel::Read),
        ])
    }

    async fn invoke(
        &self,
        sub_path: &str,
        method_name: &str,
        params: Option<RpcValue>,
        ctx: &CallContext,
    ) -> Result<RpcValue> {
        match method_name {
            CLIENT_IDS => Ok(ids_value(&self.state.client_ids()?)),
            MOUNT_POINTS => {
                let mounts: Map = self
                    .state
                    .mount_points()?
                    .into_iter()
                    .map(|(mount, id)| (mount, RpcValue::from(id)))
                    .collect();
                Ok(RpcValue::from(mounts))
            }
            TUNNELS => {
                let tunnels = self
                    .state
                    .tunnels()?
                    .into_iter()
                    .map(|t| {
                        let mut map = Map::new();
                        map.insert("tunnelId".to_string(), RpcValue::from(t.id));
                        map.insert("callerIds".to_string(), ids_value(&t.caller_client_ids));
                        map.insert("anchor".to_string(), RpcValue::from(t.anchor));
                        map.insert("target".to_string(), RpcValue::from(t.target));
                        map.insert("path".to_string(), RpcValue::from(t.target_path));
                        RpcValue::from(map)
                    })
                    .collect::<Vec<_>>();
                Ok(RpcValue::from(tunnels))
            }
            method::OPEN_TUNNEL => {
                let anchor = caller(ctx)?;
                let shv_path = params
                    .as_ref()
                    .and_then(|p| p.as_str().or_else(|| p.get("shvPath").and_then(RpcValue::as_str)))
                    .ok_or_else(|| ShvError::invalid_params("openTunnel needs shvPath"))?;
                let handle = self.state.open_tunnel(anchor, &ctx.caller_ids, shv_path)?;
                Ok(handle.to_rpc_value())
            }
            method::CLOSE_TUNNEL => {
                let requester = caller(ctx)?;
                let handle = params
                    .as_ref()
                    .and_then(TunnelHandle::from_rpc_value)
                    .ok_or_else(|| ShvError::invalid_params("closeTunnel needs a tunnel handle"))?;
                self.state
                    .close_tunnel(handle.tunnel_client_id, requester)?;
                Ok(RpcValue::from(true))
            }
            method::SUBSCRIBE => {
                let client_id = caller(ctx)?;
                let (path, signal) = subscription_params(params.as_ref())?;
                self.state.subscribe(client_id, &path, signal.as_deref())?;
                Ok(RpcValue::from(true))
            }
            method::UNSUBSCRIBE => {
                let client_id = caller(ctx)?;
                let (path, signal) = subscription_params(params.as_ref())?;
                let removed = self
                    .state
                    .unsubscribe(client_id, &path, signal.as_deref())?;
                Ok(RpcValue::from(removed))
            }
            _ => Err(ShvError::method_not_found(sub_path, method_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    fn ctx(client_id: i64) -> CallContext {
        CallContext {
            client_id: Some(client_id),
            caller_ids: Vec::new(),
            access: AccessLevel::Admin,
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let state = Arc::new(BrokerState::new(BrokerConfig::default()));
        let node = BrokerAppNode::new(state.clone());

        let mut params = Map::new();
        params.insert("path".to_string(), RpcValue::from("test"));
        params.insert("method".to_string(), RpcValue::from("chng"));
        let params = RpcValue::from(params);

        let ok = node
            .invoke("", "subscribe", Some(params.clone()), &ctx(3))
            .await
            .unwrap();
        assert_eq!(ok, RpcValue::from(true));

        let removed = node
            .invoke("", "unsubscribe", Some(params.clone()), &ctx(3))
            .await
            .unwrap();
        assert_eq!(removed, RpcValue::from(true));
        let removed = node
            .invoke("", "unsubscribe", Some(params), &ctx(3))
            .await
            .unwrap();
        assert_eq!(removed, RpcValue::from(false));
    }

    #[tokio::test]
    async fn test_open_tunnel_needs_mount() {
        let state = Arc::new(BrokerState::new(BrokerConfig::default()));
        let node = BrokerAppNode::new(state.clone());
        let err = node
            .invoke("", "openTunnel", Some(RpcValue::from("nowhere")), &ctx(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ShvError::PathNotFound { .. }));
    }

    #[tokio::test]
    async fn test_open_and_close_tunnel() {
        let state = Arc::new(BrokerState::new(BrokerConfig::default()));
        state.reserve_mount("test/dev", 50).unwrap();
        let node = BrokerAppNode::new(state.clone());

        let mut params = Map::new();
        params.insert("shvPath".to_string(), RpcValue::from("test/dev"));
        let handle = node
            .invoke("", "openTunnel", Some(RpcValue::from(params)), &ctx(7))
            .await
            .unwrap();
        let parsed = TunnelHandle::from_rpc_value(&handle).unwrap();
        assert_eq!(parsed.caller_client_ids, vec![7]);

        let err = node
            .invoke("", "closeTunnel", Some(handle.clone()), &ctx(8))
            .await
            .unwrap_err();
        assert!(matches!(err, ShvError::PermissionDenied { .. }));

        node.invoke("", "closeTunnel", Some(handle), &ctx(7))
            .await
            .unwrap();
        assert!(state.tunnels().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_call_without_client_is_rejected() {
        let state = Arc::new(BrokerState::new(BrokerConfig::default()));
        let node = BrokerAppNode::new(state);
        let err = node
            .invoke("", "subscribe", None, &CallContext::local())
            .await
            .unwrap_err();
        assert!(matches!(err, ShvError::InvalidParams { .. }));
    }
}
