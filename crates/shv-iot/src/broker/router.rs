//! Request routing inside the broker.
//!
//! A request is served by the first of:
//!
//! 1. the tunnel named by its tunnel handle
//! 2. the device mounted at the longest prefix of its path
//! 3. the broker's own tree (`.broker/app` and the root app node)
//!
//! Relayed requests get the sender appended to their caller ids, so the
//! response finds its way back by popping that id again.

use super::app_node::BrokerAppNode;
use super::state::{BrokerState, ClientEntry, MountMatch};
use crate::config::RpcConfig;
use crate::error::{Result, ShvError};
use crate::node::{app_node, builtin_methods, dir_result, ls_result, CallContext, ShvTree};
use crate::rpc::{ConnectionHandle, RpcHandler};
use shv_chainpack::rpc::{join_shv_path, method};
use shv_chainpack::{RpcRequest, RpcResponse, RpcSignal, RpcValue, TunnelHandle};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct BrokerRouter {
    state: Arc<BrokerState>,
    tree: ShvTree,
}

fn error_response(request: &RpcRequest, error: &ShvError) -> RpcResponse {
    RpcResponse::for_request(request, Err(error.to_rpc_error()))
}

impl BrokerRouter {
    pub fn new(state: Arc<BrokerState>) -> Result<Self> {
        let config = state.config();
        let tree = ShvTree::new()
            .with_node("", app_node(&config.app_name, config.device_id.clone()))?
            .with_node(RpcConfig::BROKER_APP_PATH, BrokerAppNode::new(state.clone()))?;
        Ok(Self { state, tree })
    }

    /// Queue `request` on `target` with the path rewritten and `caller_id`
    /// appended. Returns an error response when the target is gone.
    fn relay(
        &self,
        request: &RpcRequest,
        target: Option<ConnectionHandle>,
        shv_path: String,
        caller_id: i64,
        sender: &ClientEntry,
    ) -> Option<RpcResponse> {
        let Some(target) = target else {
            return Some(error_response(request, &ShvError::ConnectionClosed));
        };
        let mut caller_ids = request.caller_ids.clone();
        caller_ids.push(caller_id);
        debug!(
            "Relaying {}:{} to client {} as '{}'",
            request.shv_path,
            request.method,
            target.id(),
            shv_path
        );
        // The grant is what this broker gave the sender, not what it claims.
        let relayed = RpcRequest {
            shv_path,
            caller_ids,
            tunnel_handle: None,
            access_grant: Some(sender.access.as_str().to_string()),
            ..request.clone()
        };
        match target.send(relayed) {
            Ok(()) => None,
            Err(e) => Some(error_response(request, &e)),
        }
    }

    fn relay_tunneled(
        &self,
        conn: &ConnectionHandle,
        sender: &ClientEntry,
        request: &RpcRequest,
        tunnel: &TunnelHandle,
    ) -> Option<RpcResponse> {
        match self.state.route_tunnel(tunnel, conn.id()) {
            Ok((target, target_path)) => self.relay(
                request,
                Some(target),
                join_shv_path(&target_path, &request.shv_path),
                tunnel.tunnel_client_id,
                sender,
            ),
            Err(e) => {
                debug!(
                    "Tunnel {} refused for client {}: {}",
                    tunnel.tunnel_client_id,
                    conn.id(),
                    e
                );
                Some(error_response(request, &e))
            }
        }
    }

    fn relay_to_mount(
        &self,
        conn: &ConnectionHandle,
        sender: &ClientEntry,
        request: &RpcRequest,
        mount: MountMatch,
    ) -> Option<RpcResponse> {
        let target = match self.state.client(mount.client_id) {
            Ok(target) => target.map(|c| c.handle),
            Err(e) => return Some(error_response(request, &e)),
        };
        self.relay(request, target, mount.remainder, conn.id(), sender)
    }

    /// Requests for paths the broker itself serves. Mount points show up as
    /// virtual children that only answer `ls` and `dir`.
    async fn call_local(
        &self,
        conn: &ConnectionHandle,
        sender: &ClientEntry,
        request: &RpcRequest,
    ) -> Result<RpcValue> {
        let path = request.shv_path.as_str();
        let params = request.params.as_ref();
        match request.method.as_str() {
            method::LS => {
                let mounts = self.state.mount_children(path)?;
                let mut names = match self.tree.ls(path).await {
                    Ok(names) => names,
                    Err(ShvError::PathNotFound { .. }) if !mounts.is_empty() => Vec::new(),
                    Err(e) => return Err(e),
                };
                for name in mounts {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
                Ok(ls_result(names, params))
            }
            method::DIR if !self.tree.contains(path) => {
                if self.state.mount_children(path)?.is_empty() {
                    return Err(ShvError::path_not_found(path));
                }
                Ok(dir_result(&builtin_methods(), params))
            }
            _ => {
                let ctx = CallContext {
                    client_id: Some(conn.id()),
                    caller_ids: request.caller_ids.clone(),
                    access: sender.access,
                };
                self.tree
                    .invoke_with(path, &request.method, request.params.clone(), &ctx)
                    .await
            }
        }
    }

    /// Where a response carrying `caller_id` goes next.
    fn response_target(&self, caller_id: i64, from: i64) -> Result<Option<ConnectionHandle>> {
        if let Some(client) = self.state.client(caller_id)? {
            return Ok(Some(client.handle));
        }
        self.state.tunnel_anchor(caller_id, from)
    }
}

#[async_trait::async_trait]
impl RpcHandler for BrokerRouter {
    async fn handle_request(
        &self,
        conn: &ConnectionHandle,
        request: RpcRequest,
    ) -> Option<RpcResponse> {
        let sender = match self.state.client(conn.id()) {
            Ok(Some(sender)) => sender,
            Ok(None) => {
                let error = ShvError::permission_denied("Client is not logged in");
                return Some(error_response(&request, &error));
            }
            Err(e) => return Some(error_response(&request, &e)),
        };

        if let Some(tunnel) = &request.tunnel_handle {
            return self.relay_tunneled(conn, &sender, &request, tunnel);
        }

        match self.state.find_mount(&request.shv_path) {
            Ok(Some(mount)) => return self.relay_to_mount(conn, &sender, &request, mount),
            Ok(None) => {}
            Err(e) => return Some(error_response(&request, &e)),
        }

        let result = self
            .call_local(conn, &sender, &request)
            .await
            .map_err(|e| {
                debug!(
                    "Broker call {}:{} from client {} failed: {}",
                    request.shv_path,
                    request.method,
                    conn.id(),
                    e
                );
                e.to_rpc_error()
            });
        Some(RpcResponse::for_request(&request, result))
    }

    /// Signals from a device are re-rooted under its mount point before they
    /// reach subscribers.
    async fn handle_signal(&self, conn: &ConnectionHandle, signal: RpcSignal) {
        let mount_point = match self.state.client(conn.id()) {
            Ok(client) => client.and_then(|c| c.mount_point),
            Err(e) => {
                error!("Dropping signal from client {}: {}", conn.id(), e);
                return;
            }
        };
        let shv_path = match &mount_point {
            Some(mount) => join_shv_path(mount, &signal.shv_path),
            None => signal.shv_path.clone(),
        };
        let subscribers = match self.state.subscribers(&shv_path, &signal.method, conn.id()) {
            Ok(subscribers) => subscribers,
            Err(e) => {
                error!("Dropping signal {}:{}: {}", shv_path, signal.method, e);
                return;
            }
        };
        let relayed = RpcSignal::new(shv_path, signal.method, signal.params);
        for subscriber in subscribers {
            if let Err(e) = subscriber.send(relayed.clone()) {
                debug!(
                    "Signal {}:{} not delivered to client {}: {}",
                    relayed.shv_path,
                    relayed.method,
                    subscriber.id(),
                    e
                );
            }
        }
    }

    async fn handle_foreign_response(&self, conn: &ConnectionHandle, mut response: RpcResponse) {
        let Some(caller_id) = response.caller_ids.pop() else {
            return;
        };
        match self.response_target(caller_id, conn.id()) {
            Ok(Some(target)) => {
                if let Err(e) = target.send(response) {
                    debug!("Response for client {} not delivered: {}", target.id(), e);
                }
            }
            Ok(None) => warn!(
                "Dropping response {} from client {}: caller {} is gone",
                response.request_id,
                conn.id(),
                caller_id
            ),
            Err(e) => error!("Dropping response {}: {}", response.request_id, e),
        }
    }

    async fn on_closed(&self, conn: &ConnectionHandle) {
        if let Err(e) = self.state.remove_client(conn.id()) {
            error!("Failed to remove client {}: {}", conn.id(), e);
        }
    }
}
