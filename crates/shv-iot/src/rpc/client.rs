//! Client session to a broker.
//!
//! [`ClientConnection`] connects over TCP, logs in and then hands the stream
//! to a connection actor. Any number of tasks may call through one session
//! concurrently; responses are matched by request id.
//!
//! A device session additionally serves requests relayed by the broker from
//! its [`ShvTree`].

use super::connection::{Connection, ConnectionHandle, ConnectionState, RpcHandler};
use super::frame::RpcStream;
use super::login::client_login;
use crate::config::{ClientConfig, RpcConfig};
use crate::error::{Result, ShvError};
use crate::node::{AccessLevel, CallContext, ShvTree};
use shv_chainpack::rpc::method;
use shv_chainpack::{
    ErrorCode, Map, RpcError, RpcRequest, RpcResponse, RpcSignal, RpcValue, TunnelHandle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Serves relayed requests from an optional tree and fans out signals.
struct ClientHandler {
    tree: Option<Arc<ShvTree>>,
    signals: broadcast::Sender<RpcSignal>,
}

#[async_trait::async_trait]
impl RpcHandler for ClientHandler {
    async fn handle_request(
        &self,
        _conn: &ConnectionHandle,
        request: RpcRequest,
    ) -> Option<RpcResponse> {
        let Some(tree) = &self.tree else {
            let error = RpcError::new(
                ErrorCode::MethodNotFound,
                format!("No methods served on '{}'", request.shv_path),
            );
            return Some(RpcResponse::for_request(&request, Err(error)));
        };

        // Requests without a grant come from peers that do not assign one.
        let access = request
            .access_grant
            .as_deref()
            .and_then(|grant| grant.parse().ok())
            .unwrap_or(AccessLevel::Read);
        let ctx = CallContext {
            client_id: request.caller_ids.last().copied(),
            caller_ids: request.caller_ids.clone(),
            access,
        };
        let result = tree
            .invoke_with(
                &request.shv_path,
                &request.method,
                request.params.clone(),
                &ctx,
            )
            .await
            .map_err(|e| {
                debug!(
                    "Request {}:{} failed: {}",
                    request.shv_path, request.method, e
                );
                e.to_rpc_error()
            });
        Some(RpcResponse::for_request(&request, result))
    }

    async fn handle_signal(&self, _conn: &ConnectionHandle, signal: RpcSignal) {
        // No receivers is fine
        let _ = self.signals.send(signal);
    }

    async fn on_closed(&self, conn: &ConnectionHandle) {
        info!("Session {} to broker closed", conn.id());
    }
}

/// Logged-in session to a broker.
pub struct ClientConnection {
    handle: ConnectionHandle,
    client_id: i64,
    call_timeout: Duration,
    signals: broadcast::Sender<RpcSignal>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Connect and log in as a plain client.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::start(config, None).await
    }

    /// Connect and log in as a device serving `tree`.
    ///
    /// `config.device` must be set; its mount point decides where the broker
    /// exposes the tree.
    pub async fn connect_device(config: ClientConfig, tree: ShvTree) -> Result<Self> {
        if config.device.is_none() {
            return Err(ShvError::Config {
                message: "Device session needs device options".to_string(),
            });
        }
        Self::start(config, Some(Arc::new(tree))).await
    }

    async fn start(config: ClientConfig, tree: Option<Arc<ShvTree>>) -> Result<Self> {
        let address = config.address();
        let stream = tokio::time::timeout(RpcConfig::CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| ShvError::Timeout(RpcConfig::CONNECT_TIMEOUT))??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        debug!("Client connected to {}", address);

        let mut rpc = RpcStream::new(stream, config.protocol);
        let client_id = tokio::time::timeout(
            RpcConfig::HANDSHAKE_TIMEOUT,
            client_login(&mut rpc, &config),
        )
        .await
        .map_err(|_| ShvError::Timeout(RpcConfig::HANDSHAKE_TIMEOUT))??;

        let (signals, _) = broadcast::channel(RpcConfig::SIGNAL_CHANNEL_CAPACITY);
        let handler = Arc::new(ClientHandler {
            tree,
            signals: signals.clone(),
        });
        let handle =
            Connection::new(rpc.into_inner(), client_id, peer, config.protocol, handler).spawn();
        info!(
            "Logged in to {} as '{}' (client id {})",
            address, config.user, client_id
        );

        let call_timeout = config.call_timeout();
        let heartbeat = config
            .heartbeat_interval()
            .map(|period| tokio::spawn(heartbeat_loop(handle.clone(), period, call_timeout)));

        Ok(Self {
            handle,
            client_id,
            call_timeout,
            signals,
            heartbeat,
        })
    }

    /// Client id the broker assigned at login.
    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub async fn call(
        &self,
        shv_path: &str,
        method: &str,
        params: Option<RpcValue>,
    ) -> Result<RpcValue> {
        self.handle
            .call(shv_path, method, params, self.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        shv_path: &str,
        method: &str,
        params: Option<RpcValue>,
        timeout: Duration,
    ) -> Result<RpcValue> {
        self.handle.call(shv_path, method, params, timeout).await
    }

    /// Call through an open tunnel. `shv_path` is relative to the path the
    /// tunnel was opened on.
    pub async fn call_tunneled(
        &self,
        tunnel: &TunnelHandle,
        shv_path: &str,
        method: &str,
        params: Option<RpcValue>,
    ) -> Result<RpcValue> {
        let request = RpcRequest::new(shv_path, method, params, self.handle.next_request_id())
            .with_tunnel_handle(tunnel.clone());
        self.handle
            .request(request, self.call_timeout)
            .await?
            .result
            .map_err(ShvError::Remote)
    }

    /// Open a tunnel to the device serving `shv_path`.
    pub async fn open_tunnel(&self, shv_path: &str) -> Result<TunnelHandle> {
        let mut params = Map::new();
        params.insert("shvPath".to_string(), RpcValue::from(shv_path));
        let value = self
            .call(
                RpcConfig::BROKER_APP_PATH,
                method::OPEN_TUNNEL,
                Some(RpcValue::from(params)),
            )
            .await?;
        TunnelHandle::from_rpc_value(&value)
            .ok_or_else(|| ShvError::internal("openTunnel returned no tunnel handle"))
    }

    pub async fn close_tunnel(&self, tunnel: &TunnelHandle) -> Result<()> {
        self.call(
            RpcConfig::BROKER_APP_PATH,
            method::CLOSE_TUNNEL,
            Some(tunnel.to_rpc_value()),
        )
        .await?;
        Ok(())
    }

    /// Receive signals under `shv_path`, optionally only those named
    /// `signal`.
    pub async fn subscribe(&self, shv_path: &str, signal: Option<&str>) -> Result<()> {
        self.call(
            RpcConfig::BROKER_APP_PATH,
            method::SUBSCRIBE,
            Some(subscription_params(shv_path, signal)),
        )
        .await?;
        Ok(())
    }

    /// Returns whether a matching subscription existed.
    pub async fn unsubscribe(&self, shv_path: &str, signal: Option<&str>) -> Result<bool> {
        let value = self
            .call(
                RpcConfig::BROKER_APP_PATH,
                method::UNSUBSCRIBE,
                Some(subscription_params(shv_path, signal)),
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Emit a signal. Devices send paths relative to their own tree.
    pub fn send_signal(
        &self,
        shv_path: &str,
        method: &str,
        params: Option<RpcValue>,
    ) -> Result<()> {
        self.handle.send(RpcSignal::new(shv_path, method, params))
    }

    /// Stream of signals delivered to this session.
    pub fn signals(&self) -> broadcast::Receiver<RpcSignal> {
        self.signals.subscribe()
    }

    /// Close the session and wait until the connection is down.
    pub async fn close(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
        self.handle.close();
        self.handle.closed().await;
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.handle.close();
    }
}

fn subscription_params(shv_path: &str, signal: Option<&str>) -> RpcValue {
    let mut params = Map::new();
    params.insert("path".to_string(), RpcValue::from(shv_path));
    if let Some(signal) = signal {
        params.insert("method".to_string(), RpcValue::from(signal));
    }
    RpcValue::from(params)
}

/// Pings the broker so its idle watchdog keeps the session.
async fn heartbeat_loop(handle: ConnectionHandle, period: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match handle.call("", method::PING, None, timeout).await {
            Ok(_) => {}
            Err(ShvError::ConnectionClosed) => break,
            Err(e) => warn!("Heartbeat on session {} failed: {}", handle.id(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{app_node, MetaMethod, MethodNode};
    use shv_chainpack::ProtocolType;

    fn device_handler() -> ClientHandler {
        let tree = ShvTree::new()
            .with_node("", app_node("demo", None))
            .unwrap()
            .with_node(
                "motor",
                MethodNode::new().with_method(
                    MetaMethod::call("start", AccessLevel::Command),
                    |_, ctx| {
                        let ids: Vec<RpcValue> =
                            ctx.caller_ids.iter().copied().map(RpcValue::from).collect();
                        Ok(RpcValue::from(ids))
                    },
                ),
            )
            .unwrap();
        let (signals, _) = broadcast::channel(4);
        ClientHandler {
            tree: Some(Arc::new(tree)),
            signals,
        }
    }

    fn dummy_handle() -> ConnectionHandle {
        let (a, _b) = tokio::io::duplex(64);
        Connection::new(a, 1, None, ProtocolType::ChainPack, Arc::new(device_handler())).handle()
    }

    #[tokio::test]
    async fn test_device_answers_with_caller_ids() {
        let handler = device_handler();
        let request = RpcRequest::new("", "appName", None, 3).with_caller_ids(vec![12]);
        let response = handler
            .handle_request(&dummy_handle(), request)
            .await
            .unwrap();
        assert_eq!(response.request_id, 3);
        assert_eq!(response.caller_ids, vec![12]);
        assert_eq!(response.result.unwrap(), RpcValue::from("demo"));
    }

    #[tokio::test]
    async fn test_missing_grant_defaults_to_read() {
        let handler = device_handler();
        let request = RpcRequest::new("motor", "start", None, 4).with_caller_ids(vec![5]);
        let response = handler
            .handle_request(&dummy_handle(), request)
            .await
            .unwrap();
        assert_eq!(
            response.result.unwrap_err().code,
            ErrorCode::PermissionDenied
        );

        let request = RpcRequest::new("motor", "start", None, 5)
            .with_caller_ids(vec![5])
            .with_access_grant("cmd");
        let response = handler
            .handle_request(&dummy_handle(), request)
            .await
            .unwrap();
        assert_eq!(
            response.result.unwrap(),
            RpcValue::from(vec![RpcValue::from(5)])
        );
    }

    #[tokio::test]
    async fn test_plain_client_has_no_methods() {
        let (signals, _) = broadcast::channel(4);
        let handler = ClientHandler {
            tree: None,
            signals,
        };
        let response = handler
            .handle_request(&dummy_handle(), RpcRequest::new("x", "y", None, 1))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap_err().code, ErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig::new("127.0.0.1", port).with_user("admin", "admin!");
        assert!(ClientConnection::connect(config).await.is_err());
    }

    #[tokio::test]
    async fn test_device_session_needs_device_options() {
        let config = ClientConfig::new("127.0.0.1", 1);
        let err = ClientConnection::connect_device(config, ShvTree::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ShvError::Config { .. }));
    }
}
