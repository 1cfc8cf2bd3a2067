//! TCP broker.
//!
//! Accepts client and device sessions, logs them in against the configured
//! users and routes traffic between them: device mounts, tunnels and signal
//! subscriptions.
//!
//! # Thread Safety
//!
//! Each session runs its own connection actor. The tables in
//! [`BrokerState`] are shared via `Arc` and guarded by `RwLock`s that are
//! never held across an await.

mod app_node;
mod router;
mod state;
mod tunnel;

pub use app_node::BrokerAppNode;
pub use router::BrokerRouter;
pub use state::{normalize_mount_point, BrokerState, ClientEntry, MountMatch, Subscription};
pub use tunnel::{Tunnel, TunnelManager};

use crate::config::BrokerConfig;
use crate::error::{Result, ShvError};
use crate::rpc::login::{accept_login, finish_login};
use crate::rpc::{Connection, RpcStream};
use shv_chainpack::ProtocolType;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running broker. Dropping shuts down the broker.
pub struct BrokerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    state: Arc<BrokerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerHandle {
    /// Get the address the broker is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &Arc<BrokerState> {
        &self.state
    }

    /// Shut down the broker.
    ///
    /// Stops accepting new sessions and closes all active ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub struct Broker;

impl Broker {
    /// Bind `config.address()` and start accepting sessions.
    ///
    /// Port 0 picks a free port; the handle reports the bound one.
    pub async fn start(config: BrokerConfig) -> Result<BrokerHandle> {
        let listener = TcpListener::bind(config.address()).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("SHV broker listening on {}", addr);

        let state = Arc::new(BrokerState::new(config));
        let router = Arc::new(BrokerRouter::new(state.clone())?);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            state.clone(),
            router,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(BrokerHandle {
            addr,
            port,
            state,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        state: Arc<BrokerState>,
        router: Arc<BrokerRouter>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let max_connections = state.config().max_connections;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("SHV broker shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= max_connections {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let state = state.clone();
                            let router = router.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = Self::handle_session(stream, peer_addr, &state, router, conn_shutdown).await {
                                    debug!("Session from {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Log a session in, register it and serve it until it closes.
    async fn handle_session(
        stream: TcpStream,
        peer_addr: SocketAddr,
        state: &Arc<BrokerState>,
        router: Arc<BrokerRouter>,
        conn_shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let config = state.config();

        let mut rpc = RpcStream::new(stream, ProtocolType::ChainPack);
        let handshake_timeout = config.handshake_timeout();
        let pending = tokio::time::timeout(handshake_timeout, accept_login(&mut rpc))
            .await
            .map_err(|_| ShvError::Timeout(handshake_timeout))??;

        let client_id = state.next_id();
        let access = match state.authenticate(&pending) {
            Ok(access) => access,
            Err(e) => {
                warn!("Login of '{}' from {} rejected", pending.user(), peer_addr);
                finish_login(&mut rpc, &pending, Err(e.to_rpc_error())).await?;
                return Err(e);
            }
        };

        let device = pending.request.options.device.clone().unwrap_or_default();
        let mount_point = match device.mount_point.as_deref() {
            Some(mount) => {
                let claimed = normalize_mount_point(mount)
                    .and_then(|mount| state.reserve_mount(&mount, client_id).map(|_| mount));
                match claimed {
                    Ok(mount) => Some(mount),
                    Err(e) => {
                        warn!("Mount of '{}' from {} rejected: {}", mount, peer_addr, e);
                        finish_login(&mut rpc, &pending, Err(e.to_rpc_error())).await?;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let idle_secs = pending
            .request
            .options
            .idle_watchdog_secs
            .unwrap_or(config.idle_watchdog_secs);
        let idle_timeout = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));

        if let Err(e) = finish_login(&mut rpc, &pending, Ok(client_id)).await {
            state.remove_client(client_id)?;
            return Err(e);
        }

        let connection = Connection::new(
            rpc.into_inner(),
            client_id,
            Some(peer_addr),
            pending.protocol,
            router,
        )
        .with_idle_timeout(idle_timeout)
        .with_shutdown(conn_shutdown);

        let entry = ClientEntry {
            handle: connection.handle(),
            user: pending.user().to_string(),
            access,
            device_id: device.device_id,
            mount_point,
        };
        if let Err(e) = state.add_client(client_id, entry) {
            state.remove_client(client_id)?;
            return Err(e);
        }

        let handle = connection.spawn();
        handle.closed().await;
        debug!("Session {} from {} closed", client_id, peer_addr);
        Ok(())
    }
}
