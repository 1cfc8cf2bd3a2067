//! Connection actor.
//!
//! A connection splits its stream and runs three tasks under one supervisor:
//!
//! ```text
//! socket ──▶ reader ──responses──▶ CallTable ──▶ waiting callers
//!              └─────requests, signals──▶ worker ──▶ RpcHandler
//! handles ──frames (bounded)──▶ writer ──▶ socket
//! ```
//!
//! Callers register in the [`CallTable`] before their request is queued and
//! enforce their own timeout, so neither a busy handler nor a peer that stops
//! reading keeps a call waiting past its deadline. The supervisor closes the
//! connection as soon as any task stops.

use super::frame::{read_frame, write_frame, Frame};
use crate::config::RpcConfig;
use crate::error::{Result, ShvError};
use shv_chainpack::meta::builtin::rpc_message;
use shv_chainpack::rpc::{decode_message, parse_message};
use shv_chainpack::{
    ChainPackError, ErrorCode, ProtocolType, RpcError, RpcMessage, RpcRequest, RpcResponse,
    RpcSignal, RpcValue,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Listening,
    Accepted,
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// Callbacks for traffic that is not a response to one of our own calls.
///
/// Callbacks run one at a time on the connection's worker task, in arrival
/// order. A handler may call through the connection it is serving; further
/// requests from that peer wait until it returns.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Answer a request. `None` means the response is sent later or by
    /// someone else.
    async fn handle_request(
        &self,
        conn: &ConnectionHandle,
        request: RpcRequest,
    ) -> Option<RpcResponse>;

    async fn handle_signal(&self, _conn: &ConnectionHandle, _signal: RpcSignal) {}

    /// A response still carrying caller ids belongs to a call relayed through
    /// this connection.
    async fn handle_foreign_response(&self, conn: &ConnectionHandle, response: RpcResponse) {
        warn!(
            "Dropping response {} for callers {:?} on connection {}",
            response.request_id,
            response.caller_ids,
            conn.id()
        );
    }

    async fn on_closed(&self, _conn: &ConnectionHandle) {}
}

type Reply = oneshot::Sender<Result<RpcResponse>>;

/// Outstanding calls keyed by request id.
#[derive(Default)]
struct CallTable {
    pending: HashMap<i64, Reply>,
    closed: bool,
}

impl CallTable {
    fn register(&mut self, request_id: i64) -> Result<oneshot::Receiver<Result<RpcResponse>>> {
        if self.closed {
            return Err(ShvError::ConnectionClosed);
        }
        if self.pending.contains_key(&request_id) {
            return Err(ShvError::internal(format!(
                "Request id {} is already pending",
                request_id
            )));
        }
        if self.len() >= RpcConfig::MAX_PENDING_CALLS {
            return Err(ShvError::internal(format!(
                "Too many pending calls ({})",
                self.len()
            )));
        }
        let (reply, rx) = oneshot::channel();
        self.pending.insert(request_id, reply);
        Ok(rx)
    }

    fn take(&mut self, request_id: i64) -> Option<Reply> {
        self.pending.remove(&request_id)
    }

    /// Stop accepting calls and hand back every waiter.
    fn close(&mut self) -> Vec<Reply> {
        self.closed = true;
        self.pending.drain().map(|(_, reply)| reply).collect()
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

struct Shared {
    id: i64,
    peer: Option<SocketAddr>,
    protocol: ProtocolType,
    state: watch::Sender<ConnectionState>,
    next_request_id: AtomicI64,
    calls: Mutex<CallTable>,
    close: Notify,
}

impl Shared {
    /// Lock the call table, recovering it from a poisoned lock.
    fn calls(&self) -> MutexGuard<'_, CallTable> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete a call. Hands the response back when no call matches.
    fn complete(&self, response: RpcResponse) -> Option<RpcResponse> {
        let reply = self.calls().take(response.request_id);
        match reply {
            Some(reply) => {
                let _ = reply.send(Ok(response));
                None
            }
            None => Some(response),
        }
    }

    fn fail(&self, request_id: i64, error: ShvError) -> bool {
        let reply = self.calls().take(request_id);
        match reply {
            Some(reply) => {
                let _ = reply.send(Err(error));
                true
            }
            None => false,
        }
    }
}

/// Cloneable handle to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> i64 {
        self.shared.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    pub fn protocol(&self) -> ProtocolType {
        self.shared.protocol
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    pub fn next_request_id(&self) -> i64 {
        self.shared.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and wait for its response, error responses included.
    ///
    /// A request id of zero or less is replaced by a fresh one. The timeout
    /// covers queueing, writing and waiting for the answer. A request id that
    /// is still pending is refused without sending anything.
    pub async fn request(&self, mut request: RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        if request.request_id <= 0 {
            request.request_id = self.next_request_id();
        }
        let request_id = request.request_id;
        let frame = self.encode(&request.into())?;
        let rx = self.shared.calls().register(request_id)?;
        if let Err(e) = self.enqueue(frame) {
            self.shared.calls().take(request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(reply) => reply.map_err(|_| ShvError::ConnectionClosed)?,
            Err(_) => {
                self.shared.calls().take(request_id);
                Err(ShvError::Timeout(timeout))
            }
        }
    }

    /// Call a method; an error response becomes [`ShvError::Remote`].
    pub async fn call(
        &self,
        shv_path: &str,
        method: &str,
        params: Option<RpcValue>,
        timeout: Duration,
    ) -> Result<RpcValue> {
        let request = RpcRequest::new(shv_path, method, params, self.next_request_id());
        self.request(request, timeout)
            .await?
            .result
            .map_err(ShvError::Remote)
    }

    /// Queue a message without waiting for an answer.
    ///
    /// Fails with [`ShvError::SendQueueFull`] instead of waiting when the
    /// peer does not keep up.
    pub fn send(&self, message: impl Into<RpcMessage>) -> Result<()> {
        let frame = self.encode(&message.into())?;
        self.enqueue(frame)
    }

    pub fn close(&self) {
        self.shared.close.notify_one();
    }

    /// Wait until the connection reached [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    fn encode(&self, message: &RpcMessage) -> Result<Frame> {
        let frame = Frame::from_message(message, self.protocol())?;
        let size = frame.payload.len() + 1;
        if size > RpcConfig::MAX_MESSAGE_SIZE {
            return Err(ShvError::MessageTooLarge {
                size,
                max: RpcConfig::MAX_MESSAGE_SIZE,
            });
        }
        Ok(frame)
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(ShvError::ConnectionClosed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ShvError::SendQueueFull {
                connection: self.id(),
            },
            TrySendError::Closed(_) => ShvError::ConnectionClosed,
        })
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!("Connection {} {:?} -> {:?}", self.id(), previous, state);
        }
    }
}

/// A connection that has not been started yet.
///
/// Creating the handle before the task runs lets the owner register it
/// before the first message is processed.
pub struct Connection<S> {
    handle: ConnectionHandle,
    stream: S,
    handler: Arc<dyn RpcHandler>,
    frames: mpsc::Receiver<Frame>,
    idle_timeout: Option<Duration>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        id: i64,
        peer: Option<SocketAddr>,
        protocol: ProtocolType,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Established);
        let (outbound, frames) = mpsc::channel(RpcConfig::OUTBOUND_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            id,
            peer,
            protocol,
            state,
            next_request_id: AtomicI64::new(1),
            calls: Mutex::new(CallTable::default()),
            close: Notify::new(),
        });
        Self {
            handle: ConnectionHandle { shared, outbound },
            stream,
            handler,
            frames,
            idle_timeout: None,
            shutdown: None,
        }
    }

    /// Close the connection after this long without inbound traffic.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Close the connection once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Start the connection tasks.
    pub fn spawn(self) -> ConnectionHandle {
        let handle = self.handle.clone();
        tokio::spawn(self.run());
        handle
    }

    async fn run(self) {
        let Connection {
            handle,
            stream,
            handler,
            frames,
            idle_timeout,
            mut shutdown,
        } = self;
        let id = handle.id();
        let (reader, writer) = tokio::io::split(stream);
        let (work_tx, work_rx) = mpsc::channel(RpcConfig::INBOUND_CHANNEL_CAPACITY);
        let mut reader_task = tokio::spawn(read_loop(reader, handle.clone(), work_tx, idle_timeout));
        let mut writer_task = tokio::spawn(write_loop(writer, frames));
        let worker_task = tokio::spawn(serve_loop(handle.clone(), handler.clone(), work_rx));

        tokio::select! {
            result = &mut reader_task => log_task_end(id, "Reader", result),
            result = &mut writer_task => log_task_end(id, "Writer", result),
            _ = handle.shared.close.notified() => {
                debug!("Connection {} closing on request", id);
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("Connection {} received shutdown signal", id);
            }
        }

        handle.set_state(ConnectionState::Closing);
        let waiters = handle.shared.calls().close();
        if !waiters.is_empty() {
            debug!("Connection {}: failing {} pending call(s)", id, waiters.len());
        }
        for reply in waiters {
            let _ = reply.send(Err(ShvError::ConnectionClosed));
        }
        reader_task.abort();
        writer_task.abort();
        worker_task.abort();
        handler.on_closed(&handle).await;
        handle.set_state(ConnectionState::Closed);
        info!("Connection {} closed", id);
    }
}

fn log_task_end(id: i64, task: &str, result: std::result::Result<Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => debug!("{} of connection {} stopped", task, id),
        Ok(Err(e)) => error!("Connection {} failed: {}", id, e),
        Err(e) => error!("{} of connection {} aborted: {}", task, id, e),
    }
}

/// Read frames until EOF, an undecodable frame or the idle timeout.
///
/// Responses to our own calls are completed here; everything else goes to
/// the worker.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    handle: ConnectionHandle,
    work: mpsc::Sender<RpcMessage>,
    idle_timeout: Option<Duration>,
) -> Result<()> {
    loop {
        let frame = match idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, read_frame(&mut reader)).await {
                Ok(frame) => frame?,
                Err(_) => {
                    warn!("Connection {} idle for {:?}, closing", handle.id(), idle);
                    return Ok(());
                }
            },
            None => read_frame(&mut reader).await?,
        };
        let Some(frame) = frame else {
            debug!("Connection {} closed by peer", handle.id());
            return Ok(());
        };

        let value = decode_message(&frame.payload, frame.protocol)?;
        let message = match parse_message(&value) {
            Ok(message) => message,
            Err(error) => {
                reject_malformed(&handle, &value, error);
                continue;
            }
        };

        match message {
            RpcMessage::Response(response) if response.caller_ids.is_empty() => {
                if let Some(response) = handle.shared.complete(response) {
                    warn!(
                        "Dropping response with unknown request id {} on connection {}",
                        response.request_id,
                        handle.id()
                    );
                }
            }
            other => {
                if work.send(other).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// A malformed request is answered with `InvalidRequest`. A malformed
/// response fails the local call it names instead.
fn reject_malformed(handle: &ConnectionHandle, value: &RpcValue, error: ChainPackError) {
    warn!("Malformed message on connection {}: {}", handle.id(), error);
    let Some(request_id) = value
        .get_i(rpc_message::REQUEST_ID)
        .and_then(RpcValue::as_int)
    else {
        return;
    };

    if value.get_i(rpc_message::METHOD).is_some() {
        let response = RpcResponse::new(
            request_id,
            Err(RpcError::new(ErrorCode::InvalidRequest, error.to_string())),
        );
        if let Err(e) = handle.send(response) {
            debug!("Rejection of request {} not sent: {}", request_id, e);
        }
    } else if value.get_i(rpc_message::CALLER_IDS).is_none()
        && !handle.shared.fail(request_id, error.into())
    {
        debug!(
            "Malformed response {} on connection {} matches no call",
            request_id,
            handle.id()
        );
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
) -> Result<()> {
    while let Some(frame) = frames.recv().await {
        tokio::time::timeout(RpcConfig::WRITE_TIMEOUT, write_frame(&mut writer, &frame))
            .await
            .map_err(|_| ShvError::Timeout(RpcConfig::WRITE_TIMEOUT))??;
    }
    Ok(())
}

async fn serve_loop(
    handle: ConnectionHandle,
    handler: Arc<dyn RpcHandler>,
    mut work: mpsc::Receiver<RpcMessage>,
) {
    while let Some(message) = work.recv().await {
        match message {
            RpcMessage::Request(request) => {
                if let Some(response) = handler.handle_request(&handle, request).await {
                    send_response(&handle, response);
                }
            }
            RpcMessage::Signal(signal) => handler.handle_signal(&handle, signal).await,
            RpcMessage::Response(response) => {
                handler.handle_foreign_response(&handle, response).await
            }
        }
    }
}

/// Send a handler's response. One too large for a frame is replaced by an
/// error response so the caller still gets an answer.
fn send_response(handle: &ConnectionHandle, response: RpcResponse) {
    let request_id = response.request_id;
    let caller_ids = response.caller_ids.clone();
    match handle.send(response) {
        Ok(()) => {}
        Err(e @ ShvError::MessageTooLarge { .. }) => {
            warn!(
                "Response {} on connection {} not sent: {}",
                request_id,
                handle.id(),
                e
            );
            let fallback =
                RpcResponse::new(request_id, Err(e.to_rpc_error())).with_caller_ids(caller_ids);
            if let Err(e) = handle.send(fallback) {
                debug!("Error response {} not sent: {}", request_id, e);
            }
        }
        Err(e) => debug!(
            "Response {} on connection {} not sent: {}",
            request_id,
            handle.id(),
            e
        ),
    }
}

async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
