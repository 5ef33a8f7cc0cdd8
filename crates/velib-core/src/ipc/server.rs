//! TCP IPC server.
//!
//! Accepts connections, answers JSON-RPC requests through an [`IpcDispatch`]
//! and, once a connection sends `Subscribe`, pushes every bus signal to it as
//! a `Signal` notification.
//!
//! # Connection tasks
//!
//! Each connection gets a reader loop and a writer task. Responses and
//! notifications share one outgoing queue, so frames never interleave.

use super::dispatch::BusDispatch;
use super::protocol::{
    read_frame, write_frame, IpcRequest, IpcResponse, SIGNAL_NOTIFICATION,
};
use crate::bus::{MemoryBus, Signal};
use crate::config::IpcConfig;
use crate::value::Value;
use crate::{Result, VelibError};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Frames queued per connection before the sender waits.
const OUTGOING_QUEUE: usize = 256;

/// Handle to a running IPC server. Dropping shuts down the server.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
}

impl IpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close the active ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Handles requests arriving over IPC.
#[async_trait::async_trait]
pub trait IpcDispatch: Send + Sync + 'static {
    /// Handle one JSON-RPC method call.
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value>;

    /// Source of signals for `Subscribe`. `None` disables subscriptions.
    fn subscribe(&self) -> Option<broadcast::Receiver<Signal>> {
        None
    }
}

/// IPC server that listens for client connections.
pub struct IpcServer;

impl IpcServer {
    /// Serve `bus` on a random local port.
    pub async fn start(bus: MemoryBus) -> Result<IpcServerHandle> {
        Self::bind(bus, SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await
    }

    /// Serve `bus` on `addr`.
    pub async fn bind(bus: MemoryBus, addr: SocketAddr) -> Result<IpcServerHandle> {
        Self::serve(addr, Arc::new(BusDispatch::new(bus))).await
    }

    /// Serve an arbitrary dispatcher on `addr`.
    pub async fn serve<D: IpcDispatch>(addr: SocketAddr, dispatch: Arc<D>) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("IPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: IpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    IpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("IPC connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, dispatch, &mut conn_shutdown).await {
                                    debug!("IPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: IpcDispatch>(
        stream: TcpStream,
        dispatch: Arc<D>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_QUEUE);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("IPC write failed: {}", e);
                    break;
                }
            }
        });

        let mut forwarder: Option<JoinHandle<()>> = None;
        let result = Self::read_loop(reader, &*dispatch, &out_tx, &mut forwarder, shutdown_rx).await;

        if let Some(task) = forwarder {
            task.abort();
        }
        drop(out_tx);
        let _ = writer_task.await;
        result
    }

    async fn read_loop<D: IpcDispatch>(
        mut reader: OwnedReadHalf,
        dispatch: &D,
        out_tx: &mpsc::Sender<Vec<u8>>,
        forwarder: &mut Option<JoinHandle<()>>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let response = match serde_json::from_slice::<IpcRequest>(&frame) {
                Ok(request) if request.method == "Subscribe" => {
                    Self::subscribe(request, dispatch, out_tx, forwarder)
                }
                Ok(request) => Self::process_request(request, dispatch).await,
                Err(e) => Some(IpcResponse::error(None, -32700, format!("Parse error: {}", e))),
            };

            if let Some(response) = response {
                let bytes = serde_json::to_vec(&response)?;
                out_tx.send(bytes).await.map_err(|_| VelibError::Disconnected {
                    name: "ipc writer".to_string(),
                })?;
            }
        }
    }

    fn subscribe<D: IpcDispatch>(
        request: IpcRequest,
        dispatch: &D,
        out_tx: &mpsc::Sender<Vec<u8>>,
        forwarder: &mut Option<JoinHandle<()>>,
    ) -> Option<IpcResponse> {
        let id = request.id;

        if forwarder.is_none() {
            let Some(signals) = dispatch.subscribe() else {
                return Some(IpcResponse::error(
                    id,
                    -32601,
                    "Subscriptions are not supported".to_string(),
                ));
            };
            *forwarder = Some(tokio::spawn(Self::forward_signals(signals, out_tx.clone())));
            debug!("IPC connection subscribed to signals");
        }

        id.map(|id| IpcResponse::success(Some(id), Value::Bool(true)))
    }

    async fn forward_signals(mut signals: broadcast::Receiver<Signal>, out_tx: mpsc::Sender<Vec<u8>>) {
        loop {
            let signal = match signals.recv().await {
                Ok(signal) => signal,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("IPC subscriber lagged, {} signals dropped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            let note = match serde_json::to_value(&signal) {
                Ok(params) => IpcRequest::notification(SIGNAL_NOTIFICATION, params),
                Err(e) => {
                    warn!("Failed to encode signal: {}", e);
                    continue;
                }
            };

            let bytes = match serde_json::to_vec(&note) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode signal: {}", e);
                    continue;
                }
            };

            if out_tx.send(bytes).await.is_err() {
                return;
            }
        }
    }

    /// Returns `None` for notifications.
    async fn process_request<D: IpcDispatch>(request: IpcRequest, dispatch: &D) -> Option<IpcResponse> {
        if request.jsonrpc != "2.0" {
            return Some(IpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            ));
        }

        let params = request.params.unwrap_or(Value::Object(Default::default()));
        let result = dispatch.dispatch(&request.method, params).await;

        let id = request.id?;
        Some(match result {
            Ok(result) => IpcResponse::success(Some(id), result),
            Err(e) => IpcResponse::from_error(Some(id), &e),
        })
    }
}
