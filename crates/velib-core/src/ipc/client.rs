//! TCP IPC client.
//!
//! A reader task owns the read half of the stream and forwards whole frames
//! over a channel, so dropping a pending call or `next_signal` never loses
//! part of a frame. Calls hold the inbox lock from request to response, so
//! calls from several tasks are serialized. Signal notifications that arrive
//! while a call waits are buffered and handed out by
//! [`IpcClient::next_signal`].

use super::dispatch::CallParams;
use super::protocol::{read_frame, write_frame, IpcMessage, IpcRequest, SIGNAL_NOTIFICATION};
use crate::bus::Signal;
use crate::config::IpcConfig;
use crate::value::Value;
use crate::{Result, VelibError};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Decoded frames buffered between the reader task and callers.
const INCOMING_QUEUE: usize = 256;

#[derive(Debug)]
struct Inbox {
    frames: mpsc::Receiver<IpcMessage>,
    signals: VecDeque<Signal>,
}

/// Client side of the IPC bridge.
#[derive(Debug)]
pub struct IpcClient {
    writer: Mutex<OwnedWriteHalf>,
    inbox: Mutex<Inbox>,
    reader: JoinHandle<()>,
    addr: SocketAddr,
    next_id: AtomicU64,
}

impl IpcClient {
    /// Connect to a server, giving up after `IpcConfig::CONNECT_TIMEOUT`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| VelibError::Io {
                message: format!("timed out connecting to {}", addr),
                source: None,
            })??;

        debug!("IPC client connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::channel(INCOMING_QUEUE);
        let reader = tokio::spawn(Self::read_loop(read_half, frames_tx));

        Ok(Self {
            writer: Mutex::new(write_half),
            inbox: Mutex::new(Inbox {
                frames: frames_rx,
                signals: VecDeque::new(),
            }),
            reader,
            addr,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Call `member` on `path` of `destination` through the server's bus.
    pub async fn call(
        &self,
        destination: &str,
        path: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let params = CallParams {
            destination: destination.to_string(),
            path: path.to_string(),
            member: member.to_string(),
            args,
        };
        self.request("Call", serde_json::to_value(params)?).await
    }

    /// Names currently on the server's bus.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let names = self.request("ListNames", Value::Null).await?;
        Ok(serde_json::from_value(names)?)
    }

    /// Start receiving signals on this connection.
    pub async fn subscribe(&self) -> Result<()> {
        self.request("Subscribe", Value::Null).await.map(|_| ())
    }

    /// The next buffered signal, or the next one to arrive.
    ///
    /// Cancel safe: dropping the future loses no signal.
    pub async fn next_signal(&self) -> Result<Signal> {
        let mut inbox = self.inbox.lock().await;
        loop {
            if let Some(signal) = inbox.signals.pop_front() {
                return Ok(signal);
            }
            match self.receive(&mut inbox).await? {
                IpcMessage::Notification(note) => Self::buffer(&mut inbox, note),
                IpcMessage::Response(resp) => {
                    warn!("Dropping unsolicited IPC response {:?}", resp.id);
                }
            }
        }
    }

    /// Send a raw JSON-RPC request and wait for its response.
    ///
    /// If the future is dropped after the request went out, the late
    /// response is discarded by whichever caller reads it next.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_bytes = serde_json::to_vec(&IpcRequest::new(method, params, id))?;

        let mut inbox = self.inbox.lock().await;
        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request_bytes)
                .await
                .map_err(|_| self.lost())?;
        }

        loop {
            match self.receive(&mut inbox).await? {
                IpcMessage::Notification(note) => Self::buffer(&mut inbox, note),
                IpcMessage::Response(resp) if resp.id == Some(Value::from(id)) => {
                    if let Some(err) = resp.error {
                        return Err(err.into_error());
                    }
                    return resp.result.ok_or_else(|| {
                        VelibError::Other("IPC response missing result".to_string())
                    });
                }
                IpcMessage::Response(resp) => {
                    warn!("Dropping IPC response {:?} while waiting for {}", resp.id, id);
                }
            }
        }
    }

    async fn read_loop(mut reader: OwnedReadHalf, frames: mpsc::Sender<IpcMessage>) {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    debug!("IPC read failed: {}", e);
                    return;
                }
            };

            match IpcMessage::parse(&frame) {
                Ok(message) => {
                    if frames.send(message).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Dropping malformed IPC frame: {}", e),
            }
        }
    }

    async fn receive(&self, inbox: &mut Inbox) -> Result<IpcMessage> {
        inbox.frames.recv().await.ok_or_else(|| self.lost())
    }

    fn buffer(inbox: &mut Inbox, note: IpcRequest) {
        if note.method != SIGNAL_NOTIFICATION {
            debug!("Ignoring IPC notification {}", note.method);
            return;
        }
        match note.params.map(serde_json::from_value::<Signal>) {
            Some(Ok(signal)) => inbox.signals.push_back(signal),
            Some(Err(e)) => warn!("Malformed signal notification: {}", e),
            None => warn!("Signal notification without params"),
        }
    }

    fn lost(&self) -> VelibError {
        VelibError::Disconnected {
            name: self.addr.to_string(),
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
