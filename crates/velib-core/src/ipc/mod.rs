//! TCP bridge to a [`MemoryBus`](crate::bus::MemoryBus).
//!
//! Lets other processes reach services on an in-process bus. Messages are
//! JSON-RPC 2.0 objects framed with a 4-byte big-endian length prefix and
//! exchanged over `127.0.0.1` TCP connections.
//!
//! # Architecture
//!
//! - **Server**: owns a bus handle, accepts connections, forwards calls and
//!   pushes signals to subscribed connections
//! - **Client**: issues calls and collects signal notifications
//! - **Protocol**: framing and JSON-RPC types shared by both

pub mod client;
pub mod dispatch;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use dispatch::{BusDispatch, CallParams};
pub use protocol::{IpcError, IpcMessage, IpcRequest, IpcResponse};
pub use server::{IpcDispatch, IpcServer, IpcServerHandle};
