//! Wire format of the IPC bridge.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests carry an `id` and get exactly one response. Notifications are
//! requests without an `id`; the server uses them to push bus signals.

use crate::config::IpcConfig;
use crate::value::Value;
use crate::{Result, VelibError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Method name of signal notifications.
pub const SIGNAL_NOTIFICATION: &str = "Signal";

/// JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl IpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(Value::Number(id.into())),
        }
    }

    /// A request that expects no response.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: None,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
    pub id: Option<Value>,
}

impl IpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(IpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Error response for a failed bus operation. The bus error name travels
    /// in `data.name` so the client can rebuild the error.
    pub fn from_error(id: Option<Value>, err: &VelibError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(IpcError {
                code: err.to_rpc_error_code(),
                message: err.to_string(),
                data: Some(serde_json::json!({ "name": err.bus_error_name() })),
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl IpcError {
    /// Turn the error back into a [`VelibError`].
    pub fn into_error(self) -> VelibError {
        match self.data.as_ref().and_then(|d| d.get("name")).and_then(Value::as_str) {
            Some(name) => VelibError::from_bus_error(name, &self.message),
            None => VelibError::Other(format!("IPC error {}: {}", self.code, self.message)),
        }
    }
}

/// Anything a server may send to a client.
#[derive(Debug, Clone)]
pub enum IpcMessage {
    Response(IpcResponse),
    Notification(IpcRequest),
}

impl IpcMessage {
    /// Decode a frame. Objects with a `method` are notifications.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(frame)?;
        if value.get("method").is_some() {
            Ok(IpcMessage::Notification(serde_json::from_value(value)?))
        } else {
            Ok(IpcMessage::Response(serde_json::from_value(value)?))
        }
    }
}

/// Read a length-prefixed frame.
///
/// Returns `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(VelibError::invalid_args(format!(
            "IPC message size {} exceeds maximum {}",
            len,
            IpcConfig::MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(VelibError::invalid_args(format!(
            "IPC message size {} exceeds maximum {}",
            payload.len(),
            IpcConfig::MAX_MESSAGE_SIZE
        )));
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
