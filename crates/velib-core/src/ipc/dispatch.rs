//! Bus-backed request handling for the IPC server.

use super::server::IpcDispatch;
use crate::bus::{MemoryBus, Signal};
use crate::value::Value;
use crate::{Result, VelibError};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Parameters of a `Call` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParams {
    pub destination: String,
    pub path: String,
    pub member: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Serves `Call` and `ListNames` from a [`MemoryBus`] and feeds its signals
/// to subscribers.
#[derive(Debug, Clone)]
pub struct BusDispatch {
    bus: MemoryBus,
}

impl BusDispatch {
    pub fn new(bus: MemoryBus) -> Self {
        Self { bus }
    }
}

#[async_trait::async_trait]
impl IpcDispatch for BusDispatch {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "Call" => {
                let call: CallParams = serde_json::from_value(params)
                    .map_err(|e| VelibError::invalid_args(format!("Call: {}", e)))?;
                let bus = self.bus.clone();

                // Holders may block; keep them off the async workers.
                tokio::task::spawn_blocking(move || {
                    bus.call(&call.destination, &call.path, &call.member, call.args)
                })
                .await
                .map_err(|e| VelibError::Other(format!("bus call panicked: {}", e)))?
            }
            "ListNames" => Ok(serde_json::to_value(self.bus.list_names()?)?),
            _ => Err(VelibError::UnknownMethod {
                path: "ipc".to_string(),
                member: method.to_string(),
            }),
        }
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Signal>> {
        Some(self.bus.subscribe())
    }
}
