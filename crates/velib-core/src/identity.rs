//! Device instance negotiation.
//!
//! The naming authority (`com.victronenergy.settings`) remembers one
//! `<class>:<instance>` record per device label under
//! `/Settings/Devices/<label>/ClassAndVrmInstance`. Resolution looks the record
//! up, asks the authority to create it if needed (an existing record always
//! wins over our proposal) and reads it back. The outcome is memoized: once
//! resolved or failed, no further round trips are made.

use crate::bus::BusConnection;
use crate::config::{BusConfig, SettingsConfig};
use crate::lock::lock;
use crate::name::ServiceName;
use crate::value::Value;
use crate::{Result, VelibError};
use serde_json::json;
use std::sync::Mutex;
use tracing::debug;

/// Instance proposed when the authority has no record yet.
const DEFAULT_INSTANCE: u32 = 1;

/// Resolution progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityState {
    Unresolved,
    Resolved(u32),
    Failed(String),
}

/// Resolves and caches the device instance for one service.
#[derive(Debug)]
pub struct DeviceInstanceResolver {
    device_class: String,
    device_label: String,
    state: Mutex<IdentityState>,
}

impl DeviceInstanceResolver {
    pub fn new(name: &ServiceName) -> Self {
        Self {
            device_class: name.device_class().to_string(),
            device_label: name.device_label().to_string(),
            state: Mutex::new(IdentityState::Unresolved),
        }
    }

    pub fn state(&self) -> Result<IdentityState> {
        Ok(lock(&self.state, "device instance")?.clone())
    }

    /// The resolved instance, if resolution already succeeded.
    pub fn cached(&self) -> Option<u32> {
        match self.state() {
            Ok(IdentityState::Resolved(instance)) => Some(instance),
            _ => None,
        }
    }

    /// Resolve the device instance, talking to the authority at most once.
    ///
    /// The state lock is held for the whole negotiation, so concurrent first
    /// calls wait for the first one instead of racing it.
    pub fn resolve(&self, conn: &dyn BusConnection) -> Result<u32> {
        let mut state = lock(&self.state, "device instance")?;

        match &*state {
            IdentityState::Resolved(instance) => return Ok(*instance),
            IdentityState::Failed(message) => {
                return Err(VelibError::IdentityAllocation {
                    message: message.clone(),
                })
            }
            IdentityState::Unresolved => {}
        }

        match self.negotiate(conn) {
            Ok(instance) => {
                debug!(
                    "Device {} resolved to {}:{}",
                    self.device_label, self.device_class, instance
                );
                *state = IdentityState::Resolved(instance);
                Ok(instance)
            }
            Err(message) => {
                *state = IdentityState::Failed(message.clone());
                Err(VelibError::IdentityAllocation { message })
            }
        }
    }

    fn negotiate(&self, conn: &dyn BusConnection) -> std::result::Result<u32, String> {
        let proposal = match self.lookup(conn) {
            Ok(instance) => instance,
            Err(e) => {
                debug!(
                    "No instance on record for {} ({}), proposing {}",
                    self.device_label, e, DEFAULT_INSTANCE
                );
                DEFAULT_INSTANCE
            }
        };

        let reply = conn
            .call(
                SettingsConfig::SERVICE_NAME,
                SettingsConfig::DEVICES_PATH,
                SettingsConfig::ADD_SETTING,
                vec![
                    json!(self.device_label),
                    json!(SettingsConfig::CLASS_AND_VRM_INSTANCE),
                    json!(format!("{}:{}", self.device_class, proposal)),
                    json!("s"),
                    json!(""),
                    json!(""),
                ],
            )
            .map_err(|e| format!("AddSetting failed: {}", e))?;

        match reply.as_i64() {
            Some(SettingsConfig::STATUS_OK) => {}
            _ => return Err(format!("AddSetting returned {}", reply)),
        }

        self.lookup(conn)
            .map_err(|e| format!("failed to read back device instance: {}", e))
    }

    fn lookup(&self, conn: &dyn BusConnection) -> std::result::Result<u32, String> {
        let value = conn
            .call(
                SettingsConfig::SERVICE_NAME,
                &self.record_path(),
                BusConfig::GET_VALUE,
                Vec::new(),
            )
            .map_err(|e| e.to_string())?;

        match value {
            Value::String(record) => parse_record(&record).map(|(_, instance)| instance),
            other => Err(format!("unexpected value {}", other)),
        }
    }

    fn record_path(&self) -> String {
        format!(
            "{}/{}/{}",
            SettingsConfig::DEVICES_PATH,
            self.device_label,
            SettingsConfig::CLASS_AND_VRM_INSTANCE
        )
    }
}

/// Split a `<class>:<instance>` record.
pub fn parse_record(record: &str) -> std::result::Result<(String, u32), String> {
    let parts: Vec<&str> = record.split(':').collect();
    match parts.as_slice() {
        [class, instance] => instance
            .parse::<u32>()
            .map(|instance| (class.to_string(), instance))
            .map_err(|e| format!("unexpected value {:?}: {}", record, e)),
        _ => Err(format!("unexpected value {:?}", record)),
    }
}
