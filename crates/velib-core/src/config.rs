//! Centralized configuration for velib.
//!
//! Well-known bus names, interface and member names, and limits for the IPC
//! bridge.

use std::time::Duration;

/// Names used on the bus by every published service.
pub struct BusConfig;

impl BusConfig {
    pub const BUSITEM_INTERFACE: &'static str = "com.victronenergy.BusItem";
    pub const INTROSPECTABLE_INTERFACE: &'static str = "org.freedesktop.DBus.Introspectable";
    pub const INTROSPECT: &'static str = "Introspect";
    pub const PROPERTIES_CHANGED: &'static str = "PropertiesChanged";
    pub const ITEMS_CHANGED: &'static str = "ItemsChanged";
    pub const GET_VALUE: &'static str = "GetValue";
    pub const GET_TEXT: &'static str = "GetText";
    pub const SET_VALUE: &'static str = "SetValue";
    pub const GET_ITEMS: &'static str = "GetItems";
    pub const ROOT_PATH: &'static str = "/";
    /// Signals buffered per subscriber before the slowest one starts lagging.
    pub const SIGNAL_CHANNEL_CAPACITY: usize = 1024;
}

/// The naming authority that persists device instances.
pub struct SettingsConfig;

impl SettingsConfig {
    pub const SERVICE_NAME: &'static str = "com.victronenergy.settings";
    pub const ROOT_PATH: &'static str = "/Settings";
    pub const DEVICES_PATH: &'static str = "/Settings/Devices";
    pub const CLASS_AND_VRM_INSTANCE: &'static str = "ClassAndVrmInstance";
    pub const ADD_SETTING: &'static str = "AddSetting";

    // AddSetting status codes
    pub const STATUS_OK: i64 = 0;
    pub const STATUS_INVALID_TYPE: i64 = -1;
    pub const STATUS_INVALID_DEFAULT: i64 = -2;
    pub const STATUS_INVALID_NAME: i64 = -3;
}

/// Limits for the TCP IPC bridge.
pub struct IpcConfig;

impl IpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024; // 4MB
    pub const MAX_CONNECTIONS: usize = 32;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
}
