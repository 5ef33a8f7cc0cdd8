//! In-process naming authority.
//!
//! [`SettingsService`] answers the `com.victronenergy.settings` protocol that
//! [`DeviceInstanceResolver`](crate::identity::DeviceInstanceResolver) speaks:
//! `AddSetting` on any prefix below `/Settings` creates a setting once, and
//! every setting path supports `GetValue`, `GetText` and `SetValue`.
//!
//! `ClassAndVrmInstance` records stay unique per device class. A proposal
//! that collides with another device's record is bumped to the next free
//! instance; a record that already exists is never rewritten by
//! `AddSetting`.

use crate::bus::{
    expect_args, validate_object_path, Arg, BusConnection, BusObject, Interface, Method, Node,
    RequestNameReply, SignalSpec,
};
use crate::config::{BusConfig, SettingsConfig};
use crate::identity::parse_record;
use crate::lock::{read, write};
use crate::value::{default_text, Value};
use crate::{Result, VelibError};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, info};

const SETTINGS_INTERFACE: &str = "com.victronenergy.Settings";

/// Declared type of a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Text,
    Integer,
    Float,
}

impl SettingKind {
    /// Parse the one-letter type code used by `AddSetting`.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "s" => Some(SettingKind::Text),
            "i" => Some(SettingKind::Integer),
            "f" => Some(SettingKind::Float),
            _ => None,
        }
    }

    /// Coerce `value` into this kind. Numeric strings are accepted for the
    /// numeric kinds.
    fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (SettingKind::Text, Value::String(_)) => Some(value.clone()),
            (SettingKind::Integer, Value::Number(n)) => n.as_i64().map(Value::from),
            (SettingKind::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (SettingKind::Float, Value::Number(n)) => n.as_f64().map(Value::from),
            (SettingKind::Float, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
            _ => None,
        }
    }
}

/// Optional numeric bound; empty strings and nulls mean unbounded.
fn bound(value: &Value) -> std::result::Result<Option<f64>, ()> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s.trim().parse::<f64>().map(Some).map_err(|_| ()),
        Value::Number(n) => n.as_f64().map(Some).ok_or(()),
        _ => Err(()),
    }
}

#[derive(Debug, Clone)]
struct Setting {
    kind: SettingKind,
    value: Value,
    min: Option<f64>,
    max: Option<f64>,
}

impl Setting {
    fn in_range(&self, value: &Value) -> bool {
        let Some(f) = value.as_f64() else {
            return true;
        };
        self.min.map_or(true, |min| f >= min) && self.max.map_or(true, |max| f <= max)
    }
}

/// The object exported over the whole `/Settings` subtree.
struct SettingsStore {
    conn: Weak<dyn BusConnection>,
    settings: RwLock<BTreeMap<String, Setting>>,
}

impl SettingsStore {
    fn get(&self, path: &str) -> Result<Setting> {
        read(&self.settings, "settings")?
            .get(path)
            .cloned()
            .ok_or_else(|| VelibError::UnknownObject {
                path: path.to_string(),
            })
    }

    fn add_setting(&self, prefix: &str, args: Vec<Value>) -> Result<i64> {
        let [group, name, default, kind, min, max] =
            expect_args::<6>(SettingsConfig::ADD_SETTING, args)?;

        let (Some(group), Some(name)) = (group.as_str(), name.as_str()) else {
            return Ok(SettingsConfig::STATUS_INVALID_NAME);
        };
        let path = format!("{}/{}/{}", prefix, group, name);
        if group.is_empty() || name.is_empty() || validate_object_path(&path).is_err() {
            return Ok(SettingsConfig::STATUS_INVALID_NAME);
        }

        let Some(kind) = kind.as_str().and_then(SettingKind::from_code) else {
            return Ok(SettingsConfig::STATUS_INVALID_TYPE);
        };
        let (Ok(min), Ok(max)) = (bound(&min), bound(&max)) else {
            return Ok(SettingsConfig::STATUS_INVALID_DEFAULT);
        };
        let Some(value) = kind.coerce(&default) else {
            return Ok(SettingsConfig::STATUS_INVALID_DEFAULT);
        };

        let mut settings = write(&self.settings, "settings")?;
        if settings.contains_key(&path) {
            debug!("AddSetting {}: already present", path);
            return Ok(SettingsConfig::STATUS_OK);
        }

        let mut setting = Setting {
            kind,
            value,
            min,
            max,
        };
        if !setting.in_range(&setting.value) {
            return Ok(SettingsConfig::STATUS_INVALID_DEFAULT);
        }

        if name == SettingsConfig::CLASS_AND_VRM_INSTANCE {
            let Some(record) = setting.value.as_str() else {
                return Ok(SettingsConfig::STATUS_INVALID_DEFAULT);
            };
            let Ok((class, proposed)) = parse_record(record) else {
                return Ok(SettingsConfig::STATUS_INVALID_DEFAULT);
            };
            let instance = next_free_instance(&settings, &class, proposed);
            setting.value = json!(format!("{}:{}", class, instance));
        }

        info!("AddSetting {} = {}", path, setting.value);
        settings.insert(path, setting);
        Ok(SettingsConfig::STATUS_OK)
    }

    fn set_value(&self, path: &str, value: Value) -> Result<()> {
        let stored = {
            let mut settings = write(&self.settings, "settings")?;
            let setting = settings
                .get_mut(path)
                .ok_or_else(|| VelibError::UnknownObject {
                    path: path.to_string(),
                })?;

            let coerced = setting.kind.coerce(&value).ok_or_else(|| {
                VelibError::value(format!("{} does not accept {}", path, value))
            })?;
            if !setting.in_range(&coerced) {
                return Err(VelibError::value(format!("{} out of range", coerced)));
            }
            setting.value = coerced.clone();
            coerced
        };

        if let Some(conn) = self.conn.upgrade() {
            let text = default_text(&stored);
            conn.emit(
                path,
                BusConfig::BUSITEM_INTERFACE,
                BusConfig::PROPERTIES_CHANGED,
                json!({ "Value": stored, "Text": text }),
            )?;
        }
        Ok(())
    }
}

/// Smallest instance at or above `proposed` not held by another device of
/// `class`.
fn next_free_instance(settings: &BTreeMap<String, Setting>, class: &str, proposed: u32) -> u32 {
    let taken: BTreeSet<u32> = settings
        .iter()
        .filter(|(path, _)| {
            path.rsplit('/').next() == Some(SettingsConfig::CLASS_AND_VRM_INSTANCE)
        })
        .filter_map(|(_, setting)| setting.value.as_str().and_then(|r| parse_record(r).ok()))
        .filter(|(c, _)| c == class)
        .map(|(_, instance)| instance)
        .collect();

    (proposed..=u32::MAX)
        .find(|n| !taken.contains(n))
        .unwrap_or(proposed)
}

impl BusObject for SettingsStore {
    fn call(&self, path: &str, member: &str, args: Vec<Value>) -> Result<Value> {
        match member {
            SettingsConfig::ADD_SETTING => self.add_setting(path, args).map(Value::from),
            BusConfig::GET_VALUE => {
                expect_args::<0>(member, args)?;
                Ok(self.get(path)?.value)
            }
            BusConfig::GET_TEXT => {
                expect_args::<0>(member, args)?;
                Ok(Value::String(default_text(&self.get(path)?.value)))
            }
            BusConfig::SET_VALUE => {
                let [value] = expect_args::<1>(member, args)?;
                self.set_value(path, value)?;
                Ok(json!(0))
            }
            _ => Err(VelibError::UnknownMethod {
                path: path.to_string(),
                member: member.to_string(),
            }),
        }
    }

    fn interface(&self) -> Interface {
        settings_interface()
    }
}

fn settings_interface() -> Interface {
    Interface {
        name: SETTINGS_INTERFACE.to_string(),
        methods: vec![
            Method::new(
                SettingsConfig::ADD_SETTING,
                vec![
                    Arg::input("group", "s"),
                    Arg::input("name", "s"),
                    Arg::input("default", "v"),
                    Arg::input("type", "s"),
                    Arg::input("min", "v"),
                    Arg::input("max", "v"),
                    Arg::output("retval", "i"),
                ],
            ),
            Method::new(BusConfig::GET_VALUE, vec![Arg::output("value", "v")]),
            Method::new(BusConfig::GET_TEXT, vec![Arg::output("text", "s")]),
            Method::new(
                BusConfig::SET_VALUE,
                vec![Arg::input("value", "v"), Arg::output("retval", "i")],
            ),
        ],
        signals: vec![SignalSpec::new(
            BusConfig::PROPERTIES_CHANGED,
            vec![Arg::output("changes", "a{sv}")],
        )],
    }
}

/// A running naming authority.
pub struct SettingsService {
    conn: Arc<dyn BusConnection>,
    store: Arc<SettingsStore>,
}

impl SettingsService {
    /// Export the settings tree on `conn` and claim
    /// `com.victronenergy.settings`.
    pub fn start(conn: Arc<dyn BusConnection>) -> Result<Self> {
        let store = Arc::new(SettingsStore {
            conn: Arc::downgrade(&conn),
            settings: RwLock::new(BTreeMap::new()),
        });

        conn.export_subtree(SettingsConfig::ROOT_PATH, store.clone())?;
        conn.export_introspection(
            SettingsConfig::ROOT_PATH,
            Node::for_interface(settings_interface()),
        )?;

        match conn.request_name(SettingsConfig::SERVICE_NAME) {
            Ok(RequestNameReply::PrimaryOwner) => {}
            Ok(_) => {
                let _ = conn.unexport(SettingsConfig::ROOT_PATH);
                return Err(VelibError::NameTaken {
                    name: SettingsConfig::SERVICE_NAME.to_string(),
                });
            }
            Err(e) => {
                let _ = conn.unexport(SettingsConfig::ROOT_PATH);
                return Err(e);
            }
        }

        info!(
            "Settings service on {} claimed {}",
            conn.unique_name(),
            SettingsConfig::SERVICE_NAME
        );
        Ok(Self { conn, store })
    }

    /// Current value of the setting at `path`.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.store.get(path).ok().map(|setting| setting.value)
    }

    /// Every setting path, sorted.
    pub fn paths(&self) -> Result<Vec<String>> {
        Ok(read(&self.store.settings, "settings")?.keys().cloned().collect())
    }

    /// Give up the name and the exported tree.
    pub fn close(&self) -> Result<()> {
        self.conn.release_name(SettingsConfig::SERVICE_NAME)?;
        self.conn.unexport(SettingsConfig::ROOT_PATH)
    }
}

impl fmt::Debug for SettingsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsService")
            .field("connection", &self.conn.unique_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    const DEVICES: &str = SettingsConfig::DEVICES_PATH;

    fn add(bus: &MemoryBus, group: &str, name: &str, default: Value, kind: &str) -> Value {
        bus.call(
            SettingsConfig::SERVICE_NAME,
            DEVICES,
            "AddSetting",
            vec![json!(group), json!(name), default, json!(kind), json!(""), json!("")],
        )
        .unwrap()
    }

    fn start(bus: &MemoryBus) -> SettingsService {
        SettingsService::start(bus.connect().unwrap()).unwrap()
    }

    #[test]
    fn test_add_then_get() {
        let bus = MemoryBus::new();
        let settings = start(&bus);

        assert_eq!(add(&bus, "pump", "Speed", json!("12"), "i"), json!(0));
        assert_eq!(settings.get("/Settings/Devices/pump/Speed"), Some(json!(12)));
        assert_eq!(
            bus.call(
                SettingsConfig::SERVICE_NAME,
                "/Settings/Devices/pump/Speed",
                "GetText",
                vec![]
            )
            .unwrap(),
            json!("12")
        );
    }

    #[test]
    fn test_invalid_type_and_default() {
        let bus = MemoryBus::new();
        let settings = start(&bus);

        assert_eq!(add(&bus, "pump", "Speed", json!(1), "x"), json!(-1));
        assert_eq!(add(&bus, "pump", "Speed", json!("fast"), "i"), json!(-2));
        assert_eq!(add(&bus, "pump", "Speed", json!(1), "s"), json!(-2));
        assert!(settings.paths().unwrap().is_empty());
    }

    #[test]
    fn test_range_checked() {
        let bus = MemoryBus::new();
        let _settings = start(&bus);

        let status = bus
            .call(
                SettingsConfig::SERVICE_NAME,
                DEVICES,
                "AddSetting",
                vec![json!("pump"), json!("Speed"), json!(50), json!("i"), json!(0), json!(10)],
            )
            .unwrap();
        assert_eq!(status, json!(-2));
    }

    #[test]
    fn test_existing_record_is_kept() {
        let bus = MemoryBus::new();
        let settings = start(&bus);

        add(&bus, "dev_a", "ClassAndVrmInstance", json!("battery:4"), "s");
        assert_eq!(
            add(&bus, "dev_a", "ClassAndVrmInstance", json!("battery:1"), "s"),
            json!(0)
        );
        assert_eq!(
            settings.get("/Settings/Devices/dev_a/ClassAndVrmInstance"),
            Some(json!("battery:4"))
        );
    }

    #[test]
    fn test_instances_unique_per_class() {
        let bus = MemoryBus::new();
        let settings = start(&bus);

        add(&bus, "dev_a", "ClassAndVrmInstance", json!("battery:1"), "s");
        add(&bus, "dev_b", "ClassAndVrmInstance", json!("battery:1"), "s");
        add(&bus, "dev_c", "ClassAndVrmInstance", json!("solarcharger:1"), "s");

        assert_eq!(
            settings.get("/Settings/Devices/dev_b/ClassAndVrmInstance"),
            Some(json!("battery:2"))
        );
        assert_eq!(
            settings.get("/Settings/Devices/dev_c/ClassAndVrmInstance"),
            Some(json!("solarcharger:1"))
        );
    }

    #[test]
    fn test_set_value_and_unknown_paths() {
        let bus = MemoryBus::new();
        let settings = start(&bus);
        add(&bus, "pump", "Gain", json!(0.5), "f");

        let mut rx = bus.subscribe();
        let path = "/Settings/Devices/pump/Gain";
        bus.call(SettingsConfig::SERVICE_NAME, path, "SetValue", vec![json!("0.75")])
            .unwrap();
        assert_eq!(settings.get(path), Some(json!(0.75)));
        assert_eq!(rx.try_recv().unwrap().payload["Value"], json!(0.75));

        assert!(matches!(
            bus.call(SettingsConfig::SERVICE_NAME, path, "SetValue", vec![json!("loud")]),
            Err(VelibError::Value { .. })
        ));
        assert!(matches!(
            bus.call(SettingsConfig::SERVICE_NAME, "/Settings/Nope", "GetValue", vec![]),
            Err(VelibError::UnknownObject { .. })
        ));
    }

    #[test]
    fn test_second_authority_rejected() {
        let bus = MemoryBus::new();
        let _settings = start(&bus);

        let err = SettingsService::start(bus.connect().unwrap()).unwrap_err();
        assert!(matches!(err, VelibError::NameTaken { .. }));
    }

    #[test]
    fn test_close_releases_name() {
        let bus = MemoryBus::new();
        let settings = start(&bus);
        settings.close().unwrap();

        assert_eq!(bus.name_owner(SettingsConfig::SERVICE_NAME).unwrap(), None);
        let _again = start(&bus);
    }
}
