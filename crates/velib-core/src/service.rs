//! The value registry.
//!
//! A [`Service`] is one device on the bus: a normalized well-known name, a
//! memoized device instance and a table of published [`BusItem`]s.
//!
//! # Locking
//!
//! The table lock is taken only to insert a path or to copy the table. It is
//! never held while a holder runs or while a path is exported, so neither a
//! slow item nor a slow transport can stall registration or listing. A
//! separate set of claimed paths keeps duplicates out while an export is in
//! flight.
//! Each item serializes its own calls. The identity lock is the only one held
//! across a round trip to another service.

use crate::bus::{
    expect_args, validate_object_path, Arg, BusConnection, BusObject, Interface, Method, Node,
    ReleaseNameReply, RequestNameReply, SignalSpec,
};
use crate::config::BusConfig;
use crate::identity::DeviceInstanceResolver;
use crate::item::{busitem_interface, BusItem};
use crate::lock::{lock, read, write};
use crate::name::ServiceName;
use crate::value::{PathValue, Value};
use crate::{Result, VelibError};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

/// Value and text of one path, as returned by `GetItems`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemState {
    pub value: Value,
    pub text: String,
}

pub(crate) struct ServiceCore {
    pub(crate) conn: Arc<dyn BusConnection>,
    name: ServiceName,
    identity: DeviceInstanceResolver,
    items: RwLock<HashMap<String, Arc<BusItem>>>,
    /// Every path claimed by `add_path`, published or still being exported.
    claimed: Mutex<HashSet<String>>,
    registered: AtomicBool,
}

/// A device published on the bus. Clones share the same registry.
#[derive(Clone)]
pub struct Service {
    core: Arc<ServiceCore>,
}

impl Service {
    /// Create a registry for the raw service name `name`.
    ///
    /// Nothing is exported or claimed yet.
    pub fn new(conn: Arc<dyn BusConnection>, name: &str) -> Result<Self> {
        let name = ServiceName::parse(name)?;
        debug!("Service {} on connection {}", name, conn.unique_name());

        Ok(Self {
            core: Arc::new(ServiceCore {
                identity: DeviceInstanceResolver::new(&name),
                conn,
                name,
                items: RwLock::new(HashMap::new()),
                claimed: Mutex::new(HashSet::new()),
                registered: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &ServiceName {
        &self.core.name
    }

    pub fn connection(&self) -> &Arc<dyn BusConnection> {
        &self.core.conn
    }

    pub fn identity(&self) -> &DeviceInstanceResolver {
        &self.core.identity
    }

    /// Resolve the device instance with the naming authority. Only the first
    /// call performs a round trip.
    pub fn device_instance(&self) -> Result<u32> {
        self.core.identity.resolve(self.core.conn.as_ref())
    }

    /// Whether the well-known name is currently claimed.
    pub fn is_registered(&self) -> bool {
        self.core.registered.load(Ordering::SeqCst)
    }

    /// Publish a new path.
    ///
    /// The item is exported, inserted into the table, then initialized by
    /// setting its own current value, which emits the first
    /// `PropertiesChanged`. Registering a path twice fails with
    /// `DuplicatePath`; a failed initialization undoes the registration.
    pub fn add_path(&self, path: &str, value: impl Into<PathValue>) -> Result<Arc<BusItem>> {
        validate_object_path(path)?;
        if path == BusConfig::ROOT_PATH {
            return Err(VelibError::invalid_args("the root path is reserved"));
        }

        let value = value.into();
        let kind = value.kind();
        let item = Arc::new(BusItem::new(
            path,
            Arc::downgrade(&self.core),
            value.into_holder(),
        ));

        self.reserve(path)?;

        let published = self.core.conn.export(path, item.clone()).and_then(|()| {
            self.core
                .conn
                .export_introspection(path, Node::for_interface(busitem_interface()))
                .inspect_err(|_| {
                    let _ = self.core.conn.unexport(path);
                })
        });
        if let Err(e) = published {
            self.release_reservation(path);
            return Err(e);
        }

        write(&self.core.items, "service items")?.insert(path.to_string(), item.clone());

        debug!("AddPath {} {} ({})", self.core.name, path, kind);

        if let Err(e) = item.initialize() {
            self.unpublish(path);
            return Err(VelibError::Initialization {
                path: path.to_string(),
                source: Box::new(e),
            });
        }

        if self.is_registered() {
            self.announce(&item);
        }

        Ok(item)
    }

    /// The item published at `path`.
    pub fn item(&self, path: &str) -> Result<Option<Arc<BusItem>>> {
        Ok(read(&self.core.items, "service items")?.get(path).cloned())
    }

    /// All published paths, sorted.
    pub fn paths(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = read(&self.core.items, "service items")?
            .keys()
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Value and text of every published path.
    ///
    /// The table is copied under its lock and the items are read afterwards,
    /// so paths added concurrently may or may not show up. The first item
    /// error aborts the enumeration.
    pub fn list_items(&self) -> Result<BTreeMap<String, ItemState>> {
        self.core.list_items()
    }

    /// Export the root object and claim the well-known name.
    pub fn register(&self) -> Result<()> {
        if self.is_registered() {
            return Ok(());
        }

        let conn = &self.core.conn;
        let name = self.core.name.as_str();

        let root = Arc::new(RootObject {
            service: Arc::downgrade(&self.core),
        });
        conn.export(BusConfig::ROOT_PATH, root)?;
        if let Err(e) =
            conn.export_introspection(BusConfig::ROOT_PATH, Node::for_interface(root_interface()))
        {
            let _ = conn.unexport(BusConfig::ROOT_PATH);
            return Err(e);
        }

        let reply = match conn.request_name(name) {
            Ok(reply) => reply,
            Err(e) => {
                let _ = conn.unexport(BusConfig::ROOT_PATH);
                return Err(e);
            }
        };

        if reply != RequestNameReply::PrimaryOwner {
            let _ = conn.unexport(BusConfig::ROOT_PATH);
            return Err(VelibError::NameTaken {
                name: name.to_string(),
            });
        }

        self.core.registered.store(true, Ordering::SeqCst);
        info!("Service {} registered", name);
        Ok(())
    }

    /// Release the well-known name. Meant to be called once, at teardown.
    pub fn close(&self) -> Result<()> {
        let name = self.core.name.as_str();
        let release_error = |reply: String| VelibError::NameRelease {
            name: name.to_string(),
            reply,
        };

        let reply = self
            .core
            .conn
            .release_name(name)
            .map_err(|e| release_error(e.to_string()))?;

        if reply != ReleaseNameReply::Released {
            return Err(release_error(reply.to_string()));
        }

        self.core.registered.store(false, Ordering::SeqCst);
        let _ = self.core.conn.unexport(BusConfig::ROOT_PATH);
        info!("Service {} released", name);
        Ok(())
    }

    /// Claim `path` without holding the table lock.
    fn reserve(&self, path: &str) -> Result<()> {
        if !lock(&self.core.claimed, "claimed paths")?.insert(path.to_string()) {
            return Err(VelibError::DuplicatePath {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    fn release_reservation(&self, path: &str) {
        if let Ok(mut claimed) = self.core.claimed.lock() {
            claimed.remove(path);
        }
    }

    fn unpublish(&self, path: &str) {
        if let Ok(mut items) = self.core.items.write() {
            items.remove(path);
        }
        let _ = self.core.conn.unexport(path);
        self.release_reservation(path);
    }

    /// Tell listeners about a path added after registration.
    fn announce(&self, item: &BusItem) {
        let result = item.snapshot().and_then(|(value, text)| {
            let mut payload = Map::new();
            payload.insert(
                item.path().to_string(),
                serde_json::to_value(ItemState { value, text })?,
            );
            self.core.conn.emit(
                BusConfig::ROOT_PATH,
                BusConfig::BUSITEM_INTERFACE,
                BusConfig::ITEMS_CHANGED,
                Value::Object(payload),
            )
        });

        if let Err(e) = result {
            warn!("Failed to announce {}: {}", item.path(), e);
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.core.name.as_str())
            .field("registered", &self.is_registered())
            .finish_non_exhaustive()
    }
}

impl ServiceCore {
    fn list_items(&self) -> Result<BTreeMap<String, ItemState>> {
        let items: Vec<Arc<BusItem>> = read(&self.items, "service items")?
            .values()
            .cloned()
            .collect();

        let mut out = BTreeMap::new();
        for item in items {
            let (value, text) = item.snapshot()?;
            out.insert(item.path().to_string(), ItemState { value, text });
        }
        Ok(out)
    }
}

/// The object at `/`: bulk access to every path of the service.
struct RootObject {
    service: Weak<ServiceCore>,
}

impl BusObject for RootObject {
    fn call(&self, path: &str, member: &str, args: Vec<Value>) -> Result<Value> {
        let core = self.service.upgrade().ok_or_else(|| VelibError::ServiceGone {
            path: path.to_string(),
        })?;

        match member {
            BusConfig::GET_ITEMS => {
                expect_args::<0>(member, args)?;
                Ok(serde_json::to_value(core.list_items()?)?)
            }
            BusConfig::GET_VALUE | BusConfig::GET_TEXT => {
                expect_args::<0>(member, args)?;
                let mut out = Map::new();
                for (item_path, state) in core.list_items()? {
                    let key = item_path.trim_start_matches('/').to_string();
                    let entry = if member == BusConfig::GET_VALUE {
                        state.value
                    } else {
                        Value::String(state.text)
                    };
                    out.insert(key, entry);
                }
                Ok(Value::Object(out))
            }
            BusConfig::ITEMS_CHANGED => Ok(Value::Null),
            _ => Err(VelibError::UnknownMethod {
                path: path.to_string(),
                member: member.to_string(),
            }),
        }
    }

    fn interface(&self) -> Interface {
        root_interface()
    }
}

fn root_interface() -> Interface {
    Interface {
        name: BusConfig::BUSITEM_INTERFACE.to_string(),
        methods: vec![
            Method::new(BusConfig::GET_ITEMS, vec![Arg::output("items", "a{sa{sv}}")]),
            Method::new(BusConfig::GET_VALUE, vec![Arg::output("values", "a{sv}")]),
            Method::new(BusConfig::GET_TEXT, vec![Arg::output("texts", "a{sv}")]),
            Method::new(BusConfig::ITEMS_CHANGED, Vec::new()),
        ],
        signals: vec![SignalSpec::new(
            BusConfig::ITEMS_CHANGED,
            vec![Arg::output("items", "a{sa{sv}}")],
        )],
    }
}
