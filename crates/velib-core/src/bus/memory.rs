//! In-process bus.
//!
//! [`MemoryBus`] plays the role of the bus daemon: it hands out connections,
//! tracks well-known name ownership, routes method calls between connections
//! and broadcasts signals. No lock is held while an exported object runs, so
//! an object may call back into the bus.

use super::{
    validate_object_path, BusConnection, BusObject, Node, ReleaseNameReply, RequestNameReply,
    Signal,
};
use crate::config::BusConfig;
use crate::lock::{lock, read, write};
use crate::value::Value;
use crate::{Result, VelibError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::debug;

/// Handle to an in-process bus. Clones share the same bus.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<BusState>,
}

struct BusState {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
    signals: broadcast::Sender<Signal>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Weak<MemoryConnection>>,
    /// Well-known name to unique name of its owner.
    names: BTreeMap<String, String>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(BusConfig::SIGNAL_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(BusState {
                next_id: AtomicU64::new(1),
                registry: Mutex::new(Registry::default()),
                signals,
            }),
        }
    }

    /// Open a new connection with a fresh unique name.
    pub fn connect(&self) -> Result<Arc<MemoryConnection>> {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(MemoryConnection {
            unique_name: format!(":1.{}", id),
            bus: self.state.clone(),
            objects: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        });

        lock(&self.state.registry, "bus registry")?
            .connections
            .insert(connection.unique_name.clone(), Arc::downgrade(&connection));

        debug!("Bus connection {} opened", connection.unique_name);
        Ok(connection)
    }

    /// Receive every signal emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.state.signals.subscribe()
    }

    /// All well-known names followed by all unique names.
    pub fn list_names(&self) -> Result<Vec<String>> {
        let registry = lock(&self.state.registry, "bus registry")?;
        let mut unique: Vec<String> = registry.connections.keys().cloned().collect();
        unique.sort();

        Ok(registry.names.keys().cloned().chain(unique).collect())
    }

    /// Unique name of the owner of `name`, if any.
    pub fn name_owner(&self, name: &str) -> Result<Option<String>> {
        Ok(lock(&self.state.registry, "bus registry")?
            .names
            .get(name)
            .cloned())
    }

    /// Call a method without a connection of one's own.
    pub fn call(
        &self,
        destination: &str,
        path: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.state.route(destination, path, member, args)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBus").finish_non_exhaustive()
    }
}

impl BusState {
    fn route(&self, destination: &str, path: &str, member: &str, args: Vec<Value>) -> Result<Value> {
        let unknown = || VelibError::UnknownService {
            name: destination.to_string(),
        };

        let target = {
            let registry = lock(&self.registry, "bus registry")?;
            let unique = if destination.starts_with(':') {
                destination.to_string()
            } else {
                registry.names.get(destination).cloned().ok_or_else(unknown)?
            };
            registry
                .connections
                .get(&unique)
                .and_then(Weak::upgrade)
                .ok_or_else(unknown)?
        };

        target.dispatch(path, member, args)
    }
}

#[derive(Default)]
struct Export {
    object: Option<Arc<dyn BusObject>>,
    subtree: bool,
    node: Option<Node>,
}

/// One connection to a [`MemoryBus`].
///
/// Dropping or closing the connection releases every name it owns.
pub struct MemoryConnection {
    unique_name: String,
    bus: Arc<BusState>,
    objects: RwLock<BTreeMap<String, Export>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    /// Close the connection. Later operations fail with `Disconnected`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut registry) = self.bus.registry.lock() {
            registry.connections.remove(&self.unique_name);
            registry.names.retain(|_, owner| owner != &self.unique_name);
        }
        if let Ok(mut objects) = self.objects.write() {
            objects.clear();
        }

        debug!("Bus connection {} closed", self.unique_name);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(VelibError::Disconnected {
                name: self.unique_name.clone(),
            });
        }
        Ok(())
    }

    fn insert_object(&self, path: &str, object: Arc<dyn BusObject>, subtree: bool) -> Result<()> {
        self.ensure_open()?;
        validate_object_path(path)?;

        let mut objects = write(&self.objects, "connection objects")?;
        let export = objects.entry(path.to_string()).or_default();
        if export.object.is_some() {
            return Err(VelibError::ObjectExists {
                path: path.to_string(),
            });
        }
        export.object = Some(object);
        export.subtree = subtree;
        Ok(())
    }

    /// Handle a call addressed to this connection.
    fn dispatch(&self, path: &str, member: &str, args: Vec<Value>) -> Result<Value> {
        self.ensure_open()?;
        validate_object_path(path)?;

        if member == BusConfig::INTROSPECT {
            return self.introspect(path).map(Value::String);
        }

        let object = self.lookup(path)?;
        object.call(path, member, args)
    }

    /// The object answering for `path`: an exact export, or the nearest
    /// subtree export above it.
    fn lookup(&self, path: &str) -> Result<Arc<dyn BusObject>> {
        let objects = read(&self.objects, "connection objects")?;

        if let Some(object) = objects.get(path).and_then(|e| e.object.clone()) {
            return Ok(object);
        }

        let mut current = path;
        while let Some(parent) = parent_path(current) {
            if let Some(export) = objects.get(parent) {
                if export.subtree {
                    if let Some(object) = export.object.clone() {
                        return Ok(object);
                    }
                }
            }
            current = parent;
        }

        Err(VelibError::UnknownObject {
            path: path.to_string(),
        })
    }

    fn introspect(&self, path: &str) -> Result<String> {
        let children = self.children(path)?;
        let node = {
            let objects = read(&self.objects, "connection objects")?;
            objects.get(path).and_then(|export| {
                export.node.clone().or_else(|| {
                    export
                        .object
                        .as_ref()
                        .map(|object| Node::for_interface(object.interface()))
                })
            })
        };

        let node = match node {
            Some(node) => node,
            None => match self.lookup(path) {
                Ok(object) => Node::for_interface(object.interface()),
                Err(_) if !children.is_empty() => Node::default(),
                Err(e) => return Err(e),
            },
        };

        Ok(node.to_xml(&children))
    }

    /// Names of exported nodes directly below `path`.
    fn children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        let objects = read(&self.objects, "connection objects")?;
        let children: BTreeSet<String> = objects
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|segment| !segment.is_empty())
            .map(String::from)
            .collect();

        Ok(children.into_iter().collect())
    }
}

impl BusConnection for MemoryConnection {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn export(&self, path: &str, object: Arc<dyn BusObject>) -> Result<()> {
        self.insert_object(path, object, false)
    }

    fn export_subtree(&self, path: &str, object: Arc<dyn BusObject>) -> Result<()> {
        self.insert_object(path, object, true)
    }

    fn export_introspection(&self, path: &str, node: Node) -> Result<()> {
        self.ensure_open()?;
        validate_object_path(path)?;

        write(&self.objects, "connection objects")?
            .entry(path.to_string())
            .or_default()
            .node = Some(node);
        Ok(())
    }

    fn unexport(&self, path: &str) -> Result<()> {
        self.ensure_open()?;

        write(&self.objects, "connection objects")?
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| VelibError::UnknownObject {
                path: path.to_string(),
            })
    }

    fn emit(&self, path: &str, interface: &str, member: &str, payload: Value) -> Result<()> {
        self.ensure_open()?;
        validate_object_path(path)?;

        // Nobody listening is not an error.
        let _ = self.bus.signals.send(Signal {
            sender: self.unique_name.clone(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            payload,
        });
        Ok(())
    }

    fn request_name(&self, name: &str) -> Result<RequestNameReply> {
        self.ensure_open()?;
        if name.is_empty() || name.starts_with(':') || !name.contains('.') {
            return Err(VelibError::invalid_args(format!(
                "invalid well-known name {:?}",
                name
            )));
        }

        let mut registry = lock(&self.bus.registry, "bus registry")?;
        let reply = match registry.names.get(name) {
            None => {
                registry
                    .names
                    .insert(name.to_string(), self.unique_name.clone());
                RequestNameReply::PrimaryOwner
            }
            Some(owner) if owner == &self.unique_name => RequestNameReply::AlreadyOwner,
            Some(_) => RequestNameReply::Exists,
        };

        debug!("{} requested {}: {:?}", self.unique_name, name, reply);
        Ok(reply)
    }

    fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        self.ensure_open()?;

        let mut registry = lock(&self.bus.registry, "bus registry")?;
        let reply = match registry.names.get(name) {
            None => ReleaseNameReply::NonExistent,
            Some(owner) if owner == &self.unique_name => {
                registry.names.remove(name);
                ReleaseNameReply::Released
            }
            Some(_) => ReleaseNameReply::NotOwner,
        };

        debug!("{} released {}: {:?}", self.unique_name, name, reply);
        Ok(reply)
    }

    fn call(
        &self,
        destination: &str,
        path: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.ensure_open()?;
        self.bus.route(destination, path, member, args)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("unique_name", &self.unique_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Arg, Interface, Method};
    use serde_json::json;

    /// Answers every call with its own path and member.
    struct Echo;

    impl BusObject for Echo {
        fn call(&self, path: &str, member: &str, args: Vec<Value>) -> Result<Value> {
            match member {
                "Echo" => Ok(json!({"path": path, "args": args})),
                _ => Err(VelibError::UnknownMethod {
                    path: path.to_string(),
                    member: member.to_string(),
                }),
            }
        }

        fn interface(&self) -> Interface {
            Interface {
                name: "org.example.Echo".into(),
                methods: vec![Method::new(
                    "Echo",
                    vec![Arg::input("args", "av"), Arg::output("reply", "v")],
                )],
                signals: Vec::new(),
            }
        }
    }

    #[test]
    fn test_unique_names_are_distinct() {
        let bus = MemoryBus::new();
        let a = bus.connect().unwrap();
        let b = bus.connect().unwrap();
        assert_ne!(a.unique_name(), b.unique_name());
        assert!(a.unique_name().starts_with(":1."));
    }

    #[test]
    fn test_call_by_well_known_name() {
        let bus = MemoryBus::new();
        let server = bus.connect().unwrap();
        let client = bus.connect().unwrap();

        server.export("/Echo", Arc::new(Echo)).unwrap();
        assert_eq!(
            server.request_name("org.example.echo").unwrap(),
            RequestNameReply::PrimaryOwner
        );

        let reply = client
            .call("org.example.echo", "/Echo", "Echo", vec![json!(1)])
            .unwrap();
        assert_eq!(reply, json!({"path": "/Echo", "args": [1]}));

        let reply = bus
            .call(server.unique_name(), "/Echo", "Echo", vec![])
            .unwrap();
        assert_eq!(reply["path"], json!("/Echo"));
    }

    #[test]
    fn test_routing_errors() {
        let bus = MemoryBus::new();
        let server = bus.connect().unwrap();
        server.export("/Echo", Arc::new(Echo)).unwrap();
        server.request_name("org.example.echo").unwrap();

        assert!(matches!(
            bus.call("org.example.missing", "/Echo", "Echo", vec![]),
            Err(VelibError::UnknownService { .. })
        ));
        assert!(matches!(
            bus.call("org.example.echo", "/Nope", "Echo", vec![]),
            Err(VelibError::UnknownObject { .. })
        ));
        assert!(matches!(
            bus.call("org.example.echo", "/Echo", "Nope", vec![]),
            Err(VelibError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn test_subtree_export_answers_descendants() {
        let bus = MemoryBus::new();
        let server = bus.connect().unwrap();
        server.export_subtree("/Settings", Arc::new(Echo)).unwrap();

        let reply = bus
            .call(server.unique_name(), "/Settings/Devices/x/Class", "Echo", vec![])
            .unwrap();
        assert_eq!(reply["path"], json!("/Settings/Devices/x/Class"));

        assert!(bus
            .call(server.unique_name(), "/Other", "Echo", vec![])
            .is_err());
    }

    #[test]
    fn test_export_twice_fails() {
        let bus = MemoryBus::new();
        let conn = bus.connect().unwrap();
        conn.export("/A", Arc::new(Echo)).unwrap();
        assert!(matches!(
            conn.export("/A", Arc::new(Echo)),
            Err(VelibError::ObjectExists { .. })
        ));

        conn.unexport("/A").unwrap();
        conn.export("/A", Arc::new(Echo)).unwrap();
    }

    #[test]
    fn test_name_ownership() {
        let bus = MemoryBus::new();
        let a = bus.connect().unwrap();
        let b = bus.connect().unwrap();

        assert_eq!(a.request_name("com.example.x").unwrap(), RequestNameReply::PrimaryOwner);
        assert_eq!(a.request_name("com.example.x").unwrap(), RequestNameReply::AlreadyOwner);
        assert_eq!(b.request_name("com.example.x").unwrap(), RequestNameReply::Exists);

        assert_eq!(b.release_name("com.example.x").unwrap(), ReleaseNameReply::NotOwner);
        assert_eq!(a.release_name("com.example.x").unwrap(), ReleaseNameReply::Released);
        assert_eq!(a.release_name("com.example.x").unwrap(), ReleaseNameReply::NonExistent);

        assert!(a.request_name(":1.99").is_err());
    }

    #[test]
    fn test_drop_releases_names() {
        let bus = MemoryBus::new();
        let a = bus.connect().unwrap();
        a.request_name("com.example.x").unwrap();
        assert!(bus.name_owner("com.example.x").unwrap().is_some());

        drop(a);
        assert!(bus.name_owner("com.example.x").unwrap().is_none());
        assert!(bus.list_names().unwrap().is_empty());
    }

    #[test]
    fn test_closed_connection_rejects_operations() {
        let bus = MemoryBus::new();
        let a = bus.connect().unwrap();
        a.close();
        assert!(matches!(
            a.emit("/", "x.y", "Z", json!(null)),
            Err(VelibError::Disconnected { .. })
        ));
        assert!(a.export("/A", Arc::new(Echo)).is_err());
    }

    #[test]
    fn test_signals_are_broadcast() {
        let bus = MemoryBus::new();
        let conn = bus.connect().unwrap();
        let mut rx = bus.subscribe();

        conn.emit("/Soc", "com.victronenergy.BusItem", "PropertiesChanged", json!({"Value": 1}))
            .unwrap();

        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.sender, conn.unique_name());
        assert_eq!(signal.path, "/Soc");
        assert_eq!(signal.member, "PropertiesChanged");
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        let conn = bus.connect().unwrap();
        conn.emit("/", "x.y", "Z", json!(null)).unwrap();
    }

    #[test]
    fn test_introspect_lists_children() {
        let bus = MemoryBus::new();
        let conn = bus.connect().unwrap();
        conn.export("/Dc/0/Voltage", Arc::new(Echo)).unwrap();
        conn.export("/Soc", Arc::new(Echo)).unwrap();

        let root = bus
            .call(conn.unique_name(), "/", "Introspect", vec![])
            .unwrap();
        let root = root.as_str().unwrap();
        assert!(root.contains("<node name=\"Dc\"/>"));
        assert!(root.contains("<node name=\"Soc\"/>"));

        let leaf = bus
            .call(conn.unique_name(), "/Dc/0/Voltage", "Introspect", vec![])
            .unwrap();
        assert!(leaf.as_str().unwrap().contains("org.example.Echo"));

        assert!(bus
            .call(conn.unique_name(), "/Missing", "Introspect", vec![])
            .is_err());
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
    }
}
