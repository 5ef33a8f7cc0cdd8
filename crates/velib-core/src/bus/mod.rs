//! Transport boundary.
//!
//! The registry never talks to a concrete bus. It needs a [`BusConnection`]
//! that can export objects at paths, publish introspection data, emit
//! signals, own a well-known name and call methods on other services.
//! Exported objects implement [`BusObject`], a single dynamic dispatch entry
//! point keyed by member name.
//!
//! [`MemoryBus`] is an in-process implementation: several connections on the
//! same bus can call each other, and every emitted [`Signal`] is broadcast to
//! subscribers.

pub mod introspect;
pub mod memory;

pub use introspect::{Arg, Direction, Interface, Method, Node, SignalSpec};
pub use memory::{MemoryBus, MemoryConnection};

use crate::value::Value;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An object exported on the bus.
pub trait BusObject: Send + Sync {
    /// Invoke `member` on this object.
    ///
    /// `path` is the object path the call was addressed to; it differs from
    /// the export path only for subtree exports.
    fn call(&self, path: &str, member: &str, args: Vec<Value>) -> Result<Value>;

    /// Interface description used for introspection.
    fn interface(&self) -> Interface;
}

/// One connection to a bus.
pub trait BusConnection: Send + Sync {
    /// The connection's unique name, e.g. `:1.4`.
    fn unique_name(&self) -> &str;

    /// Export `object` at exactly `path`.
    fn export(&self, path: &str, object: Arc<dyn BusObject>) -> Result<()>;

    /// Export `object` at `path` and every path below it that has no object
    /// of its own.
    fn export_subtree(&self, path: &str, object: Arc<dyn BusObject>) -> Result<()>;

    /// Publish introspection data for `path`.
    fn export_introspection(&self, path: &str, node: Node) -> Result<()>;

    /// Remove the object and introspection data at `path`.
    fn unexport(&self, path: &str) -> Result<()>;

    /// Emit `interface.member` from the object at `path`.
    fn emit(&self, path: &str, interface: &str, member: &str, payload: Value) -> Result<()>;

    /// Ask for ownership of a well-known name without queueing.
    fn request_name(&self, name: &str) -> Result<RequestNameReply>;

    /// Give up a well-known name.
    fn release_name(&self, name: &str) -> Result<ReleaseNameReply>;

    /// Call `member` on the object at `path` owned by `destination`.
    fn call(&self, destination: &str, path: &str, member: &str, args: Vec<Value>)
        -> Result<Value>;
}

/// Outcome of a name request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestNameReply {
    PrimaryOwner,
    Exists,
    AlreadyOwner,
}

/// Outcome of a name release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl fmt::Display for ReleaseNameReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseNameReply::Released => "released",
            ReleaseNameReply::NonExistent => "name does not exist",
            ReleaseNameReply::NotOwner => "not the owner",
        };
        f.write_str(s)
    }
}

/// A signal as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Unique name of the emitting connection.
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub payload: Value,
}

/// Check that `path` is an absolute object path without empty elements.
pub fn validate_object_path(path: &str) -> Result<()> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && path[1..].split('/').all(|element| {
                !element.is_empty()
                    && element
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
            }));

    if valid {
        Ok(())
    } else {
        Err(crate::VelibError::invalid_args(format!(
            "invalid object path {:?}",
            path
        )))
    }
}

/// Take exactly `N` positional arguments.
pub(crate) fn expect_args<const N: usize>(member: &str, args: Vec<Value>) -> Result<[Value; N]> {
    let got = args.len();
    <[Value; N]>::try_from(args).map_err(|_| {
        crate::VelibError::invalid_args(format!(
            "{} expects {} argument(s), got {}",
            member, N, got
        ))
    })
}
