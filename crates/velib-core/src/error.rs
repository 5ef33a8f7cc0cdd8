//! Error types for velib.
//!
//! Every failure the registry can report is a variant of [`VelibError`]. The
//! same values travel across the bus: [`VelibError::bus_error_name`] gives the
//! D-Bus style error name a remote peer sees, and
//! [`VelibError::to_rpc_error_code`] the code used by the IPC bridge.

use thiserror::Error;

/// Main error type for velib.
#[derive(Debug, Error)]
pub enum VelibError {
    // Construction and startup
    #[error("Invalid service name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Device instance allocation failed: {message}")]
    IdentityAllocation { message: String },

    // Path registration
    #[error("Path already registered: {path}")]
    DuplicatePath { path: String },

    #[error("Failed to initialize {path}: {source}")]
    Initialization {
        path: String,
        #[source]
        source: Box<VelibError>,
    },

    /// Raised by a value holder; passed through to the caller unchanged.
    #[error("{message}")]
    Value { message: String },

    // Name lifecycle
    #[error("Name {name:?} already taken")]
    NameTaken { name: String },

    #[error("Failed to release name {name:?}: {reply}")]
    NameRelease { name: String, reply: String },

    // Routing
    #[error("Unknown service: {name}")]
    UnknownService { name: String },

    #[error("Unknown object: {path}")]
    UnknownObject { path: String },

    #[error("Unknown method {member} on {path}")]
    UnknownMethod { path: String, member: String },

    #[error("Invalid arguments: {message}")]
    InvalidArgs { message: String },

    #[error("Object already exported at {path}")]
    ObjectExists { path: String },

    #[error("Connection {name} is closed")]
    Disconnected { name: String },

    #[error("Service owning {path} has been dropped")]
    ServiceGone { path: String },

    /// An error reply from a remote peer, carrying its error name.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error("Lock poisoned: {what}")]
    LockPoisoned { what: String },

    // I/O and serialization
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for velib operations.
pub type Result<T> = std::result::Result<T, VelibError>;

impl From<std::io::Error> for VelibError {
    fn from(err: std::io::Error) -> Self {
        VelibError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for VelibError {
    fn from(err: serde_json::Error) -> Self {
        VelibError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl VelibError {
    /// Shorthand for a holder error.
    pub fn value(message: impl Into<String>) -> Self {
        VelibError::Value {
            message: message.into(),
        }
    }

    /// Shorthand for an argument error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        VelibError::InvalidArgs {
            message: message.into(),
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        VelibError::LockPoisoned {
            what: what.to_string(),
        }
    }

    /// D-Bus style error name reported to remote peers.
    pub fn bus_error_name(&self) -> &str {
        match self {
            VelibError::UnknownService { .. } => "org.freedesktop.DBus.Error.ServiceUnknown",
            VelibError::UnknownObject { .. } => "org.freedesktop.DBus.Error.UnknownObject",
            VelibError::UnknownMethod { .. } => "org.freedesktop.DBus.Error.UnknownMethod",
            VelibError::InvalidArgs { .. } => "org.freedesktop.DBus.Error.InvalidArgs",
            VelibError::Disconnected { .. } => "org.freedesktop.DBus.Error.Disconnected",
            VelibError::Remote { name, .. } => name,
            _ => "com.victronenergy.BusItem.Error",
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard codes:
    /// - -32602: Invalid params
    /// - -32601: Method not found
    /// - -32603: Internal error
    ///
    /// Application codes:
    /// - -32000: Routing failure (unknown service or object)
    /// - -32001: Value rejected by a holder
    /// - -32002: Name ownership conflict
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            VelibError::InvalidArgs { .. } => -32602,
            VelibError::UnknownMethod { .. } => -32601,

            VelibError::UnknownService { .. }
            | VelibError::UnknownObject { .. }
            | VelibError::Disconnected { .. } => -32000,

            VelibError::Value { .. } | VelibError::Remote { .. } => -32001,

            VelibError::NameTaken { .. } | VelibError::NameRelease { .. } => -32002,

            _ => -32603,
        }
    }

    /// Rebuild an error from the name and message carried by an error reply.
    pub fn from_bus_error(name: &str, message: &str) -> Self {
        match name {
            "org.freedesktop.DBus.Error.InvalidArgs" => VelibError::invalid_args(message),
            "com.victronenergy.BusItem.Error" => VelibError::value(message),
            _ => VelibError::Remote {
                name: name.to_string(),
                message: message.to_string(),
            },
        }
    }
}
