//! # velib-core
//!
//! A value registry for a D-Bus style message bus, following the conventions
//! of Victron Energy's `com.victronenergy.*` services.
//!
//! A [`Service`] publishes values at object paths. Each path is a
//! [`BusItem`] exposing `GetValue`, `GetText` and `SetValue` and announcing
//! every change with a `PropertiesChanged` signal. The root path answers
//! `GetItems` with the whole table. Before a device is reported, its device
//! instance is negotiated with the settings service, the naming authority
//! that remembers which instance every device label was given.
//!
//! ## Example
//!
//! ```
//! use velib_core::{FormattedValue, MemoryBus, Service, SettingsService};
//!
//! let bus = MemoryBus::new();
//! let _settings = SettingsService::start(bus.connect()?)?;
//!
//! let service = Service::new(bus.connect()?, "com.victronenergy.battery.ttyO1")?;
//! let instance = service.device_instance()?;
//! service.add_path("/DeviceInstance", instance)?;
//! let voltage = service.add_path("/Dc/0/Voltage", FormattedValue::with_unit(0.0, 2, "V"))?;
//! service.register()?;
//!
//! voltage.set_value(12.6)?;
//! assert_eq!(voltage.text()?, "12.60 V");
//! # Ok::<(), velib_core::VelibError>(())
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod item;
pub mod name;
pub mod service;
pub mod settings;
pub mod value;

mod lock;

pub use bus::{BusConnection, BusObject, MemoryBus, MemoryConnection, Signal};
pub use error::{Result, VelibError};
pub use ipc::{IpcClient, IpcServer, IpcServerHandle};
pub use item::BusItem;
pub use name::ServiceName;
pub use service::{ItemState, Service};
pub use settings::SettingsService;
pub use value::{DirectValue, FormattedValue, PathValue, Value, ValueHolder};
