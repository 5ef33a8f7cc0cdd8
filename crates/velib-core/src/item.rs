//! Published paths.
//!
//! A [`BusItem`] owns one [`ValueHolder`] behind its own lock. Every get, set
//! and text call on the same item is serialized by that lock; different items
//! never contend. A successful set is followed, still under the lock, by a
//! `PropertiesChanged` signal carrying the new value and text, so signals for
//! one path go out in the order their sets took the lock.

use crate::bus::{expect_args, Arg, BusObject, Interface, Method, SignalSpec};
use crate::config::BusConfig;
use crate::lock::lock;
use crate::service::ServiceCore;
use crate::value::{Value, ValueHolder};
use crate::{Result, VelibError};
use serde_json::json;
use std::fmt;
use std::sync::{Mutex, Weak};

/// One published path of a [`Service`](crate::Service).
pub struct BusItem {
    path: String,
    service: Weak<ServiceCore>,
    holder: Mutex<Box<dyn ValueHolder>>,
}

impl BusItem {
    pub(crate) fn new(path: &str, service: Weak<ServiceCore>, holder: Box<dyn ValueHolder>) -> Self {
        Self {
            path: path.to_string(),
            service,
            holder: Mutex::new(holder),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The current raw value.
    pub fn value(&self) -> Result<Value> {
        lock(&self.holder, &self.path)?.value()
    }

    /// The current display text.
    pub fn text(&self) -> Result<String> {
        lock(&self.holder, &self.path)?.text()
    }

    /// Value and text read under a single lock acquisition.
    pub fn snapshot(&self) -> Result<(Value, String)> {
        let holder = lock(&self.holder, &self.path)?;
        Ok((holder.value()?, holder.text()?))
    }

    /// Store a new value and notify subscribers.
    ///
    /// On error nothing is rolled back: if the holder accepted the value but
    /// rendering its text or emitting the signal failed, the new value stays
    /// and no signal was sent.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<()> {
        let mut holder = lock(&self.holder, &self.path)?;
        self.apply(&mut **holder, value.into())
    }

    /// Feed the holder's current value back through a set, so the first
    /// signal goes out before anyone else can reach the item.
    pub(crate) fn initialize(&self) -> Result<()> {
        let mut holder = lock(&self.holder, &self.path)?;
        let current = holder.value()?;
        self.apply(&mut **holder, current)
    }

    fn apply(&self, holder: &mut dyn ValueHolder, value: Value) -> Result<()> {
        holder.set_value(value.clone())?;
        let text = holder.text()?;

        let service = self.service.upgrade().ok_or_else(|| VelibError::ServiceGone {
            path: self.path.clone(),
        })?;
        service.conn.emit(
            &self.path,
            BusConfig::BUSITEM_INTERFACE,
            BusConfig::PROPERTIES_CHANGED,
            json!({ "Value": value, "Text": text }),
        )
    }
}

impl fmt::Debug for BusItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusItem")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl BusObject for BusItem {
    fn call(&self, path: &str, member: &str, args: Vec<Value>) -> Result<Value> {
        match member {
            BusConfig::GET_VALUE => self.value(),
            BusConfig::GET_TEXT => self.text().map(Value::String),
            BusConfig::SET_VALUE => {
                let [value] = expect_args::<1>(member, args)?;
                self.set_value(value)?;
                Ok(json!(0))
            }
            _ => Err(VelibError::UnknownMethod {
                path: path.to_string(),
                member: member.to_string(),
            }),
        }
    }

    fn interface(&self) -> Interface {
        busitem_interface()
    }
}

/// The `com.victronenergy.BusItem` interface as exposed by every path.
pub fn busitem_interface() -> Interface {
    Interface {
        name: BusConfig::BUSITEM_INTERFACE.to_string(),
        methods: vec![
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConnection, MemoryBus, MemoryConnection};
    use crate::value::{FormattedValue, PathValue};
    use crate::Service;
    use std::sync::Arc;

    fn service(bus: &MemoryBus) -> (Arc<MemoryConnection>, Service) {
        let conn = bus.connect().unwrap();
        let service = Service::new(conn.clone(), "com.victronenergy.battery.test").unwrap();
        (conn, service)
    }

    #[test]
    fn test_direct_round_trip() {
        let bus = MemoryBus::new();
        let (_conn, service) = service(&bus);
        let item = service.add_path("/CustomName", "go-velib").unwrap();

        item.set_value("renamed").unwrap();
        assert_eq!(item.value().unwrap(), json!("renamed"));
        assert_eq!(item.text().unwrap(), "renamed");
    }

    #[test]
    fn test_formatted_voltage() {
        let bus = MemoryBus::new();
        let (_conn, service) = service(&bus);
        let voltage = service
            .add_path("/Dc/0/Voltage", FormattedValue::with_unit(0.0, 2, "V"))
            .unwrap();

        voltage.set_value(3.5).unwrap();
        assert_eq!(voltage.value().unwrap(), json!(3.5));
        assert_eq!(voltage.text().unwrap(), "3.50 V");
    }

    #[test]
    fn test_set_emits_properties_changed() {
        let bus = MemoryBus::new();
        let (conn, service) = service(&bus);
        let item = service.add_path("/Soc", 10).unwrap();

        let mut rx = bus.subscribe();
        item.set_value(11).unwrap();
        item.set_value(12).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.sender, conn.unique_name());
        assert_eq!(first.interface, "com.victronenergy.BusItem");
        assert_eq!(first.payload, json!({"Value": 11, "Text": "11"}));
        assert_eq!(second.payload, json!({"Value": 12, "Text": "12"}));
    }

    #[test]
    fn test_remote_calls() {
        let bus = MemoryBus::new();
        let (conn, service) = service(&bus);
        service
            .add_path("/Dc/0/Voltage", FormattedValue::with_unit(0.0, 1, "V"))
            .unwrap();
        let dest = conn.unique_name();

        assert_eq!(
            bus.call(dest, "/Dc/0/Voltage", "SetValue", vec![json!(12.3)]).unwrap(),
            json!(0)
        );
        assert_eq!(
            bus.call(dest, "/Dc/0/Voltage", "GetValue", vec![]).unwrap(),
            json!(12.3)
        );
        assert_eq!(
            bus.call(dest, "/Dc/0/Voltage", "GetText", vec![]).unwrap(),
            json!("12.3 V")
        );

        assert!(matches!(
            bus.call(dest, "/Dc/0/Voltage", "SetValue", vec![]),
            Err(VelibError::InvalidArgs { .. })
        ));
        assert!(matches!(
            bus.call(dest, "/Dc/0/Voltage", "Reset", vec![]),
            Err(VelibError::UnknownMethod { .. })
        ));
    }

    /// Accepts every value but cannot render negative ones.
    struct NoNegativeText(Value);

    impl ValueHolder for NoNegativeText {
        fn value(&self) -> Result<Value> {
            Ok(self.0.clone())
        }

        fn text(&self) -> Result<String> {
            match self.0.as_f64() {
                Some(f) if f < 0.0 => Err(VelibError::value("cannot render negative")),
                _ => Ok(self.0.to_string()),
            }
        }

        fn set_value(&mut self, value: Value) -> Result<()> {
            self.0 = value;
            Ok(())
        }
    }

    #[test]
    fn test_failed_text_keeps_value_without_signal() {
        let bus = MemoryBus::new();
        let (_conn, service) = service(&bus);
        let item = service
            .add_path("/Dc/0/Current", PathValue::custom(NoNegativeText(json!(1))))
            .unwrap();

        let mut rx = bus.subscribe();
        let err = item.set_value(-2).unwrap_err();
        assert!(matches!(err, VelibError::Value { .. }));

        assert_eq!(item.value().unwrap(), json!(-2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_after_service_dropped() {
        let bus = MemoryBus::new();
        let (conn, service) = service(&bus);
        let item = service.add_path("/Soc", 1).unwrap();

        drop(service);
        conn.unexport("/Soc").unwrap();

        assert!(matches!(
            item.set_value(2),
            Err(VelibError::ServiceGone { .. })
        ));
        // Reads do not need the service.
        assert_eq!(item.value().unwrap(), json!(2));
    }
}
