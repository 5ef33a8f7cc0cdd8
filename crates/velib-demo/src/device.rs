//! The simulated battery.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;
use velib_core::{BusItem, FormattedValue, MemoryBus, Service};

/// Product id reported for the simulated device.
const PRODUCT_ID: u32 = 0xB0FF;

pub struct Battery {
    pub service: Service,
    pub voltage: Arc<BusItem>,
}

impl Battery {
    /// Resolve the device instance and publish every path, then claim the
    /// bus name.
    pub fn publish(bus: &MemoryBus, name: &str) -> Result<Self> {
        let service = Service::new(bus.connect()?, name)
            .with_context(|| format!("invalid service name {:?}", name))?;
        let instance = service
            .device_instance()
            .context("device instance negotiation failed")?;
        debug!("{} has device instance {}", service.name(), instance);

        service.add_path("/Mgmt/ProcessName", env!("CARGO_PKG_NAME"))?;
        service.add_path("/Mgmt/ProcessVersion", env!("CARGO_PKG_VERSION"))?;
        service.add_path("/Mgmt/Connection", "In-process bus")?;
        service.add_path("/DeviceInstance", instance)?;
        service.add_path("/ProductId", PRODUCT_ID)?;
        service.add_path("/ProductName", "Simulated battery")?;
        service.add_path("/CustomName", "")?;
        service.add_path("/DeviceName", service.name().device_label())?;
        service.add_path("/FirmwareVersion", 0)?;
        service.add_path("/HardwareVersion", 0)?;
        service.add_path("/Connected", 1)?;
        service.add_path("/ErrorCode", 0)?;

        let voltage = service.add_path("/Dc/0/Voltage", FormattedValue::with_unit(12.8, 2, "V"))?;

        service.register().context("failed to claim bus name")?;
        Ok(Self { service, voltage })
    }
}
