//! Device status queries

use crate::ports::DeviceRegistry;
use device_registry::{Device, DeviceId, Level};
use std::sync::Arc;

/// Read-only view of device states.
///
/// Devices are resolved on every call; nothing is cached between calls.
#[derive(Clone)]
pub struct DeviceQuery {
    registry: Arc<dyn DeviceRegistry>,
}

impl DeviceQuery {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Whether a device is currently active. Unknown devices are inactive.
    pub fn is_active(&self, id: &str) -> bool {
        match self.registry.get(id) {
            Some(device) => device_is_active(&device),
            None => {
                tracing::warn!("Device not found: {}", id);
                false
            }
        }
    }

    /// Whether at least one of the devices is active, checked in order
    pub fn any_active<'a>(&self, ids: impl IntoIterator<Item = &'a DeviceId>) -> bool {
        ids.into_iter().any(|id| self.is_active(id))
    }

    /// Current level of a device
    pub fn level(&self, id: &str) -> Option<Level> {
        self.registry.get(id).map(|device| device.level)
    }
}

/// Classify a device snapshot as active by its kind
pub fn device_is_active(device: &Device) -> bool {
    if device.kind.is_binary() {
        device.level.is_on()
    } else if device.kind.is_multilevel() {
        device.level.as_f64().is_some_and(|level| level > 0.0)
    } else {
        tracing::error!("Unsupported device type for {}", device.id);
        false
    }
}
