//! Collaborator interfaces used by the rules.
//!
//! Rules never hold concrete registry or bus types; everything goes through
//! these traits so a host can plug in its own device backend.

use device_registry::{
    BusEvent, Device, DeviceCommand, InMemoryRegistry, InProcessBus, Level, RegistryError,
    RegistryEvent,
};
use tokio::sync::broadcast;

/// Device lookup, state storage and command dispatch
pub trait DeviceRegistry: Send + Sync {
    /// Snapshot of a device, `None` if unknown
    fn get(&self, id: &str) -> Option<Device>;

    /// Create a device, keeping the persisted state of an existing one
    fn create(&self, device: Device) -> Device;

    /// Remove a device
    fn remove(&self, id: &str) -> Option<Device>;

    /// Set a device level, optionally without notifying listeners
    fn set_level(&self, id: &str, level: Level, notify: bool) -> Result<(), RegistryError>;

    /// Store a persisted attribute silently (`Null` clears it)
    fn set_metric(&self, id: &str, key: &str, value: serde_json::Value)
        -> Result<(), RegistryError>;

    /// Send a command to a device
    fn send_command(&self, id: &str, command: DeviceCommand) -> Result<(), RegistryError>;

    /// Subscribe to device changes
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}

/// Publish/subscribe between modules
pub trait EventBus: Send + Sync {
    /// Emit an event to all subscribers
    fn emit(&self, event: BusEvent);

    /// Subscribe to events emitted after this call
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

impl DeviceRegistry for InMemoryRegistry {
    fn get(&self, id: &str) -> Option<Device> {
        InMemoryRegistry::get(self, id)
    }

    fn create(&self, device: Device) -> Device {
        InMemoryRegistry::create(self, device)
    }

    fn remove(&self, id: &str) -> Option<Device> {
        InMemoryRegistry::remove(self, id)
    }

    fn set_level(&self, id: &str, level: Level, notify: bool) -> Result<(), RegistryError> {
        InMemoryRegistry::set_level(self, id, level, notify)
    }

    fn set_metric(
        &self,
        id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), RegistryError> {
        InMemoryRegistry::set_metric(self, id, key, value)
    }

    fn send_command(&self, id: &str, command: DeviceCommand) -> Result<(), RegistryError> {
        InMemoryRegistry::send_command(self, id, command)
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        InMemoryRegistry::subscribe(self)
    }
}

impl EventBus for InProcessBus {
    fn emit(&self, event: BusEvent) {
        InProcessBus::emit(self, event);
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        InProcessBus::subscribe(self)
    }
}
