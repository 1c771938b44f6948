//! Device registry for light automations
//!
//! This crate provides the device model, an in-memory registry with
//! change notifications, an in-process event bus, and JSON persistence
//! for device state.

pub mod bus;
pub mod device;
pub mod persistence;
pub mod registry;

pub use bus::{BusEvent, InProcessBus};
pub use device::{Device, DeviceCommand, DeviceId, DeviceKind, Level};
pub use registry::{InMemoryRegistry, RegistryError, RegistryEvent};
