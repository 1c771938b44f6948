//! In-memory device registry

use crate::device::{Device, DeviceCommand, DeviceId, DeviceKind, Level};
use crate::persistence::{self, DeviceStore};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported command {command:?} for device {device_id}")]
    UnsupportedCommand {
        device_id: String,
        command: DeviceCommand,
    },
}

/// Registry events
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was added
    DeviceAdded { device_id: DeviceId },
    /// A device was removed
    DeviceRemoved { device_id: DeviceId },
    /// A device reported a new level
    LevelChanged { device_id: DeviceId, level: Level },
    /// A command was sent to a device
    CommandSent {
        device_id: DeviceId,
        command: DeviceCommand,
    },
}

/// Device registry keeping every device in memory
pub struct InMemoryRegistry {
    /// Known devices (keyed by id)
    devices: Arc<DashMap<DeviceId, Device>>,
    /// Event broadcaster
    event_tx: broadcast::Sender<RegistryEvent>,
    /// File storage, when the registry is persisted
    store: Option<DeviceStore>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    /// Create an empty registry without persistence
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            devices: Arc::new(DashMap::new()),
            event_tx,
            store: None,
        }
    }

    /// Create a registry backed by a JSON file, loading any saved devices
    pub async fn open(data_path: PathBuf) -> Self {
        let mut registry = Self::new();
        for device in persistence::load_devices(&data_path).await {
            registry.devices.insert(device.id.clone(), device);
        }
        registry.store = Some(DeviceStore::spawn(data_path, Arc::clone(&registry.devices)));
        registry
    }

    /// Subscribe to registry events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Get a snapshot of a device
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.get(id).map(|r| r.value().clone())
    }

    /// Get all known devices
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(|r| r.value().clone()).collect()
    }

    /// Add a device or update an existing one
    pub fn upsert(&self, device: Device) {
        let id = device.id.clone();
        let is_new = self.devices.insert(id.clone(), device).is_none();
        if is_new {
            let _ = self.event_tx.send(RegistryEvent::DeviceAdded { device_id: id });
        }
        self.save_devices();
    }

    /// Add a device unless one with the same id exists.
    ///
    /// An existing device keeps its level and metrics (restored state wins
    /// over defaults), but takes over the new owner, title and location.
    pub fn create(&self, device: Device) -> Device {
        let id = device.id.clone();
        let created = {
            let mut entry = self.devices.entry(id.clone()).or_insert_with(|| device.clone());
            let existing = entry.value_mut();
            existing.owner = device.owner;
            existing.title = device.title.or_else(|| existing.title.take());
            existing.location = device.location.or_else(|| existing.location.take());
            existing.clone()
        };
        tracing::debug!("Created device {}", id);
        let _ = self.event_tx.send(RegistryEvent::DeviceAdded { device_id: id });
        self.save_devices();
        created
    }

    /// Remove a device
    pub fn remove(&self, id: &str) -> Option<Device> {
        let removed = self.devices.remove(id).map(|(_, v)| v);
        if removed.is_some() {
            let _ = self.event_tx.send(RegistryEvent::DeviceRemoved {
                device_id: id.to_string(),
            });
            self.save_devices();
        }
        removed
    }

    /// Set a device level.
    ///
    /// With `notify` false the level is stored silently and no
    /// `LevelChanged` event is emitted.
    pub fn set_level(&self, id: &str, level: Level, notify: bool) -> Result<(), RegistryError> {
        let changed = {
            let mut device = self
                .devices
                .get_mut(id)
                .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))?;
            let changed = device.level != level;
            device.level = level.clone();
            changed
        };

        if changed && notify {
            let _ = self.event_tx.send(RegistryEvent::LevelChanged {
                device_id: id.to_string(),
                level,
            });
        }
        self.save_devices();
        Ok(())
    }

    /// Store a persisted attribute without notifying anyone. `Null` clears it.
    pub fn set_metric(
        &self,
        id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), RegistryError> {
        {
            let mut device = self
                .devices
                .get_mut(id)
                .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))?;
            if value.is_null() {
                if device.metrics.remove(key).is_none() {
                    return Ok(());
                }
            } else {
                device.metrics.insert(key.to_string(), value);
            }
        }
        self.save_devices();
        Ok(())
    }

    /// Send a command to a device.
    ///
    /// Commands to owned devices are announced only; for every other device
    /// the registry applies `on`/`off`/`exact` to the level itself.
    pub fn send_command(&self, id: &str, command: DeviceCommand) -> Result<(), RegistryError> {
        let device = self
            .get(id)
            .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))?;

        tracing::debug!("Sending {:?} command to device {}", command, id);
        let _ = self.event_tx.send(RegistryEvent::CommandSent {
            device_id: id.to_string(),
            command,
        });

        if device.owner.is_some() {
            return Ok(());
        }

        let level = match (device.kind, command) {
            (_, DeviceCommand::Update) => return Ok(()),
            (DeviceKind::SwitchBinary, DeviceCommand::On) => Level::on(),
            (DeviceKind::SwitchBinary, DeviceCommand::Off) => Level::off(),
            (DeviceKind::SwitchMultilevel, DeviceCommand::On) => Level::from(99u8),
            (DeviceKind::SwitchMultilevel, DeviceCommand::Off) => Level::from(0u8),
            (DeviceKind::SwitchMultilevel, DeviceCommand::Exact { level }) => {
                Level::from(level.min(99))
            }
            _ => {
                return Err(RegistryError::UnsupportedCommand {
                    device_id: id.to_string(),
                    command,
                })
            }
        };
        self.set_level(id, level, true)
    }

    /// Schedule a save of every device
    fn save_devices(&self) {
        if let Some(store) = &self.store {
            store.mark_dirty();
        }
    }

    /// Save devices to disk and wait for completion
    pub async fn flush(&self) -> Result<(), std::io::Error> {
        match &self.store {
            Some(store) => store.flush().await,
            None => Ok(()),
        }
    }
}
