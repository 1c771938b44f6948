//! Output commander switching the rule's lights

use crate::ports::DeviceRegistry;
use device_registry::{Device, DeviceCommand, DeviceId, DeviceKind, Level};
use std::sync::Arc;

/// Sends idempotent on/off/level commands to a set of lights
pub struct OutputCommander {
    registry: Arc<dyn DeviceRegistry>,
}

impl OutputCommander {
    /// Create a new commander
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Switch all lights on at `level`, or off.
    ///
    /// Every light is first marked silently with the target, then commands
    /// are sent only to lights whose committed level differs from the
    /// target. Returns the number of commands sent.
    pub fn apply(&self, lights: &[DeviceId], mode: bool, level: u8) -> usize {
        // Snapshot committed levels before touching anything
        let planned: Vec<(Device, Level, DeviceCommand)> = lights
            .iter()
            .filter_map(|id| {
                let Some(device) = self.registry.get(id) else {
                    tracing::warn!("Light not found: {}", id);
                    return None;
                };
                match target_for(device.kind, mode, level) {
                    Some((target, command)) => Some((device, target, command)),
                    None => {
                        tracing::error!("Unsupported device type for light {}", id);
                        None
                    }
                }
            })
            .collect();

        for (device, target, _) in &planned {
            for (key, value) in [
                ("auto", serde_json::json!(mode)),
                ("target_level", serde_json::json!(target)),
            ] {
                if let Err(e) = self.registry.set_metric(&device.id, key, value) {
                    tracing::warn!("Failed to mark light {}: {}", device.id, e);
                }
            }
        }

        let mut sent = 0;
        for (device, target, command) in &planned {
            if levels_match(device.kind, &device.level, target) {
                tracing::debug!("Light {} already at {}", device.display_name(), target);
                continue;
            }
            match self.registry.send_command(&device.id, *command) {
                Ok(()) => {
                    tracing::info!("Switched {} to {}", device.display_name(), target);
                    sent += 1;
                }
                Err(e) => tracing::warn!("Failed to switch {}: {}", device.id, e),
            }
        }
        sent
    }
}

/// Target level and command for a light kind
fn target_for(kind: DeviceKind, mode: bool, level: u8) -> Option<(Level, DeviceCommand)> {
    match (kind, mode) {
        (DeviceKind::SwitchBinary, true) => Some((Level::on(), DeviceCommand::On)),
        (DeviceKind::SwitchBinary, false) => Some((Level::off(), DeviceCommand::Off)),
        (DeviceKind::SwitchMultilevel, true) => {
            Some((Level::from(level), DeviceCommand::Exact { level }))
        }
        (DeviceKind::SwitchMultilevel, false) => {
            Some((Level::from(0u8), DeviceCommand::Exact { level: 0 }))
        }
        _ => None,
    }
}

#[allow(clippy::float_cmp)]
fn levels_match(kind: DeviceKind, current: &Level, target: &Level) -> bool {
    if kind.is_multilevel() {
        current.as_f64() == target.as_f64()
    } else {
        current == target
    }
}
