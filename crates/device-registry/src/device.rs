//! Device representation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque device identifier (e.g. "ZWayVDev_zway_5-0-48-1")
pub type DeviceId = String;

/// Device kinds understood by the automations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    SwitchBinary,
    SwitchMultilevel,
    SensorBinary,
    SensorMultilevel,
    /// Any device type we do not know how to read or drive
    #[serde(other)]
    Unsupported,
}

impl DeviceKind {
    /// On/off devices whose level is the string "on" or "off"
    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(self, Self::SwitchBinary | Self::SensorBinary)
    }

    /// Devices whose level is a number
    #[must_use]
    pub fn is_multilevel(self) -> bool {
        matches!(self, Self::SwitchMultilevel | Self::SensorMultilevel)
    }
}

/// Current level of a device
///
/// Binary devices report `"on"`/`"off"`, multilevel devices report a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Level {
    Number(f64),
    Text(String),
}

impl Level {
    #[must_use]
    pub fn on() -> Self {
        Self::Text("on".to_string())
    }

    #[must_use]
    pub fn off() -> Self {
        Self::Text("off".to_string())
    }

    /// Whether this is the binary "on" level
    #[must_use]
    pub fn is_on(&self) -> bool {
        matches!(self, Self::Text(s) if s == "on")
    }

    /// Numeric view of the level (numeric strings are parsed)
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Self::off()
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Whole numbers render without a fractional part ("42", not "42.0")
            #[allow(clippy::cast_possible_truncation)]
            Self::Number(n) if n.is_finite() && n.fract() == 0.0 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Level {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<u8> for Level {
    fn from(value: u8) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for Level {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Commands that can be sent to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceCommand {
    /// Turn device on
    On,
    /// Turn device off
    Off,
    /// Set a multilevel device to an exact level (0-99)
    Exact { level: u8 },
    /// Ask the device to report its current state
    Update,
}

/// A device known to the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Unique identifier
    pub id: DeviceId,
    /// Device type
    #[serde(rename = "deviceType")]
    pub kind: DeviceKind,
    /// Last committed level
    #[serde(default)]
    pub level: Level,
    /// User-assigned title
    #[serde(default)]
    pub title: Option<String>,
    /// Room or zone the device belongs to
    #[serde(default)]
    pub location: Option<String>,
    /// Module handling commands for this device.
    ///
    /// Commands sent to an owned device are not applied by the registry,
    /// they are only announced so the owner can react.
    #[serde(default)]
    pub owner: Option<String>,
    /// Free-form persisted attributes
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl Device {
    /// Create a new device with no title, location or metrics
    #[must_use]
    pub fn new(id: impl Into<DeviceId>, kind: DeviceKind, level: Level) -> Self {
        Self {
            id: id.into(),
            kind,
            level,
            title: None,
            location: None,
            owner: None,
            metrics: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Read a persisted attribute
    #[must_use]
    pub fn metric(&self, key: &str) -> Option<&serde_json::Value> {
        self.metrics.get(key).filter(|v| !v.is_null())
    }

    /// Get a display name (title or id)
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}
