//! Rule configuration

use crate::error::LightMotionError;
use chrono::NaiveTime;
use device_registry::DeviceId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of one motion lighting rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique identifier
    pub id: String,
    /// Human-readable name, used as the title of the controller device
    #[serde(default)]
    pub title: Option<String>,
    /// Location of the rule; rules sharing a location retrigger each other
    #[serde(default)]
    pub location: Option<String>,
    /// Security/motion sensors that trigger the rule
    pub security_sensors: Vec<DeviceId>,
    /// Lights switched by the rule
    pub lights: Vec<DeviceId>,
    /// Lights that only count for the "already on" check
    #[serde(default)]
    pub extra_lights: Vec<DeviceId>,
    /// Seconds to wait after motion before switching on
    #[serde(default)]
    pub delay: u64,
    /// Seconds to wait after motion stops before switching off
    #[serde(default)]
    pub duration: u64,
    /// Re-evaluate preconditions while triggered
    #[serde(default)]
    pub recheck: bool,
    /// Seconds between precondition rechecks
    #[serde(default = "default_recheck_period")]
    pub recheck_period: u64,
    /// Seconds between sensor refresh polls while triggered
    #[serde(default)]
    pub poll_sensors: Option<u64>,
    /// Seconds to wait after start before subscribing to devices
    #[serde(default = "default_startup_delay")]
    pub startup_delay: u64,
    /// How bright the lights are switched on
    #[serde(default)]
    pub dimmer: DimmerConfig,
    /// Conditions gating activation
    #[serde(default)]
    pub preconditions: Preconditions,
}

fn default_recheck_period() -> u64 {
    30
}

fn default_startup_delay() -> u64 {
    10
}

impl RuleConfig {
    /// Create a configuration with defaults for everything but the devices
    pub fn new(
        id: impl Into<String>,
        security_sensors: Vec<DeviceId>,
        lights: Vec<DeviceId>,
    ) -> Self {
        Self {
            id: id.into(),
            title: None,
            location: None,
            security_sensors,
            lights,
            extra_lights: Vec::new(),
            delay: 0,
            duration: 0,
            recheck: false,
            recheck_period: default_recheck_period(),
            poll_sensors: None,
            startup_delay: default_startup_delay(),
            dimmer: DimmerConfig::default(),
            preconditions: Preconditions::default(),
        }
    }

    /// Id of the controller device owned by this rule
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        format!("LightMotion_{}", self.id)
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay)
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    #[must_use]
    pub fn recheck_period(&self) -> Duration {
        Duration::from_secs(self.recheck_period)
    }

    #[must_use]
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay)
    }

    /// All lights considered when checking whether lights are already on
    pub fn status_lights(&self) -> impl Iterator<Item = &DeviceId> {
        self.lights.iter().chain(self.extra_lights.iter())
    }

    /// Check the configuration for values that can never work
    pub fn validate(&self) -> Result<(), LightMotionError> {
        if self.id.is_empty() {
            return Err(LightMotionError::InvalidConfig(
                "rule id must not be empty".to_string(),
            ));
        }
        if self.security_sensors.is_empty() {
            return Err(LightMotionError::InvalidConfig(format!(
                "rule {} has no security sensors",
                self.id
            )));
        }
        if self.lights.is_empty() {
            return Err(LightMotionError::InvalidConfig(format!(
                "rule {} has no lights",
                self.id
            )));
        }
        if self.recheck && self.recheck_period == 0 {
            return Err(LightMotionError::InvalidConfig(
                "recheck_period must be positive".to_string(),
            ));
        }
        if self.poll_sensors == Some(0) {
            return Err(LightMotionError::InvalidConfig(
                "poll_sensors must be positive".to_string(),
            ));
        }
        for window in &self.preconditions.time {
            if let Some(day) = window.days.iter().find(|d| **d > 6) {
                return Err(LightMotionError::InvalidConfig(format!(
                    "invalid day of week {day} (0=Sunday..6=Saturday)"
                )));
            }
        }
        if let DimmerConfig::Luminosity {
            luminosity_min,
            luminosity_max,
            ..
        } = &self.dimmer
        {
            if luminosity_min >= luminosity_max {
                return Err(LightMotionError::InvalidConfig(format!(
                    "luminosity_min ({luminosity_min}) must be below luminosity_max ({luminosity_max})"
                )));
            }
        }
        Ok(())
    }
}

/// Dimmer level computation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DimmerConfig {
    /// Fixed level
    Static { level: u8 },
    /// Arithmetic expression over `luminosity`, `hour`, `minute` and `weekday`
    Expression {
        expression: String,
        /// Sensor providing the `luminosity` variable
        #[serde(default)]
        luminosity_sensor: Option<DeviceId>,
    },
    /// Linear mapping from a luminosity sensor reading
    Luminosity {
        sensor: DeviceId,
        luminosity_min: f64,
        luminosity_max: f64,
        level_min: u8,
        level_max: u8,
    },
}

impl Default for DimmerConfig {
    fn default() -> Self {
        Self::Static { level: 99 }
    }
}

/// Conditions that must hold before lights are switched on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preconditions {
    /// Time windows; any matching window passes. Empty means always.
    #[serde(default)]
    pub time: Vec<TimeWindow>,
    /// Binary devices that must be at a given level
    #[serde(default)]
    pub binary: Vec<BinaryCheck>,
    /// Multilevel devices compared against a value
    #[serde(default)]
    pub multilevel: Vec<MultilevelCheck>,
}

/// A time-of-day window, optionally restricted to some weekdays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Start time in HH:MM format
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    /// End time in HH:MM format (exclusive, can wrap past midnight)
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    /// Days when the window applies (0=Sunday). Empty means every day.
    #[serde(default)]
    pub days: Vec<u8>,
}

/// Binary device level equality check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryCheck {
    pub device: DeviceId,
    /// Expected level (e.g. "on")
    pub value: String,
}

/// Multilevel device comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultilevelCheck {
    pub device: DeviceId,
    pub operator: Comparison,
    pub value: f64,
}

/// Comparison operators for multilevel checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(other)]
    Unknown,
}

impl Comparison {
    /// Compare `level` against `value`; `None` for an unknown operator
    #[allow(clippy::float_cmp)]
    #[must_use]
    pub fn compare(self, level: f64, value: f64) -> Option<bool> {
        match self {
            Self::Eq => Some(level == value),
            Self::Ne => Some(level != value),
            Self::Gt => Some(level > value),
            Self::Lt => Some(level < value),
            Self::Ge => Some(level >= value),
            Self::Le => Some(level <= value),
            Self::Unknown => None,
        }
    }
}

/// Parse a time string in HH:MM format
pub fn parse_time(s: &str) -> Result<NaiveTime, LightMotionError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| LightMotionError::InvalidTimeFormat(s.to_string()))
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_time(&s).map_err(serde::de::Error::custom)
    }
}
