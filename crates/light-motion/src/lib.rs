//! Motion-activated lighting for the device registry
//!
//! A rule watches security/motion sensors and switches lights on and off,
//! with an activation delay, an auto-off timeout, periodic precondition
//! rechecks and dynamic dimmer levels.

pub mod commander;
pub mod config;
pub mod dimmer;
pub mod error;
pub mod machine;
pub mod persistence;
pub mod ports;
pub mod precondition;
pub mod query;
pub mod rule;
pub mod timers;

pub use config::*;
pub use error::LightMotionError;
pub use machine::{
    LightNotice, Mode, RuleState, TriggerStateMachine, LIGHT_OFF_EVENT, LIGHT_ON_EVENT,
};
pub use ports::{DeviceRegistry, EventBus};
pub use rule::LightMotionRule;
