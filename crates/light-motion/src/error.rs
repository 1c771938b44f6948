//! Error types for light motion rules

use thiserror::Error;

/// Errors that can occur while setting up or running a rule
#[derive(Error, Debug)]
pub enum LightMotionError {
    /// Invalid rule configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Dimmer expression failed to compile
    #[error("Invalid dimmer expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// Invalid time format
    #[error("Invalid time format: {0}")]
    InvalidTimeFormat(String),
}
