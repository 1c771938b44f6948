//! Dimmer level calculation

use crate::config::DimmerConfig;
use crate::error::LightMotionError;
use crate::query::DeviceQuery;
use chrono::{Datelike, NaiveDateTime, Timelike};
use minijinja::Environment;

/// Level used when no better level can be determined
pub const DEFAULT_LEVEL: u8 = 99;

/// Computes the level lights are switched on with
pub struct DimmerCalculator {
    config: DimmerConfig,
    query: DeviceQuery,
    env: Environment<'static>,
}

impl DimmerCalculator {
    /// Create a calculator, rejecting expressions that do not compile
    pub fn new(config: DimmerConfig, query: DeviceQuery) -> Result<Self, LightMotionError> {
        let env = expression_environment();
        if let DimmerConfig::Expression { expression, .. } = &config {
            env.compile_expression(expression)
                .map_err(|e| LightMotionError::InvalidExpression {
                    expression: expression.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(Self { config, query, env })
    }

    /// Compute the target level (0-99) at local time `now`
    pub fn compute(&self, now: NaiveDateTime) -> u8 {
        match &self.config {
            DimmerConfig::Static { level } => (*level).min(99),
            DimmerConfig::Expression {
                expression,
                luminosity_sensor,
            } => {
                let luminosity = luminosity_sensor
                    .as_deref()
                    .and_then(|id| self.read_luminosity(id));
                match self.eval_expression(expression, luminosity, now) {
                    Ok(level) => to_level(level),
                    Err(e) => {
                        tracing::error!(
                            "Dimmer expression '{}' failed: {}, using {}",
                            expression,
                            e,
                            DEFAULT_LEVEL
                        );
                        DEFAULT_LEVEL
                    }
                }
            }
            DimmerConfig::Luminosity {
                sensor,
                luminosity_min,
                luminosity_max,
                level_min,
                level_max,
            } => {
                let Some(luminosity) = self.read_luminosity(sensor) else {
                    tracing::error!("No luminosity reading from {}, using {}", sensor, level_max);
                    return (*level_max).min(99);
                };
                to_level(interpolate(
                    luminosity,
                    (*luminosity_min, *luminosity_max),
                    (f64::from(*level_min), f64::from(*level_max)),
                ))
            }
        }
    }

    fn read_luminosity(&self, sensor: &str) -> Option<f64> {
        match self.query.level(sensor) {
            Some(level) => level.as_f64(),
            None => {
                tracing::error!("Luminosity sensor not found: {}", sensor);
                None
            }
        }
    }

    fn eval_expression(
        &self,
        expression: &str,
        luminosity: Option<f64>,
        now: NaiveDateTime,
    ) -> Result<f64, minijinja::Error> {
        let expr = self.env.compile_expression(expression)?;
        let value = expr.eval(minijinja::context! {
            luminosity => luminosity,
            hour => now.hour(),
            minute => now.minute(),
            weekday => now.weekday().num_days_from_sunday(),
        })?;
        f64::try_from(value)
    }
}

/// Environment exposing only arithmetic and a few numeric helpers
fn expression_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_function("min", |a: f64, b: f64| a.min(b));
    env.add_function("max", |a: f64, b: f64| a.max(b));
    env.add_function("clamp", |value: f64, low: f64, high: f64| {
        value.max(low).min(high)
    });
    env
}

/// Map `value` clamped to `from` linearly onto `to`
fn interpolate(value: f64, from: (f64, f64), to: (f64, f64)) -> f64 {
    let (from_min, from_max) = from;
    let (to_min, to_max) = to;
    let clamped = value.max(from_min).min(from_max);
    let span = from_max - from_min;
    let ratio = if span > 0.0 {
        (clamped - from_min) / span
    } else {
        0.0
    };
    to_min + (to_max - to_min) * ratio
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_level(value: f64) -> u8 {
    if value.is_nan() {
        return DEFAULT_LEVEL;
    }
    value.round().clamp(0.0, 99.0) as u8
}
