//! Precondition evaluator for rules

use crate::config::{BinaryCheck, MultilevelCheck, Preconditions, TimeWindow};
use crate::query::DeviceQuery;
use chrono::{Datelike, NaiveDateTime};

/// Evaluator for rule preconditions (time windows, binary and multilevel checks)
pub struct PreconditionEvaluator {
    query: DeviceQuery,
}

impl PreconditionEvaluator {
    /// Create a new evaluator
    pub fn new(query: DeviceQuery) -> Self {
        Self { query }
    }

    /// Evaluate all preconditions at local time `now` (all must pass)
    pub fn evaluate(&self, preconditions: &Preconditions, now: NaiveDateTime) -> bool {
        if !preconditions.time.is_empty()
            && !preconditions.time.iter().any(|w| check_period(w, now))
        {
            tracing::debug!("No time window matches {}", now);
            return false;
        }

        if !preconditions.binary.iter().all(|c| self.check_binary(c)) {
            return false;
        }

        preconditions
            .multilevel
            .iter()
            .all(|c| self.check_multilevel(c))
    }

    fn check_binary(&self, check: &BinaryCheck) -> bool {
        let Some(level) = self.query.level(&check.device) else {
            // A missing device does not decide the outcome
            tracing::error!("Precondition device not found: {}", check.device);
            return true;
        };
        let passed = level.to_string() == check.value;
        if !passed {
            tracing::debug!(
                "Binary precondition failed: {} is {}, expected {}",
                check.device,
                level,
                check.value
            );
        }
        passed
    }

    fn check_multilevel(&self, check: &MultilevelCheck) -> bool {
        let Some(level) = self.query.level(&check.device) else {
            tracing::error!("Precondition device not found: {}", check.device);
            return true;
        };
        let Some(value) = level.as_f64() else {
            tracing::warn!(
                "Precondition device {} has non-numeric level {}",
                check.device,
                level
            );
            return false;
        };
        match check.operator.compare(value, check.value) {
            Some(passed) => {
                if !passed {
                    tracing::debug!(
                        "Multilevel precondition failed: {} is {}, wanted {:?} {}",
                        check.device,
                        value,
                        check.operator,
                        check.value
                    );
                }
                passed
            }
            None => {
                tracing::error!("Unknown operator in precondition for {}", check.device);
                false
            }
        }
    }
}

/// Whether `now` falls inside the window.
///
/// The window is `[start, end)`; when `end` is before `start` it spans
/// midnight. Dates are shifted by whole days on naive local time so the
/// hour and minute stay fixed across daylight saving changes.
pub fn check_period(window: &TimeWindow, now: NaiveDateTime) -> bool {
    if !window.days.is_empty() {
        let today = now.weekday().num_days_from_sunday() as u8;
        if !window.days.contains(&today) {
            return false;
        }
    }

    let date = now.date();
    let mut start = date.and_time(window.start);
    let mut end = date.and_time(window.end);

    if window.end < window.start {
        if now.time() < window.end {
            // Still in the part of the window that started yesterday
            match date.pred_opt() {
                Some(yesterday) => start = yesterday.and_time(window.start),
                None => return false,
            }
        } else {
            match date.succ_opt() {
                Some(tomorrow) => end = tomorrow.and_time(window.end),
                None => return false,
            }
        }
    }

    now >= start && now < end
}
