//! Timers for the rule state machine

use crate::ports::DeviceRegistry;
use chrono::{DateTime, Utc};
use device_registry::DeviceId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long light-off feedback is ignored after switching lights on
pub const LOCK_DURATION: Duration = Duration::from_secs(5);

/// Kinds of timers owned by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Activation delay after motion
    Delay,
    /// Auto-off after motion stopped
    Off,
    /// Periodic precondition recheck
    Recheck,
    /// Debounced retrigger from another rule's event
    Retrigger,
}

impl TimerKind {
    /// Metric holding the persisted absolute deadline, if the kind is persisted
    #[must_use]
    pub fn deadline_key(self) -> Option<&'static str> {
        match self {
            Self::Delay => Some("delay_deadline"),
            Self::Off => Some("off_deadline"),
            Self::Recheck | Self::Retrigger => None,
        }
    }
}

/// Message sent when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

struct Slot {
    handle: JoinHandle<()>,
    generation: u64,
}

/// Cancelable timers of one rule.
///
/// Each kind has at most one pending timer; scheduling a kind replaces the
/// previous timer of that kind. Fired timers are delivered as [`TimerFired`]
/// messages and must be [claimed](TimerSet::claim) before acting on them, so
/// a timer cancelled after it already sent its message is ignored.
pub struct TimerSet {
    registry: Arc<dyn DeviceRegistry>,
    /// Device storing the persisted deadlines
    device_id: DeviceId,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    delay: Option<Slot>,
    off: Option<Slot>,
    recheck: Option<Slot>,
    retrigger: Option<Slot>,
    lock_until: Option<Instant>,
    next_generation: u64,
}

impl TimerSet {
    /// Create an empty timer set persisting deadlines on `device_id`
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        device_id: DeviceId,
        fired_tx: mpsc::UnboundedSender<TimerFired>,
    ) -> Self {
        Self {
            registry,
            device_id,
            fired_tx,
            delay: None,
            off: None,
            recheck: None,
            retrigger: None,
            lock_until: None,
            next_generation: 0,
        }
    }

    /// Start the activation delay timer
    pub fn schedule_delay(&mut self, duration: Duration) {
        self.schedule_persisted(TimerKind::Delay, duration);
    }

    /// Start the auto-off timer
    pub fn schedule_off(&mut self, duration: Duration) {
        self.schedule_persisted(TimerKind::Off, duration);
    }

    /// Start the retrigger debounce timer
    pub fn schedule_retrigger(&mut self, duration: Duration) {
        self.spawn_once(TimerKind::Retrigger, duration);
    }

    /// Start the recurring recheck timer, first tick after one `period`
    pub fn start_recheck(&mut self, period: Duration) {
        self.cancel_slot(TimerKind::Recheck);
        let generation = self.next_generation();
        let fired_tx = self.fired_tx.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;
                let fired = TimerFired {
                    kind: TimerKind::Recheck,
                    generation,
                };
                if fired_tx.send(fired).is_err() {
                    break;
                }
            }
        });

        self.recheck = Some(Slot { handle, generation });
        tracing::debug!("Started recheck every {:?} for {}", period, self.device_id);
    }

    pub fn cancel_delay(&mut self) {
        self.cancel(TimerKind::Delay);
    }

    pub fn cancel_off(&mut self) {
        self.cancel(TimerKind::Off);
    }

    pub fn cancel_recheck(&mut self) {
        self.cancel(TimerKind::Recheck);
    }

    /// Cancel every timer and drop the lock
    pub fn cancel_all(&mut self) {
        self.cancel(TimerKind::Delay);
        self.cancel(TimerKind::Off);
        self.cancel(TimerKind::Recheck);
        self.cancel(TimerKind::Retrigger);
        self.lock_until = None;
    }

    /// Cancel a timer and clear its persisted deadline. Idempotent.
    pub fn cancel(&mut self, kind: TimerKind) {
        self.cancel_slot(kind);
        if kind.deadline_key().is_some() {
            self.persist_deadline(kind, None);
        }
    }

    /// Whether a timer of this kind is pending
    #[must_use]
    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.slot(kind).is_some()
    }

    /// Accept a fired timer if it is still the current one of its kind.
    ///
    /// One-shot kinds are no longer pending once claimed.
    pub fn claim(&mut self, fired: TimerFired) -> bool {
        let current = self
            .slot(fired.kind)
            .is_some_and(|slot| slot.generation == fired.generation);
        if !current {
            tracing::debug!("Ignoring stale {:?} timer", fired.kind);
            return false;
        }
        if fired.kind != TimerKind::Recheck {
            *self.slot_mut(fired.kind) = None;
        }
        true
    }

    /// Arm the anti-flicker lock
    pub fn arm_lock(&mut self) {
        self.lock_until = Some(Instant::now() + LOCK_DURATION);
    }

    /// Whether the anti-flicker lock is active
    #[must_use]
    pub fn lock_active(&self) -> bool {
        self.lock_until.is_some_and(|until| Instant::now() < until)
    }

    /// Persisted absolute deadline of a timer kind
    #[must_use]
    pub fn persisted_deadline(&self, kind: TimerKind) -> Option<DateTime<Utc>> {
        let key = kind.deadline_key()?;
        let device = self.registry.get(&self.device_id)?;
        let value = device.metric(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(deadline) => Some(deadline),
            Err(e) => {
                tracing::warn!("Ignoring invalid {} on {}: {}", key, self.device_id, e);
                None
            }
        }
    }

    /// Resume persisted deadlines after a restart.
    ///
    /// Deadlines still in the future are rescheduled with the remaining
    /// duration. Kinds whose deadline has passed are returned so the caller
    /// can fire them right away.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Vec<TimerKind> {
        let mut overdue = Vec::new();
        for kind in [TimerKind::Delay, TimerKind::Off] {
            let Some(deadline) = self.persisted_deadline(kind) else {
                continue;
            };
            match (deadline - now).to_std() {
                Ok(remaining) if !remaining.is_zero() => {
                    tracing::info!(
                        "Resuming {:?} timer for {} ({:?} remaining)",
                        kind,
                        self.device_id,
                        remaining
                    );
                    self.spawn_once(kind, remaining);
                }
                _ => {
                    tracing::info!("{:?} deadline for {} passed while stopped", kind, self.device_id);
                    overdue.push(kind);
                }
            }
        }
        overdue
    }

    fn schedule_persisted(&mut self, kind: TimerKind, duration: Duration) {
        self.spawn_once(kind, duration);
        let offset = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.persist_deadline(kind, Some(Utc::now() + offset));
    }

    fn spawn_once(&mut self, kind: TimerKind, duration: Duration) {
        self.cancel_slot(kind);
        let generation = self.next_generation();
        let fired_tx = self.fired_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = fired_tx.send(TimerFired { kind, generation });
        });

        *self.slot_mut(kind) = Some(Slot { handle, generation });
        tracing::debug!("Scheduled {:?} timer in {:?} for {}", kind, duration, self.device_id);
    }

    fn cancel_slot(&mut self, kind: TimerKind) {
        if let Some(slot) = self.slot_mut(kind).take() {
            slot.handle.abort();
            tracing::debug!("Cancelled {:?} timer for {}", kind, self.device_id);
        }
    }

    fn persist_deadline(&self, kind: TimerKind, deadline: Option<DateTime<Utc>>) {
        let Some(key) = kind.deadline_key() else {
            return;
        };
        let value = match deadline {
            Some(deadline) => serde_json::to_value(deadline).unwrap_or_default(),
            None => serde_json::Value::Null,
        };
        if let Err(e) = self.registry.set_metric(&self.device_id, key, value) {
            tracing::warn!("Failed to persist {}: {}", key, e);
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn slot(&self, kind: TimerKind) -> Option<&Slot> {
        match kind {
            TimerKind::Delay => self.delay.as_ref(),
            TimerKind::Off => self.off.as_ref(),
            TimerKind::Recheck => self.recheck.as_ref(),
            TimerKind::Retrigger => self.retrigger.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: TimerKind) -> &mut Option<Slot> {
        match kind {
            TimerKind::Delay => &mut self.delay,
            TimerKind::Off => &mut self.off,
            TimerKind::Recheck => &mut self.recheck,
            TimerKind::Retrigger => &mut self.retrigger,
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        for slot in [&self.delay, &self.off, &self.recheck, &self.retrigger]
            .into_iter()
            .flatten()
        {
            slot.handle.abort();
        }
    }
}
