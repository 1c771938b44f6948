//! Running rule: one task driving a [`TriggerStateMachine`]

use crate::config::RuleConfig;
use crate::error::LightMotionError;
use crate::machine::TriggerStateMachine;
use crate::ports::{DeviceRegistry, EventBus};
use crate::timers::TimerFired;
use chrono::Utc;
use device_registry::DeviceId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};

/// A started motion lighting rule.
///
/// The rule owns a task that serializes every input (device changes, bus
/// events, timers, polling) into its state machine. Dropping the handle
/// aborts the task without touching persisted state; call
/// [`LightMotionRule::stop`] to cancel timers and release the controller
/// device.
pub struct LightMotionRule {
    id: String,
    device_id: DeviceId,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LightMotionRule {
    /// Validate the configuration, create the controller device and start
    /// the rule task. Subscriptions begin after the configured startup delay.
    pub fn start(
        config: RuleConfig,
        registry: Arc<dyn DeviceRegistry>,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self, LightMotionError> {
        let id = config.id.clone();
        let device_id = config.device_id();
        let startup_delay = config.startup_delay();
        let poll_period = config.poll_sensors.map(Duration::from_secs);

        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let machine = TriggerStateMachine::new(config, registry.clone(), bus.clone(), fired_tx)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(RuleTask {
            machine,
            registry,
            bus,
            fired_rx,
            shutdown_rx,
            startup_delay,
            poll_period,
        }));

        tracing::info!("Started rule {}", id);
        Ok(Self {
            id,
            device_id,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Rule id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the controller device
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the rule task is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the rule and wait for its teardown. Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Err(e) = task.await {
            tracing::warn!("Rule {} task ended abnormally: {}", self.id, e);
        }
    }
}

impl Drop for LightMotionRule {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

struct RuleTask {
    machine: TriggerStateMachine,
    registry: Arc<dyn DeviceRegistry>,
    bus: Arc<dyn EventBus>,
    fired_rx: mpsc::UnboundedReceiver<TimerFired>,
    shutdown_rx: oneshot::Receiver<()>,
    startup_delay: Duration,
    poll_period: Option<Duration>,
}

async fn run(task: RuleTask) {
    let RuleTask {
        mut machine,
        registry,
        bus,
        mut fired_rx,
        mut shutdown_rx,
        startup_delay,
        poll_period,
    } = task;

    // Let the device backends settle before listening
    tokio::select! {
        () = tokio::time::sleep(startup_delay) => {}
        stopped = &mut shutdown_rx => {
            // A dropped handle leaves persisted state for the next start
            if stopped.is_ok() {
                machine.shutdown();
            }
            return;
        }
    }

    let mut registry_rx = registry.subscribe();
    let mut bus_rx = bus.subscribe();
    machine.resume(Utc::now());

    let mut poll_interval =
        poll_period.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            stopped = &mut shutdown_rx => {
                if stopped.is_err() {
                    return;
                }
                break;
            }
            Some(fired) = fired_rx.recv() => machine.on_timer(fired),
            event = registry_rx.recv() => match event {
                Ok(event) => machine.on_registry_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Rule {} lagged by {} device events", machine.config().id, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Device event channel closed");
                    break;
                }
            },
            event = bus_rx.recv() => match event {
                Ok(event) => machine.handle_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Rule {} lagged by {} bus events", machine.config().id, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed");
                    break;
                }
            },
            () = poll_tick(&mut poll_interval) => machine.handle_poll(),
        }
    }

    drop(registry_rx);
    drop(bus_rx);
    drop(poll_interval);
    machine.shutdown();
}

async fn poll_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
