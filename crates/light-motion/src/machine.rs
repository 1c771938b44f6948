//! Trigger state machine deciding when a rule's lights go on and off

use crate::commander::OutputCommander;
use crate::config::RuleConfig;
use crate::dimmer::DimmerCalculator;
use crate::error::LightMotionError;
use crate::ports::{DeviceRegistry, EventBus};
use crate::precondition::PreconditionEvaluator;
use crate::query::DeviceQuery;
use crate::timers::{TimerFired, TimerKind, TimerSet};
use chrono::{DateTime, Local, Utc};
use device_registry::{
    BusEvent, Device, DeviceCommand, DeviceId, DeviceKind, Level, RegistryEvent,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Event emitted when a rule switches its lights on
pub const LIGHT_ON_EVENT: &str = "light.on";
/// Event emitted when a rule switches its lights off
pub const LIGHT_OFF_EVENT: &str = "light.off";
/// Debounce before reacting to another rule's activation
pub const RETRIGGER_DELAY: Duration = Duration::from_secs(1);

/// Binary switch mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    On,
    Off,
}

impl From<bool> for Mode {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => f.write_str("on"),
            Self::Off => f.write_str("off"),
        }
    }
}

/// Where a rule is in its activation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    /// Not triggered, nothing pending
    Idle,
    /// Motion seen, waiting for the activation delay
    Delaying,
    /// Lights switched on by the rule
    Triggered,
    /// Motion stopped, waiting for the off timeout
    Cooling,
}

/// Visual state of the controller device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Icon {
    On,
    Off,
    Triggered,
    Pending,
}

/// Payload of `light.on` / `light.off` events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightNotice {
    pub rule_id: String,
    pub mode: Mode,
    /// Controller device of the emitting rule
    pub device_id: DeviceId,
    #[serde(default)]
    pub location: Option<String>,
}

/// The decision core of one rule.
///
/// All methods take `&mut self`; the owner is responsible for calling them
/// one at a time. Timers report back through the channel given to
/// [`TriggerStateMachine::new`] and must be fed to [`TriggerStateMachine::on_timer`].
pub struct TriggerStateMachine {
    config: RuleConfig,
    /// Controller device owned by this rule
    device_id: DeviceId,
    registry: Arc<dyn DeviceRegistry>,
    bus: Arc<dyn EventBus>,
    query: DeviceQuery,
    evaluator: PreconditionEvaluator,
    dimmer: DimmerCalculator,
    commander: OutputCommander,
    timers: TimerSet,
    triggered: bool,
    /// Device whose event scheduled the pending retrigger
    retrigger_source: Option<DeviceId>,
}

impl TriggerStateMachine {
    /// Create the state machine and its controller device
    pub fn new(
        config: RuleConfig,
        registry: Arc<dyn DeviceRegistry>,
        bus: Arc<dyn EventBus>,
        fired_tx: mpsc::UnboundedSender<TimerFired>,
    ) -> Result<Self, LightMotionError> {
        config.validate()?;

        let query = DeviceQuery::new(registry.clone());
        let dimmer = DimmerCalculator::new(config.dimmer.clone(), query.clone())?;
        let device_id = config.device_id();

        let mut controller =
            Device::new(device_id.clone(), DeviceKind::SwitchBinary, Level::on())
                .with_owner(config.id.clone());
        controller.title = config.title.clone();
        controller.location = config.location.clone();
        let controller = registry.create(controller);

        let machine = Self {
            evaluator: PreconditionEvaluator::new(query.clone()),
            commander: OutputCommander::new(registry.clone()),
            timers: TimerSet::new(registry.clone(), device_id.clone(), fired_tx),
            device_id,
            registry,
            bus,
            query,
            dimmer,
            config,
            triggered: false,
            retrigger_source: None,
        };
        if controller.metric("icon").is_none() {
            machine.set_icon(machine.master_icon());
        }

        tracing::info!("Created rule {} ({})", machine.config.id, machine.device_id);
        Ok(machine)
    }

    /// Rule configuration
    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Id of the controller device
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether lights are currently on because of this rule
    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Whether the controller switch is on
    pub fn master_on(&self) -> bool {
        self.registry
            .get(&self.device_id)
            .is_some_and(|device| device.level.is_on())
    }

    /// Timers of this rule
    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    /// Current state of the activation cycle
    pub fn state(&self) -> RuleState {
        let delaying = self.timers.is_pending(TimerKind::Delay);
        let cooling = self.timers.is_pending(TimerKind::Off);
        debug_assert!(!(delaying && cooling), "delay and off timers both pending");

        match (self.triggered, delaying, cooling) {
            (true, _, true) => RuleState::Cooling,
            (true, _, false) => RuleState::Triggered,
            (false, true, _) => RuleState::Delaying,
            (false, false, _) => RuleState::Idle,
        }
    }

    /// React to a sensor change (or a synthetic activation)
    pub fn handle_change(&mut self, mode: Mode, source: Option<&str>) {
        let source = source.unwrap_or("controller");
        if !self.master_on() {
            tracing::debug!("Rule {} is off, ignoring {} from {}", self.config.id, mode, source);
            return;
        }

        let sensors_active = self.query.any_active(&self.config.security_sensors);

        match (sensors_active, mode) {
            (true, Mode::On) => {
                let lights_on = self.query.any_active(self.config.status_lights());
                let precondition_ok = self
                    .evaluator
                    .evaluate(&self.config.preconditions, Local::now().naive_local());

                if precondition_ok && !lights_on {
                    self.timers.cancel_off();
                    if self.config.delay > 0 {
                        if self.timers.is_pending(TimerKind::Delay) {
                            tracing::debug!("Rule {} already delaying", self.config.id);
                        } else {
                            tracing::info!(
                                "Rule {} triggered by {}, switching on in {}s",
                                self.config.id,
                                source,
                                self.config.delay
                            );
                            self.timers.schedule_delay(self.config.delay());
                        }
                    } else {
                        tracing::info!("Rule {} triggered by {}", self.config.id, source);
                        self.switch_device(true);
                    }
                } else if self.triggered && (!self.config.recheck || precondition_ok) {
                    tracing::debug!("Rule {} retriggered by {}", self.config.id, source);
                    self.timers.cancel_off();
                    self.set_icon(Icon::Triggered);
                    if self.config.recheck && !self.timers.is_pending(TimerKind::Recheck) {
                        self.timers.start_recheck(self.config.recheck_period());
                    }
                } else {
                    tracing::debug!(
                        "Rule {} not triggering (preconditions: {}, lights on: {})",
                        self.config.id,
                        precondition_ok,
                        lights_on
                    );
                }
            }
            (false, Mode::Off) if self.triggered => {
                if self.timers.is_pending(TimerKind::Off) {
                    tracing::debug!("Rule {} already counting down", self.config.id);
                } else {
                    self.untrigger_device();
                }
            }
            (false, Mode::Off) => {
                if self.timers.is_pending(TimerKind::Delay) {
                    tracing::info!("Rule {} motion stopped before delay elapsed", self.config.id);
                }
                self.timers.cancel_delay();
            }
            _ => {
                tracing::debug!(
                    "Rule {} ignoring {} from {} (sensors active: {})",
                    self.config.id,
                    mode,
                    source,
                    sensors_active
                );
            }
        }
    }

    /// Motion ended: start the off timeout or switch off right away
    pub fn untrigger_device(&mut self) {
        self.timers.cancel_recheck();
        self.timers.cancel_delay();
        self.timers.cancel_off();

        if self.config.duration > 0 {
            tracing::info!(
                "Rule {} untriggered, switching off in {}s",
                self.config.id,
                self.config.duration
            );
            self.timers.schedule_off(self.config.duration());
            self.set_icon(Icon::Pending);
        } else {
            self.switch_device(false);
        }
    }

    /// Switch the rule's lights on or off
    ///
    /// A computed level of 0 does not count as switching on: the lights are
    /// left as they are and the rule stays untriggered.
    pub fn switch_device(&mut self, mode: bool) {
        let level = if mode {
            self.dimmer.compute(Local::now().naive_local())
        } else {
            0
        };
        if mode && level == 0 {
            tracing::info!("Rule {} dimmer level is 0, leaving lights off", self.config.id);
            self.timers.cancel_delay();
            return;
        }

        if mode {
            self.set_icon(Icon::Triggered);
            self.timers.arm_lock();
            if self.config.recheck {
                self.timers.start_recheck(self.config.recheck_period());
            }
        } else {
            self.timers.cancel_recheck();
            self.set_icon(self.master_icon());
        }

        self.timers.cancel_delay();
        self.timers.cancel_off();
        self.set_triggered(mode);

        tracing::info!(
            "Rule {} switching lights {} (level {})",
            self.config.id,
            Mode::from(mode),
            level
        );
        self.commander.apply(&self.config.lights, mode, level);
        self.emit(Mode::from(mode));
    }

    /// Periodic recheck of the preconditions while triggered
    pub fn handle_check(&mut self) {
        if !self.triggered || self.timers.is_pending(TimerKind::Off) {
            return;
        }
        let precondition_ok = self
            .evaluator
            .evaluate(&self.config.preconditions, Local::now().naive_local());
        if !precondition_ok {
            tracing::info!("Rule {} preconditions no longer met", self.config.id);
            self.untrigger_device();
        }
    }

    /// A light changed; notice lights switched off by someone else
    pub fn handle_light(&mut self, light: &str) {
        if self.query.any_active(&self.config.lights) {
            return;
        }

        self.timers.cancel_delay();
        if !self.triggered {
            return;
        }
        if self.timers.lock_active() {
            tracing::debug!("Ignoring {} switching off during lock", light);
            return;
        }

        tracing::info!(
            "Lights of rule {} were switched off externally ({})",
            self.config.id,
            light
        );
        self.switch_device(false);
    }

    /// Another rule switched its lights; retrigger if it shares our location
    pub fn handle_event(&mut self, event: &BusEvent) {
        if event.event_type != LIGHT_ON_EVENT || event.origin == self.device_id {
            return;
        }
        let notice: LightNotice = match serde_json::from_value(event.data.clone()) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::debug!("Ignoring malformed {} event: {}", event.event_type, e);
                return;
            }
        };
        if notice.rule_id == self.config.id {
            return;
        }

        let Some(location) = &self.config.location else {
            return;
        };
        let origin_location = self
            .registry
            .get(&notice.device_id)
            .and_then(|device| device.location)
            .or(notice.location);
        if origin_location.as_deref() != Some(location.as_str()) {
            return;
        }

        tracing::debug!(
            "Rule {} retriggering after {} from {}",
            self.config.id,
            event.event_type,
            notice.rule_id
        );
        self.retrigger_source = Some(notice.device_id);
        self.timers.schedule_retrigger(RETRIGGER_DELAY);
    }

    /// Ask the sensors to refresh their state while triggered
    pub fn handle_poll(&mut self) {
        if !self.triggered || !self.master_on() {
            return;
        }
        for sensor in &self.config.security_sensors {
            if let Err(e) = self.registry.send_command(sensor, DeviceCommand::Update) {
                tracing::warn!("Failed to poll {}: {}", sensor, e);
            }
        }
    }

    /// Command sent to the controller device
    pub fn handle_command(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::On => {
                tracing::info!("Rule {} switched on", self.config.id);
                self.set_master(true);
                self.set_icon(if self.triggered { Icon::Triggered } else { Icon::On });
                self.handle_change(Mode::On, None);
            }
            DeviceCommand::Off => {
                tracing::info!("Rule {} switched off", self.config.id);
                self.set_master(false);
                if self.triggered {
                    self.switch_device(false);
                }
                self.timers.cancel_all();
                self.set_icon(Icon::Off);
            }
            other => {
                tracing::debug!("Rule {} ignoring command {:?}", self.config.id, other);
            }
        }
    }

    /// Route a registry event to the matching handler
    pub fn on_registry_event(&mut self, event: &RegistryEvent) {
        match event {
            RegistryEvent::LevelChanged { device_id, .. } => {
                if self.config.security_sensors.contains(device_id) {
                    let mode = Mode::from(self.query.is_active(device_id));
                    self.handle_change(mode, Some(device_id.as_str()));
                }
                if self.config.lights.contains(device_id) {
                    self.handle_light(device_id);
                }
            }
            RegistryEvent::CommandSent { device_id, command } if *device_id == self.device_id => {
                self.handle_command(*command);
            }
            _ => {}
        }
    }

    /// Act on a fired timer
    pub fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.claim(fired) {
            return;
        }
        match fired.kind {
            TimerKind::Delay => {
                tracing::debug!("Rule {} delay elapsed", self.config.id);
                self.switch_device(true);
            }
            TimerKind::Off => {
                tracing::debug!("Rule {} off timeout elapsed", self.config.id);
                self.switch_device(false);
            }
            TimerKind::Recheck => self.handle_check(),
            TimerKind::Retrigger => {
                let source = self.retrigger_source.take();
                self.handle_change(Mode::On, source.as_deref());
            }
        }
    }

    /// Restore persisted state after a restart
    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.triggered = self
            .registry
            .get(&self.device_id)
            .and_then(|device| device.metric("triggered").and_then(serde_json::Value::as_bool))
            .unwrap_or(false);

        if !self.master_on() {
            if self.triggered {
                self.switch_device(false);
            }
            self.timers.cancel_all();
            return;
        }

        let overdue = self.timers.resume(now);
        if self.triggered && self.config.recheck && !self.timers.is_pending(TimerKind::Off) {
            self.timers.start_recheck(self.config.recheck_period());
        }
        tracing::info!(
            "Rule {} resumed in state {:?}",
            self.config.id,
            self.state()
        );

        for kind in overdue {
            match kind {
                TimerKind::Delay => self.switch_device(true),
                TimerKind::Off => self.switch_device(false),
                TimerKind::Recheck | TimerKind::Retrigger => {}
            }
        }
    }

    /// Cancel all timers and release the controller device
    pub fn shutdown(&mut self) {
        self.timers.cancel_all();
        self.registry.remove(&self.device_id);
        tracing::info!("Stopped rule {}", self.config.id);
    }

    fn master_icon(&self) -> Icon {
        if self.master_on() {
            Icon::On
        } else {
            Icon::Off
        }
    }

    fn set_master(&self, on: bool) {
        let level = if on { Level::on() } else { Level::off() };
        if let Err(e) = self.registry.set_level(&self.device_id, level, true) {
            tracing::warn!("Failed to update {}: {}", self.device_id, e);
        }
    }

    fn set_icon(&self, icon: Icon) {
        self.set_metric("icon", serde_json::json!(icon));
    }

    fn set_triggered(&mut self, triggered: bool) {
        self.triggered = triggered;
        self.set_metric("triggered", serde_json::json!(triggered));
    }

    fn set_metric(&self, key: &str, value: serde_json::Value) {
        if let Err(e) = self.registry.set_metric(&self.device_id, key, value) {
            tracing::warn!("Failed to store {} on {}: {}", key, self.device_id, e);
        }
    }

    fn emit(&self, mode: Mode) {
        let notice = LightNotice {
            rule_id: self.config.id.clone(),
            mode,
            device_id: self.device_id.clone(),
            location: self.config.location.clone(),
        };
        let event_type = match mode {
            Mode::On => LIGHT_ON_EVENT,
            Mode::Off => LIGHT_OFF_EVENT,
        };
        match serde_json::to_value(&notice) {
            Ok(data) => self
                .bus
                .emit(BusEvent::new(event_type, self.device_id.clone(), data)),
            Err(e) => tracing::warn!("Failed to encode {}: {}", event_type, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BinaryCheck, DimmerConfig};
    use crate::timers::LOCK_DURATION;
    use device_registry::{InMemoryRegistry, InProcessBus};
    use tokio::time::Instant;

    const CONTROLLER: &str = "LightMotion_hall";

    struct Harness {
        registry: Arc<InMemoryRegistry>,
        bus: Arc<InProcessBus>,
        machine: TriggerStateMachine,
        fired_rx: mpsc::UnboundedReceiver<TimerFired>,
    }

    impl Harness {
        fn new(config: RuleConfig) -> Self {
            Self::with_registry(devices(), config)
        }

        fn with_registry(registry: Arc<InMemoryRegistry>, config: RuleConfig) -> Self {
            let bus = Arc::new(InProcessBus::default());
            let (fired_tx, fired_rx) = mpsc::unbounded_channel();
            let machine =
                TriggerStateMachine::new(config, registry.clone(), bus.clone(), fired_tx).unwrap();
            Self {
                registry,
                bus,
                machine,
                fired_rx,
            }
        }

        fn motion(&mut self, on: bool) {
            let level = if on { Level::on() } else { Level::off() };
            self.registry.set_level("motion", level, false).unwrap();
            self.machine.handle_change(Mode::from(on), Some("motion"));
        }

        fn level(&self, id: &str) -> Level {
            self.registry.get(id).unwrap().level
        }

        fn controller_metric(&self, key: &str) -> Option<serde_json::Value> {
            self.registry.get(CONTROLLER)?.metric(key).cloned()
        }

        async fn fire_next(&mut self) -> TimerFired {
            let fired = self.fired_rx.recv().await.unwrap();
            self.machine.on_timer(fired);
            fired
        }
    }

    fn devices() -> Arc<InMemoryRegistry> {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.upsert(Device::new("motion", DeviceKind::SensorBinary, Level::off()));
        registry.upsert(Device::new("lamp", DeviceKind::SwitchMultilevel, Level::from(0u8)));
        registry.upsert(Device::new("spot", DeviceKind::SwitchBinary, Level::off()));
        registry.upsert(Device::new("alarm", DeviceKind::SwitchBinary, Level::off()));
        registry
    }

    fn config() -> RuleConfig {
        let mut config = RuleConfig::new(
            "hall",
            vec!["motion".into()],
            vec!["lamp".into(), "spot".into()],
        );
        config.location = Some("hallway".into());
        config
    }

    fn assert_elapsed(started: Instant, expected: Duration) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    fn notice_from(rule_id: &str, location: &str) -> BusEvent {
        let device_id = format!("LightMotion_{rule_id}");
        let notice = LightNotice {
            rule_id: rule_id.into(),
            mode: Mode::On,
            device_id: device_id.clone(),
            location: Some(location.into()),
        };
        BusEvent::new(LIGHT_ON_EVENT, device_id, serde_json::to_value(notice).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_without_delay() {
        let mut h = Harness::new(config());
        let mut events = h.bus.subscribe();

        h.motion(true);

        assert_eq!(h.machine.device_id(), CONTROLLER);
        assert!(h.machine.is_triggered());
        assert_eq!(h.machine.state(), RuleState::Triggered);
        assert_eq!(h.level("lamp"), Level::from(99u8));
        assert!(h.level("spot").is_on());
        assert_eq!(h.controller_metric("triggered"), Some(serde_json::json!(true)));
        assert_eq!(h.controller_metric("icon"), Some(serde_json::json!("triggered")));

        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type, LIGHT_ON_EVENT);
        let notice: LightNotice = serde_json::from_value(event.data).unwrap();
        assert_eq!(notice.rule_id, "hall");
        assert_eq!(notice.device_id, CONTROLLER);
        assert_eq!(notice.location.as_deref(), Some("hallway"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_off_ignores_motion() {
        let mut h = Harness::new(config());
        h.machine.handle_command(DeviceCommand::Off);
        assert!(!h.machine.master_on());

        h.motion(true);
        h.motion(false);
        h.motion(true);

        assert!(!h.machine.is_triggered());
        assert_eq!(h.machine.state(), RuleState::Idle);
        assert_eq!(h.level("lamp"), Level::from(0u8));
        assert_eq!(h.controller_metric("icon"), Some(serde_json::json!("off")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_off_switches_lights_off() {
        let mut h = Harness::new(config());
        h.motion(true);

        h.machine.handle_command(DeviceCommand::Off);

        assert!(!h.machine.is_triggered());
        assert_eq!(h.level("lamp"), Level::from(0u8));
        assert!(!h.level("spot").is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_on_reevaluates() {
        let mut h = Harness::new(config());
        h.machine.handle_command(DeviceCommand::Off);
        h.motion(true);
        assert!(!h.machine.is_triggered());

        h.machine.handle_command(DeviceCommand::On);

        assert!(h.machine.master_on());
        assert!(h.machine.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_not_restarted() {
        let mut config = config();
        config.delay = 10;
        let mut h = Harness::new(config);
        let started = Instant::now();

        h.motion(true);
        assert_eq!(h.machine.state(), RuleState::Delaying);
        assert_eq!(h.level("lamp"), Level::from(0u8));
        assert!(h.controller_metric("delay_deadline").is_some());

        tokio::time::sleep(Duration::from_secs(4)).await;
        h.motion(true);

        let fired = h.fire_next().await;
        assert_eq!(fired.kind, TimerKind::Delay);
        assert_elapsed(started, Duration::from_secs(10));
        assert!(h.machine.is_triggered());
        assert_eq!(h.level("lamp"), Level::from(99u8));
        assert!(h.controller_metric("delay_deadline").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_stop_cancels_delay() {
        let mut config = config();
        config.delay = 10;
        let mut h = Harness::new(config);

        h.motion(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.motion(false);

        assert_eq!(h.machine.state(), RuleState::Idle);
        assert!(h.controller_metric("delay_deadline").is_none());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.fired_rx.try_recv().is_err());
        assert_eq!(h.level("lamp"), Level::from(0u8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_light_off_cancels_pending_delay() {
        let mut config = config();
        config.delay = 10;
        let mut h = Harness::new(config);
        h.motion(true);
        assert_eq!(h.machine.state(), RuleState::Delaying);

        h.machine.handle_light("lamp");

        assert_eq!(h.machine.state(), RuleState::Idle);
        assert!(h.controller_metric("delay_deadline").is_none());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(h.fired_rx.try_recv().is_err());
        assert_eq!(h.level("lamp"), Level::from(0u8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_ignored_while_cooling() {
        let mut config = config();
        config.recheck = true;
        config.duration = 60;
        config.preconditions.binary.push(BinaryCheck {
            device: "alarm".into(),
            value: "off".into(),
        });
        let mut h = Harness::new(config);
        h.motion(true);
        let started = Instant::now();
        h.motion(false);
        let deadline = h.controller_metric("off_deadline");
        assert!(deadline.is_some());

        h.registry.set_level("alarm", Level::on(), false).unwrap();
        h.machine.handle_check();

        assert_eq!(h.machine.state(), RuleState::Cooling);
        assert_eq!(h.controller_metric("off_deadline"), deadline);
        assert_eq!(h.level("lamp"), Level::from(99u8));

        let fired = h.fire_next().await;
        assert_eq!(fired.kind, TimerKind::Off);
        assert_elapsed(started, Duration::from_secs(60));
        assert!(!h.machine.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_while_cooling_restarts_recheck() {
        let mut config = config();
        config.recheck = true;
        config.duration = 60;
        let mut h = Harness::new(config);
        h.motion(true);
        h.motion(false);
        assert!(!h.machine.timers().is_pending(TimerKind::Recheck));

        h.motion(true);

        assert_eq!(h.machine.state(), RuleState::Triggered);
        assert!(h.machine.timers().is_pending(TimerKind::Recheck));
        assert_eq!(h.controller_metric("icon"), Some(serde_json::json!("triggered")));
        let fired = h.fire_next().await;
        assert_eq!(fired.kind, TimerKind::Recheck);
        assert!(h.machine.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_dimmer_level_does_not_trigger() {
        let registry = devices();
        registry.upsert(Device::new("lux", DeviceKind::SensorMultilevel, Level::from(0.0)));
        let mut config = config();
        config.dimmer = DimmerConfig::Luminosity {
            sensor: "lux".into(),
            luminosity_min: 0.0,
            luminosity_max: 100.0,
            level_min: 0,
            level_max: 99,
        };
        let mut h = Harness::with_registry(registry, config);
        let mut events = h.bus.subscribe();

        h.motion(true);
        h.motion(true);

        assert!(!h.machine.is_triggered());
        assert_eq!(h.machine.state(), RuleState::Idle);
        assert_eq!(h.level("lamp"), Level::from(0u8));
        assert!(!h.level("spot").is_on());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_timer_after_motion_stops() {
        let mut config = config();
        config.duration = 60;
        let mut h = Harness::new(config);
        h.motion(true);
        let started = Instant::now();

        h.motion(false);
        assert_eq!(h.machine.state(), RuleState::Cooling);
        assert_eq!(h.controller_metric("icon"), Some(serde_json::json!("pending")));
        assert!(h.controller_metric("off_deadline").is_some());
        assert_eq!(h.level("lamp"), Level::from(99u8));

        let fired = h.fire_next().await;
        assert_eq!(fired.kind, TimerKind::Off);
        assert_elapsed(started, Duration::from_secs(60));
        assert_eq!(h.machine.state(), RuleState::Idle);
        assert_eq!(h.level("lamp"), Level::from(0u8));
        assert_eq!(h.controller_metric("icon"), Some(serde_json::json!("on")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_while_cooling_keeps_lights_on() {
        let mut config = config();
        config.duration = 60;
        let mut h = Harness::new(config);
        h.motion(true);
        h.motion(false);

        tokio::time::sleep(Duration::from_secs(30)).await;
        h.motion(true);

        assert_eq!(h.machine.state(), RuleState::Triggered);
        assert!(h.controller_metric("off_deadline").is_none());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.fired_rx.try_recv().is_err());
        assert_eq!(h.level("lamp"), Level::from(99u8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_light_on_blocks_trigger() {
        let registry = devices();
        registry.upsert(Device::new("ceiling", DeviceKind::SwitchBinary, Level::on()));
        let mut config = config();
        config.extra_lights = vec!["ceiling".into()];
        let mut h = Harness::with_registry(registry, config);

        h.motion(true);

        assert!(!h.machine.is_triggered());
        assert_eq!(h.level("lamp"), Level::from(0u8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_precondition_blocks_trigger() {
        let mut config = config();
        config.preconditions.binary.push(BinaryCheck {
            device: "alarm".into(),
            value: "on".into(),
        });
        let mut h = Harness::new(config);

        h.motion(true);

        assert!(!h.machine.is_triggered());
        assert_eq!(h.machine.state(), RuleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_untriggers_when_preconditions_fail() {
        let mut config = config();
        config.recheck = true;
        config.preconditions.binary.push(BinaryCheck {
            device: "alarm".into(),
            value: "off".into(),
        });
        let mut h = Harness::new(config);
        h.motion(true);
        assert!(h.machine.timers().is_pending(TimerKind::Recheck));

        let fired = h.fire_next().await;
        assert_eq!(fired.kind, TimerKind::Recheck);
        assert!(h.machine.is_triggered());

        h.registry.set_level("alarm", Level::on(), false).unwrap();
        h.fire_next().await;

        assert!(!h.machine.is_triggered());
        assert_eq!(h.level("lamp"), Level::from(0u8));
        assert!(!h.machine.timers().is_pending(TimerKind::Recheck));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_off_ignored_during_lock() {
        let mut h = Harness::new(config());
        h.motion(true);

        h.registry.set_level("lamp", Level::from(0u8), false).unwrap();
        h.registry.set_level("spot", Level::off(), false).unwrap();
        h.machine.handle_light("lamp");
        assert!(h.machine.is_triggered());

        tokio::time::sleep(LOCK_DURATION).await;
        h.machine.handle_light("lamp");
        assert!(!h.machine.is_triggered());
        assert_eq!(h.controller_metric("triggered"), Some(serde_json::json!(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_external_off_keeps_trigger() {
        let mut h = Harness::new(config());
        h.motion(true);
        tokio::time::sleep(LOCK_DURATION).await;

        h.registry.set_level("lamp", Level::from(0u8), false).unwrap();
        h.machine.handle_light("lamp");

        assert!(h.machine.is_triggered());
    }

    fn restored(metrics: &[(&str, serde_json::Value)], master: Level) -> Arc<InMemoryRegistry> {
        let registry = devices();
        registry.set_level("lamp", Level::from(99u8), false).unwrap();
        let mut controller =
            Device::new(CONTROLLER, DeviceKind::SwitchBinary, master).with_owner("hall");
        for (key, value) in metrics {
            controller.metrics.insert((*key).to_string(), value.clone());
        }
        registry.upsert(controller);
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_future_off_deadline() {
        let now = Utc::now();
        let registry = restored(
            &[
                ("triggered", serde_json::json!(true)),
                (
                    "off_deadline",
                    serde_json::to_value(now + chrono::Duration::seconds(5)).unwrap(),
                ),
            ],
            Level::on(),
        );
        let mut config = config();
        config.duration = 60;
        let mut h = Harness::with_registry(registry, config);
        let started = Instant::now();

        h.machine.resume(now + chrono::Duration::seconds(2));
        assert_eq!(h.machine.state(), RuleState::Cooling);
        assert_eq!(h.level("lamp"), Level::from(99u8));

        let fired = h.fire_next().await;
        assert_eq!(fired.kind, TimerKind::Off);
        assert_elapsed(started, Duration::from_secs(3));
        assert!(!h.machine.is_triggered());
        assert_eq!(h.level("lamp"), Level::from(0u8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_past_off_deadline() {
        let now = Utc::now();
        let registry = restored(
            &[
                ("triggered", serde_json::json!(true)),
                (
                    "off_deadline",
                    serde_json::to_value(now - chrono::Duration::seconds(1)).unwrap(),
                ),
            ],
            Level::on(),
        );
        let mut h = Harness::with_registry(registry, config());

        h.machine.resume(now);

        assert!(!h.machine.is_triggered());
        assert_eq!(h.machine.state(), RuleState::Idle);
        assert_eq!(h.level("lamp"), Level::from(0u8));
        assert!(h.controller_metric("off_deadline").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_with_master_off() {
        let registry = restored(&[("triggered", serde_json::json!(true))], Level::off());
        let mut h = Harness::with_registry(registry, config());

        h.machine.resume(Utc::now());

        assert!(!h.machine.is_triggered());
        assert_eq!(h.level("lamp"), Level::from(0u8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_from_same_location() {
        let mut h = Harness::new(config());
        h.registry.set_level("motion", Level::on(), false).unwrap();
        let started = Instant::now();

        h.machine.handle_event(&notice_from("kitchen", "hallway"));
        assert!(h.machine.timers().is_pending(TimerKind::Retrigger));

        let fired = h.fire_next().await;
        assert_eq!(fired.kind, TimerKind::Retrigger);
        assert_elapsed(started, RETRIGGER_DELAY);
        assert!(h.machine.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_ignores_unrelated_events() {
        let mut h = Harness::new(config());

        h.machine.handle_event(&notice_from("garage", "driveway"));
        h.machine.handle_event(&notice_from("hall", "hallway"));
        let mut off = notice_from("kitchen", "hallway");
        off.event_type = LIGHT_OFF_EVENT.to_string();
        h.machine.handle_event(&off);
        h.machine.handle_event(&BusEvent::new(
            LIGHT_ON_EVENT,
            "somewhere",
            serde_json::json!({"unexpected": true}),
        ));

        assert!(!h.machine.timers().is_pending(TimerKind::Retrigger));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_only_while_triggered() {
        let mut h = Harness::new(config());
        let mut rx = h.registry.subscribe();
        h.machine.handle_poll();
        assert!(rx.try_recv().is_err());

        h.motion(true);
        let mut rx = h.registry.subscribe();
        h.machine.handle_poll();

        match rx.try_recv().unwrap() {
            RegistryEvent::CommandSent { device_id, command } => {
                assert_eq!(device_id, "motion");
                assert_eq!(command, DeviceCommand::Update);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_events_are_routed() {
        let mut h = Harness::new(config());
        h.registry.set_level("motion", Level::on(), false).unwrap();

        h.machine.on_registry_event(&RegistryEvent::LevelChanged {
            device_id: "motion".into(),
            level: Level::on(),
        });
        assert!(h.machine.is_triggered());

        h.machine.on_registry_event(&RegistryEvent::CommandSent {
            device_id: CONTROLLER.into(),
            command: DeviceCommand::Off,
        });
        assert!(!h.machine.master_on());
        assert!(!h.machine.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_controller() {
        let mut config = config();
        config.duration = 60;
        let mut h = Harness::new(config);
        h.motion(true);
        h.motion(false);

        h.machine.shutdown();

        assert!(h.registry.get(CONTROLLER).is_none());
        assert!(!h.machine.timers().is_pending(TimerKind::Off));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.fired_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config.lights.clear();
        let (fired_tx, _fired_rx) = mpsc::unbounded_channel();
        let result = TriggerStateMachine::new(
            config,
            devices(),
            Arc::new(InProcessBus::default()),
            fired_tx,
        );
        assert!(matches!(result, Err(LightMotionError::InvalidConfig(_))));
    }
}
