//! In-process event bus backed by a tokio broadcast channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Unique event id
    pub id: uuid::Uuid,
    /// Event name (e.g. "light.on")
    pub event_type: String,
    /// Identifier of the emitter
    pub origin: String,
    /// Event payload
    pub data: serde_json::Value,
    /// When the event was fired
    pub time_fired: DateTime<Utc>,
}

impl BusEvent {
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        origin: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            event_type: event_type.into(),
            origin: origin.into(),
            data,
            time_fired: Utc::now(),
        }
    }
}

/// Event bus delivering every event to every current subscriber.
///
/// Emitting succeeds even when there are no active subscribers
/// (the event is simply dropped).
pub struct InProcessBus {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl InProcessBus {
    /// Create a new bus with the given channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events emitted after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: BusEvent) {
        tracing::debug!("Emitting {} from {}", event.event_type, event.origin);
        let _ = self.sender.send(event);
    }
}
