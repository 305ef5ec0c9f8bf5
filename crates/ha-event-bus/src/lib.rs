//! Event bus with typed pub/sub for Home Assistant
//!
//! The EventBus is the process-wide message broker. The config entry hub
//! uses it to announce lifecycle milestones (started, stopping) and
//! discovery notifications; anything else in the process can listen.

use dashmap::DashMap;
use ha_core::{Context, Event, EventData, EventType};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// The event bus for publishing and subscribing to events
pub struct EventBus {
    /// Map of event types to their broadcast senders
    listeners: DashMap<EventType, broadcast::Sender<Event<serde_json::Value>>>,
    /// Special sender for MATCH_ALL subscribers
    match_all_sender: broadcast::Sender<Event<serde_json::Value>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            listeners: DashMap::new(),
            match_all_sender,
            capacity,
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe(
        &self,
        event_type: impl Into<EventType>,
    ) -> broadcast::Receiver<Event<serde_json::Value>> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing to event type");

        if event_type.is_match_all() {
            return self.match_all_sender.subscribe();
        }

        self.listeners
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to a typed event, receiving parsed data
    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedEventReceiver<T> {
        TypedEventReceiver::new(self.subscribe(T::event_type()))
    }

    /// Subscribe to all events
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event<serde_json::Value>> {
        self.match_all_sender.subscribe()
    }

    /// Fire an event to the subscribers of its type and to MATCH_ALL subscribers
    pub fn fire(&self, event: Event<serde_json::Value>) {
        debug!(event_type = %event.event_type, "Firing event");

        if let Some(sender) = self.listeners.get(&event.event_type) {
            // Send errors only mean there are no active receivers
            let _ = sender.send(event.clone());
        }

        let _ = self.match_all_sender.send(event);
    }

    /// Fire a typed event
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let data = match serde_json::to_value(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(event_type = T::event_type(), "Dropping unserializable event: {}", err);
                return;
            }
        };
        self.fire(Event::new(T::event_type(), data, context));
    }

    /// Number of event types that have had subscribers
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver for typed events
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event<serde_json::Value>>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    fn new(rx: broadcast::Receiver<Event<serde_json::Value>>) -> Self {
        Self {
            rx,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Receive the next event whose payload parses as `T`
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(Event {
                    event_type: event.event_type,
                    data,
                    origin: event.origin,
                    time_fired: event.time_fired,
                    context: event.context,
                });
            }
        }
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::events::{ConfigEntryDiscoveredData, HOMEASSISTANT_STARTED, HOMEASSISTANT_STOP};
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_and_fire() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(HOMEASSISTANT_STARTED);

        bus.fire(Event::new(HOMEASSISTANT_STARTED, json!({"state": "running"}), Context::new()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type.as_str(), HOMEASSISTANT_STARTED);
        assert_eq!(received.data["state"], "running");
    }

    #[tokio::test]
    async fn test_match_all_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();

        bus.fire(Event::new(HOMEASSISTANT_STARTED, json!({}), Context::new()));
        bus.fire(Event::new(HOMEASSISTANT_STOP, json!({}), Context::new()));

        assert_eq!(rx.recv().await.unwrap().event_type.as_str(), HOMEASSISTANT_STARTED);
        assert_eq!(rx.recv().await.unwrap().event_type.as_str(), HOMEASSISTANT_STOP);
    }

    #[tokio::test]
    async fn test_typed_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_typed::<ConfigEntryDiscoveredData>();

        bus.fire_typed(ConfigEntryDiscoveredData::default(), Context::new());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type.as_str(), "config_entry_discovered");
    }

    #[test]
    fn test_no_cross_event_pollution() {
        let bus = EventBus::new();
        let mut rx_stop = bus.subscribe(HOMEASSISTANT_STOP);

        bus.fire(Event::new(HOMEASSISTANT_STARTED, json!({}), Context::new()));

        tokio_test::assert_err!(rx_stop.try_recv());
        assert_eq!(bus.listener_count(), 1);
    }
}
