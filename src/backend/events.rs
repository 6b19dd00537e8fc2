//! Broadcast of Docker-style events to `/events` subscribers

use crate::api::types::{Event, EventActor};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Per-subscriber queue depth
pub const SUBSCRIBER_CAPACITY: usize = 64;

/// Fan-out of events to named subscribers.
///
/// Publishing never blocks: a subscriber whose queue is full misses the
/// event.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, mpsc::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<Event>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber, replacing any previous one with the same ID
    pub fn subscribe(&self, id: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.lock().insert(id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn publish(&self, event: Event) {
        let mut subscribers = self.lock();
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Event subscriber {} is full, dropping {}", id, event.action);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Build and publish an event stamped with the current time
    pub fn emit(&self, event_type: &str, action: &str, id: &str, attributes: HashMap<String, String>) {
        let now = Utc::now();
        self.publish(Event {
            event_type: event_type.to_string(),
            action: action.to_string(),
            actor: EventActor {
                id: id.to_string(),
                attributes,
            },
            time: now.timestamp(),
            time_nano: now.timestamp_nanos_opt().unwrap_or_default(),
        });
    }

    /// Drop every subscriber, ending their streams
    pub fn close(&self) {
        self.lock().clear();
    }
}

/// Single-entry attribute map, the common case for emitted events
pub fn attrs(key: &str, value: &str) -> HashMap<String, String> {
    HashMap::from([(key.to_string(), value.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("s1");
        bus.emit("container", "create", "abc", attrs("name", "web"));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event_type, "container");
        assert_eq!(ev.action, "create");
        assert_eq!(ev.actor.id, "abc");
        assert_eq!(ev.actor.attributes["name"], "web");
        assert!(ev.time > 0);
        assert_eq!(ev.time_nano / 1_000_000_000, ev.time);
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_only_its_events() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe("slow");
        for i in 0..SUBSCRIBER_CAPACITY {
            bus.emit("network", "create", &i.to_string(), HashMap::new());
        }
        let mut fast = bus.subscribe("fast");
        bus.emit("network", "destroy", "late", HashMap::new());

        assert_eq!(fast.recv().await.unwrap().actor.id, "late");
        let mut seen = 0;
        while let Ok(ev) = slow.try_recv() {
            assert_eq!(ev.action, "create");
            seen += 1;
        }
        assert_eq!(seen, SUBSCRIBER_CAPACITY);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("s1");
        bus.close();
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe("gone"));
        bus.emit("volume", "create", "v", HashMap::new());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
