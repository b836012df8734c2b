//! Topic-keyed publish/subscribe fanout (§4.2).
//!
//! Delivery never blocks the publisher: each topic is an [`async_broadcast`]
//! channel in overflow mode, so a subscriber lagging behind simply misses
//! the oldest unread events instead of stalling the producer or other
//! subscribers. Events are handed out as `Arc<Event>`, so no subscriber can
//! alias another's (or the publisher's) working memory.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_broadcast::{Receiver, Sender, TrySendError};
use log::warn;

use crate::event::Event;

pub const HA_EVENTS_TOPIC: &str = "ha:events";
pub const MQTT_EVENTS_TOPIC: &str = "mqtt:events";

/// Per-subscriber mailbox capacity before the oldest unread event is dropped.
const TOPIC_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, Sender<Arc<Event>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn sender_for(&self, topic: &str) -> Sender<Arc<Event>> {
        if let Some(sender) = self.topics.read().unwrap().get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                let (mut sender, receiver) = async_broadcast::broadcast(TOPIC_CAPACITY);
                sender.set_overflow(true);
                // Keep an inactive receiver alive so the channel isn't closed
                // the moment the last active subscriber drops theirs.
                receiver.deactivate();
                sender
            })
            .clone()
    }

    /// Subscribes to `topic`, creating it on first use. Events published
    /// before this call are not replayed.
    pub fn subscribe(&self, topic: &str) -> Receiver<Arc<Event>> {
        self.sender_for(topic).new_receiver()
    }

    /// Publishes `event` on `topic`. Non-blocking: if every subscriber's
    /// buffer is full, the oldest buffered event for that subscriber is
    /// dropped to make room (a warning is logged by the subscriber loop
    /// that observes the drop, per [`crate::bus::drain`]).
    pub fn publish(&self, topic: &str, event: Arc<Event>) {
        let sender = self.sender_for(topic);
        match sender.try_broadcast(event) {
            Ok(_) | Err(TrySendError::Inactive(_)) => {}
            Err(TrySendError::Full(_)) => {
                // Overflow mode makes this unreachable in practice (the
                // sender overwrites instead of erroring), kept defensively.
                warn!("event bus topic {topic} is full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("event bus topic {topic} has no live receivers left");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

/// Turns a raw bus [`Receiver`] into a `Stream` of events, logging a warning
/// every time the receiver lagged and missed overwritten events. Intended to
/// be fed to `ctx.add_stream` by actors that consume bus topics.
pub fn drain(
    topic: &'static str,
    mut receiver: Receiver<Arc<Event>>,
) -> impl futures::Stream<Item = Arc<Event>> {
    async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => yield event,
                Err(async_broadcast::RecvError::Overflowed(skipped)) => {
                    warn!("subscriber to {topic} lagged, dropped {skipped} events");
                }
                Err(async_broadcast::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, EventSource, EventType};
    use chrono::Utc;
    use futures::StreamExt;

    fn sample_event() -> Arc<Event> {
        Arc::new(EventBuilder::new(EventSource::HomeAssistant, EventType::Unknown, Utc::now()).build())
    }

    #[tokio::test]
    async fn delivers_events_in_publish_order_per_subscriber() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe(HA_EVENTS_TOPIC);

        let first = sample_event();
        let second = sample_event();
        bus.publish(HA_EVENTS_TOPIC, first.clone());
        bus.publish(HA_EVENTS_TOPIC, second.clone());

        assert_eq!(receiver.recv().await.unwrap().id, first.id);
        assert_eq!(receiver.recv().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_their_own_copy() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(HA_EVENTS_TOPIC);
        let mut b = bus.subscribe(HA_EVENTS_TOPIC);

        let event = sample_event();
        bus.publish(HA_EVENTS_TOPIC, event.clone());

        assert_eq!(a.recv().await.unwrap().id, event.id);
        assert_eq!(b.recv().await.unwrap().id, event.id);
    }

    #[tokio::test]
    async fn publish_never_blocks_when_a_subscriber_lags() {
        let bus = EventBus::new();
        let receiver = bus.subscribe(HA_EVENTS_TOPIC);
        // Overflow more than the buffer capacity without ever reading.
        for _ in 0..(TOPIC_CAPACITY * 2) {
            bus.publish(HA_EVENTS_TOPIC, sample_event());
        }
        drop(receiver);
    }

    #[tokio::test]
    async fn drain_skips_overwritten_events_and_keeps_going() {
        let bus = EventBus::new();
        let receiver = bus.subscribe(HA_EVENTS_TOPIC);
        let mut stream = Box::pin(drain(HA_EVENTS_TOPIC, receiver));

        for _ in 0..(TOPIC_CAPACITY + 5) {
            bus.publish(HA_EVENTS_TOPIC, sample_event());
        }
        let last = sample_event();
        bus.publish(HA_EVENTS_TOPIC, last.clone());

        let mut seen_last = false;
        while let Some(event) = stream.next().await {
            if event.id == last.id {
                seen_last = true;
                break;
            }
        }
        assert!(seen_last, "the most recently published event must still arrive");
    }
}
