use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static MQTT_SEQ: AtomicU64 = AtomicU64::new(1);
static HA_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    HomeAssistant,
    Mqtt,
    Rest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StateChanged,
    ServiceCalled,
    AutomationTriggered,
    Unknown,
}

/// A point-in-time entity state, as reported by HA or reconstructed from an MQTT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: Value,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn new(state: Value, last_changed: DateTime<Utc>, last_updated: DateTime<Utc>) -> Self {
        StateSnapshot {
            state,
            last_changed,
            last_updated,
        }
    }

    pub fn now(state: Value) -> Self {
        let now = Utc::now();
        StateSnapshot::new(state, now, now)
    }
}

/// The canonical, immutable event record every source gets normalized into.
///
/// `id` is unique within a process run; if `entity_id` contains a `.`, `domain`
/// is always the substring before the first `.` (see [`domain_of`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub source: EventSource,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub entity_id: Option<String>,
    pub domain: Option<String>,
    pub old_state: Option<StateSnapshot>,
    pub new_state: Option<StateSnapshot>,
    pub attributes: Map<String, Value>,
    pub context: Map<String, Value>,
    pub raw: Value,
}

/// Extracts the `domain` of an `entity_id` of the form `"<domain>.<object>"`.
pub fn domain_of(entity_id: &str) -> Option<String> {
    entity_id.split_once('.').map(|(domain, _)| domain.to_string())
}

pub struct EventBuilder {
    id: String,
    source: EventSource,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    entity_id: Option<String>,
    old_state: Option<StateSnapshot>,
    new_state: Option<StateSnapshot>,
    attributes: Map<String, Value>,
    context: Map<String, Value>,
    raw: Value,
}

impl EventBuilder {
    pub fn new(source: EventSource, event_type: EventType, timestamp: DateTime<Utc>) -> Self {
        let id = match source {
            EventSource::HomeAssistant | EventSource::Rest => {
                format!("ha_{}", HA_SEQ.fetch_add(1, Ordering::Relaxed))
            }
            EventSource::Mqtt => format!("mqtt_{}", MQTT_SEQ.fetch_add(1, Ordering::Relaxed)),
        };
        EventBuilder {
            id,
            source,
            event_type,
            timestamp,
            entity_id: None,
            old_state: None,
            new_state: None,
            attributes: Map::new(),
            context: Map::new(),
            raw: Value::Null,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn old_state(mut self, state: Option<StateSnapshot>) -> Self {
        self.old_state = state;
        self
    }

    pub fn new_state(mut self, state: Option<StateSnapshot>) -> Self {
        self.new_state = state;
        self
    }

    pub fn attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn build(self) -> Event {
        let domain = self.entity_id.as_deref().and_then(domain_of);
        Event {
            id: self.id,
            source: self.source,
            event_type: self.event_type,
            timestamp: self.timestamp,
            entity_id: self.entity_id,
            domain,
            old_state: self.old_state,
            new_state: self.new_state,
            attributes: self.attributes,
            context: self.context,
            raw: self.raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_is_prefix_before_first_dot() {
        assert_eq!(domain_of("light.kitchen"), Some("light".to_string()));
        assert_eq!(domain_of("light.kitchen.extra"), Some("light".to_string()));
        assert_eq!(domain_of("no_dot"), None);
    }

    #[test]
    fn builder_derives_domain_from_entity_id() {
        let event = EventBuilder::new(EventSource::HomeAssistant, EventType::StateChanged, Utc::now())
            .entity_id("switch.garage")
            .build();
        assert_eq!(event.domain.as_deref(), Some("switch"));
    }

    #[test]
    fn builder_leaves_domain_unset_without_entity_id() {
        let event = EventBuilder::new(EventSource::HomeAssistant, EventType::Unknown, Utc::now()).build();
        assert_eq!(event.domain, None);
    }

    #[test]
    fn ids_are_unique_within_a_run() {
        let a = EventBuilder::new(EventSource::Mqtt, EventType::StateChanged, Utc::now()).build();
        let b = EventBuilder::new(EventSource::Mqtt, EventType::StateChanged, Utc::now()).build();
        assert_ne!(a.id, b.id);
    }
}
