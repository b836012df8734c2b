//! Pure functions turning raw HA / MQTT payloads into [`Event`]s. Neither
//! function performs I/O or touches shared state — they're the seam tested
//! by the round-trip and boundary-behavior properties.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::event::{EventBuilder, EventSource, EventType, StateSnapshot};

fn parse_time_fired(value: Option<&Value>) -> DateTime<Utc> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn state_snapshot(state: Option<&Value>) -> Option<StateSnapshot> {
    let state = state?;
    let value = state.get("state").cloned().unwrap_or(Value::Null);
    let last_changed = state
        .get("last_changed")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let last_updated = state
        .get("last_updated")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(last_changed);
    Some(StateSnapshot::new(value, last_changed, last_updated))
}

fn as_map(value: Option<&Value>) -> Map<String, Value> {
    value
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Normalizes a decoded Home Assistant WS frame of `type: "event"` into an [`Event`].
///
/// `frame` is the full decoded JSON message, i.e. `{"id":.., "type":"event", "event": {..}}`.
pub fn ha_normalize(frame: &Value) -> crate::event::Event {
    let event = frame.get("event").cloned().unwrap_or(Value::Null);
    let event_type = event.get("event_type").and_then(Value::as_str).unwrap_or("");
    let timestamp = parse_time_fired(event.get("time_fired"));
    let data = event.get("data");

    // Note: `frame.get("id")` is the *subscription* id, constant across every
    // event HA pushes for that subscription — not usable as an event id. Only
    // an id nested inside the event payload itself (some custom integrations
    // embed one) is eligible to override the builder's own unique counter.
    let id = event
        .get("id")
        .and_then(Value::as_u64)
        .map(|id| format!("ha_{id}"));

    match event_type {
        "state_changed" => {
            let entity_id = data
                .and_then(|d| d.get("entity_id"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let new_state = data.and_then(|d| d.get("new_state"));
            let old_state = data.and_then(|d| d.get("old_state"));
            let attributes = as_map(new_state.and_then(|s| s.get("attributes")));

            let mut builder = EventBuilder::new(EventSource::HomeAssistant, EventType::StateChanged, timestamp)
                .old_state(state_snapshot(old_state))
                .new_state(state_snapshot(new_state))
                .attributes(attributes)
                .raw(frame.clone());
            if let Some(entity_id) = entity_id {
                builder = builder.entity_id(entity_id);
            }
            if let Some(id) = id {
                builder = builder.id(id);
            }
            builder.build()
        }
        "call_service" => {
            let service = data.and_then(|d| d.get("service")).cloned().unwrap_or(Value::Null);
            let service_data = data.and_then(|d| d.get("service_data")).cloned().unwrap_or(Value::Null);
            let domain = data
                .and_then(|d| d.get("domain"))
                .and_then(Value::as_str)
                .map(str::to_string);

            let mut attributes = Map::new();
            attributes.insert("service".to_string(), service);
            attributes.insert("service_data".to_string(), service_data);

            let mut builder = EventBuilder::new(EventSource::HomeAssistant, EventType::ServiceCalled, timestamp)
                .attributes(attributes)
                .raw(frame.clone());
            if let Some(id) = id {
                builder = builder.id(id);
            }
            let mut built = builder.build();
            built.domain = domain;
            built
        }
        "automation_triggered" => {
            let mut builder = EventBuilder::new(EventSource::HomeAssistant, EventType::AutomationTriggered, timestamp)
                .attributes(as_map(data))
                .raw(frame.clone());
            if let Some(id) = id {
                builder = builder.id(id);
            }
            builder.build()
        }
        _ => {
            let mut builder =
                EventBuilder::new(EventSource::HomeAssistant, EventType::Unknown, timestamp).raw(frame.clone());
            if let Some(id) = id {
                builder = builder.id(id);
            }
            builder.build()
        }
    }
}

/// Normalizes an MQTT publish `(topic_parts, payload)` into a `state_changed` [`Event`].
pub fn mqtt_normalize(topic_parts: &[String], payload: &[u8]) -> crate::event::Event {
    let entity_id = topic_parts.join("/");
    let now = Utc::now();

    let (state_value, attributes) = match serde_json::from_slice::<Value>(payload) {
        Ok(value) => {
            let attrs = value.as_object().cloned().unwrap_or_default();
            (value, attrs)
        }
        Err(_) => {
            let text = String::from_utf8_lossy(payload).to_string();
            let mut attrs = Map::new();
            attrs.insert("raw".to_string(), Value::String(text.clone()));
            let mut raw_state = Map::new();
            raw_state.insert("raw".to_string(), Value::String(text));
            (Value::Object(raw_state), attrs)
        }
    };

    let mut event = EventBuilder::new(EventSource::Mqtt, EventType::StateChanged, now)
        .entity_id(entity_id)
        .new_state(Some(StateSnapshot::now(state_value)))
        .attributes(attributes)
        .raw(Value::String(String::from_utf8_lossy(payload).to_string()))
        .build();
    // MQTT entity ids are slash-joined topics, not "<domain>.<object>" pairs,
    // so the invariant linking domain to entity_id's dotted prefix (§3) does
    // not apply here: the spec fixes domain to the literal "mqtt" instead.
    event.domain = Some("mqtt".to_string());
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_state_changed_event() {
        let frame = json!({
            "id": 42,
            "type": "event",
            "event": {
                "id": 5,
                "event_type": "state_changed",
                "time_fired": "2025-03-10T12:05:00+00:00",
                "data": {
                    "entity_id": "light.kitchen",
                    "old_state": {"state": "off", "last_changed": "2025-03-10T11:00:00+00:00"},
                    "new_state": {
                        "state": "on",
                        "last_changed": "2025-03-10T12:05:00+00:00",
                        "attributes": {"brightness": 255}
                    }
                }
            }
        });

        let event = ha_normalize(&frame);
        assert_eq!(event.id, "ha_5");
        assert_eq!(event.entity_id.as_deref(), Some("light.kitchen"));
        assert_eq!(event.domain.as_deref(), Some("light"));
        assert_eq!(event.new_state.as_ref().unwrap().state, json!("on"));
        assert_eq!(event.attributes.get("brightness"), Some(&json!(255)));
    }

    #[test]
    fn falls_back_to_unknown_for_unrecognized_event_type() {
        let frame = json!({"type": "event", "event": {"event_type": "something_else"}});
        let event = ha_normalize(&frame);
        assert!(matches!(event.event_type, EventType::Unknown));
    }

    #[test]
    fn falls_back_to_utc_now_on_unparseable_timestamp() {
        let frame = json!({"type": "event", "event": {"event_type": "state_changed", "time_fired": "not-a-time"}});
        let event = ha_normalize(&frame);
        assert!((Utc::now() - event.timestamp).num_seconds() < 5);
    }

    #[test]
    fn mqtt_joins_topic_parts_as_entity_id() {
        let parts = vec!["pomodoro".to_string(), "timer".to_string(), "kitchen".to_string()];
        let event = mqtt_normalize(&parts, br#"{"state":"running"}"#);
        assert_eq!(event.entity_id.as_deref(), Some("pomodoro/timer/kitchen"));
        assert_eq!(event.domain.as_deref(), Some("mqtt"));
    }

    #[test]
    fn mqtt_wraps_non_json_payload_under_raw() {
        let parts = vec!["pomodoro".to_string(), "timer".to_string()];
        let event = mqtt_normalize(&parts, b"not json");
        let state = event.new_state.unwrap().state;
        assert_eq!(state, json!({"raw": "not json"}));
        assert_eq!(event.attributes.get("raw"), Some(&json!("not json")));
    }
}
