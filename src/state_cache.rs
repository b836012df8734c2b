//! The entity state cache (§4.5): a concurrent-read map bootstrapped from
//! HA's REST API and kept live from the event stream. Reads never block
//! behind writes; there is exactly one writer (the live-update task), which
//! enforces the "events processed in receive order" ordering the spec relies
//! on to make the bootstrap-vs-live-event race resolve correctly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{error, info, warn};
use serde_json::{Map, Value};

use crate::bus::{self, EventBus, HA_EVENTS_TOPIC};
use crate::config::Config;
use crate::event::{Event, EventType, StateSnapshot};

#[derive(Debug, Clone)]
pub struct EntityState {
    pub state: Value,
    pub attributes: Map<String, Value>,
    pub last_changed: chrono::DateTime<chrono::Utc>,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

impl EntityState {
    fn from_snapshot(snapshot: &StateSnapshot, attributes: Map<String, Value>) -> Self {
        EntityState {
            state: snapshot.state.clone(),
            attributes,
            last_changed: snapshot.last_changed,
            last_updated: snapshot.last_updated,
        }
    }
}

#[derive(Clone)]
pub struct StateCache {
    entities: Arc<RwLock<HashMap<String, EntityState>>>,
}

impl StateCache {
    pub fn new() -> Self {
        StateCache {
            entities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.entities.read().unwrap().get(entity_id).cloned()
    }

    pub fn all_entities(&self) -> Vec<(String, EntityState)> {
        let mut all: Vec<_> = self
            .entities
            .read()
            .unwrap()
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        all.sort_by(|(a, _), (b, _)| a.cmp(b));
        all
    }

    fn apply_event(&self, event: &Event) {
        if !matches!(event.event_type, EventType::StateChanged) {
            return;
        }
        let (Some(entity_id), Some(new_state)) = (&event.entity_id, &event.new_state) else {
            return;
        };
        let state = EntityState::from_snapshot(new_state, event.attributes.clone());
        self.entities.write().unwrap().insert(entity_id.clone(), state);
    }

    /// Issues `GET /api/states` against HA with a 10s overall timeout.
    /// On timeout or a non-200 response, logs an error and leaves the cache
    /// empty — live events will fill it from that point on.
    pub async fn bootstrap(&self, config: &Config) {
        let base = config.ha_rest_base();
        let url = match base.join("/api/states") {
            Ok(url) => url,
            Err(err) => {
                error!("invalid HA REST base url: {err}");
                return;
            }
        };
        let Some(token) = &config.ha_token else {
            warn!("no HA_TOKEN configured, skipping state cache bootstrap");
            return;
        };

        let client = awc::Client::builder()
            .timeout(Duration::from_secs(10))
            .finish();
        let response = client
            .get(url.as_str())
            .insert_header(("Authorization", format!("Bearer {token}")))
            .send()
            .await;

        let mut response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                error!("HA REST bootstrap failed with status {}", response.status());
                return;
            }
            Err(err) => {
                error!("HA REST bootstrap failed: {err}");
                return;
            }
        };

        let body = match response.body().limit(64 * 1024 * 1024).await {
            Ok(body) => body,
            Err(err) => {
                error!("HA REST bootstrap: failed to read response body: {err}");
                return;
            }
        };

        let entities: Vec<Value> = match serde_json::from_slice(&body) {
            Ok(entities) => entities,
            Err(err) => {
                error!("HA REST bootstrap: failed to decode response: {err}");
                return;
            }
        };

        let mut map = self.entities.write().unwrap();
        for entity in entities {
            let Some(entity_id) = entity.get("entity_id").and_then(Value::as_str) else {
                continue;
            };
            let state = entity.get("state").cloned().unwrap_or(Value::Null);
            let attributes = entity
                .get("attributes")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let now = chrono::Utc::now();
            let last_changed = entity
                .get("last_changed")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or(now);
            let last_updated = entity
                .get("last_updated")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or(last_changed);
            map.insert(
                entity_id.to_string(),
                EntityState {
                    state,
                    attributes,
                    last_changed,
                    last_updated,
                },
            );
        }
        info!("state cache bootstrapped with {} entities", map.len());
    }

    /// Spawns the sole writer task: drains `"ha:events"` and overwrites the
    /// cache entry for every `state_changed` event it sees.
    pub fn spawn_live_updates(&self, bus: &EventBus) {
        let receiver = bus.subscribe(HA_EVENTS_TOPIC);
        let cache = self.clone();
        actix::spawn(async move {
            let mut stream = Box::pin(bus::drain(HA_EVENTS_TOPIC, receiver));
            use futures::StreamExt;
            while let Some(event) = stream.next().await {
                cache.apply_event(&event);
            }
        });
    }
}

impl Default for StateCache {
    fn default() -> Self {
        StateCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, EventSource};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn get_returns_none_for_unknown_entity() {
        let cache = StateCache::new();
        assert!(cache.get("light.unknown").is_none());
    }

    #[test]
    fn apply_event_overwrites_state_for_entity() {
        let cache = StateCache::new();
        let event = EventBuilder::new(EventSource::HomeAssistant, EventType::StateChanged, Utc::now())
            .entity_id("light.kitchen")
            .new_state(Some(StateSnapshot::now(json!("on"))))
            .build();
        cache.apply_event(&event);
        assert_eq!(cache.get("light.kitchen").unwrap().state, json!("on"));
    }

    #[test]
    fn apply_event_ignores_non_state_changed_events() {
        let cache = StateCache::new();
        let event = EventBuilder::new(EventSource::HomeAssistant, EventType::ServiceCalled, Utc::now())
            .entity_id("light.kitchen")
            .new_state(Some(StateSnapshot::now(json!("on"))))
            .build();
        cache.apply_event(&event);
        assert!(cache.get("light.kitchen").is_none());
    }

    #[test]
    fn all_entities_is_sorted_by_entity_id() {
        let cache = StateCache::new();
        for id in ["light.b", "light.a", "light.c"] {
            let event = EventBuilder::new(EventSource::HomeAssistant, EventType::StateChanged, Utc::now())
                .entity_id(id)
                .new_state(Some(StateSnapshot::now(json!("on"))))
                .build();
            cache.apply_event(&event);
        }
        let ids: Vec<_> = cache.all_entities().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["light.a", "light.b", "light.c"]);
    }
}
