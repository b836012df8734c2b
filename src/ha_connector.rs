//! The Home Assistant WebSocket connector (§4.3): authenticates, subscribes
//! to `state_changed`, normalizes incoming events onto `"ha:events"`, and
//! relays outbound service calls. Reconnects on its own with a fixed delay;
//! `auth_invalid` is terminal and leaves the connector idle rather than
//! endlessly retrying with a token that will never work.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix::io::SinkWrite;
use actix::prelude::*;
use actix_codec::Framed;
use awc::{ws, BoxedSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use url::Url;

use crate::bus::{EventBus, HA_EVENTS_TOPIC};
use crate::normalize::ha_normalize;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static CONNECTOR_SEQ: AtomicU32 = AtomicU32::new(1);

pub struct HaConnector {
    id: String,
    url: Url,
    token: String,
    bus: EventBus,
    ws_id: u32,
    subscribe_events_id: Option<u32>,
    sink: Option<SinkWrite<ws::Message, SplitSink<Framed<BoxedSocket, ws::Codec>, ws::Message>>>,
    authenticated: bool,
    /// Set only once `subscribe_events` comes back with `success: true`; the
    /// `READY` state of spec.md §4.3's state machine. Outbound service calls
    /// are gated on this, not on `authenticated` alone.
    ready: bool,
    fatal: bool,
}

impl HaConnector {
    pub fn new(url: Url, token: String, bus: EventBus) -> Self {
        HaConnector {
            id: format!("ha-{}", CONNECTOR_SEQ.fetch_add(1, Ordering::SeqCst)),
            url,
            token,
            bus,
            ws_id: 0,
            subscribe_events_id: None,
            sink: None,
            authenticated: false,
            ready: false,
            fatal: false,
        }
    }

    fn new_msg_id(&mut self) -> u32 {
        self.ws_id += 1;
        self.ws_id
    }

    fn send_json(&mut self, msg: Value) {
        let name = msg.get("type").and_then(Value::as_str).unwrap_or("?").to_string();
        let text = msg.to_string();
        match &mut self.sink {
            Some(sink) => {
                if sink.write(ws::Message::Text(text.into())).is_err() {
                    warn!("[{}] could not send {name}, socket is closing", self.id);
                }
            }
            None => warn!("[{}] no websocket sink, dropping {name}", self.id),
        }
    }

    fn connect(&mut self, ctx: &mut Context<Self>) {
        let url = self.url.clone();
        async move {
            awc::Client::builder()
                .timeout(CONNECT_TIMEOUT)
                .finish()
                .ws(url.as_str())
                .connect()
                .await
        }
            .into_actor(self)
            .map(|result, actor, ctx| match result {
                Ok((_response, framed)) => {
                    let (sink, stream) = framed.split();
                    actor.sink = Some(SinkWrite::new(sink, ctx));
                    actor.ws_id = 0;
                    actor.subscribe_events_id = None;
                    actor.authenticated = false;
                    actor.ready = false;
                    ctx.add_stream(stream.filter_map(|item| async move { item.ok() }));
                    info!("[{}] connected to {}", actor.id, actor.url);
                }
                Err(err) => {
                    error!("[{}] failed to connect to HA: {err}, retrying in {:?}", actor.id, RECONNECT_DELAY);
                    actor.schedule_reconnect(ctx);
                }
            })
            .spawn(ctx);
    }

    fn schedule_reconnect(&self, ctx: &mut Context<Self>) {
        if self.fatal {
            return;
        }
        ctx.run_later(RECONNECT_DELAY, |actor, ctx| actor.connect(ctx));
    }

    fn on_text(&mut self, text: Bytes, _ctx: &mut Context<Self>) {
        let parsed: Value = match serde_json::from_slice(&text) {
            Ok(value) => value,
            Err(err) => {
                warn!("[{}] malformed message from HA: {err}", self.id);
                return;
            }
        };
        let Some(object) = parsed.as_object() else {
            return;
        };
        let id = object.get("id").and_then(Value::as_u64).map(|n| n as u32);
        match object.get("type").and_then(Value::as_str).unwrap_or_default() {
            "auth_required" => {
                self.send_json(json!({ "type": "auth", "access_token": self.token }));
            }
            "auth_invalid" => {
                error!(
                    "[{}] HA_TOKEN rejected: {}",
                    self.id,
                    object.get("message").and_then(Value::as_str).unwrap_or_default()
                );
                self.fatal = true;
                self.authenticated = false;
                self.ready = false;
            }
            "auth_ok" => {
                self.authenticated = true;
                info!("[{}] authenticated with HA", self.id);
                let subscribe_id = self.new_msg_id();
                self.subscribe_events_id = Some(subscribe_id);
                self.send_json(json!({
                    "id": subscribe_id,
                    "type": "subscribe_events",
                    "event_type": "state_changed",
                }));
            }
            "event" => {
                if id != self.subscribe_events_id {
                    return;
                }
                if object.contains_key("event") {
                    let normalized = ha_normalize(&parsed);
                    self.bus.publish(HA_EVENTS_TOPIC, Arc::new(normalized));
                }
            }
            "result" => {
                let success = object.get("success").and_then(Value::as_bool).unwrap_or(false);
                if id == self.subscribe_events_id {
                    if success {
                        self.ready = true;
                        info!("[{}] subscribe_events acknowledged, connector is READY", self.id);
                    } else {
                        self.ready = false;
                        error!("[{}] subscribe_events was rejected by HA", self.id);
                    }
                }
            }
            other => debug!("[{}] unhandled message type {other}", self.id),
        }
    }
}

impl Actor for HaConnector {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.connect(ctx);
    }
}

impl Supervised for HaConnector {
    fn restarting(&mut self, _ctx: &mut Self::Context) {
        self.sink = None;
        self.authenticated = false;
        self.ready = false;
    }
}

impl StreamHandler<ws::Frame> for HaConnector {
    fn handle(&mut self, frame: ws::Frame, ctx: &mut Self::Context) {
        match frame {
            ws::Frame::Text(text) => self.on_text(text, ctx),
            ws::Frame::Ping(bytes) => {
                if let Some(sink) = &mut self.sink {
                    let _ = sink.write(ws::Message::Pong(bytes));
                }
            }
            ws::Frame::Close(_) => {
                warn!("[{}] HA closed the websocket", self.id);
                ctx.stop();
            }
            _ => {}
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        warn!("[{}] HA connection lost, reconnecting in {:?}", self.id, RECONNECT_DELAY);
        self.sink = None;
        self.authenticated = false;
        self.ready = false;
        self.schedule_reconnect(ctx);
    }
}

impl actix::io::WriteHandler<awc::error::WsProtocolError> for HaConnector {}

/// Calls a Home Assistant service. Dropped with a warning if the connector
/// isn't `READY` (authenticated *and* its `subscribe_events` succeeded) —
/// callers are expected to be tolerant of a transient disconnection rather
/// than queue indefinitely.
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct CallService {
    pub domain: String,
    pub service: String,
    pub service_data: Value,
    pub target: Option<Value>,
}

impl Handler<CallService> for HaConnector {
    type Result = ();

    fn handle(&mut self, msg: CallService, _ctx: &mut Self::Context) -> Self::Result {
        if !self.ready {
            warn!(
                "[{}] not READY, dropping call_service {}.{}",
                self.id, msg.domain, msg.service
            );
            return;
        }
        let id = self.new_msg_id();
        let mut frame = json!({
            "id": id,
            "type": "call_service",
            "domain": msg.domain,
            "service": msg.service,
            "service_data": msg.service_data,
        });
        if let Some(target) = msg.target {
            frame["target"] = target;
        }
        self.send_json(frame);
    }
}
