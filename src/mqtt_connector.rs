//! The MQTT connector (§4.4): subscribes to a configurable set of topic
//! filters, normalizes every publish into an [`Event`] on `"mqtt:events"`,
//! and exposes a fire-and-forget publish handler for automations.

use std::time::Duration;

use actix::prelude::*;
use async_stream::stream;
use exponential_backoff::Backoff;
use log::{error, info, trace};
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, Publish, QoS};
use std::sync::Arc;
use tokio::time::sleep;
use url::Url;

use crate::bus::{EventBus, MQTT_EVENTS_TOPIC};
use crate::misc::HumanReadable;
use crate::normalize::mqtt_normalize;

pub const DEFAULT_TOPIC_FILTERS: &[&str] = &["pomodoro/timer/+"];

pub struct MqttConnector {
    mqtt_options: MqttOptions,
    topic_filters: Vec<String>,
    client: Option<AsyncClient>,
    bus: EventBus,
}

impl MqttConnector {
    pub fn new(broker_url: &Url, client_id: &str, topic_filters: Vec<String>, bus: EventBus) -> Self {
        let mqtt_options = MqttOptions::new(
            client_id.to_string(),
            broker_url.host().expect("a broker URL with a host").to_string(),
            broker_url.port().expect("a broker URL with a port"),
        );
        MqttConnector {
            mqtt_options,
            topic_filters,
            client: None,
            bus,
        }
    }

    fn subscribe_topics(&self, ctx: &mut Context<Self>) {
        let Some(client) = self.client.clone() else { return };
        let filters = self.topic_filters.clone();
        async move {
            for filter in filters {
                if let Err(err) = client.subscribe(&filter, QoS::AtMostOnce).await {
                    error!("failed to subscribe to {filter}: {err}");
                }
            }
        }
        .into_actor(self)
        .spawn(ctx);
    }

    fn handle_publish(&self, publish: Publish) {
        let topic_parts: Vec<String> = publish.topic.split('/').map(str::to_string).collect();
        trace!("mqtt publish on {}: {} bytes", publish.topic, publish.payload.len());
        let event = mqtt_normalize(&topic_parts, &publish.payload);
        self.bus.publish(MQTT_EVENTS_TOPIC, Arc::new(event));
    }
}

impl Actor for MqttConnector {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (async_client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);
        self.client = Some(async_client);

        ctx.add_stream(stream! {
            let backoff = Backoff::new(u32::MAX, Duration::from_millis(50), Duration::from_secs(300));
            let mut backoff_session = backoff.iter();
            loop {
                match event_loop.poll().await {
                    Ok(event) => yield event,
                    Err(connection_error) => {
                        let delay = match backoff_session.next() {
                            Some(Some(delay)) => delay,
                            _ => Duration::from_secs(300),
                        };
                        error!("mqtt connection error, backing off {}: {connection_error}", delay.prettify());
                        sleep(delay).await;
                    }
                }
            }
        });
    }
}

impl StreamHandler<MqttEvent> for MqttConnector {
    fn handle(&mut self, event: MqttEvent, ctx: &mut Self::Context) {
        match event {
            MqttEvent::Incoming(Packet::ConnAck(_)) => {
                info!("mqtt connected, subscribing to {:?}", self.topic_filters);
                self.subscribe_topics(ctx);
            }
            MqttEvent::Incoming(Packet::Publish(publish)) => self.handle_publish(publish),
            _ => {}
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        info!("mqtt event loop stream ended");
    }
}

/// Fire-and-forget outbound publish, used by automations and by the birth
/// message on connect.
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct PublishMqtt {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

impl Handler<PublishMqtt> for MqttConnector {
    type Result = ();

    fn handle(&mut self, msg: PublishMqtt, ctx: &mut Self::Context) -> Self::Result {
        let Some(client) = self.client.clone() else {
            error!("mqtt client not connected yet, dropping publish to {}", msg.topic);
            return;
        };
        let qos = match msg.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        };
        async move {
            if let Err(err) = client.publish(&msg.topic, qos, false, msg.payload).await {
                error!("failed to publish to {}: {err}", msg.topic);
            }
        }
        .into_actor(self)
        .spawn(ctx);
    }
}
