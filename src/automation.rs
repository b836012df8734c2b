//! Automations (§4.9): user-supplied logic running as supervised actors.
//!
//! Each automation owns a `State: Clone` value. Before every callback we
//! snapshot it; if the callback panics, the snapshot is restored and the
//! panic is logged instead of taking the whole process down.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use actix::prelude::*;
use futures::FutureExt;
use log::{error, warn};
use serde_json::Value;

use crate::bus::{self, EventBus, HA_EVENTS_TOPIC, MQTT_EVENTS_TOPIC};
use crate::event::Event;
use crate::ha_connector::{CallService, HaConnector};
use crate::kv::GlobalKv;
use crate::mqtt_connector::{MqttConnector, PublishMqtt};
use crate::scheduler::{RegisterSchedule, ScheduleDecl, Scheduler};
use crate::state_cache::{EntityState, StateCache};

/// A message delivered to an automation when one of its declared schedules
/// fires. Carries the `message` name from the `ScheduleDecl` that armed it.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct ScheduledMessage(pub String);

/// Splits a `"domain.service"` call into its HA frame parts: `entity_id`,
/// `device_id`, and `area_id` keys in `data` are lifted into a `target`
/// sub-object, the rest is forwarded as `service_data`. Returns `None` if
/// `domain_service` has no `.`.
fn split_service_call(domain_service: &str, data: Value) -> Option<(String, String, Value, Option<Value>)> {
    let (domain, service) = domain_service.split_once('.')?;

    let mut service_data = data.as_object().cloned().unwrap_or_default();
    let mut target = serde_json::Map::new();
    for key in ["entity_id", "device_id", "area_id"] {
        if let Some(value) = service_data.remove(key) {
            target.insert(key.to_string(), value);
        }
    }
    let target = if target.is_empty() { None } else { Some(Value::Object(target)) };

    Some((domain.to_string(), service.to_string(), Value::Object(service_data), target))
}

/// User-facing automation logic. `State` must be `Clone` so the actor can
/// snapshot it around each callback for panic rollback.
#[async_trait::async_trait]
pub trait Automation: Send + Sync + 'static {
    type State: Clone + Send + 'static;

    /// A short, unique name used in schedule ids and log lines.
    fn name(&self) -> &str;

    fn initial_state(&self) -> Self::State;

    /// Schedules this automation wants armed at startup. Evaluated once,
    /// at actor start.
    fn schedules(&self) -> Vec<ScheduleDecl> {
        Vec::new()
    }

    /// Called for every normalized event on either bus.
    async fn handle_event(&self, ctx: &AutomationContext, state: &mut Self::State, event: &Event);

    /// Called when one of `schedules()` fires. `message` is the name given
    /// to `ScheduleDecl::daily`/`sunrise`/`sunset`/`every`.
    async fn handle_message(&self, _ctx: &AutomationContext, _state: &mut Self::State, _message: &str) {}
}

/// Handle given to automation callbacks: service calls, state reads,
/// global KV access, MQTT publish, and self-scheduling one-shot timers.
#[derive(Clone)]
pub struct AutomationContext {
    automation_name: String,
    ha: Addr<HaConnector>,
    mqtt: Addr<MqttConnector>,
    state_cache: StateCache,
    global_kv: GlobalKv,
    timer_control: Recipient<TimerControl>,
}

impl AutomationContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        automation_name: String,
        ha: Addr<HaConnector>,
        mqtt: Addr<MqttConnector>,
        state_cache: StateCache,
        global_kv: GlobalKv,
        timer_control: Recipient<TimerControl>,
    ) -> Self {
        AutomationContext {
            automation_name,
            ha,
            mqtt,
            state_cache,
            global_kv,
            timer_control,
        }
    }

    pub fn name(&self) -> &str {
        &self.automation_name
    }

    /// Fire-and-forget service call addressed as `"domain.service"`.
    /// `entity_id`/`device_id`/`area_id` keys in `data` are lifted into a
    /// `target` sub-object; the rest is forwarded as `service_data`. An
    /// `id` without a `.` is logged and dropped without sending.
    pub fn call_service(&self, domain_service: &str, data: Value) {
        let Some((domain, service, service_data, target)) = split_service_call(domain_service, data) else {
            warn!(
                "automation {}: invalid service id {domain_service:?}, expected \"domain.service\"",
                self.automation_name
            );
            return;
        };

        let msg = CallService {
            domain,
            service,
            service_data,
            target,
        };
        if self.ha.try_send(msg).is_err() {
            warn!("automation {}: HA connector mailbox full, dropping service call", self.automation_name);
        }
    }

    pub fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.state_cache.get(entity_id)
    }

    /// Like [`get_state`](Self::get_state), but panics if `entity_id` has
    /// never been observed. The panic is caught by the owning actor's
    /// dispatch loop like any other callback panic: state rolls back to its
    /// pre-call snapshot and the automation keeps running.
    pub fn must_get_state(&self, entity_id: &str) -> EntityState {
        self.get_state(entity_id)
            .unwrap_or_else(|| panic!("entity {entity_id:?} not found in state cache"))
    }

    pub async fn get_global(&self, key: &Value, default: Value) -> Value {
        self.global_kv.get(key, default).await
    }

    pub async fn set_global(&self, key: &Value, value: &Value) -> anyhow::Result<()> {
        self.global_kv.set(key, value).await
    }

    pub async fn delete_global(&self, key: &Value) -> anyhow::Result<()> {
        self.global_kv.delete(key).await
    }

    pub fn all_globals(&self) -> Vec<(Value, Value)> {
        self.global_kv.all()
    }

    pub fn global_keys(&self) -> Vec<Value> {
        self.global_kv.keys()
    }

    pub async fn clear_globals(&self) -> anyhow::Result<()> {
        self.global_kv.clear().await
    }

    pub fn publish_mqtt(&self, topic: impl Into<String>, payload: Vec<u8>) {
        let msg = PublishMqtt {
            topic: topic.into(),
            payload,
            qos: 0,
        };
        if self.mqtt.try_send(msg).is_err() {
            warn!("automation {}: MQTT connector mailbox full, dropping publish", self.automation_name);
        }
    }

    /// Arms a one-shot timer; `label` is delivered back via `TimerFired`.
    pub fn schedule_timer(&self, label: impl Into<String>, delay: std::time::Duration) {
        let _ = self.timer_control.do_send(TimerControl::Schedule {
            label: label.into(),
            delay,
        });
    }

    pub fn cancel_timer(&self, label: impl Into<String>) {
        let _ = self.timer_control.do_send(TimerControl::Cancel { label: label.into() });
    }
}

/// Self-addressed message an automation's async callbacks use to arm or
/// cancel timers without holding `&mut Context` across an `.await`.
#[derive(Message)]
#[rtype(result = "()")]
pub enum TimerControl {
    Schedule { label: String, delay: std::time::Duration },
    Cancel { label: String },
}

#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct TimerFired(pub String);

/// Runs one `Automation` as a supervised actor. Monomorphized per
/// automation type so `State` can stay a concrete, `Clone`-able value.
pub struct AutomationActor<A: Automation> {
    automation: Arc<A>,
    state: A::State,
    ha: Addr<HaConnector>,
    mqtt: Addr<MqttConnector>,
    scheduler: Addr<Scheduler>,
    state_cache: StateCache,
    global_kv: GlobalKv,
    bus: EventBus,
    pending_timers: std::collections::HashMap<String, SpawnHandle>,
}

impl<A: Automation> AutomationActor<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        automation: A,
        ha: Addr<HaConnector>,
        mqtt: Addr<MqttConnector>,
        scheduler: Addr<Scheduler>,
        state_cache: StateCache,
        global_kv: GlobalKv,
        bus: EventBus,
    ) -> Self {
        let initial_state = automation.initial_state();
        AutomationActor {
            automation: Arc::new(automation),
            state: initial_state,
            ha,
            mqtt,
            scheduler,
            state_cache,
            global_kv,
            bus,
            pending_timers: std::collections::HashMap::new(),
        }
    }

    fn context(&self, timer_control: Recipient<TimerControl>) -> AutomationContext {
        AutomationContext::new(
            self.automation.name().to_string(),
            self.ha.clone(),
            self.mqtt.clone(),
            self.state_cache.clone(),
            self.global_kv.clone(),
            timer_control,
        )
    }

    /// Runs `callback`, rolling `self.state` back to its pre-call snapshot
    /// if it panics. The panic is logged, never propagated.
    fn dispatch<F>(&mut self, ctx: &mut Context<Self>, run: F)
    where
        F: FnOnce(Arc<A>, AutomationContext, A::State) -> futures::future::BoxFuture<'static, A::State> + 'static,
    {
        let automation = self.automation.clone();
        let automation_ctx = self.context(ctx.address().recipient());
        let backup = self.state.clone();
        let state = self.state.clone();
        let name = automation.name().to_string();

        let fut = AssertUnwindSafe(run(automation, automation_ctx, state)).catch_unwind();
        ctx.spawn(
            fut.into_actor(self).map(move |result, actor, _ctx| match result {
                Ok(new_state) => actor.state = new_state,
                Err(_) => {
                    error!("automation {name}: callback panicked, state rolled back");
                    actor.state = backup;
                }
            }),
        );
    }
}

impl<A: Automation> Actor for AutomationActor<A> {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let ha_receiver = self.bus.subscribe(HA_EVENTS_TOPIC);
        ctx.add_stream(bus::drain(HA_EVENTS_TOPIC, ha_receiver));
        let mqtt_receiver = self.bus.subscribe(MQTT_EVENTS_TOPIC);
        ctx.add_stream(bus::drain(MQTT_EVENTS_TOPIC, mqtt_receiver));

        let recipient: Recipient<ScheduledMessage> = ctx.address().recipient();
        for (index, decl) in self.automation.schedules().into_iter().enumerate() {
            self.scheduler.do_send(RegisterSchedule {
                automation: self.automation.name().to_string(),
                declaration_index: index,
                decl,
                recipient: recipient.clone(),
            });
        }
    }
}

impl<A: Automation> Supervised for AutomationActor<A> {
    fn restarting(&mut self, _ctx: &mut Self::Context) {
        self.state = self.automation.initial_state();
        self.pending_timers.clear();
    }
}

impl<A: Automation> StreamHandler<Arc<Event>> for AutomationActor<A> {
    fn handle(&mut self, event: Arc<Event>, ctx: &mut Self::Context) {
        self.dispatch(ctx, move |automation, automation_ctx, mut state| {
            Box::pin(async move {
                automation.handle_event(&automation_ctx, &mut state, &event).await;
                state
            })
        });
    }
}

impl<A: Automation> Handler<ScheduledMessage> for AutomationActor<A> {
    type Result = ();

    fn handle(&mut self, msg: ScheduledMessage, ctx: &mut Self::Context) -> Self::Result {
        self.dispatch(ctx, move |automation, automation_ctx, mut state| {
            Box::pin(async move {
                automation.handle_message(&automation_ctx, &mut state, &msg.0).await;
                state
            })
        });
    }
}

impl<A: Automation> Handler<TimerFired> for AutomationActor<A> {
    type Result = ();

    fn handle(&mut self, msg: TimerFired, ctx: &mut Self::Context) -> Self::Result {
        self.pending_timers.remove(&msg.0);
        self.dispatch(ctx, move |automation, automation_ctx, mut state| {
            Box::pin(async move {
                automation.handle_message(&automation_ctx, &mut state, &msg.0).await;
                state
            })
        });
    }
}

impl<A: Automation> Handler<TimerControl> for AutomationActor<A> {
    type Result = ();

    fn handle(&mut self, msg: TimerControl, ctx: &mut Self::Context) -> Self::Result {
        match msg {
            TimerControl::Schedule { label, delay } => {
                if let Some(handle) = self.pending_timers.remove(&label) {
                    ctx.cancel_future(handle);
                }
                let fired_label = label.clone();
                let handle = ctx.run_later(delay, move |actor, ctx| {
                    actor.pending_timers.remove(&fired_label);
                    ctx.address().do_send(TimerFired(fired_label));
                });
                self.pending_timers.insert(label, handle);
            }
            TimerControl::Cancel { label } => {
                if let Some(handle) = self.pending_timers.remove(&label) {
                    ctx.cancel_future(handle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::state_cache::StateCache;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;
    use url::Url;

    #[test]
    fn call_service_lifts_targeting_keys_into_target() {
        let (domain, service, service_data, target) = split_service_call(
            "light.turn_on",
            json!({"entity_id": "light.k", "brightness": 255}),
        )
        .unwrap();
        assert_eq!(domain, "light");
        assert_eq!(service, "turn_on");
        assert_eq!(service_data, json!({"brightness": 255}));
        assert_eq!(target, Some(json!({"entity_id": "light.k"})));
    }

    #[test]
    fn call_service_without_targeting_keys_has_no_target() {
        let (_, _, service_data, target) = split_service_call("notify.notify", json!({"message": "hi"})).unwrap();
        assert_eq!(service_data, json!({"message": "hi"}));
        assert_eq!(target, None);
    }

    #[test]
    fn call_service_rejects_ids_without_a_dot() {
        assert!(split_service_call("not_a_service_id", json!({})).is_none());
    }

    /// Minimal scratch-directory helper, mirroring `kv.rs`'s own shim —
    /// avoids an extra `tempfile` dev-dependency just for this module's tests.
    struct TempDir(PathBuf);

    impl TempDir {
        fn new(label: &str) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!(
                "mirai-automation-test-{label}-{}",
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ));
            TempDir(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[derive(Clone, Default)]
    struct RecorderState {
        fired: Option<Arc<Mutex<Vec<String>>>>,
    }

    struct RecorderAutomation {
        fired: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Automation for RecorderAutomation {
        type State = RecorderState;

        fn name(&self) -> &str {
            "recorder"
        }

        fn initial_state(&self) -> Self::State {
            RecorderState { fired: Some(self.fired.clone()) }
        }

        async fn handle_event(&self, _ctx: &AutomationContext, _state: &mut Self::State, _event: &Event) {}

        async fn handle_message(&self, _ctx: &AutomationContext, state: &mut Self::State, message: &str) {
            if let Some(fired) = &state.fired {
                fired.lock().unwrap().push(message.to_string());
            }
        }
    }

    /// Spins up a full `AutomationActor<RecorderAutomation>` with real (but
    /// unreachable) HA/MQTT connectors, so `TimerControl` messages exercise
    /// the actual dispatch path instead of a hand-rolled stand-in.
    fn spawn_recorder(data_dir: &Path) -> (Addr<AutomationActor<RecorderAutomation>>, Arc<Mutex<Vec<String>>>) {
        let bus = EventBus::new();
        let ha = HaConnector::new(Url::parse("ws://127.0.0.1:1/api/websocket").unwrap(), "token".to_string(), bus.clone())
            .start();
        let mqtt = MqttConnector::new(&Url::parse("tcp://127.0.0.1:1").unwrap(), "test-client", vec![], bus.clone())
            .start();
        let scheduler = Scheduler::new("UTC", None).start();
        let state_cache = StateCache::new();
        let global_kv = GlobalKv::open(&data_dir.join("global_state.dat")).unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let automation = RecorderAutomation { fired: fired.clone() };
        let addr = AutomationActor::new(automation, ha, mqtt, scheduler, state_cache, global_kv, bus).start();
        (addr, fired)
    }

    #[actix::test]
    async fn scheduling_an_existing_timer_name_replaces_it_instead_of_arming_a_second_one() {
        let dir = TempDir::new("timer-replace");
        let (addr, fired) = spawn_recorder(dir.path());

        addr.do_send(TimerControl::Schedule { label: "off".into(), delay: Duration::from_millis(600) });
        tokio::time::sleep(Duration::from_millis(50)).await;
        addr.do_send(TimerControl::Schedule { label: "off".into(), delay: Duration::from_millis(120) });

        // Long enough to observe the replacement firing, nowhere near the
        // original +600ms mark.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.lock().unwrap().as_slice(), ["off".to_string()]);

        // And it must not fire a second time at the original delay.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.lock().unwrap().as_slice(), ["off".to_string()]);
    }

    #[actix::test]
    async fn cancelling_a_timer_twice_in_a_row_is_a_no_op_and_prevents_firing() {
        let dir = TempDir::new("timer-cancel");
        let (addr, fired) = spawn_recorder(dir.path());

        addr.do_send(TimerControl::Schedule { label: "off".into(), delay: Duration::from_millis(60) });
        addr.do_send(TimerControl::Cancel { label: "off".into() });
        addr.do_send(TimerControl::Cancel { label: "off".into() });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fired.lock().unwrap().is_empty());
    }
}
