//! Bridges the `pomodoro/timer/+` MQTT seed topic to HA notifications:
//! `pomodoro/timer/start` (payload: minutes, defaults to 25) arms a timer;
//! `pomodoro/timer/cancel` cancels it; on expiry a notification fires and
//! the MQTT status topic is updated.

use std::time::Duration;

use log::warn;
use serde_json::json;

use crate::automation::{Automation, AutomationContext};
use crate::event::{Event, EventSource};
use crate::scheduler::ScheduleDecl;

const TIMER_NAME: &str = "finish";
const STATUS_TOPIC: &str = "pomodoro/timer/status";
const DEFAULT_MINUTES: u64 = 25;

#[derive(Clone, Default)]
pub struct PomodoroState {
    running: bool,
}

pub struct PomodoroTimer;

#[async_trait::async_trait]
impl Automation for PomodoroTimer {
    type State = PomodoroState;

    fn name(&self) -> &str {
        "pomodoro_timer"
    }

    fn initial_state(&self) -> Self::State {
        PomodoroState::default()
    }

    fn schedules(&self) -> Vec<ScheduleDecl> {
        Vec::new()
    }

    async fn handle_event(&self, ctx: &AutomationContext, state: &mut Self::State, event: &Event) {
        if event.source != EventSource::Mqtt {
            return;
        }
        let Some(entity_id) = &event.entity_id else { return };
        match entity_id.as_str() {
            "pomodoro/timer/start" => {
                let minutes = event
                    .new_state
                    .as_ref()
                    .and_then(|s| s.state.as_u64().or_else(|| s.state.get("raw").and_then(|r| r.as_str()?.trim().parse().ok())))
                    .unwrap_or(DEFAULT_MINUTES);
                ctx.schedule_timer(TIMER_NAME, Duration::from_secs(minutes * 60));
                state.running = true;
                ctx.publish_mqtt(STATUS_TOPIC, b"running".to_vec());
            }
            "pomodoro/timer/cancel" => {
                ctx.cancel_timer(TIMER_NAME);
                state.running = false;
                ctx.publish_mqtt(STATUS_TOPIC, b"idle".to_vec());
            }
            _ => {}
        }
    }

    async fn handle_message(&self, ctx: &AutomationContext, state: &mut Self::State, message: &str) {
        if message != TIMER_NAME {
            warn!("{}: unexpected message {message:?}", ctx.name());
            return;
        }
        state.running = false;
        ctx.call_service(
            "notify.notify",
            json!({ "message": "Pomodoro session complete" }),
        );
        ctx.publish_mqtt(STATUS_TOPIC, b"idle".to_vec());
    }
}
