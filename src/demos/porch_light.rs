//! Turns the porch light on at sunset and off at a fixed time, with a
//! schedule-armed hand-off: turning the light on updates its believed
//! state so a stale [`handle_event`] echo doesn't trigger a redundant call.

use chrono::NaiveTime;
use serde_json::json;

use crate::automation::{Automation, AutomationContext};
use crate::event::{Event, EventType};
use crate::scheduler::ScheduleDecl;

const PORCH_LIGHT: &str = "light.porch";
const TURN_ON_MESSAGE: &str = "dusk";
const TURN_OFF_MESSAGE: &str = "late_night_cutoff";

#[derive(Clone, Default)]
pub struct PorchLightState {
    believed_on: bool,
}

pub struct PorchLight;

#[async_trait::async_trait]
impl Automation for PorchLight {
    type State = PorchLightState;

    fn name(&self) -> &str {
        "porch_light"
    }

    fn initial_state(&self) -> Self::State {
        PorchLightState::default()
    }

    fn schedules(&self) -> Vec<ScheduleDecl> {
        vec![
            ScheduleDecl::sunset(TURN_ON_MESSAGE, 0),
            ScheduleDecl::daily(TURN_OFF_MESSAGE, NaiveTime::from_hms_opt(23, 0, 0).unwrap()),
        ]
    }

    async fn handle_event(&self, _ctx: &AutomationContext, state: &mut Self::State, event: &Event) {
        if event.entity_id.as_deref() != Some(PORCH_LIGHT) || event.event_type != EventType::StateChanged {
            return;
        }
        if let Some(new_state) = &event.new_state {
            state.believed_on = new_state.state == json!("on");
        }
    }

    async fn handle_message(&self, ctx: &AutomationContext, state: &mut Self::State, message: &str) {
        match message {
            TURN_ON_MESSAGE if !state.believed_on => {
                ctx.call_service("light.turn_on", json!({ "entity_id": PORCH_LIGHT }));
                state.believed_on = true;
            }
            TURN_OFF_MESSAGE if state.believed_on => {
                ctx.call_service("light.turn_off", json!({ "entity_id": PORCH_LIGHT }));
                state.believed_on = false;
            }
            _ => {}
        }
    }
}
