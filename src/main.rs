use actix::{Actor, Supervisor, System};
use clap::Parser;
use log::{error, info};

mod automation;
mod bus;
mod config;
mod demos;
mod event;
mod ha_connector;
mod kv;
mod misc;
mod mqtt_connector;
mod normalize;
mod scheduler;
mod state_cache;

use automation::AutomationActor;
use bus::EventBus;
use config::Config;
use demos::pomodoro::PomodoroTimer;
use demos::porch_light::PorchLight;
use ha_connector::HaConnector;
use kv::GlobalKv;
use mqtt_connector::{MqttConnector, DEFAULT_TOPIC_FILTERS};
use scheduler::Scheduler;
use state_cache::StateCache;

/// `HA_TOKEN` missing at startup: fail fast, no point retrying.
const EXIT_MISSING_TOKEN: i32 = 78;
/// Global KV data directory could not be created/opened.
const EXIT_KV_UNAVAILABLE: i32 = 74;

#[actix::main]
async fn main() {
    env_logger::init();
    info!("{} starting on {}", misc::app_infos::name(), misc::hostname());

    let config = Config::parse();

    let Some(token) = config.ha_token.clone() else {
        error!("HA_TOKEN is required");
        std::process::exit(EXIT_MISSING_TOKEN);
    };

    let bus = EventBus::new();

    let kv_path = config.kv_path();
    let global_kv = match GlobalKv::open(&kv_path) {
        Ok(kv) => kv,
        Err(err) => {
            error!("failed to open global KV store at {}: {err:#}", kv_path.display());
            std::process::exit(EXIT_KV_UNAVAILABLE);
        }
    };

    let state_cache = StateCache::new();
    state_cache.bootstrap(&config).await;
    state_cache.spawn_live_updates(&bus);

    let ha_addr = HaConnector::new(config.ha_ws_url(), token, bus.clone()).start();

    let topic_filters = DEFAULT_TOPIC_FILTERS.iter().map(|s| s.to_string()).collect();
    let mqtt_addr =
        MqttConnector::new(&config.mqtt_broker_url(), &config.mqtt_client_id, topic_filters, bus.clone()).start();

    let scheduler_addr = Scheduler::new(&config.timezone, config.location()).start();

    {
        let ha_addr = ha_addr.clone();
        let mqtt_addr = mqtt_addr.clone();
        let scheduler_addr = scheduler_addr.clone();
        let state_cache = state_cache.clone();
        let global_kv = global_kv.clone();
        let bus = bus.clone();
        Supervisor::start(move |_ctx| {
            AutomationActor::new(PomodoroTimer, ha_addr, mqtt_addr, scheduler_addr, state_cache, global_kv, bus)
        });
    }
    {
        let global_kv = global_kv.clone();
        let bus = bus.clone();
        Supervisor::start(move |_ctx| {
            AutomationActor::new(PorchLight, ha_addr, mqtt_addr, scheduler_addr, state_cache, global_kv, bus)
        });
    }

    info!("mirai started");

    actix::rt::signal::ctrl_c().await.ok();
    info!("shutting down");
    global_kv.close();
    System::current().stop();
}
