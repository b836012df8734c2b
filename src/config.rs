//! Process configuration, read from environment variables (§6).

use std::path::PathBuf;

use clap::Parser;
use url::Url;

fn default_ha_url() -> Url {
    Url::parse("ws://homeassistant.local:8123/api/websocket").expect("a valid default HA URL")
}

fn default_mqtt_url() -> Url {
    Url::parse("tcp://localhost:1883").expect("a valid default MQTT broker URL")
}

#[derive(Parser, Debug, Clone)]
#[command(name = "mirai", about = "Home-automation event/automation runtime")]
pub struct Config {
    /// Home Assistant hostname
    #[clap(long, env = "HA_HOST", default_value = "homeassistant.local")]
    pub ha_host: String,

    /// Home Assistant port
    #[clap(long, env = "HA_PORT", default_value_t = 8123)]
    pub ha_port: u16,

    /// Home Assistant long-lived access token
    #[clap(long, env = "HA_TOKEN")]
    pub ha_token: Option<String>,

    /// MQTT broker hostname
    #[clap(long, env = "MQTT_HOST", default_value = "localhost")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[clap(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT client id
    #[clap(long, env = "MQTT_CLIENT_ID", default_value = "mirai")]
    pub mqtt_client_id: String,

    /// IANA timezone used for schedule math
    #[clap(long, env = "MIRAI_TIMEZONE", default_value = "Europe/Prague")]
    pub timezone: String,

    /// Decimal-degree latitude used for sunrise/sunset schedules
    #[clap(long, env = "MIRAI_LATITUDE")]
    pub latitude: Option<f64>,

    /// Decimal-degree longitude used for sunrise/sunset schedules
    #[clap(long, env = "MIRAI_LONGITUDE")]
    pub longitude: Option<f64>,

    /// Directory holding the durable global KV store
    #[clap(long, env = "MIRAI_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,
}

impl Config {
    pub fn ha_ws_url(&self) -> Url {
        let mut url = default_ha_url();
        url.set_host(Some(&self.ha_host)).expect("a valid host");
        url.set_port(Some(self.ha_port)).expect("a settable port");
        url
    }

    pub fn ha_rest_base(&self) -> Url {
        let scheme = "http";
        Url::parse(&format!("{scheme}://{}:{}", self.ha_host, self.ha_port)).expect("a valid REST base URL")
    }

    pub fn mqtt_broker_url(&self) -> Url {
        let mut url = default_mqtt_url();
        url.set_host(Some(&self.mqtt_host)).expect("a valid host");
        url.set_port(Some(self.mqtt_port)).expect("a settable port");
        url
    }

    pub fn location(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join("global_state.dat")
    }
}
