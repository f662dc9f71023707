use serde_derive::Deserialize;

use crate::alarm::{RepeatPolicy, UnknownTagPolicy};

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub database: Option<DatabaseConfig>,
    pub rfid: Option<RfidConfig>,
    pub alarm: Option<AlarmConfig>,
    pub kiosk: Option<KioskConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub reconnect_delay_seconds: Option<u64>,
    pub client_ids: Option<ClientIds>,
}

/// One MQTT client identity per role, so sessions never collide on the broker.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientIds {
    pub rfid_publisher: String,
    pub alarm_rfid_subscriber: String,
    pub alarm_gui_subscriber: String,
    pub gui_subscriber: String,
    pub gui_publisher: String,
}

impl Default for ClientIds {
    fn default() -> Self {
        ClientIds {
            rfid_publisher: "rfid_publisher".to_string(),
            alarm_rfid_subscriber: "alarm_rfid_subscriber".to_string(),
            alarm_gui_subscriber: "alarm_gui_subscriber".to_string(),
            gui_subscriber: "gui_subscriber".to_string(),
            gui_publisher: "gui_publisher".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: Option<u32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct RfidConfig {
    /// Serial device or file emitting one `EPC[,RSSI]` record per line.
    pub device: Option<String>,
    pub timeout_ms: Option<u64>,
    pub idle_delay_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AlarmConfig {
    pub relay_pin: Option<u32>,
    pub gpio_root: Option<String>,
    pub unknown_tag_policy: Option<UnknownTagPolicy>,
    pub repeat_policy: Option<RepeatPolicy>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct KioskConfig {
    pub admin_password: String,
}

impl MqttConfig {
    pub fn client_ids(&self) -> ClientIds {
        self.client_ids.clone().unwrap_or_default()
    }
}

impl AppConfig {
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(contents)
    }
}
