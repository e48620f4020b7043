//! `c2.json` configuration loading.
//!
//! Field names mirror `original_source/cmd/main.go`'s `C2Config` struct
//! one-for-one so an existing fleet's config file loads unchanged; this is
//! JSON, not TOML, because the upstream command-server catalog this
//! simulator was built around is JSON end to end.

use serde::Deserialize;
use std::path::Path;

use crate::error::SimError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default, rename = "c2serverREST")]
    pub c2server_rest: String,
    #[serde(default, rename = "c2serverWS")]
    pub c2server_ws: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "createDevicesLWN")]
    pub create_devices_lwn: bool,
    #[serde(default = "default_join_delay", rename = "joinDelay")]
    pub join_delay: u64,
    #[serde(default = "default_data_path_s", rename = "dataPathS")]
    pub data_path_s: String,
    #[serde(default = "default_data_path_l", rename = "dataPathL")]
    pub data_path_l: String,
    #[serde(default = "default_send_interval", rename = "sendInterval")]
    pub send_interval: u64,
    #[serde(default = "default_ack_timeout", rename = "ackTimeout")]
    pub ack_timeout: u64,
    #[serde(default = "default_rx_delay", rename = "rxDelay")]
    pub rx_delay: u64,
    #[serde(default = "default_rx_duration_open", rename = "rxDurationOpen")]
    pub rx_duration_open: u64,
    #[serde(default = "default_data_rate", rename = "dataRate")]
    pub data_rate: u8,
    #[serde(default = "default_config_dirname", rename = "configDirname")]
    pub config_dirname: String,
    #[serde(default, rename = "mgDeviceId")]
    pub mg_device_id: String,
    #[serde(default, rename = "mgPasscode")]
    pub mg_passcode: String,
    #[serde(default, rename = "createDevicesChirpstack")]
    pub create_devices_chirpstack: bool,
    #[serde(default, rename = "chirpstackServer")]
    pub chirpstack_server: String,
    #[serde(default, rename = "apiToken")]
    pub api_token: String,
    #[serde(default, rename = "applicationId")]
    pub application_id: String,
    #[serde(default, rename = "profileId")]
    pub profile_id: String,
    #[serde(default, rename = "tenantId")]
    pub tenant_id: String,
    #[serde(default = "default_max_devices", rename = "maxDevices")]
    pub max_devices: u32,
    #[serde(default = "default_parallel_devices", rename = "parallelDevices")]
    pub parallel_devices: u32,
    #[serde(default = "default_max_devices", rename = "maxDevicesTransmit")]
    pub max_devices_transmit: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_join_delay() -> u64 {
    5
}
fn default_data_path_s() -> String {
    "./data/s".to_string()
}
fn default_data_path_l() -> String {
    "./data/l".to_string()
}
fn default_send_interval() -> u64 {
    60
}
fn default_ack_timeout() -> u64 {
    5
}
fn default_rx_delay() -> u64 {
    1
}
fn default_rx_duration_open() -> u64 {
    500
}
fn default_data_rate() -> u8 {
    5
}
fn default_config_dirname() -> String {
    "./config".to_string()
}
fn default_max_devices() -> u32 {
    1000
}
fn default_parallel_devices() -> u32 {
    50
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let content = std::fs::read_to_string(path).map_err(|e| SimError::ConfigRead { path: path.to_path_buf(), source: e })?;
        serde_json::from_str(&content).map_err(|e| SimError::ConfigParse { path: path.to_path_buf(), source: e })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            c2server_rest: String::new(),
            c2server_ws: String::new(),
            username: String::new(),
            password: String::new(),
            create_devices_lwn: false,
            join_delay: default_join_delay(),
            data_path_s: default_data_path_s(),
            data_path_l: default_data_path_l(),
            send_interval: default_send_interval(),
            ack_timeout: default_ack_timeout(),
            rx_delay: default_rx_delay(),
            rx_duration_open: default_rx_duration_open(),
            data_rate: default_data_rate(),
            config_dirname: default_config_dirname(),
            mg_device_id: String::new(),
            mg_passcode: String::new(),
            create_devices_chirpstack: false,
            chirpstack_server: String::new(),
            api_token: String::new(),
            application_id: String::new(),
            profile_id: String::new(),
            tenant_id: String::new(),
            max_devices: default_max_devices(),
            parallel_devices: default_parallel_devices(),
            max_devices_transmit: default_max_devices(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.send_interval, 60);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: Config = serde_json::from_str(r#"{"sendInterval": 30}"#).unwrap();
        assert_eq!(config.send_interval, 30);
        assert_eq!(config.ack_timeout, default_ack_timeout());
    }
}
