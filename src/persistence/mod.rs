//! JSON persistence for the three fleet files: `devices.json`,
//! `gateways.json`, `simulator.json`. Saves are routed
//! through a single task so concurrent mutations from the operator
//! console never interleave writes to the same file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub dev_eui: String,
    pub app_eui: String,
    pub app_key: String,
    pub name: String,
    pub region: u8,
    pub active: bool,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    #[serde(default = "default_send_interval")]
    pub send_interval_secs: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_range_m")]
    pub range_m: f64,
    #[serde(default)]
    pub disable_fcnt_down: bool,
    #[serde(default = "default_true")]
    pub supported_otaa: bool,
    #[serde(default = "default_true")]
    pub supported_adr: bool,
    #[serde(default)]
    pub supported_class_b: bool,
    #[serde(default)]
    pub supported_class_c: bool,
    #[serde(default)]
    pub supported_fragment: bool,
    #[serde(default = "default_data_rate")]
    pub data_rate: u8,
    #[serde(default)]
    pub rx1_dr_offset: u8,
    #[serde(default = "default_nb_retransmission")]
    pub nb_retransmission: u8,
    #[serde(default = "default_rx_delay")]
    pub rx_delay_secs: u64,
    #[serde(default = "default_rx_duration_open")]
    pub rx_duration_open_ms: u64,
    #[serde(default)]
    pub confirmed_uplinks: bool,
}

fn default_send_interval() -> u64 {
    60
}
fn default_ack_timeout() -> u64 {
    5
}
fn default_range_m() -> f64 {
    2000.0
}
fn default_true() -> bool {
    true
}
fn default_data_rate() -> u8 {
    5
}
fn default_nb_retransmission() -> u8 {
    3
}
fn default_rx_delay() -> u64 {
    1
}
fn default_rx_duration_open() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub mac: String,
    pub name: String,
    pub active: bool,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub ip: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorRecord {
    pub bridge_address: Option<String>,
}

/// A pending write, dispatched to the single save task.
pub enum SaveRequest {
    Devices(Vec<DeviceRecord>),
    Gateways(Vec<GatewayRecord>),
    Simulator(SimulatorRecord),
}

#[derive(Clone)]
pub struct Persistence {
    tx: mpsc::Sender<SaveRequest>,
}

impl Persistence {
    /// Spawns the save task and returns a handle. `dir` is the directory
    /// `devices.json`/`gateways.json`/`simulator.json` live under.
    pub fn spawn(dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<SaveRequest>(32);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let result = match req {
                    SaveRequest::Devices(records) => write_json(&dir.join("devices.json"), &records),
                    SaveRequest::Gateways(records) => write_json(&dir.join("gateways.json"), &records),
                    SaveRequest::Simulator(record) => write_json(&dir.join("simulator.json"), &record),
                };
                if let Err(e) = result {
                    error!("persistence write failed: {e}");
                } else {
                    info!("persisted fleet state");
                }
            }
        });
        Self { tx }
    }

    pub async fn save(&self, req: SaveRequest) {
        if self.tx.send(req).await.is_err() {
            error!("persistence task is gone, dropping save request");
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn load_devices(dir: &Path) -> anyhow::Result<Vec<DeviceRecord>> {
    load_or_empty(&dir.join("devices.json"))
}

pub fn load_gateways(dir: &Path) -> anyhow::Result<Vec<GatewayRecord>> {
    load_or_empty(&dir.join("gateways.json"))
}

pub fn load_simulator(dir: &Path) -> anyhow::Result<Option<SimulatorRecord>> {
    let path = dir.join("simulator.json");
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn load_or_empty<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_shim::TempDir;

    mod tempfile_shim {
        use std::path::PathBuf;

        /// Minimal scratch-dir helper so persistence tests don't need the
        /// `tempfile` crate for a single use site.
        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let dir = std::env::temp_dir().join(format!("lwn-sim-test-{}", std::process::id()));
                std::fs::create_dir_all(&dir).unwrap();
                Self(dir)
            }
            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn missing_files_load_as_empty() {
        let dir = TempDir::new();
        assert!(load_devices(dir.path()).unwrap().is_empty());
        assert!(load_gateways(dir.path()).unwrap().is_empty());
        assert!(load_simulator(dir.path()).unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = TempDir::new();
        let persistence = Persistence::spawn(dir.path().to_path_buf());
        let record = DeviceRecord {
            dev_eui: "0102030405060708".into(),
            app_eui: "0102030405060708".into(),
            app_key: "00".repeat(16),
            name: "dev-1".into(),
            region: 1,
            active: true,
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            send_interval_secs: default_send_interval(),
            ack_timeout_secs: default_ack_timeout(),
            range_m: default_range_m(),
            disable_fcnt_down: false,
            supported_otaa: true,
            supported_adr: true,
            supported_class_b: false,
            supported_class_c: false,
            supported_fragment: false,
            data_rate: default_data_rate(),
            rx1_dr_offset: 0,
            nb_retransmission: default_nb_retransmission(),
            rx_delay_secs: default_rx_delay(),
            rx_duration_open_ms: default_rx_duration_open(),
            confirmed_uplinks: false,
        };
        persistence.save(SaveRequest::Devices(vec![record.clone()])).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let loaded = load_devices(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].dev_eui, record.dev_eui);
    }
}
