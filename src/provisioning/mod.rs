//! Fleet-provisioning ingress: a WebSocket client that ingests a batched
//! device/profile catalog from an external command server.
//!
//! Grounded on `tokio-tungstenite`'s client usage in
//! `examples/other_examples/manifests/arx-os-arxos` for the connect/read-loop
//! shape. The untyped JSON-map walking of the Go original's provisioning
//! path is replaced here with serde-typed `BondedDevice`/`DeviceProfile`
//! records.

use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// One batch frame from the command server:
/// `{ msg_type, sequence, dataSize, finalBatch, bonded_devices[], deviceProfiles[] }`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchMessage {
    pub msg_type: String,
    pub sequence: u64,
    #[serde(rename = "dataSize")]
    pub data_size: usize,
    #[serde(rename = "finalBatch")]
    pub final_batch: bool,
    #[serde(default)]
    pub bonded_devices: Vec<BondedDevice>,
    #[serde(default)]
    pub device_profiles: Vec<DeviceProfile>,
}

/// One device descriptor: `code` (DevEUI), `name`, `key` (AppKey), `type`
/// (category), `data_type`, `axis`, `profileId`.
#[derive(Debug, Clone, Deserialize)]
pub struct BondedDevice {
    pub code: String,
    pub name: String,
    pub key: String,
    #[serde(rename = "type")]
    pub category_raw: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub axis: u8,
    #[serde(rename = "profileId")]
    pub profile_id: String,
}

impl BondedDevice {
    /// The device's parsed category. Unknown `type` strings are not an
    /// error: they surface as `Unsupported` and are logged and skipped by
    /// the caller.
    pub fn category(&self) -> DeviceCategory {
        match self.category_raw.as_str() {
            "gateway" => DeviceCategory::Gateway,
            "device" | "device-class" | "sensor" => DeviceCategory::Device,
            other => DeviceCategory::Unsupported(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCategory {
    Gateway,
    Device,
    Unsupported(String),
}

/// A device profile:
/// `{ id, deviceSupportOTAA, deviceSupportClassB, deviceSupportClassC, deviceRegion }`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    pub id: String,
    #[serde(rename = "deviceSupportOTAA")]
    pub device_support_otaa: bool,
    #[serde(rename = "deviceSupportClassB")]
    pub device_support_class_b: bool,
    #[serde(rename = "deviceSupportClassC")]
    pub device_support_class_c: bool,
    #[serde(rename = "deviceRegion")]
    pub device_region: String,
}

/// Outcome of a completed or abandoned provisioning session, sent to the
/// caller over an `mpsc` channel so the WS read loop never blocks on
/// registration work.
#[derive(Debug)]
pub enum ProvisioningEvent {
    Completed { devices: Vec<BondedDevice>, profiles: Vec<DeviceProfile> },
    Aborted { reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },
    #[error("final batch accumulated {accumulated} devices, dataSize declared {declared}")]
    SizeMismatch { accumulated: usize, declared: usize },
}

/// Accumulates batches of a single provisioning session, enforcing a
/// strictly increasing sequence starting at 1 whose accumulated
/// `|bonded_devices|` equals the final batch's `dataSize`.
#[derive(Debug, Default)]
pub struct ProvisioningSession {
    expected_sequence: u64,
    devices: Vec<BondedDevice>,
    profiles: Vec<DeviceProfile>,
}

impl ProvisioningSession {
    pub fn new() -> Self {
        Self { expected_sequence: 1, devices: Vec::new(), profiles: Vec::new() }
    }

    /// Feeds one batch into the session. Returns `Ok(Some(event))` once the
    /// session concludes (completed or aborted by this batch), `Ok(None)`
    /// if more batches are still expected.
    pub fn ingest(&mut self, batch: BatchMessage) -> Result<Option<ProvisioningEvent>, SessionError> {
        if batch.sequence != self.expected_sequence {
            return Err(SessionError::SequenceGap { expected: self.expected_sequence, got: batch.sequence });
        }
        self.expected_sequence += 1;
        self.devices.extend(batch.bonded_devices);
        self.profiles.extend(batch.device_profiles);

        if !batch.final_batch {
            return Ok(None);
        }

        if self.devices.len() != batch.data_size {
            return Err(SessionError::SizeMismatch { accumulated: self.devices.len(), declared: batch.data_size });
        }

        Ok(Some(ProvisioningEvent::Completed {
            devices: std::mem::take(&mut self.devices),
            profiles: std::mem::take(&mut self.profiles),
        }))
    }
}

/// Runs the WebSocket provisioning client against `url` until `shutdown`
/// fires or the connection closes. Each concluded session (completed or
/// aborted) is handed to `events`; the read loop keeps running afterward so
/// a single long-lived connection can carry multiple provisioning sessions.
pub async fn run_client(url: &str, events: mpsc::Sender<ProvisioningEvent>, mut shutdown: broadcast::Receiver<()>) {
    let (ws_stream, _) = match tokio_tungstenite::connect_async(url).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("provisioning WS connect to {url} failed: {e}");
            return;
        }
    };
    info!(url, "provisioning WS connected");
    let (_, mut read) = ws_stream.split();
    let mut session = ProvisioningSession::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("provisioning client shutting down");
                return;
            }
            frame = read.next() => {
                let Some(frame) = frame else {
                    debug!("provisioning WS closed by peer");
                    return;
                };
                let Ok(Message::Text(text)) = frame else {
                    continue;
                };
                let batch: BatchMessage = match serde_json::from_str(&text) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("malformed provisioning batch: {e}");
                        continue;
                    }
                };
                match session.ingest(batch) {
                    Ok(Some(event)) => {
                        session = ProvisioningSession::new();
                        let _ = events.send(event).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("provisioning session abandoned: {e}");
                        session = ProvisioningSession::new();
                        let _ = events.send(ProvisioningEvent::Aborted { reason: e.to_string() }).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(seq: u64, data_size: usize, final_batch: bool, devices: Vec<BondedDevice>) -> BatchMessage {
        BatchMessage {
            msg_type: "batch".into(),
            sequence: seq,
            data_size,
            final_batch,
            bonded_devices: devices,
            device_profiles: Vec::new(),
        }
    }

    fn device(code: &str) -> BondedDevice {
        BondedDevice {
            code: code.into(),
            name: "dev".into(),
            key: "00".repeat(16),
            category_raw: "device".into(),
            data_type: String::new(),
            axis: 0,
            profile_id: "p1".into(),
        }
    }

    #[test]
    fn three_batches_complete_session_with_exact_count() {
        let mut session = ProvisioningSession::new();
        assert!(session.ingest(batch(1, 3, false, vec![device("a")])).unwrap().is_none());
        assert!(session.ingest(batch(2, 3, false, vec![device("b")])).unwrap().is_none());
        let event = session.ingest(batch(3, 3, true, vec![device("c")])).unwrap().unwrap();
        match event {
            ProvisioningEvent::Completed { devices, .. } => assert_eq!(devices.len(), 3),
            ProvisioningEvent::Aborted { reason } => panic!("unexpected abort: {reason}"),
        }
    }

    #[test]
    fn sequence_gap_aborts_session() {
        let mut session = ProvisioningSession::new();
        session.ingest(batch(1, 2, false, vec![device("a")])).unwrap();
        let err = session.ingest(batch(3, 2, true, vec![device("b")])).unwrap_err();
        assert_eq!(err, SessionError::SequenceGap { expected: 2, got: 3 });
    }

    #[test]
    fn final_batch_size_mismatch_is_an_error() {
        let mut session = ProvisioningSession::new();
        let err = session.ingest(batch(1, 5, true, vec![device("a")])).unwrap_err();
        assert_eq!(err, SessionError::SizeMismatch { accumulated: 1, declared: 5 });
    }

    #[test]
    fn unknown_type_maps_to_unsupported() {
        let mut d = device("a");
        d.category_raw = "drone".into();
        assert_eq!(d.category(), DeviceCategory::Unsupported("drone".into()));
    }

    #[test]
    fn known_types_map_to_gateway_and_device() {
        let mut d = device("a");
        assert_eq!(d.category(), DeviceCategory::Device);
        d.category_raw = "gateway".into();
        assert_eq!(d.category(), DeviceCategory::Gateway);
    }
}
