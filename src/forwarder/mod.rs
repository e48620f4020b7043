//! Forwarder: the shared routing fabric that pairs every uplink with the
//! gateways in range and routes downlinks back to the device that owns
//! the target address.
//!
//! Grounded on the `Arc<RwLock<..>>` handle pattern in
//! `src/udp/mod.rs`'s `GatewayTracker`/`DownlinkSender`: reads (fan-out
//! enumeration) are frequent and shouldn't block each other; writes
//! (register/unregister/update) are rare and exclusive.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::error::ForwarderResult;
use crate::lorawan::keys::{DevAddr, DevEui};

/// Location in decimal degrees + meters above sea level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// Haversine great-circle distance between two points, in meters.
pub fn haversine_m(a: Location, b: Location) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// A frame ready to be emitted over the packet-forwarder protocol: raw PHY
/// payload plus the TX parameters the gateway needs to build an `rxpk`.
#[derive(Debug, Clone)]
pub struct UplinkFrame {
    pub dev_addr: DevAddr,
    pub phy_payload: Vec<u8>,
    pub freq_mhz: f64,
    pub datr: String,
    pub codr: String,
}

/// A downlink handed back to its owning device's inbox.
#[derive(Debug, Clone)]
pub struct DownlinkFrame {
    pub phy_payload: Vec<u8>,
}

struct DeviceEntry {
    dev_eui: DevEui,
    dev_addr: Option<DevAddr>,
    location: Location,
    range_m: f64,
    inbox: mpsc::Sender<DownlinkFrame>,
}

struct GatewayEntry {
    outbox: mpsc::Sender<UplinkFrame>,
    location: Location,
}

/// Registration info for a device joining the routing fabric.
pub struct DeviceInfo {
    pub dev_eui: DevEui,
    pub dev_addr: Option<DevAddr>,
    pub location: Location,
    pub range_m: f64,
    pub inbox: mpsc::Sender<DownlinkFrame>,
}

/// Registration info for a gateway joining the routing fabric.
pub struct GatewayInfo {
    pub mac: [u8; 8],
    pub location: Location,
    pub outbox: mpsc::Sender<UplinkFrame>,
}

#[derive(Default)]
struct Tables {
    by_addr: HashMap<u32, DeviceEntry>,
    by_eui: HashMap<[u8; 8], u32>,
    gateways: HashMap<[u8; 8], GatewayEntry>,
}

/// Cloneable handle onto the shared routing tables. Every device and
/// gateway task holds one; none of them owns the tables outright.
#[derive(Clone)]
pub struct Forwarder {
    inner: Arc<RwLock<Tables>>,
}

impl Forwarder {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(Tables::default())) }
    }

    /// Registers a device. Pre-join, devices are keyed by DevEUI only;
    /// once a DevAddr is assigned, `update_device` promotes the entry.
    pub async fn register_device(&self, info: DeviceInfo) {
        let mut tables = self.inner.write().await;
        if let Some(addr) = info.dev_addr {
            tables.by_eui.insert(info.dev_eui.0, addr.0);
            tables.by_addr.insert(
                addr.0,
                DeviceEntry {
                    dev_eui: info.dev_eui,
                    dev_addr: Some(addr),
                    location: info.location,
                    range_m: info.range_m,
                    inbox: info.inbox,
                },
            );
        } else {
            // Pre-join placeholder keyed by a synthetic address derived
            // from the DevEUI's low 32 bits so JoinRequest-time downlink
            // lookups by DevEUI still resolve through the address table.
            let synthetic = u32::from_be_bytes(info.dev_eui.0[4..8].try_into().unwrap());
            tables.by_eui.insert(info.dev_eui.0, synthetic);
            tables.by_addr.insert(
                synthetic,
                DeviceEntry {
                    dev_eui: info.dev_eui,
                    dev_addr: None,
                    location: info.location,
                    range_m: info.range_m,
                    inbox: info.inbox,
                },
            );
        }
    }

    pub async fn unregister_device(&self, dev_addr: DevAddr) {
        let mut tables = self.inner.write().await;
        if let Some(entry) = tables.by_addr.remove(&dev_addr.0) {
            tables.by_eui.remove(&entry.dev_eui.0);
        }
    }

    /// Called when a device's DevAddr or location changes, e.g. after a
    /// successful join-accept assigns the real DevAddr over the synthetic
    /// pre-join one.
    pub async fn update_device(&self, dev_eui: DevEui, new_addr: Option<DevAddr>, location: Location) {
        let mut tables = self.inner.write().await;
        let Some(&old_key) = tables.by_eui.get(&dev_eui.0) else {
            warn!(dev_eui = %dev_eui.to_hex(), "update_device: no prior registration");
            return;
        };
        let Some(mut entry) = tables.by_addr.remove(&old_key) else { return };
        entry.location = location;
        if let Some(addr) = new_addr {
            entry.dev_addr = Some(addr);
            tables.by_eui.insert(dev_eui.0, addr.0);
            tables.by_addr.insert(addr.0, entry);
        } else {
            tables.by_addr.insert(old_key, entry);
        }
    }

    pub async fn register_gateway(&self, info: GatewayInfo) {
        let mut tables = self.inner.write().await;
        tables.gateways.insert(info.mac, GatewayEntry { outbox: info.outbox, location: info.location });
    }

    pub async fn unregister_gateway(&self, mac: [u8; 8]) {
        self.inner.write().await.gateways.remove(&mac);
    }

    /// Fans an uplink out to every gateway within range of `location`.
    pub async fn uplink(&self, location: Location, range_m: f64, frame: UplinkFrame) -> ForwarderResult {
        let tables = self.inner.read().await;
        let mut sent = 0usize;
        for gw in tables.gateways.values() {
            if haversine_m(location, gw.location) <= range_m {
                if gw.outbox.send(frame.clone()).await.is_ok() {
                    sent += 1;
                } else {
                    debug!("gateway outbox closed, dropping uplink");
                }
            }
        }
        if sent == 0 {
            ForwarderResult::NoPath
        } else {
            ForwarderResult::FannedOut(sent)
        }
    }

    /// Delivers a downlink to the device owning `dev_addr`.
    pub async fn downlink(&self, dev_addr: DevAddr, frame: DownlinkFrame) -> ForwarderResult {
        let tables = self.inner.read().await;
        match tables.by_addr.get(&dev_addr.0) {
            Some(entry) => {
                if entry.inbox.send(frame).await.is_ok() {
                    ForwarderResult::Delivered
                } else {
                    ForwarderResult::UnknownDevice
                }
            }
            None => ForwarderResult::UnknownDevice,
        }
    }

    /// Broadcasts a frame to every registered device's inbox.
    ///
    /// A JoinAccept carries no plaintext DevEUI/DevAddr; on real radio
    /// hardware every device in range hears it and only the one whose
    /// AppKey verifies the MIC accepts it. This mirrors that: the gateway
    /// hands every JoinAccept-shaped downlink to every device, and each
    /// device's own `parse_join_accept` call silently rejects the ones
    /// that aren't addressed to it.
    pub async fn broadcast(&self, frame: DownlinkFrame) -> usize {
        let tables = self.inner.read().await;
        let mut sent = 0;
        for entry in tables.by_addr.values() {
            if entry.inbox.send(frame.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(lat: f64, lon: f64) -> Location {
        Location { lat, lon, alt: 0.0 }
    }

    #[test]
    fn haversine_zero_distance_for_same_point() {
        let p = loc(45.0, 9.0);
        assert!(haversine_m(p, p) < 1e-6);
    }

    #[tokio::test]
    async fn uplink_with_no_gateways_returns_no_path() {
        let fwd = Forwarder::new();
        let frame = UplinkFrame {
            dev_addr: DevAddr(1),
            phy_payload: vec![],
            freq_mhz: 868.1,
            datr: "SF7BW125".into(),
            codr: "4/5".into(),
        };
        let result = fwd.uplink(loc(0.0, 0.0), 1000.0, frame).await;
        assert_eq!(result, ForwarderResult::NoPath);
    }

    #[tokio::test]
    async fn uplink_fans_out_to_in_range_gateway_only() {
        let fwd = Forwarder::new();
        let (tx_near, mut rx_near) = mpsc::channel(4);
        let (tx_far, _rx_far) = mpsc::channel(4);

        fwd.register_gateway(GatewayInfo { mac: [1; 8], location: loc(0.0, 0.0), outbox: tx_near }).await;
        fwd.register_gateway(GatewayInfo { mac: [2; 8], location: loc(10.0, 10.0), outbox: tx_far }).await;

        let frame = UplinkFrame {
            dev_addr: DevAddr(1),
            phy_payload: vec![1, 2, 3],
            freq_mhz: 868.1,
            datr: "SF7BW125".into(),
            codr: "4/5".into(),
        };
        let result = fwd.uplink(loc(0.001, 0.001), 1000.0, frame).await;
        assert_eq!(result, ForwarderResult::FannedOut(1));
        assert!(rx_near.try_recv().is_ok());
    }

    #[tokio::test]
    async fn downlink_to_unknown_device_is_unknown() {
        let fwd = Forwarder::new();
        let result = fwd.downlink(DevAddr(0xDEADBEEF), DownlinkFrame { phy_payload: vec![] }).await;
        assert_eq!(result, ForwarderResult::UnknownDevice);
    }

    #[tokio::test]
    async fn register_device_then_downlink_delivers() {
        let fwd = Forwarder::new();
        let (tx, mut rx) = mpsc::channel(4);
        fwd.register_device(DeviceInfo {
            dev_eui: DevEui([9; 8]),
            dev_addr: Some(DevAddr(42)),
            location: loc(0.0, 0.0),
            range_m: 500.0,
            inbox: tx,
        })
        .await;

        let result = fwd.downlink(DevAddr(42), DownlinkFrame { phy_payload: vec![9] }).await;
        assert_eq!(result, ForwarderResult::Delivered);
        assert!(rx.try_recv().is_ok());
    }
}
