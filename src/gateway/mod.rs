//! Gateway Runtime: per-gateway loop that multiplexes the Forwarder
//! outbox with the external packet-forwarder bridge socket.
//!
//! Grounded on `src/udp/mod.rs`'s `run_server`/`start_server` task shape
//! (single `tokio::spawn`'d receive loop plus a cloneable sender handle),
//! turned around to dial out rather than bind and listen: this
//! simulator plays the gateway role, not the network server.

pub mod protocol;

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::forwarder::{DownlinkFrame, Forwarder, GatewayInfo, Location, UplinkFrame};
use crate::lorawan::keys::DevAddr;
use protocol::{InboundPacket, Rxpk};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mac: [u8; 8],
    pub name: String,
    pub location: Location,
    pub bridge_addr: Option<SocketAddr>,
    pub keep_alive: Duration,
}

/// A gateway with no `bridge_addr` is "virtual": it still registers with
/// the Forwarder and participates in uplink fan-out/downlink dispatch for
/// intra-simulator testing, but never opens a socket.
pub struct Gateway {
    config: GatewayConfig,
    forwarder: Forwarder,
    outbox_tx: mpsc::Sender<UplinkFrame>,
    outbox_rx: mpsc::Receiver<UplinkFrame>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, forwarder: Forwarder) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(64);
        Self { config, forwarder, outbox_tx, outbox_rx }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        self.forwarder
            .register_gateway(GatewayInfo { mac: self.config.mac, location: self.config.location, outbox: self.outbox_tx.clone() })
            .await;

        let socket = match self.config.bridge_addr {
            Some(addr) => match dial(addr).await {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(gateway = %self.config.name, "failed to dial bridge {addr}: {e}, running virtual");
                    None
                }
            },
            None => None,
        };

        let mut keepalive = tokio::time::interval(self.config.keep_alive);
        let mut rng = rand::thread_rng();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = keepalive.tick() => {
                    if let Some(sock) = &socket {
                        let token = rng.gen();
                        let packet = protocol::pull_data(token, self.config.mac);
                        if let Err(e) = sock.send(&packet).await {
                            warn!(gateway = %self.config.name, "keepalive send failed: {e}");
                        }
                    }
                }
                Some(frame) = self.outbox_rx.recv() => {
                    self.emit_uplink(socket.as_ref(), &mut rng, frame).await;
                }
                Some(inbound) = recv_inbound(socket.as_ref()) => {
                    self.handle_inbound(socket.as_ref(), inbound).await;
                }
            }
        }

        self.forwarder.unregister_gateway(self.config.mac).await;
        info!(gateway = %self.config.name, "gateway task drained and stopped");
    }

    async fn emit_uplink(&self, socket: Option<&UdpSocket>, rng: &mut impl Rng, frame: UplinkFrame) {
        let Some(sock) = socket else {
            debug!(gateway = %self.config.name, "virtual gateway, dropping uplink emission");
            return;
        };
        let rxpk = Rxpk {
            time: Some(chrono::Utc::now().to_rfc3339()),
            tmst: 0,
            chan: 0,
            rfch: 0,
            freq: frame.freq_mhz,
            stat: 1,
            modu: "LORA".into(),
            datr: frame.datr.clone(),
            codr: frame.codr.clone(),
            lsnr: 7.0,
            rssi: -80,
            size: frame.phy_payload.len() as u16,
            data: base64_encode(&frame.phy_payload),
        };
        let token = rng.gen();
        match protocol::push_data(token, self.config.mac, &[rxpk]) {
            Ok(packet) => {
                if let Err(e) = sock.send(&packet).await {
                    warn!(gateway = %self.config.name, "PUSH_DATA send failed: {e}");
                }
            }
            Err(e) => warn!("failed to build PUSH_DATA: {e}"),
        }
    }

    async fn handle_inbound(&self, socket: Option<&UdpSocket>, packet: InboundPacket) {
        match packet {
            InboundPacket::PullResp { random_token, txpk } => {
                let ack_error = match base64_decode(&txpk.data) {
                    Ok(payload) => self.route_downlink(payload).await,
                    Err(e) => {
                        warn!(gateway = %self.config.name, "PULL_RESP carried invalid base64: {e}");
                        Some("BAD_DATA".to_string())
                    }
                };
                self.send_tx_ack(socket, random_token, ack_error.as_deref()).await;
            }
            InboundPacket::PushAck { .. } | InboundPacket::PullAck { .. } | InboundPacket::TxAck { .. } => {}
        }
    }

    /// Routes a decoded `PULL_RESP` payload to its owning device via the
    /// Forwarder. Returns `Some(reason)` if the transmission should be
    /// reported as failed in the following `TX_ACK`.
    async fn route_downlink(&self, payload: Vec<u8>) -> Option<String> {
        match crate::lorawan::decode_phy_payload(&payload) {
            Ok(crate::lorawan::LoRaWANFrame::Data { dev_addr, .. }) => {
                match self.forwarder.downlink(DevAddr(dev_addr), DownlinkFrame { phy_payload: payload }).await {
                    crate::error::ForwarderResult::Delivered => None,
                    _ => Some("NO_SUCH_DEVICE".to_string()),
                }
            }
            Ok(crate::lorawan::LoRaWANFrame::JoinAccept { .. }) => {
                let sent = self.forwarder.broadcast(DownlinkFrame { phy_payload: payload }).await;
                debug!(gateway = %self.config.name, sent, "broadcast JoinAccept to all registered devices");
                None
            }
            Ok(_) => {
                debug!("PULL_RESP carried an unroutable frame type, dropping");
                Some("UNSUPPORTED".to_string())
            }
            Err(e) => {
                warn!("failed to parse downlink PHY payload: {e}");
                Some("BAD_DATA".to_string())
            }
        }
    }

    async fn send_tx_ack(&self, socket: Option<&UdpSocket>, random_token: u16, error: Option<&str>) {
        let Some(sock) = socket else { return };
        match protocol::tx_ack(random_token, self.config.mac, error) {
            Ok(packet) => {
                if let Err(e) = sock.send(&packet).await {
                    warn!(gateway = %self.config.name, "TX_ACK send failed: {e}");
                }
            }
            Err(e) => warn!("failed to build TX_ACK: {e}"),
        }
    }
}

async fn dial(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    Ok(socket)
}

async fn recv_inbound(socket: Option<&UdpSocket>) -> Option<InboundPacket> {
    let sock = socket?;
    let mut buf = [0u8; 2048];
    match sock.recv(&mut buf).await {
        Ok(len) => InboundPacket::parse(&buf[..len]).ok(),
        Err(_) => None,
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(input: &str) -> anyhow::Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input).map_err(|e| anyhow::anyhow!("base64 decode error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_config_defaults_to_virtual() {
        let cfg = GatewayConfig {
            mac: [1; 8],
            name: "virtual-1".into(),
            location: Location { lat: 0.0, lon: 0.0, alt: 0.0 },
            bridge_addr: None,
            keep_alive: Duration::from_secs(30),
        };
        assert!(cfg.bridge_addr.is_none());
    }
}
