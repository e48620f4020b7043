//! Semtech UDP Packet Forwarder Protocol (GWMP), gateway side.
//!
//! Binary header + JSON body, all multi-byte header fields big-endian.
//! This simulator plays the *gateway* side, so it builds
//! `PUSH_DATA`/`PULL_DATA`/`TX_ACK` and parses `PUSH_ACK`/`PULL_ACK`/
//! `PULL_RESP` coming back from the bridge/network-server it dials.
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(anyhow::anyhow!("unknown packet type 0x{value:02x}")),
        }
    }
}

pub type GatewayEui = [u8; 8];

/// A packet this simulator has received from the bridge.
#[derive(Debug)]
pub enum InboundPacket {
    PushAck { random_token: u16 },
    PullAck { random_token: u16 },
    PullResp { random_token: u16, txpk: Txpk },
    TxAck { random_token: u16 },
}

impl InboundPacket {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 4 {
            return Err(anyhow::anyhow!("packet too short: {} bytes", data.len()));
        }
        let mut buf = &data[..];
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(anyhow::anyhow!("unsupported protocol version 0x{version:02x}"));
        }
        let random_token = buf.get_u16();
        let packet_type = PacketType::try_from(buf.get_u8())?;

        match packet_type {
            PacketType::PushAck => Ok(InboundPacket::PushAck { random_token }),
            PacketType::PullAck => Ok(InboundPacket::PullAck { random_token }),
            PacketType::TxAck => Ok(InboundPacket::TxAck { random_token }),
            PacketType::PullResp => {
                let json = std::str::from_utf8(buf.chunk())?;
                let payload: PullRespPayload = serde_json::from_str(json)?;
                Ok(InboundPacket::PullResp { random_token, txpk: payload.txpk })
            }
            other => Err(anyhow::anyhow!("unexpected inbound packet type {other:?}")),
        }
    }
}

/// A received-packet report, one per demodulated uplink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    pub time: Option<String>,
    pub tmst: u64,
    pub chan: u8,
    pub rfch: u8,
    pub freq: f64,
    pub stat: i8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub lsnr: f64,
    pub rssi: i32,
    pub size: u16,
    pub data: String,
}

/// A requested downlink transmission, as sent back by the network server
/// inside `PULL_RESP`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txpk {
    pub imme: bool,
    pub tmst: Option<u64>,
    pub freq: f64,
    pub rfch: u8,
    pub powe: u8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub ipol: bool,
    pub size: u16,
    pub data: String,
}

#[derive(Debug, Serialize)]
struct PushDataPayload<'a> {
    rxpk: &'a [Rxpk],
}

#[derive(Debug, Deserialize)]
struct PullRespPayload {
    txpk: Txpk,
}

/// Builds a `PUSH_DATA` packet carrying one or more `rxpk` reports.
pub fn push_data(random_token: u16, gateway_eui: GatewayEui, rxpk: &[Rxpk]) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_string(&PushDataPayload { rxpk })?;
    let mut buf = BytesMut::with_capacity(12 + json.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(random_token);
    buf.put_u8(PacketType::PushData as u8);
    buf.put_slice(&gateway_eui);
    buf.put_slice(json.as_bytes());
    Ok(buf.to_vec())
}

/// Builds a `PULL_DATA` keepalive, which also opens the return path for
/// `PULL_RESP` downlinks on the NS side of a stateful transport.
pub fn pull_data(random_token: u16, gateway_eui: GatewayEui) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(random_token);
    buf.put_u8(PacketType::PullData as u8);
    buf.put_slice(&gateway_eui);
    buf.to_vec()
}

/// Builds a `TX_ACK` acknowledging (or reporting an error on) a `PULL_RESP`.
pub fn tx_ack(random_token: u16, gateway_eui: GatewayEui, error: Option<&str>) -> anyhow::Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(random_token);
    buf.put_u8(PacketType::TxAck as u8);
    buf.put_slice(&gateway_eui);
    if let Some(err) = error {
        let json = serde_json::json!({ "txpk_ack": { "error": err } });
        buf.put_slice(json.to_string().as_bytes());
    }
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_has_correct_header() {
        let rxpk = vec![];
        let packet = push_data(0x1234, [1; 8], &rxpk).unwrap();
        assert_eq!(packet[0], PROTOCOL_VERSION);
        assert_eq!(u16::from_be_bytes([packet[1], packet[2]]), 0x1234);
        assert_eq!(packet[3], PacketType::PushData as u8);
    }

    #[test]
    fn pull_resp_roundtrips() {
        let txpk = Txpk {
            imme: true,
            tmst: None,
            freq: 868.1,
            rfch: 0,
            powe: 14,
            modu: "LORA".into(),
            datr: "SF7BW125".into(),
            codr: "4/5".into(),
            ipol: true,
            size: 4,
            data: "AQIDBA==".into(),
        };
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(0xABCD);
        buf.put_u8(PacketType::PullResp as u8);
        buf.put_slice(serde_json::to_string(&PullRespPayload { txpk: txpk.clone() }).unwrap().as_bytes());

        match InboundPacket::parse(&buf).unwrap() {
            InboundPacket::PullResp { random_token, txpk: parsed } => {
                assert_eq!(random_token, 0xABCD);
                assert_eq!(parsed.freq, 868.1);
            }
            _ => panic!("expected PullResp"),
        }
    }

    #[test]
    fn push_ack_parses() {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(7);
        buf.put_u8(PacketType::PushAck as u8);
        assert!(matches!(InboundPacket::parse(&buf).unwrap(), InboundPacket::PushAck { random_token: 7 }));
    }
}
