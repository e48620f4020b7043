//! MAC Command Registry: the closed set of LoRaWAN 1.0.x MAC commands
//! this simulator understands, plus the FOpts assembly policy devices use
//! to piggyback them on data frames.
//!
//! Reference: LoRaWAN 1.0.3 Specification §5. The CID/length table below
//! mirrors the structure the Go original keeps in its own `macCommands`
//! package (`AckMacCommand.GetAll()` in
//! `original_source/simulator/components/device/frames/uplink/uplink.go`),
//! reimplemented here as a typed enum instead of a queue of opaque byte
//! blobs.

use std::fmt;

/// Command identifier, shared by request and answer; direction
/// disambiguates which side a given CID is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cid {
    LinkCheck = 0x02,
    LinkADR = 0x03,
    DutyCycle = 0x04,
    RXParamSetup = 0x05,
    DevStatus = 0x06,
    NewChannel = 0x07,
    RXTimingSetup = 0x08,
    TxParamSetup = 0x09,
    DlChannel = 0x0A,
    PingSlotInfo = 0x10,
    PingSlotChannel = 0x11,
    BeaconTiming = 0x12,
    BeaconFreq = 0x13,
    DeviceTime = 0x0D,
}

impl TryFrom<u8> for Cid {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(Cid::LinkCheck),
            0x03 => Ok(Cid::LinkADR),
            0x04 => Ok(Cid::DutyCycle),
            0x05 => Ok(Cid::RXParamSetup),
            0x06 => Ok(Cid::DevStatus),
            0x07 => Ok(Cid::NewChannel),
            0x08 => Ok(Cid::RXTimingSetup),
            0x09 => Ok(Cid::TxParamSetup),
            0x0A => Ok(Cid::DlChannel),
            0x0D => Ok(Cid::DeviceTime),
            0x10 => Ok(Cid::PingSlotInfo),
            0x11 => Ok(Cid::PingSlotChannel),
            0x12 => Ok(Cid::BeaconTiming),
            0x13 => Ok(Cid::BeaconFreq),
            other => Err(anyhow::anyhow!("unknown MAC command CID 0x{other:02x}")),
        }
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side of the link a command travels: the end-device (Req,
/// carried up) or the network (Req, carried down; devices answer those
/// with Ans uplinks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    DeviceOriginated,
    NetworkOriginated,
}

impl Cid {
    /// Byte length of the command payload, excluding the CID byte itself.
    /// `LinkADRReq`/`Ans` and `NewChannelReq` have fixed lengths per the
    /// spec despite carrying "variable" semantic content (channel masks
    /// etc. are bit-packed into the fixed width).
    pub fn payload_len(self, direction: Direction) -> usize {
        use Direction::*;
        match (self, direction) {
            (Cid::LinkCheck, NetworkOriginated) => 0,
            (Cid::LinkCheck, DeviceOriginated) => 2,
            (Cid::LinkADR, NetworkOriginated) => 4,
            (Cid::LinkADR, DeviceOriginated) => 1,
            (Cid::DutyCycle, NetworkOriginated) => 1,
            (Cid::DutyCycle, DeviceOriginated) => 0,
            (Cid::RXParamSetup, NetworkOriginated) => 4,
            (Cid::RXParamSetup, DeviceOriginated) => 1,
            (Cid::DevStatus, NetworkOriginated) => 0,
            (Cid::DevStatus, DeviceOriginated) => 2,
            (Cid::NewChannel, NetworkOriginated) => 5,
            (Cid::NewChannel, DeviceOriginated) => 1,
            (Cid::RXTimingSetup, NetworkOriginated) => 1,
            (Cid::RXTimingSetup, DeviceOriginated) => 0,
            (Cid::TxParamSetup, NetworkOriginated) => 1,
            (Cid::TxParamSetup, DeviceOriginated) => 0,
            (Cid::DlChannel, NetworkOriginated) => 4,
            (Cid::DlChannel, DeviceOriginated) => 1,
            (Cid::PingSlotInfo, DeviceOriginated) => 1,
            (Cid::PingSlotInfo, NetworkOriginated) => 0,
            (Cid::PingSlotChannel, NetworkOriginated) => 5,
            (Cid::PingSlotChannel, DeviceOriginated) => 1,
            (Cid::BeaconTiming, NetworkOriginated) => 3,
            (Cid::BeaconTiming, DeviceOriginated) => 0,
            (Cid::BeaconFreq, NetworkOriginated) => 3,
            (Cid::BeaconFreq, DeviceOriginated) => 1,
            (Cid::DeviceTime, NetworkOriginated) => 5,
            (Cid::DeviceTime, DeviceOriginated) => 0,
        }
    }
}

/// A MAC command ready for FOpts piggyback: already CID-prefixed and
/// length-correct for its direction.
#[derive(Debug, Clone)]
pub struct MacCommand {
    pub cid: Cid,
    pub payload: Vec<u8>,
}

impl MacCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.cid as u8);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Queue of pending Ans commands a device has accumulated (answers to
/// network-originated Req commands it received on a prior downlink) plus
/// any device-originated Req commands it wants to send (e.g. LinkCheckReq).
///
/// FOpts is capped at 15 bytes by the 4-bit FOptsLen field in FCtrl; when
/// the queue doesn't fit, the overflow is carried to the next uplink rather
/// than dropped or truncated mid-command.
#[derive(Debug, Clone, Default)]
pub struct MacQueue {
    pending: Vec<MacCommand>,
}

impl MacQueue {
    pub fn push(&mut self, cmd: MacCommand) {
        self.pending.push(cmd);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains as many whole commands as fit in 15 bytes, in FIFO order,
    /// leaving the rest queued for the next uplink.
    pub fn drain_for_fopts(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut taken = 0;
        for cmd in &self.pending {
            let encoded = cmd.encode();
            if out.len() + encoded.len() > super::lorawan::codec::MAX_FOPTS_LEN {
                break;
            }
            out.extend_from_slice(&encoded);
            taken += 1;
        }
        self.pending.drain(..taken);
        out
    }
}

/// Splits a raw FOpts (or FPort-0 FRMPayload) byte string into its
/// constituent network-originated commands: a received downlink's FOpts
/// and FRMPayload-on-FPort-0 are parsed in order. Unknown CIDs stop
/// parsing at that point since their length can't be determined; a command
/// whose declared length runs past the end of the buffer likewise stops
/// parsing rather than reading garbage.
pub fn parse_network_commands(data: &[u8]) -> Vec<(Cid, Vec<u8>)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let Ok(cid) = Cid::try_from(data[i]) else {
            break;
        };
        let len = cid.payload_len(Direction::NetworkOriginated);
        if i + 1 + len > data.len() {
            break;
        }
        out.push((cid, data[i + 1..i + 1 + len].to_vec()));
        i += 1 + len;
    }
    out
}

/// Builds the device's answer to a received network-originated command.
///
/// This simulator has no real network-server peer to negotiate with, so
/// answers report unconditional success/no-op (all-channels-ack, no
/// margin/battery telemetry beyond the fixed values LoRaWAN reserves for
/// "unsupported"), enough to keep a real network server's MAC-command
/// state machine from stalling on a missing Ans.
pub fn build_answer(cid: Cid, req_payload: &[u8]) -> Option<MacCommand> {
    let payload = match cid {
        Cid::LinkCheck => vec![255, 1], // margin=255 (unknown), gateway count=1
        Cid::LinkADR => vec![0b111],    // channel mask ACK | DR ACK | power ACK
        Cid::DutyCycle => vec![],
        Cid::RXParamSetup => vec![0b111], // RX1DROffset ACK | RX2DR ACK | channel ACK
        Cid::DevStatus => vec![255, 0],   // battery=255 (not measurable), margin=0
        Cid::NewChannel => vec![0b11],    // DR range ACK | channel freq ACK
        Cid::RXTimingSetup => vec![],
        Cid::TxParamSetup => vec![],
        Cid::DlChannel => vec![0b11],
        Cid::PingSlotChannel => vec![0b11],
        Cid::BeaconFreq => vec![1],
        Cid::DeviceTime => return None, // device-originated only, no Ans to build
        Cid::PingSlotInfo | Cid::BeaconTiming => return None,
    };
    let _ = req_payload;
    Some(MacCommand { cid, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_back_to_back_commands() {
        let data = [Cid::LinkCheck as u8, Cid::DutyCycle as u8, 0x05];
        let parsed = parse_network_commands(&data);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, Cid::LinkCheck);
        assert_eq!(parsed[0].1.len(), 0);
        assert_eq!(parsed[1].0, Cid::DutyCycle);
        assert_eq!(parsed[1].1, vec![0x05]);
    }

    #[test]
    fn stops_on_truncated_trailing_command() {
        let data = [Cid::RXParamSetup as u8, 0x01, 0x02]; // needs 4 bytes, only 2 given
        assert!(parse_network_commands(&data).is_empty());
    }

    #[test]
    fn unknown_cid_stops_parsing() {
        let data = [0xFF, Cid::LinkCheck as u8];
        assert!(parse_network_commands(&data).is_empty());
    }

    #[test]
    fn build_answer_round_trips_for_link_adr() {
        let ans = build_answer(Cid::LinkADR, &[0, 0, 0, 0]).unwrap();
        assert_eq!(ans.cid, Cid::LinkADR);
        assert_eq!(ans.payload.len(), Cid::LinkADR.payload_len(Direction::DeviceOriginated));
    }

    #[test]
    fn link_check_ans_is_two_bytes() {
        assert_eq!(Cid::LinkCheck.payload_len(Direction::DeviceOriginated), 2);
    }

    #[test]
    fn cid_roundtrips_through_byte() {
        assert_eq!(Cid::try_from(0x03).unwrap(), Cid::LinkADR);
        assert!(Cid::try_from(0xFF).is_err());
    }

    #[test]
    fn fopts_overflow_is_carried_not_dropped() {
        let mut q = MacQueue::default();
        for _ in 0..10 {
            q.push(MacCommand {
                cid: Cid::LinkCheck,
                payload: vec![0xAA, 0xBB],
            });
        }
        let first = q.drain_for_fopts();
        assert!(first.len() <= 15);
        assert!(!q.is_empty(), "overflow commands should remain queued");

        let second = q.drain_for_fopts();
        assert!(!second.is_empty());
    }
}
