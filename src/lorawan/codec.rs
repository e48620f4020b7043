//! Frame Codec: the typed encode/decode surface the device runtime drives.
//!
//! Wraps the raw wire parsing in `super::{decode_phy_payload, LoRaWANFrame}`
//! and the primitives in `super::crypto` with the key-typed operations a
//! caller actually wants: build an uplink ready for the air, or take
//! whatever came down from a gateway and either get a decoded frame back or
//! a specific reason it was rejected.

use super::keys::{AppKey, AppSKey, DevAddr, DevEui, DevNonce, JoinNonce, NetId, NwkSKey};
use super::{crypto, decode_phy_payload, LoRaWANFrame, MType};

/// Frames this crate sends or receives never exceed the PHY payload the
/// smallest supported data rate allows; this is checked independent of the
/// per-region `max_payload` table as a last-ditch sanity bound.
pub const MAX_PHY_PAYLOAD: usize = 250;

/// FOpts is capped at 15 bytes by the LoRaWAN MAC header's 4-bit FOptsLen
/// field; anything beyond that must be carried as a separate MAC-command
/// uplink rather than piggybacked on the next data frame.
pub const MAX_FOPTS_LEN: usize = 15;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("PHY payload of {0} bytes exceeds the {1}-byte cap")]
    FrameTooLarge(usize, usize),
    #[error("FOpts of {0} bytes exceeds the 15-byte cap")]
    InvalidFOpts(usize),
    #[error("MIC verification failed")]
    InvalidMic,
    #[error("unsupported or unexpected message type {0}")]
    UnknownMType(MType),
    #[error(transparent)]
    Malformed(#[from] anyhow::Error),
}

/// Everything an uplink assembler needs beyond the raw payload bytes.
pub struct UplinkParams<'a> {
    pub confirmed: bool,
    pub dev_addr: DevAddr,
    pub fcnt: u32,
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub f_opts: &'a [u8],
    pub f_port: Option<u8>,
    pub frm_payload: &'a [u8],
    pub nwk_s_key: &'a NwkSKey,
    pub app_s_key: &'a AppSKey,
}

/// Builds a fully-encrypted, MIC'd uplink PHY payload ready for GWMP.
///
/// FRMPayload is encrypted under AppSKey when `f_port` is `Some(p)` with
/// `p > 0`, or under NwkSKey when `f_port == Some(0)` (MAC commands sent as
/// payload rather than piggybacked in FOpts). FOpts itself is only
/// encrypted under NwkSKey when FPort is *not* 0; LoRaWAN 1.0.x never
/// encrypts FOpts when it shares the frame with FPort 0 data, since both
/// would use the same key and collide.
pub fn encode_uplink(p: &UplinkParams) -> Result<Vec<u8>, CodecError> {
    if p.f_opts.len() > MAX_FOPTS_LEN {
        return Err(CodecError::InvalidFOpts(p.f_opts.len()));
    }

    let mhdr = if p.confirmed { 0x80 } else { 0x40 };

    let mut fctrl = 0u8;
    if p.adr {
        fctrl |= 0x80;
    }
    if p.adr_ack_req {
        fctrl |= 0x40;
    }
    if p.ack {
        fctrl |= 0x20;
    }
    fctrl |= p.f_opts.len() as u8 & 0x0f;

    let dev_addr_le = p.dev_addr.to_le_bytes();

    let mut mac_payload = Vec::with_capacity(7 + p.f_opts.len() + 1 + p.frm_payload.len());
    mac_payload.extend_from_slice(&dev_addr_le);
    mac_payload.push(fctrl);
    mac_payload.extend_from_slice(&(p.fcnt as u16).to_le_bytes());
    mac_payload.extend_from_slice(p.f_opts);

    let mut encrypted_payload = p.frm_payload.to_vec();
    if let Some(port) = p.f_port {
        mac_payload.push(port);
        let key: &dyn crypto::KeyBytes = if port == 0 { p.nwk_s_key } else { p.app_s_key };
        crypto::encrypt_frm_payload(key, dev_addr_le, crypto::direction_byte(true), p.fcnt, &mut encrypted_payload);
        mac_payload.extend_from_slice(&encrypted_payload);
    }

    let mut frame = Vec::with_capacity(1 + mac_payload.len() + 4);
    frame.push(mhdr);
    frame.extend_from_slice(&mac_payload);

    let mic = crypto::compute_data_mic(p.nwk_s_key, dev_addr_le, crypto::direction_byte(true), p.fcnt, &frame);
    frame.extend_from_slice(&mic);

    if frame.len() > MAX_PHY_PAYLOAD {
        return Err(CodecError::FrameTooLarge(frame.len(), MAX_PHY_PAYLOAD));
    }

    Ok(frame)
}

/// A downlink frame after MIC verification and FRMPayload decryption.
pub struct DecodedDownlink {
    pub confirmed: bool,
    pub ack: bool,
    pub f_pending: bool,
    pub fcnt: u16,
    pub f_opts: Vec<u8>,
    pub f_port: Option<u8>,
    pub frm_payload: Vec<u8>,
}

/// Verifies MIC and decrypts FRMPayload on a downlink PHY payload.
///
/// `fcnt` is the full 32-bit frame counter the caller has already resolved
/// from the 16-bit wire value against its rollover window; MIC is computed
/// over the full counter per LoRaWAN 1.0.x.
pub fn decode_downlink(
    data: &[u8],
    expect_dev_addr: DevAddr,
    fcnt: u32,
    nwk_s_key: &NwkSKey,
    app_s_key: &AppSKey,
) -> Result<DecodedDownlink, CodecError> {
    if data.len() > MAX_PHY_PAYLOAD {
        return Err(CodecError::FrameTooLarge(data.len(), MAX_PHY_PAYLOAD));
    }

    let frame = decode_phy_payload(data)?;
    let (mtype, dev_addr, fctrl, wire_fcnt, f_opts, f_port, frm_payload, mic) = match frame {
        LoRaWANFrame::Data {
            mtype,
            dev_addr,
            fctrl,
            fcnt,
            f_opts,
            f_port,
            frm_payload,
            mic,
        } => (mtype, dev_addr, fctrl, fcnt, f_opts, f_port, frm_payload, mic),
        other => return Err(CodecError::UnknownMType(frame_mtype(&other))),
    };

    if !matches!(mtype, MType::UnconfirmedDataDown | MType::ConfirmedDataDown) {
        return Err(CodecError::UnknownMType(mtype));
    }
    if dev_addr != expect_dev_addr.0 {
        return Err(CodecError::InvalidMic);
    }
    if fctrl.f_opts_len as usize > MAX_FOPTS_LEN {
        return Err(CodecError::InvalidFOpts(fctrl.f_opts_len as usize));
    }

    let dev_addr_le = expect_dev_addr.to_le_bytes();
    let mic_start = data.len() - 4;
    let expected = crypto::compute_data_mic(nwk_s_key, dev_addr_le, crypto::direction_byte(false), fcnt, &data[..mic_start]);
    if u32::from_le_bytes(expected) != mic {
        return Err(CodecError::InvalidMic);
    }

    let mut decrypted = frm_payload;
    if let Some(port) = f_port {
        let key: &dyn crypto::KeyBytes = if port == 0 { nwk_s_key } else { app_s_key };
        crypto::encrypt_frm_payload(key, dev_addr_le, crypto::direction_byte(false), fcnt, &mut decrypted);
    }

    Ok(DecodedDownlink {
        confirmed: matches!(mtype, MType::ConfirmedDataDown),
        ack: fctrl.ack,
        f_pending: fctrl.class_b, // FPending shares FCtrl bit 0x10 on downlink frames
        fcnt: wire_fcnt,
        f_opts,
        f_port,
        frm_payload: decrypted,
    })
}

fn frame_mtype(frame: &LoRaWANFrame) -> MType {
    match frame {
        LoRaWANFrame::Data { mtype, .. } => *mtype,
        LoRaWANFrame::JoinRequest { .. } => MType::JoinRequest,
        LoRaWANFrame::JoinAccept { .. } => MType::JoinAccept,
        LoRaWANFrame::Proprietary { .. } => MType::Proprietary,
    }
}

/// Builds a JoinRequest PHY payload: MHDR | AppEUI(8,LE) | DevEUI(8,LE) |
/// DevNonce(2,LE) | MIC(4,LE), MIC = CMAC-AES128(AppKey, everything before it).
pub fn build_join_request(app_eui: DevEui, dev_eui: DevEui, dev_nonce: DevNonce, app_key: &AppKey) -> Vec<u8> {
    let mut frame = Vec::with_capacity(23);
    frame.push(0x00); // MHDR: JoinRequest, Major R1
    frame.extend(app_eui.0.iter().rev()); // EUIs are stored MSB-first, carried LSB-first
    frame.extend(dev_eui.0.iter().rev());
    frame.extend_from_slice(&dev_nonce.to_le_bytes());

    let mic = crypto::compute_join_mic(app_key, &frame);
    frame.extend_from_slice(&mic);
    frame
}

/// A decoded, key-derived JoinAccept.
pub struct JoinAcceptResult {
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub join_nonce: JoinNonce,
    pub dl_settings: u8,
    pub rx_delay: u8,
    pub nwk_s_key: NwkSKey,
    pub app_s_key: AppSKey,
}

/// Decrypts and verifies a JoinAccept, deriving session keys.
///
/// `data` is the raw PHY payload (MHDR + encrypted body); `dev_nonce` is the
/// DevNonce this device sent in the JoinRequest it's now accepting a reply
/// to, needed for session-key derivation.
pub fn parse_join_accept(data: &[u8], app_key: &AppKey, dev_nonce: DevNonce) -> Result<JoinAcceptResult, CodecError> {
    if data.is_empty() {
        return Err(CodecError::Malformed(anyhow::anyhow!("empty JoinAccept")));
    }
    let mhdr = data[0];
    let mtype = MType::try_from(mhdr)?;
    if mtype != MType::JoinAccept {
        return Err(CodecError::UnknownMType(mtype));
    }

    let mut body = data[1..].to_vec();
    crypto::decrypt_join_accept(app_key, &mut body);

    // JoinNonce(3) | NetID(3) | DevAddr(4,LE) | DLSettings(1) | RxDelay(1) | [CFList(16)] | MIC(4)
    if body.len() != 16 && body.len() != 32 {
        return Err(CodecError::Malformed(anyhow::anyhow!(
            "JoinAccept body must be 16 or 32 bytes after decrypt, got {}",
            body.len()
        )));
    }

    let mic_start = body.len() - 4;
    let mut mic_input = vec![mhdr];
    mic_input.extend_from_slice(&body[..mic_start]);
    let expected = crypto::compute_join_mic(app_key, &mic_input);
    let actual = u32::from_le_bytes(body[mic_start..].try_into().map_err(|_| CodecError::InvalidMic)?);
    if u32::from_le_bytes(expected) != actual {
        return Err(CodecError::InvalidMic);
    }

    let mut join_nonce = [0u8; 3];
    join_nonce.copy_from_slice(&body[0..3]);
    let mut net_id = [0u8; 3];
    net_id.copy_from_slice(&body[3..6]);
    let dev_addr = DevAddr::from_le_bytes(body[6..10].try_into().unwrap());
    let dl_settings = body[10];
    let rx_delay = body[11];

    let dev_nonce_le = dev_nonce.to_le_bytes();
    let nwk_s_key = NwkSKey(crypto::derive_session_key(0x01, app_key, join_nonce, net_id, dev_nonce_le));
    let app_s_key = AppSKey(crypto::derive_session_key(0x02, app_key, join_nonce, net_id, dev_nonce_le));

    Ok(JoinAcceptResult {
        net_id: NetId(net_id),
        dev_addr,
        join_nonce: JoinNonce(join_nonce),
        dl_settings,
        rx_delay,
        nwk_s_key,
        app_s_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (NwkSKey, AppSKey) {
        (NwkSKey([0x11; 16]), AppSKey([0x22; 16]))
    }

    #[test]
    fn uplink_roundtrips_through_downlink_decode_shape() {
        let (nwk, app) = keys();
        let params = UplinkParams {
            confirmed: false,
            dev_addr: DevAddr(0x01020304),
            fcnt: 7,
            adr: true,
            adr_ack_req: false,
            ack: false,
            f_opts: &[],
            f_port: Some(1),
            frm_payload: b"hi",
            nwk_s_key: &nwk,
            app_s_key: &app,
        };
        let frame = encode_uplink(&params).unwrap();
        assert_eq!(frame[0], 0x40);
        assert!(frame.len() <= MAX_PHY_PAYLOAD);
    }

    #[test]
    fn fopts_over_cap_is_rejected() {
        let (nwk, app) = keys();
        let big_fopts = vec![0u8; 16];
        let params = UplinkParams {
            confirmed: false,
            dev_addr: DevAddr(1),
            fcnt: 0,
            adr: false,
            adr_ack_req: false,
            ack: false,
            f_opts: &big_fopts,
            f_port: None,
            frm_payload: &[],
            nwk_s_key: &nwk,
            app_s_key: &app,
        };
        assert!(matches!(encode_uplink(&params), Err(CodecError::InvalidFOpts(16))));
    }

    #[test]
    fn downlink_with_wrong_key_fails_mic() {
        let (nwk, app) = keys();
        let other_nwk = NwkSKey([0x99; 16]);

        let params = UplinkParams {
            confirmed: false,
            dev_addr: DevAddr(42),
            fcnt: 3,
            adr: false,
            adr_ack_req: false,
            ack: false,
            f_opts: &[],
            f_port: Some(5),
            frm_payload: b"ping",
            nwk_s_key: &nwk,
            app_s_key: &app,
        };
        let frame = encode_uplink(&params).unwrap();

        let result = decode_downlink(&frame, DevAddr(42), 3, &other_nwk, &app);
        assert!(matches!(result, Err(CodecError::InvalidMic)));
    }

    #[test]
    fn join_request_is_23_bytes() {
        let app_key = AppKey([0x01; 16]);
        let frame = build_join_request(DevEui([1; 8]), DevEui([2; 8]), DevNonce(5), &app_key);
        assert_eq!(frame.len(), 23);
        assert_eq!(frame[0], 0x00);
    }
}
