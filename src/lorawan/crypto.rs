//! AES-CTR payload cipher and CMAC-AES128 MIC, per LoRaWAN 1.0.x.
//!
//! The block-construction algorithm (`generate_helper_block`) and the
//! encrypt-in-place CTR loop are ported from
//! `lora-rs-lora-rs/encoding/src/securityhelpers.rs`'s
//! `calculate_data_mic`/`encrypt_frm_data_payload`, adapted to operate
//! directly on owned `Vec<u8>` buffers instead of that crate's
//! `GenericArray`-parameterized parser types.

use aes::Aes128;
use cipher::{BlockEncrypt, KeyInit};
use cmac::{Cmac, Mac};
use generic_array::GenericArray;

use super::keys::AppKey;

/// Narrow trait so `mic` and `encrypt_frm_payload` accept any of our
/// `AppKey`/`NwkSKey`/`AppSKey` newtypes without duplicating the body.
pub trait KeyBytes {
    fn bytes(&self) -> &[u8; 16];
}

impl KeyBytes for super::keys::AppKey {
    fn bytes(&self) -> &[u8; 16] {
        &self.0
    }
}
impl KeyBytes for super::keys::NwkSKey {
    fn bytes(&self) -> &[u8; 16] {
        &self.0
    }
}
impl KeyBytes for super::keys::AppSKey {
    fn bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// b0/a blocks differ only in their first byte (0x49 for MIC, 0x01 for
/// payload cipher) and, for the MIC block, a trailing length byte. See
/// LoRaWAN 1.0.3 §4.4.
fn helper_block(first: u8, dev_addr_le: [u8; 4], dir: u8, fcnt: u32) -> [u8; 16] {
    let mut b = [0u8; 16];
    b[0] = first;
    // b[1..5] reserved, zero
    b[5] = dir;
    b[6..10].copy_from_slice(&dev_addr_le);
    b[10] = (fcnt & 0xff) as u8;
    b[11] = ((fcnt >> 8) & 0xff) as u8;
    b[12] = ((fcnt >> 16) & 0xff) as u8;
    b[13] = ((fcnt >> 24) & 0xff) as u8;
    // b[14] reserved, zero; b[15] set by caller for MIC (msg length) or CTR (block counter)
    b
}

/// Direction byte used in the B0/A blocks: 0 for uplink, 1 for downlink.
pub fn direction_byte(uplink: bool) -> u8 {
    if uplink {
        0
    } else {
        1
    }
}

/// Computes the 4-byte MIC over `mac_payload` (MHDR..FRMPayload, i.e.
/// everything except the MIC itself) using CMAC-AES128 under `key`
/// (NwkSKey for data frames).
pub fn compute_data_mic(
    key: &impl KeyBytes,
    dev_addr_le: [u8; 4],
    dir: u8,
    fcnt: u32,
    mac_payload: &[u8],
) -> [u8; 4] {
    let mut b0 = helper_block(0x49, dev_addr_le, dir, fcnt);
    b0[15] = mac_payload.len() as u8;

    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key.bytes()).expect("key is 16 bytes");
    mac.update(&b0);
    mac.update(mac_payload);
    let full = mac.finalize().into_bytes();

    let mut mic = [0u8; 4];
    mic.copy_from_slice(&full[0..4]);
    mic
}

/// Encrypts (or decrypts, since AES-CTR is its own inverse) `buf` in place using
/// AES-128 under `key`, per LoRaWAN's FRMPayload cipher.
pub fn encrypt_frm_payload(key: &impl KeyBytes, dev_addr_le: [u8; 4], dir: u8, fcnt: u32, buf: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(key.bytes()));

    let mut a = helper_block(0x01, dev_addr_le, dir, fcnt);
    let mut s = GenericArray::clone_from_slice(&[0u8; 16]);

    let mut block_counter: u8 = 1;
    for (i, byte) in buf.iter_mut().enumerate() {
        let j = i & 0x0f;
        if j == 0 {
            a[15] = block_counter;
            block_counter = block_counter.wrapping_add(1);
            s = GenericArray::clone_from_slice(&a);
            cipher.encrypt_block(&mut s);
        }
        *byte ^= s[j];
    }
}

/// Decrypts a JoinAccept payload. Per LoRaWAN 1.0.x, the network server
/// *encrypts* the JoinAccept with AES-128-ECB under AppKey, so the device
/// recovers the plaintext by running the AES-128 **encrypt** operation.
/// This asymmetry is intentional, not a bug; see
/// `lora-rs-lora-rs/lorawan-encoding/src/parser.rs`'s
/// `EncryptedJoinAcceptPayload::decrypt`.
pub fn decrypt_join_accept(key: &AppKey, buf: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(&key.0));
    for chunk in buf.chunks_mut(16) {
        if chunk.len() == 16 {
            let mut block = GenericArray::clone_from_slice(chunk);
            cipher.encrypt_block(&mut block);
            chunk.copy_from_slice(&block);
        }
    }
}

/// Encrypts a JoinAccept payload for transmission (network-server side of
/// the same asymmetric operation, used by test fixtures that play the NS
/// role when injecting a JoinAccept).
pub fn encrypt_join_accept(key: &AppKey, buf: &mut [u8]) {
    // AES-ECB is an involution across encrypt/decrypt *roles* here because
    // the NS uses the block **decrypt** operation to produce what the
    // device later recovers via **encrypt**. We only need the encrypt
    // direction in this crate (we play the device side), but test fixtures
    // that assemble a JoinAccept fixture at the NS role need the opposite
    // block operation, so we reuse the cheap symmetric trick of decrypting
    // with cipher::BlockDecrypt.
    use cipher::BlockDecrypt;
    let cipher = Aes128::new(GenericArray::from_slice(&key.0));
    for chunk in buf.chunks_mut(16) {
        if chunk.len() == 16 {
            let mut block = GenericArray::clone_from_slice(chunk);
            cipher.decrypt_block(&mut block);
            chunk.copy_from_slice(&block);
        }
    }
}

/// MIC over a JoinRequest or (already-decrypted) JoinAccept body, computed
/// with plain CMAC-AES128 under AppKey (no B0 block; see LoRaWAN 1.0.3 §6.2.4/§6.2.5).
pub fn compute_join_mic(key: &AppKey, body: &[u8]) -> [u8; 4] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(&key.0).expect("key is 16 bytes");
    mac.update(body);
    let full = mac.finalize().into_bytes();
    let mut mic = [0u8; 4];
    mic.copy_from_slice(&full[0..4]);
    mic
}

/// Derives NwkSKey or AppSKey from AppKey + AppNonce + NetID + DevNonce.
///
/// Grounded on `lora-rs-lora-rs/lorawan-encoding/src/parser.rs`'s
/// `derive_session_key`: `AES128_encrypt(AppKey, first_byte | AppNonce(3) |
/// NetID(3) | DevNonce(2) | pad...)`. `first_byte` is `0x01` for NwkSKey,
/// `0x02` for AppSKey.
pub fn derive_session_key(
    first_byte: u8,
    app_key: &AppKey,
    app_nonce: [u8; 3],
    net_id: [u8; 3],
    dev_nonce: [u8; 2],
) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = first_byte;
    block[1..4].copy_from_slice(&app_nonce);
    block[4..7].copy_from_slice(&net_id);
    block[7..9].copy_from_slice(&dev_nonce);

    let cipher = Aes128::new(GenericArray::from_slice(&app_key.0));
    let mut b = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut b);

    let mut out = [0u8; 16];
    out.copy_from_slice(&b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::keys::{AppSKey, NwkSKey};

    #[test]
    fn payload_cipher_is_involution() {
        let key = AppSKey([0x2b; 16]);
        let dev_addr = [0x04, 0x03, 0x02, 0x01];
        let mut data = b"hello lorawan!!!".to_vec();
        let original = data.clone();

        encrypt_frm_payload(&key, dev_addr, 0, 1, &mut data);
        assert_ne!(data, original);

        encrypt_frm_payload(&key, dev_addr, 0, 1, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn mic_is_deterministic_and_key_sensitive() {
        let key_a = NwkSKey([0x11; 16]);
        let key_b = NwkSKey([0x22; 16]);
        let dev_addr = [0x04, 0x03, 0x02, 0x01];
        let payload = vec![0x40, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0x00];

        let mic_a1 = compute_data_mic(&key_a, dev_addr, 0, 1, &payload);
        let mic_a2 = compute_data_mic(&key_a, dev_addr, 0, 1, &payload);
        let mic_b = compute_data_mic(&key_b, dev_addr, 0, 1, &payload);

        assert_eq!(mic_a1, mic_a2);
        assert_ne!(mic_a1, mic_b);
    }

    #[test]
    fn join_accept_decrypt_is_involution_of_ns_side_encrypt() {
        let key = AppKey([0x42; 16]);
        let mut plaintext = vec![
            0x20, 0x49, 0x3e, 0xeb, 0x51, 0xfb, 0xa2, 0x11, 0x6f, 0x81, 0x0e, 0xdb, 0x37, 0x42,
            0x97, 0x51, 0x42,
        ];
        let original = plaintext.clone();

        // Network-server side: "encrypts" the accept using the block
        // decrypt operation before putting it on the wire.
        encrypt_join_accept(&key, &mut plaintext);
        assert_ne!(plaintext, original);

        // Device side: recovers plaintext using the block encrypt operation.
        decrypt_join_accept(&key, &mut plaintext);
        assert_eq!(plaintext, original);
    }

    #[test]
    fn session_keys_differ_by_first_byte() {
        let app_key = AppKey([0x01; 16]);
        let nwk = derive_session_key(0x01, &app_key, [0xAB, 0xCD, 0xEF], [0, 0, 0], [0x42, 0x00]);
        let app = derive_session_key(0x02, &app_key, [0xAB, 0xCD, 0xEF], [0, 0, 0], [0x42, 0x00]);
        assert_ne!(nwk, app);
    }
}
