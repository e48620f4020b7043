//! LoRaWAN 1.0.x key and nonce types.
//!
//! Grounded on `lora-rs-lora-rs/lorawan-encoding/src/keys.rs`: thin newtypes
//! around a 16-byte AES-128 key so `AppKey`, `NwkSKey`, and `AppSKey` can't
//! be swapped by accident at a call site.

use serde::{Deserialize, Serialize};

macro_rules! aes_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name(pub [u8; 16]);

        impl $name {
            pub fn from_hex(s: &str) -> anyhow::Result<Self> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 16 {
                    anyhow::bail!("{} must be 16 bytes, got {}", stringify!($name), bytes.len());
                }
                let mut arr = [0u8; 16];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<[u8; 16]> for $name {
            fn from(v: [u8; 16]) -> Self {
                Self(v)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }
    };
}

aes_key!(
    /// Root key, provisioned out of band, used to derive session keys at join time.
    AppKey
);
aes_key!(
    /// Network session key: MICs every frame, de/encrypts FOpts-on-FPort-0.
    NwkSKey
);
aes_key!(
    /// Application session key: de/encrypts FRMPayload when FPort > 0.
    AppSKey
);

/// 64-bit device identifier, MSB-first as provisioned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevEui(pub [u8; 8]);

impl DevEui {
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 8 {
            anyhow::bail!("DevEUI must be 8 bytes, got {}", bytes.len());
        }
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl std::fmt::Debug for DevEui {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DevEui({})", self.to_hex())
    }
}

/// 32-bit network address assigned at join time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevAddr(pub u32);

impl DevAddr {
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let v = u32::from_str_radix(s, 16)?;
        Ok(Self(v))
    }

    pub fn to_hex(&self) -> String {
        format!("{:08X}", self.0)
    }

    /// Little-endian wire encoding, as carried in the PHY payload.
    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(b: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(b))
    }
}

impl std::fmt::Debug for DevAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DevAddr({})", self.to_hex())
    }
}

/// 24-bit network identifier (NetID), as carried in JoinAccept.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NetId(pub [u8; 3]);

impl NetId {
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 3 {
            anyhow::bail!("NetID must be 3 bytes, got {}", bytes.len());
        }
        let mut arr = [0u8; 3];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// 24-bit server nonce, as carried in JoinAccept.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct JoinNonce(pub [u8; 3]);

impl JoinNonce {
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 3 {
            anyhow::bail!("JoinNonce must be 3 bytes, got {}", bytes.len());
        }
        let mut arr = [0u8; 3];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// 16-bit device nonce. Drawn from a cryptographically strong RNG at join
/// time; the codec rejects accepts whose DevNonce was already used in this
/// AppKey epoch (tracked per-device in `Device::used_dev_nonces`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DevNonce(pub u16);

impl DevNonce {
    /// Draw a DevNonce from the OS RNG.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut rng = rand::rngs::OsRng;
        Self(rng.next_u32() as u16)
    }

    pub fn to_le_bytes(&self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_key_hex_roundtrip() {
        let key = AppKey::from_hex("000102030405060708090A0B0C0D0E0F").unwrap();
        assert_eq!(key.0[0], 0x00);
        assert_eq!(key.0[15], 0x0F);
        assert_eq!(key.to_hex().to_uppercase(), "000102030405060708090A0B0C0D0E0F");
    }

    #[test]
    fn dev_addr_wire_order() {
        let addr = DevAddr::from_hex("26011BDA").unwrap();
        assert_eq!(addr.to_le_bytes(), [0xDA, 0x1B, 0x01, 0x26]);
        assert_eq!(DevAddr::from_le_bytes(addr.to_le_bytes()), addr);
    }

    #[test]
    fn dev_eui_rejects_wrong_length() {
        assert!(DevEui::from_hex("0102").is_err());
    }
}
