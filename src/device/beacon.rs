//! Class B beacon/ping-slot timing, modeled abstractly: beacon acquisition
//! is exposed as a `beacon_time()` source the Device consumes. Real beacon
//! acquisition involves demodulating a dedicated downlink from the network;
//! this simulator has no such signal to listen for, so it stands in a
//! wall-clock-derived beacon epoch any device can read without network
//! involvement.

use std::time::{SystemTime, UNIX_EPOCH};

/// LoRaWAN class B beacon period, seconds (fixed by the specification).
pub const BEACON_PERIOD_SECS: u64 = 128;

/// Source of the current beacon epoch. A trait so tests can supply a fixed
/// clock instead of wall-clock time.
pub trait BeaconClock: Send + Sync {
    /// Seconds since the most recent beacon, per LoRaWAN's 128s beacon
    /// period, the abstracted stand-in for real beacon acquisition.
    fn beacon_time(&self) -> u64;
}

/// Default beacon source: wall-clock time floor-divided into 128s epochs.
pub struct SystemBeaconClock;

impl BeaconClock for SystemBeaconClock {
    fn beacon_time(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0) / BEACON_PERIOD_SECS
            * BEACON_PERIOD_SECS
    }
}

/// Seconds until the device's next ping slot, given the beacon epoch and
/// the `PingPeriod` (in slots per beacon period, a power of two, as
/// negotiated by `PingSlotInfoReq`/`PingSlotInfoAns`).
///
/// LoRaWAN derives the actual slot offset from an AES pseudo-random
/// function seeded with `DevAddr` and the beacon time; this simulator only
/// needs devices to wake on *some* stable per-device cadence within the
/// beacon period, so it uses a cheap hash of `DevAddr` instead of the full
/// cipher. No real network server is scoring slot collisions here.
pub fn next_ping_slot_offset_secs(dev_addr: u32, ping_period_slots: u16) -> u64 {
    let slots = ping_period_slots.max(1) as u64;
    let slot_duration = BEACON_PERIOD_SECS / slots.min(BEACON_PERIOD_SECS).max(1);
    let pseudo_random = (dev_addr as u64).wrapping_mul(2654435761) % slots;
    (pseudo_random * slot_duration).min(BEACON_PERIOD_SECS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_slot_offset_is_within_beacon_period() {
        for addr in [0u32, 1, 42, 0xDEADBEEF] {
            let offset = next_ping_slot_offset_secs(addr, 16);
            assert!(offset < BEACON_PERIOD_SECS);
        }
    }

    #[test]
    fn ping_slot_offset_is_deterministic_per_device() {
        assert_eq!(next_ping_slot_offset_secs(42, 8), next_ping_slot_offset_secs(42, 8));
    }
}
