//! Typed error surfaces for the seams callers need to match on.
//!
//! Internal plumbing keeps using `anyhow::Result` the way the rest of the
//! crate does; these types exist where a caller (the operator console, the
//! provisioning session, the Forwarder) needs to branch on *which* failure
//! happened rather than just log and move on.

use std::fmt;

/// Configuration and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("failed to read config file {path:?}: {source}")]
    ConfigRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    ConfigParse {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid bridge address {0:?}")]
    InvalidAddress(String),
    #[error("empty DevEUI")]
    EmptyDevEui,
    #[error("empty gateway MAC address")]
    EmptyGatewayMac,
    #[error("duplicate name {0:?}")]
    DuplicateName(String),
    #[error("duplicate address {0:?}")]
    DuplicateAddress(String),
    #[error("an active gateway is required but none is configured")]
    NoActiveGateway,
}

/// Structured status codes returned by operator-initiated operations.
///
/// Mirrors the `{ code, id, error? }` response shape spec'd for the operator
/// console: `Ok` serializes to `code: 0`, every other variant to a small
/// positive code a console client can switch on without string-matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    ErrorAddress,
    ErrorDeviceActive,
    ErrorGatewayActive,
    ErrorNotFound,
    ErrorDuplicate,
    NoBridge,
    ErrorValidation,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::ErrorAddress => 1,
            StatusCode::ErrorDeviceActive => 2,
            StatusCode::ErrorGatewayActive => 3,
            StatusCode::ErrorNotFound => 4,
            StatusCode::ErrorDuplicate => 5,
            StatusCode::NoBridge => 6,
            StatusCode::ErrorValidation => 7,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// Result of a Forwarder routing operation. The Forwarder is the only
/// surface shared across device/gateway tasks and it never panics; every
/// outcome, including "nothing matched", is an ordinary value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderResult {
    /// Uplink was enqueued to at least one gateway outbox.
    FannedOut(usize),
    /// Downlink was delivered to the owning device's inbox.
    Delivered,
    /// No gateway was within range of the device (uplink) or routing table
    /// had nothing registered for the address (downlink target lookup).
    NoPath,
    /// Downlink targeted a DevAddr/DevEUI with no registered device.
    UnknownDevice,
}
