//! Error taxonomy for the gateway core, grouped by component boundary (see
//! spec §7). Each enum is the thing a component can fail with; errors never
//! cross a boundary as anything richer than what's defined here.

use thiserror::Error;

/// C1 frame-reassembly failures. Never fatal: the reassembler logs and
/// keeps scanning.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("0x81 envelope declared LEN=0")]
    ZeroLength,
    #[error("no frame boundary found within the {window}-byte resync window")]
    NoSync { window: usize },
}

/// C2 packet-decode failures. Absorbed at the monitor boundary; never
/// surfaced above C2 as anything but a counter increment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: need at least {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("unsupported protocol byte 0x{0:02x}")]
    UnsupportedProtocol(u8),
    #[error("checksum mismatch: expected 0x{expected:02x}, computed 0x{computed:02x}")]
    ChecksumError { expected: u8, computed: u8 },
    #[error("channel_slot {0} out of range 1..32")]
    InvalidChannelSlot(u8),
}

/// C3 Modbus RTU failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModbusError {
    #[error("modbus request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("modbus response framing invalid: {0}")]
    Framing(String),
    #[error("modbus CRC mismatch")]
    Crc,
    #[error("modbus exception response, code {0}")]
    Exception(u8),
}

/// C5 slot-manager procedure failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotManagerError {
    #[error("no unused slot available to bind address {0}")]
    NoCapacity(u16),
}

/// C7 publisher failures. Transient; the publisher retries with backoff and
/// never propagates these to callers.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Startup-time configuration problems. Fatal: the supervisor does not
/// start when this is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no networks configured")]
    NoNetworks,
    #[error("duplicate network id: {0}")]
    DuplicateNetworkId(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
