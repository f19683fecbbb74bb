use std::time::Duration;

use crate::snapshot::DataClass;

/// Failures reported by a [`crate::transport::BleTransport`].
///
/// All of them are recovered inside the connection loop by reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peripheral dropped the link.
    #[error("device disconnected")]
    Disconnected,
    /// No peripheral with the requested address was seen.
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("notification failed: {0}")]
    Notify(String),
    /// An operation needing a link was called while not connected.
    #[error("not connected")]
    NotConnected,
    /// An error raised by the underlying BLE stack.
    #[error("BLE backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// The frame is structurally wrong (bad marker, rejected status, implausible field).
    #[error("Framing error: {0}")]
    Framing(String),
    /// The declared length exceeds the bytes available.
    #[error("Short frame - declared={declared} available={available}")]
    ShortFrame { declared: usize, available: usize },
    #[error("Checksum mismatch - calculated={calculated:04X} received={received:04X}")]
    Integrity { calculated: u16, received: u16 },
    /// No successful decode of `class` within the watchdog horizon.
    #[error("No {class} update for {elapsed:?}")]
    Liveness { class: DataClass, elapsed: Duration },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Battery settings not available after {0} attempts")]
    SettingsUnavailable(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
