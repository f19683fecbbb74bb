use crate::error::TransportError;
use std::future::Future;
use std::time::Duration;

/// 16 bit GATT UUIDs a BMS vendor exposes its UART-like channel on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: u16,
    pub notify_characteristic: u16,
    pub write_characteristic: u16,
}

/// Minimal BLE central operations needed to talk to one BMS.
///
/// Notifications are pulled rather than pushed to a callback, so the
/// connection loop handles them on its own task in arrival order.
pub trait BleTransport: Send {
    /// Connects to `address`, discovers the profile and subscribes to its notify characteristic.
    fn connect(
        &mut self,
        address: &str,
        profile: &GattProfile,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn write(
        &mut self,
        data: &[u8],
        with_response: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits at most `timeout` for one notification; `Ok(None)` on timeout.
    ///
    /// A dropped link is reported as [`TransportError::Disconnected`].
    fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
