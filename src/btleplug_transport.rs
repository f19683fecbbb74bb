//! [`BleTransport`] on top of `btleplug` (BlueZ, CoreBluetooth, WinRT).

use crate::error::TransportError;
use crate::transport::{BleTransport, GattProfile};
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn backend(err: btleplug::Error) -> TransportError {
    TransportError::Backend(Box::new(err))
}

struct Link {
    peripheral: Peripheral,
    write_characteristic: Characteristic,
    notify_uuid: Uuid,
    notifications: NotificationStream,
}

pub struct BtleplugTransport {
    adapter: Adapter,
    scan_timeout: Duration,
    link: Option<Link>,
}

impl BtleplugTransport {
    /// Uses the first adapter the platform reports.
    pub async fn new(scan_timeout: Duration) -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(backend)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(backend)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Connect("no BLE adapter found".into()))?;
        log::debug!(
            "Using BLE adapter {}",
            adapter.adapter_info().await.map_err(backend)?
        );
        Ok(Self {
            adapter,
            scan_timeout,
            link: None,
        })
    }

    async fn find_peripheral(&self, address: BDAddr) -> Result<Peripheral, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(backend)?;
        let deadline = tokio::time::Instant::now() + self.scan_timeout;
        while tokio::time::Instant::now() < deadline {
            for peripheral in self.adapter.peripherals().await.map_err(backend)? {
                if peripheral.address() == address {
                    let _ = self.adapter.stop_scan().await;
                    return Ok(peripheral);
                }
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let _ = self.adapter.stop_scan().await;
        Err(TransportError::DeviceNotFound(address.to_string()))
    }

    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(err) = link.peripheral.disconnect().await {
                log::debug!("Disconnect failed: {err}");
            }
        }
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    service: u16,
    characteristic: u16,
) -> Result<Characteristic, TransportError> {
    let service = uuid_from_u16(service);
    let uuid = uuid_from_u16(characteristic);
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == service && c.uuid == uuid)
        .ok_or_else(|| TransportError::Connect(format!("characteristic {characteristic:04x} missing")))
}

impl BleTransport for BtleplugTransport {
    async fn connect(&mut self, address: &str, profile: &GattProfile) -> Result<(), TransportError> {
        self.teardown().await;
        let bd_addr = BDAddr::from_str(address)
            .map_err(|err| TransportError::Connect(format!("{address}: {err}")))?;
        let peripheral = self.find_peripheral(bd_addr).await?;
        peripheral
            .connect()
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let link = async {
            peripheral.discover_services().await.map_err(backend)?;
            let notify_characteristic = find_characteristic(
                &peripheral,
                profile.service,
                profile.notify_characteristic,
            )?;
            let write_characteristic = find_characteristic(
                &peripheral,
                profile.service,
                profile.write_characteristic,
            )?;
            peripheral
                .subscribe(&notify_characteristic)
                .await
                .map_err(|err| TransportError::Notify(err.to_string()))?;
            let notifications = peripheral.notifications().await.map_err(backend)?;
            Ok::<_, TransportError>(Link {
                peripheral: peripheral.clone(),
                write_characteristic,
                notify_uuid: notify_characteristic.uuid,
                notifications,
            })
        }
        .await;
        match link {
            Ok(link) => {
                self.link = Some(link);
                Ok(())
            }
            Err(err) => {
                let _ = peripheral.disconnect().await;
                Err(err)
            }
        }
    }

    async fn write(&mut self, data: &[u8], with_response: bool) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        log::trace!("Write {data:02X?}");
        link.peripheral
            .write(&link.write_characteristic, data, write_type)
            .await
            .map_err(|err| TransportError::Write(err.to_string()))
    }

    async fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, link.notifications.next()).await {
                Ok(Some(notification)) if notification.uuid == link.notify_uuid => {
                    log::trace!("Notification {:02X?}", notification.value);
                    return Ok(Some(notification.value));
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    self.teardown().await;
                    return Err(TransportError::Disconnected);
                }
                Err(_elapsed) => {
                    if link.peripheral.is_connected().await.map_err(backend)? {
                        return Ok(None);
                    }
                    self.teardown().await;
                    return Err(TransportError::Disconnected);
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.teardown().await;
        Ok(())
    }
}
