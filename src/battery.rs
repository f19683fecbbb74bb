use crate::snapshot::BatterySnapshot;
use crate::{Error, Result};
use std::time::Duration;

/// What a telemetry consumer needs from a pack, physical or virtual.
pub trait Battery: Send {
    /// True once the static settings (cell count, limits) are known.
    fn get_settings(&mut self) -> bool;

    /// True once a complete general-info plus cell dataset is available.
    fn refresh_data(&mut self) -> bool;

    fn get_current_snapshot(&self) -> BatterySnapshot;

    fn log_settings(&mut self) {
        self.get_settings();
        log_snapshot_settings(&self.get_current_snapshot());
    }
}

pub fn log_snapshot_settings(snapshot: &BatterySnapshot) {
    log::info!("Battery {} connected to {}", snapshot.battery_type, snapshot.address);
    log::info!(
        "> CELLS: {}  CAPACITY: {:.1}Ah",
        snapshot.cell_count,
        snapshot.capacity
    );
    log::info!(
        "> VOLTAGE: {:.2}V..{:.2}V  CHARGE: {:.0}A  DISCHARGE: {:.0}A",
        snapshot.min_battery_voltage,
        snapshot.max_battery_voltage,
        snapshot.max_battery_charge_current,
        snapshot.max_battery_discharge_current
    );
    if let Some(model) = &snapshot.model {
        log::info!("> MODEL: {model}");
    }
    log::info!(
        "> FIRMWARE: {}  MANUFACTURED: {}",
        snapshot.firmware_version.as_deref().unwrap_or("unknown"),
        snapshot.manufacture_date.as_deref().unwrap_or("unknown")
    );
}

/// Polls `get_settings` until it succeeds; startup fails after `attempts` tries.
pub async fn wait_for_settings<B: Battery + ?Sized>(
    battery: &mut B,
    attempts: u32,
    delay: Duration,
) -> Result<()> {
    for attempt in 1..=attempts {
        if battery.get_settings() {
            return Ok(());
        }
        log::debug!("Battery settings not available yet ({attempt}/{attempts})");
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(Error::SettingsUnavailable(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Delayed {
        ready_after: u32,
        calls: u32,
    }

    impl Battery for Delayed {
        fn get_settings(&mut self) -> bool {
            self.calls += 1;
            self.calls > self.ready_after
        }

        fn refresh_data(&mut self) -> bool {
            false
        }

        fn get_current_snapshot(&self) -> BatterySnapshot {
            BatterySnapshot::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settings_after_retries() {
        let mut battery = Delayed {
            ready_after: 2,
            calls: 0,
        };
        wait_for_settings(&mut battery, 5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(battery.calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn settings_unavailable() {
        let mut battery = Delayed {
            ready_after: 10,
            calls: 0,
        };
        let err = wait_for_settings(&mut battery, 3, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SettingsUnavailable(3)));
        assert_eq!(battery.calls, 3);
    }
}
