use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Highest cell count any supported BMS reports.
pub const MAX_CELL_COUNT: u8 = 32;

/// Maximum number of packs a virtual battery can combine.
pub const MAX_LINKS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    /// JBD / xiaoxiang smart BMS
    Jbd,
    /// JK / jikong BMS
    Jk,
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Vendor::Jbd => write!(f, "jbd"),
            Vendor::Jk => write!(f, "jk"),
        }
    }
}

/// Electrical limits of the pack and the software low-SoC thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub max_cell_voltage: f32,
    pub min_cell_voltage: f32,
    pub max_battery_charge_current: f32,
    pub max_battery_discharge_current: f32,
    /// SoC (%) below which `soc_low` is a warning
    pub soc_low_warning: f32,
    /// SoC (%) below which `soc_low` is an alarm
    pub soc_low_alarm: f32,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            max_cell_voltage: 3.45,
            min_cell_voltage: 3.10,
            max_battery_charge_current: 50.0,
            max_battery_discharge_current: 60.0,
            soc_low_warning: 20.0,
            soc_low_alarm: 10.0,
        }
    }
}

/// Timing of one link's connection loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Delay after a failed connect attempt
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Delay after a dropped connection
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Bound for a single wait-for-notification call
    #[serde(with = "humantime_serde")]
    pub notification_wait: Duration,
    /// Bound for waiting on a reply or an ACK
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(3),
            notification_wait: Duration::from_millis(500),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// One physical pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub address: String,
    #[serde(default = "LinkEntry::default_vendor")]
    pub vendor: Vendor,
    /// Reject packs that report another cell count
    #[serde(default)]
    pub expected_cell_count: Option<u8>,
}

impl LinkEntry {
    fn default_vendor() -> Vendor {
        Vendor::Jbd
    }

    pub fn new(address: impl Into<String>, vendor: Vendor) -> Self {
        Self {
            address: address.into(),
            vendor,
            expected_cell_count: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub links: Vec<LinkEntry>,
    #[serde(default)]
    pub battery: BatteryConfig,
    #[serde(default)]
    pub link: LinkConfig,
    /// Zero disables the watchdog
    #[serde(
        default = "Config::default_watchdog_horizon",
        with = "humantime_serde"
    )]
    pub watchdog_horizon: Duration,
    /// How often `get_settings` is retried at startup before giving up
    #[serde(default = "Config::default_settings_attempts")]
    pub settings_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            links: Vec::new(),
            battery: BatteryConfig::default(),
            link: LinkConfig::default(),
            watchdog_horizon: Self::default_watchdog_horizon(),
            settings_attempts: Self::default_settings_attempts(),
        }
    }
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &'static str = "btbattery.yaml";

    fn default_watchdog_horizon() -> Duration {
        Duration::from_secs(300)
    }

    fn default_settings_attempts() -> u32 {
        30
    }

    pub fn load(config_file_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_file_path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let config_file = std::fs::File::open(path)?;
        let config: Self = serde_yaml::from_reader(&config_file)?;
        Ok(config)
    }

    /// Checks everything that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.links.is_empty() {
            return Err(Error::Configuration("no battery address configured".into()));
        }
        if self.links.len() > MAX_LINKS {
            return Err(Error::Configuration(format!(
                "at most {MAX_LINKS} batteries can be combined, got {}",
                self.links.len()
            )));
        }
        for entry in &self.links {
            validate_address(&entry.address)?;
            if let Some(cells) = entry.expected_cell_count {
                if cells == 0 || cells > MAX_CELL_COUNT {
                    return Err(Error::Configuration(format!(
                        "implausible cell count {cells} for {}",
                        entry.address
                    )));
                }
            }
        }
        let link = &self.link;
        for (name, value) in [
            ("poll_interval", link.poll_interval),
            ("notification_wait", link.notification_wait),
            ("response_timeout", link.response_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Configuration(format!("{name} must not be zero")));
            }
        }
        let battery = &self.battery;
        if battery.min_cell_voltage >= battery.max_cell_voltage {
            return Err(Error::Configuration(format!(
                "min cell voltage {} must be below max cell voltage {}",
                battery.min_cell_voltage, battery.max_cell_voltage
            )));
        }
        if battery.soc_low_alarm > battery.soc_low_warning {
            return Err(Error::Configuration(format!(
                "SoC alarm threshold {} above warning threshold {}",
                battery.soc_low_alarm, battery.soc_low_warning
            )));
        }
        Ok(())
    }
}

/// Accepts `XX:XX:XX:XX:XX:XX` with hexadecimal digits.
pub fn validate_address(address: &str) -> Result<()> {
    let parts: Vec<&str> = address.split(':').collect();
    let well_formed = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    if well_formed {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "invalid BLE address '{address}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_driver_constants() {
        let config = Config::default();
        assert_eq!(config.battery.max_cell_voltage, 3.45);
        assert_eq!(config.battery.min_cell_voltage, 3.10);
        assert_eq!(config.link.poll_interval, Duration::from_secs(5));
        assert_eq!(config.link.response_timeout, Duration::from_secs(5));
        assert_eq!(config.watchdog_horizon, Duration::from_secs(300));
    }

    #[test]
    fn load_yaml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "links:\n  - address: 70:3e:97:08:00:62\n  - address: a4:c1:37:40:89:5e\n    vendor: jk\nlink:\n  poll_interval: 10s\nwatchdog_horizon: 0s\n"
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.links.len(), 2);
        assert_eq!(config.links[0].vendor, Vendor::Jbd);
        assert_eq!(config.links[1].vendor, Vendor::Jk);
        assert_eq!(config.link.poll_interval, Duration::from_secs(10));
        assert_eq!(config.link.retry_delay, Duration::from_secs(3));
        assert_eq!(config.watchdog_horizon, Duration::ZERO);
        assert_eq!(config.battery, BatteryConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load("/nonexistent/btbattery.yaml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(validate_address("70:3e:97:08:00:62").is_ok());
        assert!(validate_address("70:3e:97:08:00").is_err());
        assert!(validate_address("70:3e:97:08:00:6g").is_err());
        assert!(validate_address("").is_err());
    }

    #[test]
    fn rejects_invalid_configs() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.links = vec![LinkEntry::new("70:3e:97:08:00:62", Vendor::Jbd); 5];
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.links = vec![LinkEntry {
            expected_cell_count: Some(0),
            ..LinkEntry::new("70:3e:97:08:00:62", Vendor::Jbd)
        }];
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.links[0].expected_cell_count = Some(16);
        config.validate().unwrap();

        config.battery.soc_low_alarm = 30.0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_zero_link_timing() {
        let mut config = Config::default();
        config.links = vec![LinkEntry::new("70:3e:97:08:00:62", Vendor::Jk)];
        config.validate().unwrap();

        config.link.poll_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.link.poll_interval = Duration::from_secs(5);
        config.link.notification_wait = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
