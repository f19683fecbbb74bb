use btbattery_lib::config::{Config, LinkEntry, Vendor};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum CliVendor {
    /// JBD / xiaoxiang smart BMS
    Jbd,
    /// JK / jikong BMS
    Jk,
}

impl From<CliVendor> for Vendor {
    fn from(vendor: CliVendor) -> Self {
        match vendor {
            CliVendor::Jbd => Vendor::Jbd,
            CliVendor::Jk => Vendor::Jk,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    /// Human readable summary
    Text,
    /// One JSON object per interval
    Json,
    /// One `path value` line per field
    Simple,
}

const fn about_text() -> &'static str {
    "JBD / JK bluetooth BMS monitor"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// BLE addresses of the packs (e.g. 70:3e:97:08:00:62); two to four form a virtual battery
    pub addresses: Vec<String>,

    /// Configuration file; defaults to btbattery.yaml when it exists
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// BMS vendor of the packs given on the command line
    #[arg(long, value_enum, default_value_t = CliVendor::Jbd)]
    pub vendor: CliVendor,

    /// Interval for printing the battery data (e.g., "5s", "1m")
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub interval: Duration,

    /// Interval for polling the BMS, overrides the configuration file
    #[arg(long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Restart when no data arrived for this long, "0s" disables; overrides the configuration file
    #[arg(long, value_parser = humantime::parse_duration)]
    pub watchdog: Option<Duration>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// How long to scan for a pack before a connect attempt fails
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub scan_timeout: Duration,
}

impl CliArgs {
    /// Applies the command line over `config`.
    pub fn merge_into(&self, mut config: Config) -> Config {
        if !self.addresses.is_empty() {
            config.links = self
                .addresses
                .iter()
                .map(|address| LinkEntry::new(address.clone(), self.vendor.into()))
                .collect();
        }
        if let Some(poll_interval) = self.poll_interval {
            config.link.poll_interval = poll_interval;
        }
        if let Some(horizon) = self.watchdog {
            config.watchdog_horizon = horizon;
        }
        config
    }
}
