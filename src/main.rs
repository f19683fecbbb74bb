use anyhow::{Context, Result};
use btbattery_lib::aggregate::VirtualBattery;
use btbattery_lib::battery::{wait_for_settings, Battery};
use btbattery_lib::btleplug_transport::BtleplugTransport;
use btbattery_lib::config::{Config, LinkEntry, Vendor};
use btbattery_lib::link::{spawn_link, BatteryHandle, LinkController};
use btbattery_lib::protocol::jbd::JbdProtocol;
use btbattery_lib::protocol::jk::JkProtocol;
use btbattery_lib::watchdog::{ExitProcess, RecoveryAction, Watchdog};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::path::Path;
use std::sync::Arc;
use std::{ops::Deref, panic, time::Duration};
use tokio::task::JoinHandle;

mod commandline;
mod daemon;

/// How often each link's watchdog looks at its timestamps.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn load_config(args: &commandline::CliArgs) -> Result<Config> {
    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to open config file at '{}'", path.display()))?,
        None if Path::new(Config::DEFAULT_CONFIG_FILE).exists() => {
            Config::load(Config::DEFAULT_CONFIG_FILE).with_context(|| {
                format!(
                    "Failed to open config file at '{}'",
                    Config::DEFAULT_CONFIG_FILE
                )
            })?
        }
        None => Config::default(),
    };
    let config = args.merge_into(config);
    config.validate().with_context(|| "Invalid configuration")?;
    debug!("Configuration: {config:?}");
    Ok(config)
}

struct Link {
    handle: BatteryHandle,
    controller: LinkController,
    watchdog: JoinHandle<()>,
}

async fn start_link(
    entry: &LinkEntry,
    config: &Config,
    scan_timeout: Duration,
    recovery: Arc<dyn RecoveryAction>,
) -> Result<Link> {
    let transport = BtleplugTransport::new(scan_timeout)
        .await
        .with_context(|| "Cannot open bluetooth adapter")?;
    let watchdog = Arc::new(Watchdog::new(config.watchdog_horizon));
    let (handle, controller) = match entry.vendor {
        Vendor::Jbd => spawn_link(
            &entry.address,
            transport,
            JbdProtocol::new(config.battery.clone())
                .with_expected_cell_count(entry.expected_cell_count),
            config.link.clone(),
            Some(watchdog.clone()),
        ),
        Vendor::Jk => spawn_link(
            &entry.address,
            transport,
            JkProtocol::new(config.battery.clone())
                .with_expected_cell_count(entry.expected_cell_count),
            config.link.clone(),
            Some(watchdog.clone()),
        ),
    };
    info!("Started {} link to {}", entry.vendor, entry.address);
    Ok(Link {
        handle,
        controller,
        watchdog: watchdog.spawn(WATCHDOG_PERIOD, recovery),
    })
}

async fn monitor(
    battery: &mut dyn Battery,
    config: &Config,
    args: &commandline::CliArgs,
) -> Result<()> {
    wait_for_settings(battery, config.settings_attempts, config.link.retry_delay)
        .await
        .with_context(|| "Battery did not report its settings")?;
    battery.log_settings();
    daemon::run(battery, args.interval, args.format).await
}

async fn run(args: commandline::CliArgs, config: Config) -> Result<()> {
    let recovery: Arc<dyn RecoveryAction> = Arc::new(ExitProcess::default());
    let mut links = Vec::with_capacity(config.links.len());
    for entry in &config.links {
        links.push(start_link(entry, &config, args.scan_timeout, recovery.clone()).await?);
    }

    let mut handles: Vec<BatteryHandle> = links.iter().map(|l| l.handle.clone()).collect();
    let mut battery: Box<dyn Battery> = if handles.len() == 1 {
        Box::new(handles.remove(0))
    } else {
        let members = handles
            .into_iter()
            .map(|h| Box::new(h) as Box<dyn Battery>)
            .collect();
        Box::new(
            VirtualBattery::new(members, config.battery.clone())
                .with_context(|| "Cannot create virtual battery")?,
        )
    };

    let result = monitor(battery.as_mut(), &config, &args).await;

    for link in &links {
        link.controller.stop();
        link.watchdog.abort();
    }
    for link in links {
        link.controller.join().await;
    }
    result
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = load_config(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Cannot start tokio runtime")?;
    runtime.block_on(run(args, config))
}
