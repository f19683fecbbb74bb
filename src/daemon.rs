use anyhow::{Context, Result};
use btbattery_lib::battery::Battery;
use btbattery_lib::snapshot::BatterySnapshot;
use log::{info, warn};
use serde_json::json;
use std::time::Duration;

use crate::commandline::OutputFormat;

const BASE_TOPIC: &str = "btbattery";

/// Flattens a JSON value into `path value` pairs, skipping nulls.
fn flatten(topic: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten(&format!("{topic}/{k}"), v, out);
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                flatten(&format!("{topic}/{i}"), v, out);
            }
        }
        serde_json::Value::String(s) => out.push((topic.to_string(), s.clone())),
        serde_json::Value::Number(n) => out.push((topic.to_string(), n.to_string())),
        serde_json::Value::Bool(b) => out.push((topic.to_string(), b.to_string())),
        serde_json::Value::Null => {}
    }
}

fn format_cells(snapshot: &BatterySnapshot) -> String {
    snapshot
        .cells
        .iter()
        .map(|cell| match cell.voltage {
            Some(v) if cell.balancing => format!("{v:.3}V*"),
            Some(v) => format!("{v:.3}V"),
            None => "-".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_text(snapshot: &BatterySnapshot) {
    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
    println!("{} {}", snapshot.battery_type, snapshot.address);
    println!(
        "Voltage: {:.2}V  Current: {:.2}A  SOC: {:.0}%",
        snapshot.voltage, snapshot.current, snapshot.soc
    );
    println!(
        "Capacity: {:.2}/{:.2}Ah  Cycles: {}",
        snapshot.capacity_remain, snapshot.capacity, snapshot.cycles
    );
    println!(
        "Cells ({}): {}",
        snapshot.cell_count,
        format_cells(snapshot)
    );
    if let (Some(min), Some(max)) = (snapshot.min_cell_voltage(), snapshot.max_cell_voltage()) {
        println!("Cell range: {min:.3}V..{max:.3}V  delta {:.3}V", max - min);
    }
    println!(
        "Temperatures: {:?}  MOSFET: {:?}",
        snapshot.temperatures, snapshot.mosfet_temperature
    );
    println!(
        "Charge FET: {}  Discharge FET: {}",
        snapshot.charge_fet, snapshot.discharge_fet
    );
    println!(
        "Protection: {:?} {:?}",
        snapshot.protection.highest(),
        snapshot.protection
    );
    println!("--------------------------");
}

fn output(snapshot: &BatterySnapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print_text(snapshot),
        OutputFormat::Json => {
            let mut data = serde_json::Map::new();
            data.insert(
                "timestamp".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
            data.insert(
                "battery".to_string(),
                serde_json::to_value(snapshot).with_context(|| "Cannot serialize snapshot")?,
            );
            println!("{}", serde_json::to_string(&data)?);
        }
        OutputFormat::Simple => {
            let value =
                serde_json::to_value(snapshot).with_context(|| "Cannot serialize snapshot")?;
            let mut lines = Vec::new();
            flatten(BASE_TOPIC, &value, &mut lines);
            for (topic, value) in lines {
                println!("{topic} {value}");
            }
        }
    }
    Ok(())
}

/// Prints the battery every `interval` until Ctrl-C.
pub async fn run(battery: &mut dyn Battery, interval: Duration, format: OutputFormat) -> Result<()> {
    info!("Starting daemon mode: interval={interval:?}, format={format:?}");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if battery.refresh_data() {
                    output(&battery.get_current_snapshot(), format)?;
                } else {
                    warn!("No complete battery data available");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.with_context(|| "Cannot listen for Ctrl-C")?;
                info!("Stopping");
                return Ok(());
            }
        }
    }
}
