use crate::config::BatteryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of data a decoded frame refreshes; the watchdog tracks each separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataClass {
    GeneralInfo,
    CellData,
}

impl DataClass {
    pub const ALL: [DataClass; 2] = [DataClass::GeneralInfo, DataClass::CellData];

    pub(crate) fn index(self) -> usize {
        match self {
            DataClass::GeneralInfo => 0,
            DataClass::CellData => 1,
        }
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DataClass::GeneralInfo => write!(f, "general info"),
            DataClass::CellData => write!(f, "cell data"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    #[default]
    Ok,
    Warning,
    Alarm,
}

impl Severity {
    pub fn alarm_if(set: bool) -> Self {
        if set {
            Severity::Alarm
        } else {
            Severity::Ok
        }
    }

    pub fn warning_if(set: bool) -> Self {
        if set {
            Severity::Warning
        } else {
            Severity::Ok
        }
    }
}

/// Protection state per category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Protection {
    pub voltage_high: Severity,
    pub voltage_low: Severity,
    pub temp_high_charge: Severity,
    pub temp_low_charge: Severity,
    pub temp_high_discharge: Severity,
    pub temp_low_discharge: Severity,
    pub current_over: Severity,
    pub current_under: Severity,
    pub cell_imbalance: Severity,
    /// software lock, short circuit or front-end IC fault
    pub internal_failure: Severity,
    /// computed from the configured SoC thresholds, not reported by the BMS
    pub soc_low: Severity,
}

impl Protection {
    pub fn classify_soc(soc: f32, config: &BatteryConfig) -> Severity {
        if soc < config.soc_low_alarm {
            Severity::Alarm
        } else if soc < config.soc_low_warning {
            Severity::Warning
        } else {
            Severity::Ok
        }
    }

    /// Per category maximum of both sides.
    pub fn merge(&mut self, other: &Protection) {
        self.voltage_high = self.voltage_high.max(other.voltage_high);
        self.voltage_low = self.voltage_low.max(other.voltage_low);
        self.temp_high_charge = self.temp_high_charge.max(other.temp_high_charge);
        self.temp_low_charge = self.temp_low_charge.max(other.temp_low_charge);
        self.temp_high_discharge = self.temp_high_discharge.max(other.temp_high_discharge);
        self.temp_low_discharge = self.temp_low_discharge.max(other.temp_low_discharge);
        self.current_over = self.current_over.max(other.current_over);
        self.current_under = self.current_under.max(other.current_under);
        self.cell_imbalance = self.cell_imbalance.max(other.cell_imbalance);
        self.internal_failure = self.internal_failure.max(other.internal_failure);
        self.soc_low = self.soc_low.max(other.soc_low);
    }

    pub fn highest(&self) -> Severity {
        [
            self.voltage_high,
            self.voltage_low,
            self.temp_high_charge,
            self.temp_low_charge,
            self.temp_high_discharge,
            self.temp_low_discharge,
            self.current_over,
            self.current_under,
            self.cell_imbalance,
            self.internal_failure,
            self.soc_low,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Volts; `None` until the first cell-voltage frame
    pub voltage: Option<f32>,
    pub balancing: bool,
}

impl Cell {
    pub fn new(balancing: bool) -> Self {
        Self {
            voltage: None,
            balancing,
        }
    }
}

/// Latest decoded state of one pack, or of a virtual pack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatterySnapshot {
    pub battery_type: String,
    pub address: String,
    /// V
    pub voltage: f32,
    /// A, positive while charging
    pub current: f32,
    /// %
    pub soc: f32,
    /// Ah
    pub capacity_remain: f32,
    /// Ah
    pub capacity: f32,
    pub cycles: u32,
    pub cell_count: u8,
    pub cells: Vec<Cell>,
    /// °C, one per sensor
    pub temperatures: Vec<f32>,
    /// °C
    pub mosfet_temperature: Option<f32>,
    pub charge_fet: bool,
    pub discharge_fet: bool,
    pub protection: Protection,
    pub firmware_version: Option<String>,
    pub manufacture_date: Option<String>,
    pub model: Option<String>,
    pub max_battery_voltage: f32,
    pub min_battery_voltage: f32,
    pub max_battery_charge_current: f32,
    pub max_battery_discharge_current: f32,
}

impl BatterySnapshot {
    pub fn new(battery_type: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            battery_type: battery_type.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    /// Recomputes the limits derived from `cell_count` and the configuration.
    pub fn apply_limits(&mut self, config: &BatteryConfig) {
        self.max_battery_voltage = config.max_cell_voltage * f32::from(self.cell_count);
        self.min_battery_voltage = config.min_cell_voltage * f32::from(self.cell_count);
        self.max_battery_charge_current = config.max_battery_charge_current;
        self.max_battery_discharge_current = config.max_battery_discharge_current;
    }

    /// Resizes `cells` to `cell_count`, keeping known voltages and taking the balance flags.
    pub fn set_cells(&mut self, cell_count: u8, balancing: impl IntoIterator<Item = bool>) {
        let mut balancing = balancing.into_iter();
        let previous = std::mem::take(&mut self.cells);
        self.cell_count = cell_count;
        self.cells = (0..usize::from(cell_count))
            .map(|i| Cell {
                voltage: previous.get(i).and_then(|c| c.voltage),
                balancing: balancing.next().unwrap_or(false),
            })
            .collect();
    }

    pub fn cell_voltages(&self) -> Vec<Option<f32>> {
        self.cells.iter().map(|c| c.voltage).collect()
    }

    pub fn min_cell_voltage(&self) -> Option<f32> {
        self.cells
            .iter()
            .filter_map(|c| c.voltage)
            .min_by(|a, b| a.total_cmp(b))
    }

    pub fn max_cell_voltage(&self) -> Option<f32> {
        self.cells
            .iter()
            .filter_map(|c| c.voltage)
            .max_by(|a, b| a.total_cmp(b))
    }
}
