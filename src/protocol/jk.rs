//! JK ("jikong") BMS protocol.
//!
//! Commands are fixed 20 byte frames starting with `AA 55 90 EB`. The BMS
//! answers each one with a 20 byte ACK frame carrying the same header and then
//! streams 300 byte records starting with `55 AA EB 90`. Every frame ends with
//! a CRC8 that is the byte sum modulo 256.

use super::{
    require_len, sum_crc8, AssemblyState, BmsProtocol, Expect, FrameAssembler, Reply, Request,
};
use crate::config::BatteryConfig;
use crate::snapshot::{BatterySnapshot, DataClass, Protection, Severity};
use crate::transport::GattProfile;
use crate::{Error, Result};

pub const OUTGOING_HEADER: [u8; 4] = [0xaa, 0x55, 0x90, 0xeb];
pub const INCOMING_HEADER: [u8; 4] = [0x55, 0xaa, 0xeb, 0x90];

pub const COMMAND_FRAME_LEN: usize = 20;
pub const RECORD_LEN: usize = 300;

pub const COMMAND_REQ_EXTENDED_RECORD: u8 = 0x96;
pub const COMMAND_REQ_DEVICE_INFO: u8 = 0x97;
pub const COMMAND_REQ_CHARGE_SWITCH: u8 = 0x1d;
pub const COMMAND_REQ_DISCHARGE_SWITCH: u8 = 0x1e;

pub const RESPONSE_ACK: u8 = 0xc8;
pub const RESPONSE_EXTENDED_RECORD: u8 = 0x01;
pub const RESPONSE_CELL_DATA: u8 = 0x02;
pub const RESPONSE_DEVICE_INFO_RECORD: u8 = 0x03;

/// Number of cell voltage slots in a cell data record.
pub const CELL_SLOTS: usize = 24;

/// Alarm bits without a protection category.
const UNKNOWN_ALARMS_MASK: u16 = 0x57a4;

fn u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn i32_le(data: &[u8], offset: usize) -> i32 {
    u32_le(data, offset) as i32
}

/// NUL terminated ASCII of at most `max_len` bytes.
fn read_string(data: &[u8], start: usize, max_len: usize) -> String {
    data[start..start + max_len]
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| char::from(*b))
        .collect()
}

fn write_string(data: &mut [u8], start: usize, max_len: usize, value: &str) {
    for (i, b) in value.bytes().take(max_len).enumerate() {
        data[start + i] = b;
    }
}

/// Builds a 20 byte command frame.
pub fn command(address: u8, value: u32, length: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(COMMAND_FRAME_LEN);
    frame.extend_from_slice(&OUTGOING_HEADER);
    frame.push(address);
    frame.push(length);
    frame.extend_from_slice(&value.to_le_bytes());
    frame.extend_from_slice(&[0u8; 9]);
    frame.push(sum_crc8(&frame));
    frame
}

pub fn charge_switch(enable: bool) -> Vec<u8> {
    command(COMMAND_REQ_CHARGE_SWITCH, u32::from(enable), 4)
}

pub fn discharge_switch(enable: bool) -> Vec<u8> {
    command(COMMAND_REQ_DISCHARGE_SWITCH, u32::from(enable), 4)
}

fn validate_crc(frame: &[u8]) -> Result<()> {
    let last = frame.len() - 1;
    let calculated = sum_crc8(&frame[..last]);
    let received = frame[last];
    if calculated != received {
        log::warn!(
            "Invalid CRC8 - calculated={calculated:02X} received={received:02X} buffer={frame:02X?}"
        );
        return Err(Error::Integrity {
            calculated: u16::from(calculated),
            received: u16::from(received),
        });
    }
    Ok(())
}

/// Checks header, length and CRC of a 300 byte record; returns its type.
pub fn validate_record(frame: &[u8]) -> Result<u8> {
    require_len(frame, RECORD_LEN)?;
    if frame.len() != RECORD_LEN {
        return Err(Error::Framing(format!(
            "record length {} instead of {RECORD_LEN}",
            frame.len()
        )));
    }
    if frame[..4] != INCOMING_HEADER {
        return Err(Error::Framing(format!(
            "invalid record header {:02X?}",
            &frame[..4]
        )));
    }
    validate_crc(frame)?;
    Ok(frame[4])
}

fn new_record(record_type: u8) -> Vec<u8> {
    let mut frame = vec![0u8; RECORD_LEN];
    frame[..4].copy_from_slice(&INCOMING_HEADER);
    frame[4] = record_type;
    frame
}

fn seal_record(mut frame: Vec<u8>) -> Vec<u8> {
    frame[RECORD_LEN - 1] = sum_crc8(&frame[..RECORD_LEN - 1]);
    frame
}

/// The 20 byte answer to a command.
pub struct AckFrame;

impl AckFrame {
    /// Returns true for an ACK (status `01 01`), false for a NACK.
    pub fn decode(frame: &[u8]) -> Result<bool> {
        require_len(frame, COMMAND_FRAME_LEN)?;
        if frame[..4] != OUTGOING_HEADER || frame[4] != RESPONSE_ACK {
            return Err(Error::Framing(format!(
                "invalid acknowledge frame {frame:02X?}"
            )));
        }
        validate_crc(&frame[..COMMAND_FRAME_LEN])?;
        Ok(frame[5] == 0x01 && frame[6] == 0x01)
    }

    pub fn encode(status: [u8; 2]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(COMMAND_FRAME_LEN);
        frame.extend_from_slice(&OUTGOING_HEADER);
        frame.extend_from_slice(&[RESPONSE_ACK, status[0], status[1]]);
        frame.resize(COMMAND_FRAME_LEN - 1, 0);
        frame.push(sum_crc8(&frame));
        frame
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub model: String,
    pub hardware_version: String,
    pub software_version: String,
    /// seconds
    pub uptime: u32,
    pub power_on_count: u32,
    pub name: String,
    pub manufacturing_date: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn request() -> Vec<u8> {
        command(COMMAND_REQ_DEVICE_INFO, 0, 0)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let record_type = validate_record(frame)?;
        if record_type != RESPONSE_DEVICE_INFO_RECORD {
            return Err(Error::Framing(format!(
                "expected device info record, got {record_type:02X}"
            )));
        }
        Ok(Self {
            model: read_string(frame, 6, 16),
            hardware_version: read_string(frame, 22, 8),
            software_version: read_string(frame, 30, 8),
            uptime: u32_le(frame, 38),
            power_on_count: u32_le(frame, 42),
            name: read_string(frame, 46, 16),
            manufacturing_date: read_string(frame, 78, 8),
            serial_number: read_string(frame, 86, 11),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = new_record(RESPONSE_DEVICE_INFO_RECORD);
        write_string(&mut frame, 6, 16, &self.model);
        write_string(&mut frame, 22, 8, &self.hardware_version);
        write_string(&mut frame, 30, 8, &self.software_version);
        frame[38..42].copy_from_slice(&self.uptime.to_le_bytes());
        frame[42..46].copy_from_slice(&self.power_on_count.to_le_bytes());
        write_string(&mut frame, 46, 16, &self.name);
        write_string(&mut frame, 78, 8, &self.manufacturing_date);
        write_string(&mut frame, 86, 11, &self.serial_number);
        seal_record(frame)
    }
}

/// Settings record; only the FET switches are used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedRecord {
    pub charge_switch: bool,
    pub discharge_switch: bool,
}

impl ExtendedRecord {
    pub fn request() -> Vec<u8> {
        command(COMMAND_REQ_EXTENDED_RECORD, 0, 0)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let record_type = validate_record(frame)?;
        if record_type != RESPONSE_EXTENDED_RECORD {
            return Err(Error::Framing(format!(
                "expected extended record, got {record_type:02X}"
            )));
        }
        Ok(Self {
            charge_switch: frame[118] == 0x01,
            discharge_switch: frame[122] == 0x01,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = new_record(RESPONSE_EXTENDED_RECORD);
        frame[118] = u8::from(self.charge_switch);
        frame[122] = u8::from(self.discharge_switch);
        seal_record(frame)
    }
}

/// Live measurement record, streamed about once per second.
#[derive(Debug, Clone, PartialEq)]
pub struct CellData {
    /// Enabled cell slots; zero on firmware that does not report it
    pub cell_mask: u32,
    /// V, enabled cells only
    pub cell_voltages: Vec<f32>,
    pub average_cell_voltage: f32,
    pub delta_cell_voltage: f32,
    /// zero based
    pub highest_cell: u8,
    /// zero based
    pub lowest_cell: u8,
    /// V
    pub voltage: f32,
    /// A, positive while charging
    pub current: f32,
    /// T1 and T2, °C
    pub temperatures: [f32; 2],
    /// °C
    pub mosfet_temperature: f32,
    pub error_bits: u16,
    pub balancing: bool,
    pub soc: u8,
    /// Ah
    pub capacity_remain: f32,
    /// Ah
    pub capacity: f32,
    pub cycles: u32,
    pub charge_fet: bool,
    pub discharge_fet: bool,
}

impl CellData {
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let record_type = validate_record(frame)?;
        if record_type != RESPONSE_CELL_DATA {
            return Err(Error::Framing(format!(
                "expected cell data record, got {record_type:02X}"
            )));
        }

        let slot = |i: usize| f32::from(u16_le(frame, 6 + 2 * i)) / 1000.0;
        let cell_mask = u32_le(frame, 54);
        let cell_voltages: Vec<f32> = if cell_mask != 0 {
            (0..CELL_SLOTS)
                .filter(|i| read_bit!(cell_mask, *i))
                .map(slot)
                .collect()
        } else {
            (0..CELL_SLOTS).map(slot).filter(|v| *v > 0.0).collect()
        };
        if cell_voltages.is_empty() {
            return Err(Error::Framing("cell data record without cells".into()));
        }

        Ok(Self {
            cell_mask,
            cell_voltages,
            average_cell_voltage: f32::from(u16_le(frame, 58)) / 1000.0,
            delta_cell_voltage: f32::from(u16_le(frame, 60)) / 1000.0,
            highest_cell: frame[62],
            lowest_cell: frame[63],
            voltage: u32_le(frame, 118) as f32 / 1000.0,
            current: i32_le(frame, 126) as f32 / 1000.0,
            temperatures: [
                f32::from(i16_le(frame, 130)) / 10.0,
                f32::from(i16_le(frame, 132)) / 10.0,
            ],
            mosfet_temperature: f32::from(i16_le(frame, 134)) / 10.0,
            error_bits: u16::from_be_bytes([frame[136], frame[137]]),
            balancing: frame[140] != 0,
            soc: frame[141],
            capacity_remain: u32_le(frame, 142) as f32 / 1000.0,
            capacity: u32_le(frame, 146) as f32 / 1000.0,
            cycles: u32_le(frame, 150),
            charge_fet: frame[166] != 0,
            discharge_fet: frame[167] != 0,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = new_record(RESPONSE_CELL_DATA);
        let slots: Vec<usize> = if self.cell_mask != 0 {
            (0..CELL_SLOTS)
                .filter(|i| read_bit!(self.cell_mask, *i))
                .collect()
        } else {
            (0..CELL_SLOTS).collect()
        };
        for (slot, voltage) in slots.into_iter().zip(&self.cell_voltages) {
            let offset = 6 + 2 * slot;
            frame[offset..offset + 2]
                .copy_from_slice(&((voltage * 1000.0).round() as u16).to_le_bytes());
        }
        frame[54..58].copy_from_slice(&self.cell_mask.to_le_bytes());
        frame[58..60]
            .copy_from_slice(&((self.average_cell_voltage * 1000.0).round() as u16).to_le_bytes());
        frame[60..62]
            .copy_from_slice(&((self.delta_cell_voltage * 1000.0).round() as u16).to_le_bytes());
        frame[62] = self.highest_cell;
        frame[63] = self.lowest_cell;
        frame[118..122].copy_from_slice(&((self.voltage * 1000.0).round() as u32).to_le_bytes());
        frame[126..130].copy_from_slice(&((self.current * 1000.0).round() as i32).to_le_bytes());
        for (i, temperature) in self
            .temperatures
            .iter()
            .chain(std::iter::once(&self.mosfet_temperature))
            .enumerate()
        {
            let offset = 130 + 2 * i;
            frame[offset..offset + 2]
                .copy_from_slice(&((temperature * 10.0).round() as i16).to_le_bytes());
        }
        frame[136..138].copy_from_slice(&self.error_bits.to_be_bytes());
        frame[140] = u8::from(self.balancing);
        frame[141] = self.soc;
        frame[142..146]
            .copy_from_slice(&((self.capacity_remain * 1000.0).round() as u32).to_le_bytes());
        frame[146..150].copy_from_slice(&((self.capacity * 1000.0).round() as u32).to_le_bytes());
        frame[150..154].copy_from_slice(&self.cycles.to_le_bytes());
        frame[166] = u8::from(self.charge_fet);
        frame[167] = u8::from(self.discharge_fet);
        seal_record(frame)
    }

    pub fn protection(&self, config: &BatteryConfig) -> Protection {
        let bits = self.error_bits;
        if bits & UNKNOWN_ALARMS_MASK != 0 {
            log::info!("Unknown system alarms: {bits:04X}");
        }
        Protection {
            temp_high_charge: Severity::alarm_if(read_bit!(bits, 0)),
            temp_low_charge: Severity::alarm_if(read_bit!(bits, 1)),
            voltage_low: Severity::alarm_if(read_bit!(bits, 3)),
            voltage_high: Severity::alarm_if(read_bit!(bits, 4)),
            current_over: Severity::alarm_if(read_bit!(bits, 6)),
            current_under: Severity::alarm_if(read_bit!(bits, 13)),
            temp_high_discharge: Severity::alarm_if(read_bit!(bits, 15)),
            soc_low: Protection::classify_soc(f32::from(self.soc), config),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct JkAssembler {
    state: AssemblyState,
}

impl JkAssembler {
    pub fn state(&self) -> &AssemblyState {
        &self.state
    }
}

impl FrameAssembler for JkAssembler {
    fn push(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        if fragment.len() == COMMAND_FRAME_LEN && fragment.starts_with(&OUTGOING_HEADER) {
            return self.state.start(None, COMMAND_FRAME_LEN, fragment);
        }
        if fragment.starts_with(&INCOMING_HEADER) {
            return self
                .state
                .start(fragment.get(4).copied(), RECORD_LEN, fragment);
        }
        if self.state.is_idle() {
            log::debug!("Discarding misaligned fragment {fragment:02X?}");
            return None;
        }
        self.state.append(fragment)
    }

    fn reset(&mut self) {
        self.state.reset();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JkUpdate {
    Ack,
    Nack,
    DeviceInfo(DeviceInfo),
    Extended(ExtendedRecord),
    Cells(CellData),
}

pub struct JkProtocol {
    config: BatteryConfig,
    assembler: JkAssembler,
    expected_cell_count: Option<u8>,
    charge_switch: Option<bool>,
    discharge_switch: Option<bool>,
    command_acked: bool,
}

impl JkProtocol {
    pub const BATTERY_TYPE: &'static str = "JK BT";

    pub fn new(config: BatteryConfig) -> Self {
        Self {
            config,
            assembler: JkAssembler::default(),
            expected_cell_count: None,
            charge_switch: None,
            discharge_switch: None,
            command_acked: false,
        }
    }

    pub fn with_expected_cell_count(mut self, cell_count: Option<u8>) -> Self {
        self.expected_cell_count = cell_count;
        self
    }

    /// Whether the last command written was acknowledged.
    pub fn is_command_acked(&self) -> bool {
        self.command_acked
    }

    fn decode_frame(&self, frame: &[u8]) -> Result<JkUpdate> {
        if frame.len() == COMMAND_FRAME_LEN {
            return Ok(if AckFrame::decode(frame)? {
                JkUpdate::Ack
            } else {
                JkUpdate::Nack
            });
        }
        match validate_record(frame)? {
            RESPONSE_EXTENDED_RECORD => Ok(JkUpdate::Extended(ExtendedRecord::decode(frame)?)),
            RESPONSE_CELL_DATA => Ok(JkUpdate::Cells(CellData::decode(frame)?)),
            RESPONSE_DEVICE_INFO_RECORD => Ok(JkUpdate::DeviceInfo(DeviceInfo::decode(frame)?)),
            other => Err(Error::Framing(format!("unknown record type {other:02X}"))),
        }
    }
}

impl BmsProtocol for JkProtocol {
    type Update = JkUpdate;

    fn battery_type(&self) -> &'static str {
        Self::BATTERY_TYPE
    }

    fn gatt_profile(&self) -> GattProfile {
        GattProfile {
            service: 0xffe0,
            notify_characteristic: 0xffe1,
            write_characteristic: 0xffe1,
        }
    }

    fn reset(&mut self) {
        self.assembler.reset();
        self.charge_switch = None;
        self.discharge_switch = None;
        self.command_acked = false;
    }

    fn connect_requests(&self) -> Vec<Request> {
        [DeviceInfo::request(), ExtendedRecord::request()]
            .into_iter()
            .map(|frame| Request {
                with_response: false,
                ..Request::new(frame, Expect::Ack)
            })
            .collect()
    }

    fn poll_requests(&self) -> Vec<Request> {
        Vec::new()
    }

    fn on_request_sent(&mut self, _request: &Request) {
        self.command_acked = false;
    }

    fn on_fragment(&mut self, fragment: &[u8]) -> Result<Option<JkUpdate>> {
        let Some(frame) = self.assembler.push(fragment) else {
            return Ok(None);
        };
        log::trace!("Frame complete: {frame:02X?}");
        let update = self.decode_frame(&frame)?;
        match &update {
            JkUpdate::Ack => self.command_acked = true,
            JkUpdate::Nack => log::warn!("Received NACK"),
            JkUpdate::Extended(record) => {
                self.charge_switch = Some(record.charge_switch);
                self.discharge_switch = Some(record.discharge_switch);
            }
            JkUpdate::DeviceInfo(info) => {
                log::info!("Device {} ({}) serial {}", info.name, info.model, info.serial_number);
            }
            JkUpdate::Cells(_) => {}
        }
        Ok(Some(update))
    }

    fn reply(update: &JkUpdate) -> Reply {
        match update {
            JkUpdate::Ack => Reply::Ack,
            JkUpdate::Nack => Reply::Nack,
            JkUpdate::DeviceInfo(_) | JkUpdate::Extended(_) => Reply::Info,
            JkUpdate::Cells(_) => Reply::Refreshed(&[DataClass::GeneralInfo, DataClass::CellData]),
        }
    }

    fn apply(&self, update: JkUpdate, snapshot: &mut BatterySnapshot) -> Result<()> {
        match update {
            JkUpdate::Ack | JkUpdate::Nack | JkUpdate::Extended(_) => {}
            JkUpdate::DeviceInfo(info) => {
                snapshot.model = Some(info.model);
                snapshot.firmware_version = Some(info.software_version);
                snapshot.manufacture_date = Some(info.manufacturing_date);
            }
            JkUpdate::Cells(data) => {
                let cell_count = data.cell_voltages.len() as u8;
                if let Some(expected) = self.expected_cell_count {
                    if cell_count != expected {
                        return Err(Error::Configuration(format!(
                            "expected {expected} cells, BMS reports {cell_count}"
                        )));
                    }
                }
                snapshot.voltage = data.voltage;
                snapshot.current = data.current;
                snapshot.soc = f32::from(data.soc);
                snapshot.capacity_remain = data.capacity_remain;
                snapshot.capacity = data.capacity;
                snapshot.cycles = data.cycles;
                snapshot.temperatures = data.temperatures.to_vec();
                snapshot.mosfet_temperature = Some(data.mosfet_temperature);
                snapshot.charge_fet = data.charge_fet && self.charge_switch.unwrap_or(true);
                snapshot.discharge_fet =
                    data.discharge_fet && self.discharge_switch.unwrap_or(true);
                snapshot.protection = data.protection(&self.config);
                // only a pack level balancing flag is reported
                snapshot.set_cells(cell_count, std::iter::empty());
                for (cell, voltage) in snapshot.cells.iter_mut().zip(&data.cell_voltages) {
                    cell.voltage = Some(*voltage);
                }
                snapshot.apply_limits(&self.config);
            }
        }
        Ok(())
    }
}
