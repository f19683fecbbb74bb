//! JBD ("xiaoxiang") smart BMS protocol.
//!
//! Requests are `DD A5 CMD 00 CHK CHK 77`, responses are
//! `DD CMD STATUS LEN PAYLOAD.. CHK CHK 77` where the 16 bit checksum is the
//! two's complement of the byte sum over status, length and payload.
//! Responses arrive split over several notifications (20 byte MTU).

use super::{require_len, AssemblyState, BmsProtocol, Expect, FrameAssembler, Reply, Request};
use crate::config::{BatteryConfig, MAX_CELL_COUNT};
use crate::snapshot::{BatterySnapshot, DataClass, Protection, Severity};
use crate::transport::GattProfile;
use crate::{Error, Result};

pub const START_BYTE: u8 = 0xdd;
pub const STOP_BYTE: u8 = 0x77;
const READ: u8 = 0xa5;
const WRITE: u8 = 0x5a;

pub const HEADER_LEN: usize = 4;
pub const FOOTER_LEN: usize = 3;

pub const CMD_GENERAL_INFO: u8 = 0x03;
pub const CMD_CELL_VOLTAGES: u8 = 0x04;
pub const CMD_HARDWARE_VERSION: u8 = 0x05;
pub const CMD_CLEAR_PASSWORD: u8 = 0x09;

const KNOWN_COMMANDS: [u8; 3] = [CMD_GENERAL_INFO, CMD_CELL_VOLTAGES, CMD_HARDWARE_VERSION];

/// Bytes of the general info payload before the temperature readings.
const GENERAL_INFO_FIXED_LEN: usize = 23;

const KELVIN_OFFSET: f32 = 273.15;

pub fn checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
        .wrapping_neg()
}

fn read_request(command: u8) -> Vec<u8> {
    let crc = checksum(&[command, 0x00]).to_be_bytes();
    vec![START_BYTE, READ, command, 0x00, crc[0], crc[1], STOP_BYTE]
}

fn write_request(command: u8, data: &[u8]) -> Result<Vec<u8>> {
    let len = u8::try_from(data.len())
        .map_err(|_| Error::Framing(format!("request payload too long: {}", data.len())))?;
    let mut tx_buffer = Vec::with_capacity(HEADER_LEN + data.len() + FOOTER_LEN);
    tx_buffer.extend_from_slice(&[START_BYTE, WRITE, command, len]);
    tx_buffer.extend_from_slice(data);
    let crc = checksum(&tx_buffer[2..]).to_be_bytes();
    tx_buffer.extend_from_slice(&[crc[0], crc[1], STOP_BYTE]);
    Ok(tx_buffer)
}

/// Builds a response frame as the BMS sends it. Payloads above 255 bytes are truncated.
pub fn encode_response(command: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(usize::from(u8::MAX))];
    let mut rx_buffer = Vec::with_capacity(HEADER_LEN + payload.len() + FOOTER_LEN);
    rx_buffer.extend_from_slice(&[START_BYTE, command, status, payload.len() as u8]);
    rx_buffer.extend_from_slice(payload);
    let crc = checksum(&rx_buffer[2..]).to_be_bytes();
    rx_buffer.extend_from_slice(&[crc[0], crc[1], STOP_BYTE]);
    rx_buffer
}

/// Checks markers, length and checksum; returns the payload.
pub fn validate_response(frame: &[u8]) -> Result<&[u8]> {
    require_len(frame, HEADER_LEN + FOOTER_LEN)?;
    if frame[0] != START_BYTE {
        return Err(Error::Framing(format!(
            "invalid start byte {:02X}",
            frame[0]
        )));
    }
    let payload_len = usize::from(frame[3]);
    let total_len = HEADER_LEN + payload_len + FOOTER_LEN;
    require_len(frame, total_len)?;
    if frame[total_len - 1] != STOP_BYTE {
        return Err(Error::Framing(format!(
            "invalid stop byte {:02X}",
            frame[total_len - 1]
        )));
    }

    let calculated = checksum(&frame[2..HEADER_LEN + payload_len]);
    let received = u16::from_be_bytes([frame[total_len - 3], frame[total_len - 2]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} buffer={frame:02X?}"
        );
        return Err(Error::Integrity {
            calculated,
            received,
        });
    }

    if frame[2] != 0 {
        return Err(Error::Framing(format!(
            "command {:02X} rejected with status {:02X}",
            frame[1], frame[2]
        )));
    }
    Ok(&frame[HEADER_LEN..HEADER_LEN + payload_len])
}

fn expect_command(frame: &[u8], command: u8) -> Result<()> {
    if frame[1] != command {
        return Err(Error::Framing(format!(
            "expected command {command:02X}, got {:02X}",
            frame[1]
        )));
    }
    Ok(())
}

fn kelvin_to_celsius(raw: u16) -> f32 {
    f32::from(raw) / 10.0 - KELVIN_OFFSET
}

fn celsius_to_kelvin(celsius: f32) -> u16 {
    ((celsius + KELVIN_OFFSET) * 10.0).round() as u16
}

/// Reply to command 0x03.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralInfo {
    /// V
    pub voltage: f32,
    /// A, positive while charging
    pub current: f32,
    /// Ah
    pub capacity_remain: f32,
    /// Ah
    pub capacity: f32,
    pub cycles: u16,
    /// packed as `(year - 2000) << 9 | month << 5 | day`
    pub production: u16,
    pub balance_low: u16,
    pub balance_high: u16,
    pub protection_bits: u16,
    /// major in the high nibble, minor in the low nibble
    pub version: u8,
    pub soc: u8,
    /// bit 0 charge, bit 1 discharge
    pub fet: u8,
    pub cell_count: u8,
    /// °C
    pub temperatures: Vec<f32>,
}

impl GeneralInfo {
    pub fn request() -> Vec<u8> {
        read_request(CMD_GENERAL_INFO)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let payload = validate_response(frame)?;
        expect_command(frame, CMD_GENERAL_INFO)?;
        require_len(payload, GENERAL_INFO_FIXED_LEN)?;

        let word = |i: usize| u16::from_be_bytes([payload[i], payload[i + 1]]);

        let cell_count = payload[21];
        if cell_count == 0 || cell_count > MAX_CELL_COUNT {
            return Err(Error::Framing(format!("implausible cell count {cell_count}")));
        }
        let sensors = usize::from(payload[22]);
        require_len(payload, GENERAL_INFO_FIXED_LEN + 2 * sensors)?;

        Ok(Self {
            voltage: f32::from(word(0)) / 100.0,
            current: f32::from(word(2) as i16) / 100.0,
            capacity_remain: f32::from(word(4)) / 100.0,
            capacity: f32::from(word(6)) / 100.0,
            cycles: word(8),
            production: word(10),
            balance_low: word(12),
            balance_high: word(14),
            protection_bits: word(16),
            version: payload[18],
            soc: payload[19],
            fet: payload[20],
            cell_count,
            temperatures: (0..sensors)
                .map(|t| kelvin_to_celsius(word(GENERAL_INFO_FIXED_LEN + 2 * t)))
                .collect(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(GENERAL_INFO_FIXED_LEN + 2 * self.temperatures.len());
        payload.extend_from_slice(&((self.voltage * 100.0).round() as u16).to_be_bytes());
        payload.extend_from_slice(&((self.current * 100.0).round() as i16).to_be_bytes());
        payload.extend_from_slice(&((self.capacity_remain * 100.0).round() as u16).to_be_bytes());
        payload.extend_from_slice(&((self.capacity * 100.0).round() as u16).to_be_bytes());
        for word in [
            self.cycles,
            self.production,
            self.balance_low,
            self.balance_high,
            self.protection_bits,
        ] {
            payload.extend_from_slice(&word.to_be_bytes());
        }
        payload.extend_from_slice(&[
            self.version,
            self.soc,
            self.fet,
            self.cell_count,
            self.temperatures.len() as u8,
        ]);
        for temperature in &self.temperatures {
            payload.extend_from_slice(&celsius_to_kelvin(*temperature).to_be_bytes());
        }
        encode_response(CMD_GENERAL_INFO, 0x00, &payload)
    }

    pub fn charge_fet(&self) -> bool {
        read_bit!(self.fet, 0)
    }

    pub fn discharge_fet(&self) -> bool {
        read_bit!(self.fet, 1)
    }

    /// One flag per cell; cells above 16 come from the second word.
    pub fn balancing(&self) -> Vec<bool> {
        (0..usize::from(self.cell_count))
            .map(|i| {
                if i < 16 {
                    read_bit!(self.balance_low, i)
                } else {
                    read_bit!(self.balance_high, i - 16)
                }
            })
            .collect()
    }

    pub fn firmware_version(&self) -> String {
        format!("{}.{}", self.version >> 4, self.version & 0x0f)
    }

    pub fn manufacture_date(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}",
            2000 + u32::from(self.production >> 9),
            (self.production >> 5) & 0x0f,
            self.production & 0x1f
        )
    }

    pub fn protection(&self, config: &BatteryConfig) -> Protection {
        let bits = self.protection_bits;
        Protection {
            voltage_high: Severity::alarm_if(read_bit!(bits, 2)),
            voltage_low: Severity::alarm_if(read_bit!(bits, 3)),
            temp_high_charge: Severity::warning_if(read_bit!(bits, 4)),
            temp_low_charge: Severity::warning_if(read_bit!(bits, 5)),
            temp_high_discharge: Severity::warning_if(read_bit!(bits, 6)),
            temp_low_discharge: Severity::warning_if(read_bit!(bits, 7)),
            current_over: Severity::warning_if(read_bit!(bits, 8)),
            current_under: Severity::warning_if(read_bit!(bits, 9)),
            // cell overvoltage or undervoltage
            cell_imbalance: Severity::alarm_if(read_bit!(bits, 0) || read_bit!(bits, 1)),
            // short circuit, front-end IC error, software lock
            internal_failure: Severity::alarm_if(
                read_bit!(bits, 10) || read_bit!(bits, 11) || read_bit!(bits, 12),
            ),
            soc_low: Protection::classify_soc(f32::from(self.soc), config),
        }
    }
}

/// Reply to command 0x04.
pub struct CellVoltages;

impl CellVoltages {
    pub fn request() -> Vec<u8> {
        read_request(CMD_CELL_VOLTAGES)
    }

    pub fn decode(frame: &[u8]) -> Result<Vec<f32>> {
        let payload = validate_response(frame)?;
        expect_command(frame, CMD_CELL_VOLTAGES)?;
        if payload.is_empty() || payload.len() % 2 != 0 {
            return Err(Error::Framing(format!(
                "invalid cell voltage payload length {}",
                payload.len()
            )));
        }
        if payload.len() / 2 > usize::from(MAX_CELL_COUNT) {
            return Err(Error::Framing(format!(
                "implausible cell count {}",
                payload.len() / 2
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .enumerate()
            .map(|(n_cell, bytes)| {
                let volt = f32::from(u16::from_be_bytes([bytes[0], bytes[1]])) / 1000.0;
                log::trace!("Cell #{} volt={}", n_cell + 1, volt);
                volt
            })
            .collect())
    }

    pub fn encode(voltages: &[f32]) -> Vec<u8> {
        let payload: Vec<u8> = voltages
            .iter()
            .flat_map(|v| ((v * 1000.0).round() as u16).to_be_bytes())
            .collect();
        encode_response(CMD_CELL_VOLTAGES, 0x00, &payload)
    }
}

/// Reply to command 0x05, an ASCII model string.
pub struct HardwareVersion;

impl HardwareVersion {
    pub fn request() -> Vec<u8> {
        read_request(CMD_HARDWARE_VERSION)
    }

    pub fn decode(frame: &[u8]) -> Result<String> {
        let payload = validate_response(frame)?;
        expect_command(frame, CMD_HARDWARE_VERSION)?;
        Ok(String::from_utf8_lossy(payload)
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }

    pub fn encode(model: &str) -> Vec<u8> {
        encode_response(CMD_HARDWARE_VERSION, 0x00, model.as_bytes())
    }
}

/// Clears the BMS bluetooth password; the BMS answers with an empty response.
pub struct ClearPassword;

impl ClearPassword {
    pub fn request(password: &str) -> Result<Vec<u8>> {
        write_request(CMD_CLEAR_PASSWORD, password.as_bytes())
    }
}

#[derive(Debug, Default)]
pub struct JbdAssembler {
    state: AssemblyState,
}

impl JbdAssembler {
    fn header_command(fragment: &[u8]) -> Option<u8> {
        if fragment.len() >= HEADER_LEN
            && fragment[0] == START_BYTE
            && KNOWN_COMMANDS.contains(&fragment[1])
        {
            Some(fragment[1])
        } else {
            None
        }
    }

    pub fn state(&self) -> &AssemblyState {
        &self.state
    }
}

impl FrameAssembler for JbdAssembler {
    fn push(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        if let Some(command) = Self::header_command(fragment) {
            let expected = HEADER_LEN + usize::from(fragment[3]) + FOOTER_LEN;
            return self.state.start(Some(command), expected, fragment);
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
pub enum JbdUpdate {
    GeneralInfo(GeneralInfo),
    CellVoltages(Vec<f32>),
    HardwareVersion(String),
}

pub struct JbdProtocol {
    config: BatteryConfig,
    assembler: JbdAssembler,
    expected_cell_count: Option<u8>,
}

impl JbdProtocol {
    pub const BATTERY_TYPE: &'static str = "JBD BT";

    pub fn new(config: BatteryConfig) -> Self {
        Self {
            config,
            assembler: JbdAssembler::default(),
            expected_cell_count: None,
        }
    }

    pub fn with_expected_cell_count(mut self, cell_count: Option<u8>) -> Self {
        self.expected_cell_count = cell_count;
        self
    }
}

impl BmsProtocol for JbdProtocol {
    type Update = JbdUpdate;

    fn battery_type(&self) -> &'static str {
        Self::BATTERY_TYPE
    }

    fn gatt_profile(&self) -> GattProfile {
        GattProfile {
            service: 0xff00,
            notify_characteristic: 0xff01,
            write_characteristic: 0xff02,
        }
    }

    fn reset(&mut self) {
        self.assembler.reset();
    }

    fn connect_requests(&self) -> Vec<Request> {
        vec![Request::new(HardwareVersion::request(), Expect::Info)]
    }

    fn poll_requests(&self) -> Vec<Request> {
        vec![
            Request::new(
                GeneralInfo::request(),
                Expect::Data(DataClass::GeneralInfo),
            ),
            Request::new(CellVoltages::request(), Expect::Data(DataClass::CellData)),
        ]
    }

    fn on_fragment(&mut self, fragment: &[u8]) -> Result<Option<JbdUpdate>> {
        let Some(frame) = self.assembler.push(fragment) else {
            return Ok(None);
        };
        log::trace!("Frame complete: {frame:02X?}");
        let update = match frame[1] {
            CMD_GENERAL_INFO => JbdUpdate::GeneralInfo(GeneralInfo::decode(&frame)?),
            CMD_CELL_VOLTAGES => JbdUpdate::CellVoltages(CellVoltages::decode(&frame)?),
            CMD_HARDWARE_VERSION => JbdUpdate::HardwareVersion(HardwareVersion::decode(&frame)?),
            other => {
                return Err(Error::Framing(format!("unexpected command {other:02X}")));
            }
        };
        Ok(Some(update))
    }

    fn reply(update: &JbdUpdate) -> Reply {
        match update {
            JbdUpdate::GeneralInfo(_) => Reply::Refreshed(&[DataClass::GeneralInfo]),
            JbdUpdate::CellVoltages(_) => Reply::Refreshed(&[DataClass::CellData]),
            JbdUpdate::HardwareVersion(_) => Reply::Info,
        }
    }

    fn apply(&self, update: JbdUpdate, snapshot: &mut BatterySnapshot) -> Result<()> {
        match update {
            JbdUpdate::GeneralInfo(info) => {
                if let Some(expected) = self.expected_cell_count {
                    if info.cell_count != expected {
                        return Err(Error::Configuration(format!(
                            "expected {expected} cells, BMS reports {}",
                            info.cell_count
                        )));
                    }
                }
                snapshot.voltage = info.voltage;
                snapshot.current = info.current;
                snapshot.capacity_remain = info.capacity_remain;
                snapshot.capacity = info.capacity;
                snapshot.cycles = u32::from(info.cycles);
                snapshot.soc = f32::from(info.soc);
                snapshot.charge_fet = info.charge_fet();
                snapshot.discharge_fet = info.discharge_fet();
                snapshot.protection = info.protection(&self.config);
                snapshot.firmware_version = Some(info.firmware_version());
                snapshot.manufacture_date = Some(info.manufacture_date());
                snapshot.set_cells(info.cell_count, info.balancing());
                snapshot.temperatures = info.temperatures;
                snapshot.apply_limits(&self.config);
            }
            JbdUpdate::CellVoltages(voltages) => {
                let cell_count = usize::from(snapshot.cell_count);
                if cell_count > 0 && voltages.len() < cell_count {
                    return Err(Error::ShortFrame {
                        declared: cell_count * 2,
                        available: voltages.len() * 2,
                    });
                }
                if cell_count == 0 {
                    // no general info yet, the frame itself tells the cell count
                    let count = u8::try_from(voltages.len()).map_err(|_| {
                        Error::Framing(format!("implausible cell count {}", voltages.len()))
                    })?;
                    snapshot.set_cells(count, std::iter::empty());
                    snapshot.apply_limits(&self.config);
                }
                for (cell, voltage) in snapshot.cells.iter_mut().zip(voltages) {
                    cell.voltage = Some(voltage);
                }
            }
            JbdUpdate::HardwareVersion(model) => snapshot.model = Some(model),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// General info payload: 52.00 V, -1.50 A, 14 cells, two sensors.
    fn general_payload() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&5200u16.to_be_bytes());
        payload.extend_from_slice(&(-150i16).to_be_bytes());
        payload.extend_from_slice(&8000u16.to_be_bytes()); // 80.00 Ah remaining
        payload.extend_from_slice(&10000u16.to_be_bytes()); // 100.00 Ah
        payload.extend_from_slice(&42u16.to_be_bytes());
        payload.extend_from_slice(&((23u16 << 9) | (4 << 5) | 15).to_be_bytes());
        payload.extend_from_slice(&0b0000_0000_0000_0101u16.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&[0x21, 80, 0b11, 14, 2]);
        payload.extend_from_slice(&2981u16.to_be_bytes());
        payload.extend_from_slice(&2731u16.to_be_bytes());
        payload
    }

    fn general_frame() -> Vec<u8> {
        encode_response(CMD_GENERAL_INFO, 0, &general_payload())
    }

    #[test]
    fn requests_match_bms_documentation() {
        assert_eq!(
            GeneralInfo::request(),
            vec![0xdd, 0xa5, 0x03, 0x00, 0xff, 0xfd, 0x77]
        );
        assert_eq!(
            CellVoltages::request(),
            vec![0xdd, 0xa5, 0x04, 0x00, 0xff, 0xfc, 0x77]
        );
        assert_eq!(
            HardwareVersion::request(),
            vec![0xdd, 0xa5, 0x05, 0x00, 0xff, 0xfb, 0x77]
        );
    }

    #[test]
    fn clear_password_request() {
        assert_eq!(
            ClearPassword::request("J1B2D4").unwrap(),
            vec![0xdd, 0x5a, 0x09, 0x06, 0x4a, 0x31, 0x42, 0x32, 0x44, 0x34, 0xfe, 0x8a, 0x77]
        );
    }

    #[test]
    fn decode_general_info() {
        let info = GeneralInfo::decode(&general_frame()).unwrap();
        assert_eq!(info.voltage, 52.0);
        assert_eq!(info.current, -1.5);
        assert_eq!(info.capacity_remain, 80.0);
        assert_eq!(info.capacity, 100.0);
        assert_eq!(info.cycles, 42);
        assert_eq!(info.cell_count, 14);
        assert_eq!(info.soc, 80);
        assert!(info.charge_fet());
        assert!(info.discharge_fet());
        assert_eq!(info.firmware_version(), "2.1");
        assert_eq!(info.manufacture_date(), "2023-04-15");
        assert_eq!(info.temperatures.len(), 2);
        assert!((info.temperatures[0] - 24.95).abs() < 1e-3);
        assert!((info.temperatures[1] + 0.05).abs() < 1e-3);

        let balancing = info.balancing();
        assert_eq!(balancing.len(), 14);
        assert!(balancing[0]);
        assert!(!balancing[1]);
        assert!(balancing[2]);
    }

    #[test]
    fn general_info_reencodes_to_same_frame() {
        let frame = general_frame();
        let info = GeneralInfo::decode(&frame).unwrap();
        assert_eq!(info.encode(), frame);
        assert_eq!(GeneralInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn applies_general_info_with_limits() {
        let config = BatteryConfig::default();
        let protocol = JbdProtocol::new(config.clone());
        let info = GeneralInfo::decode(&general_frame()).unwrap();
        let mut snapshot = BatterySnapshot::default();
        protocol
            .apply(JbdUpdate::GeneralInfo(info), &mut snapshot)
            .unwrap();
        assert_eq!(snapshot.voltage, 52.0);
        assert_eq!(snapshot.current, -1.5);
        assert_eq!(snapshot.cell_count, 14);
        assert_eq!(snapshot.cells.len(), 14);
        assert_eq!(snapshot.max_battery_voltage, 14.0 * config.max_cell_voltage);
        assert_eq!(snapshot.min_battery_voltage, 14.0 * config.min_cell_voltage);
        assert_eq!(snapshot.max_battery_charge_current, 50.0);
        assert_eq!(snapshot.firmware_version.as_deref(), Some("2.1"));
    }

    #[test]
    fn balance_uses_second_word_above_16_cells() {
        let info = GeneralInfo {
            voltage: 66.0,
            current: 0.0,
            capacity_remain: 0.0,
            capacity: 0.0,
            cycles: 0,
            production: 0,
            balance_low: 0x8000,
            balance_high: 0b10,
            protection_bits: 0,
            version: 0,
            soc: 50,
            fet: 0,
            cell_count: 20,
            temperatures: vec![],
        };
        let balancing = info.balancing();
        assert_eq!(balancing.len(), 20);
        let active: Vec<usize> = balancing
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
            .collect();
        assert_eq!(active, vec![15, 17]);
        assert!(!info.charge_fet());
    }

    #[test]
    fn protection_bits_classified() {
        let mut info = GeneralInfo::decode(&general_frame()).unwrap();
        info.protection_bits = (1 << 2) | (1 << 4) | (1 << 9) | (1 << 1) | (1 << 12);
        info.soc = 15;
        let protection = info.protection(&BatteryConfig::default());
        assert_eq!(protection.voltage_high, Severity::Alarm);
        assert_eq!(protection.voltage_low, Severity::Ok);
        assert_eq!(protection.temp_high_charge, Severity::Warning);
        assert_eq!(protection.current_under, Severity::Warning);
        assert_eq!(protection.current_over, Severity::Ok);
        assert_eq!(protection.cell_imbalance, Severity::Alarm);
        assert_eq!(protection.internal_failure, Severity::Alarm);
        assert_eq!(protection.soc_low, Severity::Warning);
    }

    #[test]
    fn checksum_mismatch_is_integrity_error() {
        let mut frame = general_frame();
        frame[5] ^= 0x01;
        assert!(matches!(
            GeneralInfo::decode(&frame),
            Err(Error::Integrity { .. })
        ));

        let mut protocol = JbdProtocol::new(BatteryConfig::default());
        assert!(matches!(
            protocol.on_fragment(&frame),
            Err(Error::Integrity { .. })
        ));
    }

    #[test]
    fn truncated_frame_is_short_frame_error() {
        let frame = general_frame();
        assert!(matches!(
            GeneralInfo::decode(&frame[..20]),
            Err(Error::ShortFrame { .. })
        ));
        assert!(matches!(
            GeneralInfo::decode(&frame[..3]),
            Err(Error::ShortFrame { .. })
        ));
    }

    #[test]
    fn rejected_status_is_framing_error() {
        let frame = encode_response(CMD_GENERAL_INFO, 0x80, &[]);
        assert!(matches!(GeneralInfo::decode(&frame), Err(Error::Framing(_))));
    }

    #[test]
    fn implausible_cell_count_rejected() {
        let mut payload = general_payload();
        payload[21] = 40;
        let frame = encode_response(CMD_GENERAL_INFO, 0, &payload);
        assert!(matches!(GeneralInfo::decode(&frame), Err(Error::Framing(_))));
    }

    #[test]
    fn cell_voltages_roundtrip() {
        let frame = CellVoltages::encode(&[3.301, 3.305, 3.299]);
        assert_eq!(CellVoltages::decode(&frame).unwrap(), vec![3.301, 3.305, 3.299]);
        assert_eq!(CellVoltages::encode(&CellVoltages::decode(&frame).unwrap()), frame);
    }

    #[test]
    fn hardware_version() {
        let frame = HardwareVersion::encode("SP04S034-L4S-100A\0");
        assert_eq!(HardwareVersion::decode(&frame).unwrap(), "SP04S034-L4S-100A");
    }

    #[test]
    fn assembles_fragments() {
        let frame = general_frame();
        let mut assembler = JbdAssembler::default();
        let mut emitted = Vec::new();
        for fragment in frame.chunks(20) {
            if let Some(f) = assembler.push(fragment) {
                emitted.push(f);
            }
        }
        assert_eq!(emitted, vec![frame]);
        assert!(assembler.state().is_idle());
    }

    #[test]
    fn discards_misaligned_fragment() {
        let mut assembler = JbdAssembler::default();
        assert_eq!(assembler.push(&[0x01, 0x02, 0x77]), None);
        assert!(assembler.state().is_idle());
    }

    #[test]
    fn new_header_abandons_partial_frame() {
        let general = general_frame();
        let cells = CellVoltages::encode(&[3.3; 4]);
        let mut assembler = JbdAssembler::default();
        assert_eq!(assembler.push(&general[..20]), None);
        assert_eq!(assembler.state().active_command(), Some(CMD_GENERAL_INFO));
        assert_eq!(assembler.push(&cells), Some(cells.clone()));
        // the rest of the abandoned frame is misaligned now
        assert_eq!(assembler.push(&general[20..]), None);
        assert!(assembler.state().is_idle());
    }

    #[test]
    fn cell_voltages_need_full_cell_count() {
        let protocol = JbdProtocol::new(BatteryConfig::default());
        let mut snapshot = BatterySnapshot::default();
        snapshot.set_cells(4, std::iter::empty());
        let err = protocol
            .apply(JbdUpdate::CellVoltages(vec![3.3, 3.3]), &mut snapshot)
            .unwrap_err();
        assert!(matches!(err, Error::ShortFrame { .. }));
        assert!(snapshot.cells.iter().all(|c| c.voltage.is_none()));

        protocol
            .apply(JbdUpdate::CellVoltages(vec![3.3, 3.31, 3.32, 3.33]), &mut snapshot)
            .unwrap();
        assert_eq!(snapshot.cells[3].voltage, Some(3.33));
    }

    #[test]
    fn cell_voltages_before_general_info_set_cell_count() {
        let protocol = JbdProtocol::new(BatteryConfig::default());
        let mut snapshot = BatterySnapshot::default();
        protocol
            .apply(JbdUpdate::CellVoltages(vec![3.3, 3.4]), &mut snapshot)
            .unwrap();
        assert_eq!(snapshot.cell_count, 2);
        assert_eq!(snapshot.cell_voltages(), vec![Some(3.3), Some(3.4)]);
    }

    #[test]
    fn unexpected_cell_count_rejected() {
        let protocol =
            JbdProtocol::new(BatteryConfig::default()).with_expected_cell_count(Some(16));
        let info = GeneralInfo::decode(&general_frame()).unwrap();
        let mut snapshot = BatterySnapshot::default();
        assert!(matches!(
            protocol.apply(JbdUpdate::GeneralInfo(info), &mut snapshot),
            Err(Error::Configuration(_))
        ));
        assert_eq!(snapshot, BatterySnapshot::default());
    }

    #[test]
    fn protocol_decodes_fragment_stream() {
        let mut protocol = JbdProtocol::new(BatteryConfig::default());
        let frame = CellVoltages::encode(&[3.3; 16]);
        let mut updates = Vec::new();
        for fragment in frame.chunks(20) {
            if let Some(update) = protocol.on_fragment(fragment).unwrap() {
                updates.push(update);
            }
        }
        assert_eq!(updates, vec![JbdUpdate::CellVoltages(vec![3.3; 16])]);
        assert_eq!(
            JbdProtocol::reply(&updates[0]),
            Reply::Refreshed(&[DataClass::CellData])
        );
    }
}
