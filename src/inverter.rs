//! Inverter-facing slave protocol: request frame synchronization, the
//! register map and reply encoding.
//!
//! Requests are fixed 8-byte frames:
//!
//! ```text
//! <slave id> <command> <addr hi> <addr lo> <len hi> <len lo> <crc lo> <crc hi>
//! ```
//!
//! Replies echo the slave id and command, carry the payload length in
//! 16-bit words and close with the same CRC, low byte first.

use crate::adapter::DataAdapter;
use crate::crc::crc16;
use crate::error::Error;

/// Every request on the inverter bus is exactly this long.
pub const REQUEST_FRAME_SIZE: usize = 8;
/// Slave id this device answers to unless configured otherwise.
pub const DEFAULT_SLAVE_ID: u8 = 0x01;
/// Register read request.
pub const COMMAND_READ: u8 = 0x03;
/// Register write request. Accepted but not acted upon.
pub const COMMAND_WRITE: u8 = 0x10;
/// Flag added to the command byte of an error reply.
const COMMAND_ERROR_FLAG: u8 = 0x80;
/// Bus noise tolerated per pump before yielding back to the caller.
const MAX_BYTES_PER_PUMP: usize = 15;

/// Byte-at-a-time synchronizer recovering 8-byte request frames from a
/// shared RS-485 bus. Alignment is keyed on the slave id; bytes seen
/// while idle that do not match it are discarded as noise.
#[derive(Debug)]
pub struct FrameSync {
    buffer: [u8; REQUEST_FRAME_SIZE],
    index: usize,
    slave_id: u8,
}

impl FrameSync {
    pub fn new(slave_id: u8) -> Self {
        Self {
            buffer: [0; REQUEST_FRAME_SIZE],
            index: 0,
            slave_id,
        }
    }

    /// Feeds bytes from `rx` into the window. Returns true as soon as a
    /// frame completes, leaving unread bytes in `rx`; returns false when
    /// `rx` runs dry or too much noise was discarded in one call.
    pub fn pump<I: Iterator<Item = u8>>(&mut self, rx: &mut I) -> bool {
        let mut iterations = 0usize;
        for byte in rx {
            iterations += 1;
            if self.index == REQUEST_FRAME_SIZE {
                self.slide();
            }
            if self.index == 0 && byte != self.slave_id {
                if iterations > MAX_BYTES_PER_PUMP {
                    return false;
                }
                continue;
            }
            self.buffer[self.index] = byte;
            self.index += 1;
            if self.index == REQUEST_FRAME_SIZE {
                return true;
            }
        }
        false
    }

    /// The completed frame, if one is buffered.
    pub fn frame(&self) -> Option<&[u8; REQUEST_FRAME_SIZE]> {
        (self.index == REQUEST_FRAME_SIZE).then_some(&self.buffer)
    }

    /// Drops the buffered frame so the next pump starts a fresh window.
    pub fn reset(&mut self) {
        self.index = 0;
    }

    // A full window that was never consumed re-aligns on the next slave
    // id candidate inside it instead of losing a frame that started
    // mid-window.
    fn slide(&mut self) {
        match self.buffer[1..].iter().position(|b| *b == self.slave_id) {
            Some(found) => {
                let start = found + 1;
                self.buffer.copy_within(start.., 0);
                self.index = REQUEST_FRAME_SIZE - start;
            }
            None => self.index = 0,
        }
    }
}

/// Registers a request frame can address. Indexed variants carry the
/// 1-based cell or sensor number already decoded from the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    ProtocolType,
    ProtocolVersion,
    BmsFirmwareVersion,
    BmsHardwareVersion,
    NumberOfCells,
    CellVoltage(u16),
    NumberOfTemperatureSensors,
    TemperatureOfSensor(u16),
    ModuleChargeCurrent,
    ModuleDischargeCurrent,
    ModuleVoltage,
    StateOfCharge,
    ModuleTotalCapacity,
    NumberOfCellsForWarningInfo,
    CellPairVoltageState(u16),
    NumberOfTemperatureSensorsForWarningInfo,
    TemperatureSensorPairState(u16),
    ModuleChargeVoltageState,
    ModuleDischargeVoltageState,
    CellChargeVoltageState,
    CellDischargeVoltageState,
    ModuleChargeCurrentState,
    ModuleDischargeCurrentState,
    ModuleChargeTemperatureState,
    ModuleDischargeTemperatureState,
    CellChargeTemperatureState,
    CellDischargeTemperatureState,
    ChargeVoltageLimit,
    DischargeVoltageLimit,
    ChargeCurrentLimit,
    DischargeCurrentLimit,
    ChargeDischargeStatus,
    RuntimeToEmpty,
}

impl Register {
    /// Maps a register address to its handler. Indexed registers repeat
    /// across pages, 20 cells and 10 sensors per page, with the page in
    /// the high address byte.
    pub fn lookup(address: u16) -> Option<Self> {
        let register = match address {
            0x0001 => Self::ProtocolType,
            0x0002 => Self::ProtocolVersion,
            0x0003 => Self::BmsFirmwareVersion,
            0x0005 => Self::BmsHardwareVersion,
            0x0010 => Self::NumberOfCells,
            0x0025 => Self::NumberOfTemperatureSensors,
            0x0030 => Self::ModuleChargeCurrent,
            0x0031 => Self::ModuleDischargeCurrent,
            0x0032 => Self::ModuleVoltage,
            0x0033 => Self::StateOfCharge,
            0x0034 => Self::ModuleTotalCapacity,
            0x0040 => Self::NumberOfCellsForWarningInfo,
            0x0050 => Self::NumberOfTemperatureSensorsForWarningInfo,
            0x0060 => Self::ModuleChargeVoltageState,
            0x0061 => Self::ModuleDischargeVoltageState,
            0x0062 => Self::CellChargeVoltageState,
            0x0063 => Self::CellDischargeVoltageState,
            0x0064 => Self::ModuleChargeCurrentState,
            0x0065 => Self::ModuleDischargeCurrentState,
            0x0066 => Self::ModuleChargeTemperatureState,
            0x0067 => Self::ModuleDischargeTemperatureState,
            0x0068 => Self::CellChargeTemperatureState,
            0x0069 => Self::CellDischargeTemperatureState,
            0x0070 => Self::ChargeVoltageLimit,
            0x0071 => Self::DischargeVoltageLimit,
            0x0072 => Self::ChargeCurrentLimit,
            0x0073 => Self::DischargeCurrentLimit,
            0x0074 => Self::ChargeDischargeStatus,
            0x0075 => Self::RuntimeToEmpty,
            _ => {
                let page = address >> 8;
                let low = address & 0x00FF;
                if page > 0x000F {
                    return None;
                }
                return match low {
                    0x11..=0x24 => Some(Self::CellVoltage(page * 20 + (low - 0x10))),
                    0x26..=0x2F => Some(Self::TemperatureOfSensor(page * 10 + (low - 0x25))),
                    // Pair-state registers only exist at odd indices
                    0x41..=0x4A => {
                        Some(Self::CellPairVoltageState(page * 20 + (low - 0x40) * 2 - 1))
                    }
                    0x51..=0x55 => Some(Self::TemperatureSensorPairState(
                        page * 10 + (low - 0x50) * 2 - 1,
                    )),
                    _ => None,
                };
            }
        };
        Some(register)
    }

    fn payload_len(self) -> usize {
        match self {
            Self::BmsFirmwareVersion | Self::BmsHardwareVersion | Self::ModuleTotalCapacity => 4,
            _ => 2,
        }
    }

    /// Builds the reply frame for this register from the adapter.
    fn respond(self, slave_id: u8, adapter: &dyn DataAdapter) -> Vec<u8> {
        // Protocol identity is answered even without battery data so the
        // inverter can keep probing the bus; everything else degrades to
        // a zeroed payload of the right width.
        let identity = matches!(self, Self::ProtocolType | Self::ProtocolVersion);
        if !identity && !adapter.has_data() {
            return read_reply(slave_id, &vec![0x00; self.payload_len()]);
        }
        match self {
            Self::ProtocolType | Self::ProtocolVersion => read_reply(slave_id, &[0x00, 0x00]),
            Self::BmsFirmwareVersion => read_reply(slave_id, &adapter.bms_firmware_version()),
            Self::BmsHardwareVersion => read_reply(slave_id, &adapter.bms_hardware_version()),
            Self::NumberOfCells => read_reply(slave_id, &adapter.number_of_cells()),
            Self::CellVoltage(n) => read_reply(slave_id, &adapter.cell_voltage(n)),
            Self::NumberOfTemperatureSensors => {
                read_reply(slave_id, &adapter.number_of_temperature_sensors())
            }
            Self::TemperatureOfSensor(n) => {
                read_reply(slave_id, &adapter.temperature_of_sensor(n))
            }
            Self::ModuleChargeCurrent => read_reply(slave_id, &adapter.module_charge_current()),
            Self::ModuleDischargeCurrent => {
                read_reply(slave_id, &adapter.module_discharge_current())
            }
            Self::ModuleVoltage => read_reply(slave_id, &adapter.module_voltage()),
            Self::StateOfCharge => read_reply(slave_id, &adapter.state_of_charge()),
            Self::ModuleTotalCapacity => read_reply(slave_id, &adapter.module_total_capacity()),
            Self::NumberOfCellsForWarningInfo => {
                read_reply(slave_id, &adapter.number_of_cells_for_warning_info())
            }
            Self::CellPairVoltageState(n) => {
                read_reply(slave_id, &adapter.cell_pair_voltage_state(n))
            }
            Self::NumberOfTemperatureSensorsForWarningInfo => read_reply(
                slave_id,
                &adapter.number_of_temperature_sensors_for_warning_info(),
            ),
            Self::TemperatureSensorPairState(n) => {
                read_reply(slave_id, &adapter.temperature_sensor_pair_state(n))
            }
            Self::ModuleChargeVoltageState => {
                read_reply(slave_id, &adapter.module_charge_voltage_state())
            }
            Self::ModuleDischargeVoltageState => {
                read_reply(slave_id, &adapter.module_discharge_voltage_state())
            }
            Self::CellChargeVoltageState => {
                read_reply(slave_id, &adapter.cell_charge_voltage_state())
            }
            Self::CellDischargeVoltageState => {
                read_reply(slave_id, &adapter.cell_discharge_voltage_state())
            }
            Self::ModuleChargeCurrentState => {
                read_reply(slave_id, &adapter.module_charge_current_state())
            }
            Self::ModuleDischargeCurrentState => {
                read_reply(slave_id, &adapter.module_discharge_current_state())
            }
            Self::ModuleChargeTemperatureState => {
                read_reply(slave_id, &adapter.module_charge_temperature_state())
            }
            Self::ModuleDischargeTemperatureState => {
                read_reply(slave_id, &adapter.module_discharge_temperature_state())
            }
            Self::CellChargeTemperatureState => {
                read_reply(slave_id, &adapter.cell_charge_temperature_state())
            }
            Self::CellDischargeTemperatureState => {
                read_reply(slave_id, &adapter.cell_discharge_temperature_state())
            }
            Self::ChargeVoltageLimit => read_reply(slave_id, &adapter.charge_voltage_limit()),
            Self::DischargeVoltageLimit => {
                read_reply(slave_id, &adapter.discharge_voltage_limit())
            }
            Self::ChargeCurrentLimit => read_reply(slave_id, &adapter.charge_current_limit()),
            Self::DischargeCurrentLimit => {
                read_reply(slave_id, &adapter.discharge_current_limit())
            }
            Self::ChargeDischargeStatus => {
                read_reply(slave_id, &adapter.charge_discharge_status())
            }
            Self::RuntimeToEmpty => read_reply(slave_id, &adapter.runtime_to_empty()),
        }
    }
}

/// Encodes a read reply carrying `payload`, CRC appended low byte first.
fn read_reply(slave_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(payload.len() + 6);
    reply.push(slave_id);
    reply.push(COMMAND_READ);
    // payload length in 16-bit words
    reply.push(0x00);
    reply.push((payload.len() / 2) as u8);
    reply.extend_from_slice(payload);
    let crc = crc16(&reply);
    reply.push(crc as u8);
    reply.push((crc >> 8) as u8);
    reply
}

/// Short error reply announcing a CRC failure on the request.
fn invalid_crc_reply(slave_id: u8) -> Vec<u8> {
    let mut reply = vec![slave_id, COMMAND_READ | COMMAND_ERROR_FLAG, 0x03];
    let crc = crc16(&reply);
    reply.push(crc as u8);
    reply.push((crc >> 8) as u8);
    reply
}

/// Validates and dispatches one request frame. Returns the reply to put
/// on the wire, or `None` when the frame must be dropped silently
/// (unknown address, write request, unknown command).
pub fn handle_frame(
    frame: &[u8; REQUEST_FRAME_SIZE],
    slave_id: u8,
    adapter: &dyn DataAdapter,
) -> Option<Vec<u8>> {
    let calculated = crc16(&frame[..6]);
    let received = u16::from_le_bytes([frame[6], frame[7]]);
    if calculated != received {
        log::warn!(
            "Dropping request payload: {}",
            Error::CrcMismatch {
                calculated,
                received
            }
        );
        return Some(invalid_crc_reply(slave_id));
    }

    let address = u16::from_be_bytes([frame[2], frame[3]]);
    match frame[1] {
        COMMAND_READ => match Register::lookup(address) {
            Some(register) => Some(register.respond(slave_id, adapter)),
            None => {
                log::debug!("Dropping read request: {}", Error::UnsupportedAddress(address));
                None
            }
        },
        COMMAND_WRITE => {
            log::debug!("Write request for address {address:#06X} ignored");
            None
        }
        command => {
            log::warn!("Unknown command {command:#04X} for address {address:#06X}, dropping");
            None
        }
    }
}
