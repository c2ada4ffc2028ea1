//! Vendor serial protocol of the battery: status request framing and the
//! decoder turning a raw status payload into a [`Snapshot`].
//!
//! A status response is framed as
//!
//! ```text
//! 4E 57 <len:u16> <terminal:u32> <type> <result> <transport> <payload...>
//! <record:u32> 68 <checksum:u32>
//! ```
//!
//! where `len` counts every byte after the length field itself and the
//! checksum is the plain 32-bit sum of all preceding bytes. The payload is
//! a tag-prefixed register dump; field positions are fixed relative to the
//! end of the variable-length cell voltage block.

use crate::error::Error;
use crate::snapshot::{self, Snapshot, MAX_CELLS, MAX_TEMPERATURE_SENSORS};

/// First two bytes of every frame on the battery bus.
pub const FRAME_MARKER: [u8; 2] = [0x4E, 0x57];

/// Fixed "read all registers" request, checksum included.
pub const STATUS_REQUEST: [u8; 21] = [
    0x4E, 0x57, 0x00, 0x13, 0x00, 0x00, 0x00, 0x00, 0x06, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x68, 0x00, 0x00, 0x01, 0x29,
];

/// Bytes between the frame marker and the register payload.
pub const RESPONSE_HEADER_LEN: usize = 11;
/// Record number, end byte and checksum trailing the register payload.
pub const RESPONSE_TRAILER_LEN: usize = 9;

/// Validates the additive checksum of a complete status frame and returns
/// the register payload inside it.
pub fn strip_status_frame(frame: &[u8]) -> Result<&[u8], Error> {
    if frame.len() < RESPONSE_HEADER_LEN + RESPONSE_TRAILER_LEN {
        return Err(Error::PayloadTooShort {
            got: frame.len(),
            need: RESPONSE_HEADER_LEN + RESPONSE_TRAILER_LEN,
        });
    }
    if frame[0..2] != FRAME_MARKER {
        return Err(Error::BadFrameMarker([frame[0], frame[1]]));
    }

    let checksum_at = frame.len() - 4;
    let received = u32::from_be_bytes([
        frame[checksum_at],
        frame[checksum_at + 1],
        frame[checksum_at + 2],
        frame[checksum_at + 3],
    ]);
    let calculated = frame[..checksum_at].iter().map(|b| *b as u32).sum::<u32>();
    if calculated != received {
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }

    Ok(&frame[RESPONSE_HEADER_LEN..frame.len() - RESPONSE_TRAILER_LEN])
}

fn get_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn get_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn get_i16(data: &[u8], at: usize) -> i16 {
    get_u16(data, at) as i16
}

fn get_string(data: &[u8], at: usize, len: usize) -> String {
    String::from_utf8_lossy(&data[at..at + len]).into_owned()
}

/// Temperatures above 100 encode negative values: 101 is -1 °C, 140 is
/// -40 °C.
fn decode_temperature(raw: u16) -> f32 {
    if raw > 100 {
        (100 - raw as i16 as i32) as f32
    } else {
        raw as f32
    }
}

/// The sign of the pack current lives in the top bit, but only protocol
/// version 1 documents the encoding; anything else decodes to 0 A rather
/// than guessing. Set bit means charging.
fn decode_current(raw: u16, protocol_version: u8) -> f32 {
    if protocol_version != 0x01 {
        return 0.0;
    }
    let magnitude = (raw & 0x7FFF) as f32 * 0.01;
    if raw & 0x8000 != 0 {
        magnitude
    } else {
        -magnitude
    }
}

/// Decodes a register payload (as returned by [`strip_status_frame`]) into
/// a [`Snapshot`].
pub fn decode_status(payload: &[u8]) -> Result<Snapshot, Error> {
    if payload.len() < 2 {
        return Err(Error::PayloadTooShort {
            got: payload.len(),
            need: 2,
        });
    }

    // 0x79: cell voltage block, 3 bytes per cell (index + mV)
    let cell_block_len = payload[1] as usize;
    let cell_count = cell_block_len / 3;
    if cell_count > MAX_CELLS {
        return Err(Error::CellCountOutOfRange(cell_count as u8));
    }

    // Every later field sits at a fixed distance from the end of the cell
    // block; the last one is the protocol version at offset + 219.
    let offset = cell_block_len + 3;
    let need = offset + 220;
    if payload.len() < need {
        return Err(Error::PayloadTooShort {
            got: payload.len(),
            need,
        });
    }

    let mut s = Snapshot {
        cell_count: cell_count as u8,
        ..Snapshot::default()
    };

    let mut min = f32::MAX;
    let mut max = f32::MIN;
    let mut sum = 0.0f32;
    for i in 0..cell_count {
        let voltage = get_u16(payload, i * 3 + 3) as f32 * 0.001;
        s.cell_voltages[i] = voltage;
        sum += voltage;
        if voltage < min {
            min = voltage;
            s.min_voltage_cell = (i + 1) as u8;
        }
        if voltage > max {
            max = voltage;
            s.max_voltage_cell = (i + 1) as u8;
        }
    }
    if cell_count > 0 {
        s.min_cell_voltage = min;
        s.max_cell_voltage = max;
        s.delta_cell_voltage = max - min;
        s.average_cell_voltage = sum / cell_count as f32;
    }

    s.protocol_version = payload[offset + 219]; // 0xC0

    s.power_tube_temperature = decode_temperature(get_u16(payload, offset)); // 0x80
    let mut sensors = [0.0f32; MAX_TEMPERATURE_SENSORS];
    sensors[0] = decode_temperature(get_u16(payload, offset + 3)); // 0x81
    sensors[1] = decode_temperature(get_u16(payload, offset + 6)); // 0x82
    s.temperature_sensors = sensors;

    s.total_voltage = get_u16(payload, offset + 9) as f32 * 0.01; // 0x83
    s.current = decode_current(get_u16(payload, offset + 12), s.protocol_version); // 0x84
    s.charging_current = s.current.max(0.0);
    s.discharging_current = s.current.min(0.0).abs();
    s.power = s.total_voltage * s.current;
    s.charging_power = s.power.max(0.0);
    s.discharging_power = s.power.min(0.0).abs();

    s.capacity_remaining_pct = payload[offset + 15] as f32; // 0x85
    s.temperature_sensor_count = payload[offset + 17]; // 0x86
    s.charging_cycles = get_u16(payload, offset + 19); // 0x87
    s.total_charging_cycle_capacity = get_u32(payload, offset + 22); // 0x89
    s.battery_strings = get_u16(payload, offset + 27); // 0x8A

    s.errors_bitmask = get_u16(payload, offset + 30); // 0x8B
    s.errors_text = snapshot::errors_to_string(s.errors_bitmask);
    s.operation_mode_bitmask = get_u16(payload, offset + 33); // 0x8C
    s.operation_mode_text = snapshot::operation_modes_to_string(s.operation_mode_bitmask);
    s.charging = s.operation_mode_bitmask & snapshot::mode_bits::CHARGING_ENABLED != 0;
    s.discharging = s.operation_mode_bitmask & snapshot::mode_bits::DISCHARGING_ENABLED != 0;
    s.balancing = s.operation_mode_bitmask & snapshot::mode_bits::BALANCER_ENABLED != 0;

    s.total_voltage_overvoltage_protection = get_u16(payload, offset + 36) as f32 * 0.01; // 0x8E
    s.total_voltage_undervoltage_protection = get_u16(payload, offset + 39) as f32 * 0.01; // 0x8F
    s.cell_voltage_overvoltage_protection = get_u16(payload, offset + 42) as f32 * 0.001; // 0x90
    s.cell_voltage_overvoltage_recovery = get_u16(payload, offset + 45) as f32 * 0.001; // 0x91
    s.cell_voltage_overvoltage_delay = get_u16(payload, offset + 48) as f32; // 0x92
    s.cell_voltage_undervoltage_protection = get_u16(payload, offset + 51) as f32 * 0.001; // 0x93
    s.cell_voltage_undervoltage_recovery = get_u16(payload, offset + 54) as f32 * 0.001; // 0x94
    s.cell_voltage_undervoltage_delay = get_u16(payload, offset + 57) as f32; // 0x95
    s.cell_pressure_difference_protection = get_u16(payload, offset + 60) as f32 * 0.001; // 0x96
    s.discharging_overcurrent_protection = get_u16(payload, offset + 63) as f32; // 0x97
    s.discharging_overcurrent_delay = get_u16(payload, offset + 66) as f32; // 0x98
    s.charging_overcurrent_protection = get_u16(payload, offset + 69) as f32; // 0x99
    s.charging_overcurrent_delay = get_u16(payload, offset + 72) as f32; // 0x9A
    s.balance_starting_voltage = get_u16(payload, offset + 75) as f32 * 0.001; // 0x9B
    s.balance_opening_pressure_difference = get_u16(payload, offset + 78) as f32 * 0.001; // 0x9C
    s.balancing_switch = payload[offset + 81] != 0x00; // 0x9D
    s.power_tube_temperature_protection = get_u16(payload, offset + 83) as f32; // 0x9E
    s.power_tube_temperature_recovery = get_u16(payload, offset + 86) as f32; // 0x9F
    s.temperature_sensor_temperature_protection = get_u16(payload, offset + 89) as f32; // 0xA0
    s.temperature_sensor_temperature_recovery = get_u16(payload, offset + 92) as f32; // 0xA1
    s.temperature_sensor_temperature_difference_protection =
        get_u16(payload, offset + 95) as f32; // 0xA2
    s.charging_high_temperature_protection = get_u16(payload, offset + 98) as f32; // 0xA3
    s.discharging_high_temperature_protection = get_u16(payload, offset + 101) as f32; // 0xA4
    s.charging_low_temperature_protection = get_i16(payload, offset + 104) as f32; // 0xA5
    s.charging_low_temperature_recovery = get_i16(payload, offset + 107) as f32; // 0xA6
    s.discharging_low_temperature_protection = get_i16(payload, offset + 110) as f32; // 0xA7
    s.discharging_low_temperature_recovery = get_i16(payload, offset + 113) as f32; // 0xA8

    s.total_battery_capacity_ah = get_u32(payload, offset + 118) as f32; // 0xAA
    s.capacity_remaining_ah = s.total_battery_capacity_ah * s.capacity_remaining_pct * 0.01;
    s.charging_switch = payload[offset + 123] != 0x00; // 0xAB
    s.discharging_switch = payload[offset + 125] != 0x00; // 0xAC
    s.current_calibration = get_u16(payload, offset + 127) as f32 * 0.001; // 0xAD
    s.device_address = payload[offset + 130]; // 0xAE
    s.battery_type = snapshot::battery_type_to_string(payload[offset + 132]).to_string(); // 0xAF
    s.sleep_wait_time = get_u16(payload, offset + 134) as f32; // 0xB0
    s.alarm_low_volume = payload[offset + 137] as f32; // 0xB1
    s.password = get_string(payload, offset + 139, 10); // 0xB2
    s.dedicated_charger_switch = payload[offset + 150] != 0x00; // 0xB3
    s.device_type = get_string(payload, offset + 152, 8); // 0xB4

    let runtime_minutes = get_u32(payload, offset + 166); // 0xB6
    s.total_runtime_hours = runtime_minutes as f32 / 60.0;
    s.total_runtime_formatted = snapshot::format_total_runtime(runtime_minutes.saturating_mul(60));

    s.software_version = get_string(payload, offset + 171, 15); // 0xB7
    s.actual_battery_capacity_ah = get_u32(payload, offset + 189) as f32; // 0xB9
    s.manufacturer = get_string(payload, offset + 194, 24); // 0xBA

    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Register payload of one real status poll from a 14-cell pack.
    const REFERENCE_PAYLOAD: [u8; 265] = [
        0x79, 0x2A, 0x01, 0x0E, 0xED, 0x02, 0x0E, 0xFA, 0x03, 0x0E, 0xF7, 0x04, 0x0E,
        0xEC, 0x05, 0x0E, 0xF8, 0x06, 0x0E, 0xFA, 0x07, 0x0E, 0xF1, 0x08, 0x0E, 0xF8,
        0x09, 0x0E, 0xE3, 0x0A, 0x0E, 0xFA, 0x0B, 0x0E, 0xF1, 0x0C, 0x0E, 0xFB, 0x0D,
        0x0E, 0xFB, 0x0E, 0x0E, 0xF2, 0x80, 0x00, 0x1D, 0x81, 0x00, 0x1E, 0x82, 0x00,
        0x1C, 0x83, 0x14, 0xEF, 0x84, 0x80, 0xD0, 0x85, 0x0F, 0x86, 0x02, 0x87, 0x00,
        0x04, 0x89, 0x00, 0x00, 0x00, 0x00, 0x8A, 0x00, 0x0E, 0x8B, 0x00, 0x00, 0x8C,
        0x00, 0x07, 0x8E, 0x16, 0x26, 0x8F, 0x10, 0xAE, 0x90, 0x0F, 0xD2, 0x91, 0x0F,
        0xA0, 0x92, 0x00, 0x05, 0x93, 0x0B, 0xEA, 0x94, 0x0C, 0x1C, 0x95, 0x00, 0x05,
        0x96, 0x01, 0x2C, 0x97, 0x00, 0x07, 0x98, 0x00, 0x03, 0x99, 0x00, 0x05, 0x9A,
        0x00, 0x05, 0x9B, 0x0C, 0xE4, 0x9C, 0x00, 0x08, 0x9D, 0x01, 0x9E, 0x00, 0x5A,
        0x9F, 0x00, 0x46, 0xA0, 0x00, 0x64, 0xA1, 0x00, 0x64, 0xA2, 0x00, 0x14, 0xA3,
        0x00, 0x46, 0xA4, 0x00, 0x46, 0xA5, 0xFF, 0xEC, 0xA6, 0xFF, 0xF6, 0xA7, 0xFF,
        0xEC, 0xA8, 0xFF, 0xF6, 0xA9, 0x0E, 0xAA, 0x00, 0x00, 0x00, 0x0E, 0xAB, 0x01,
        0xAC, 0x01, 0xAD, 0x04, 0x11, 0xAE, 0x01, 0xAF, 0x01, 0xB0, 0x00, 0x0A, 0xB1,
        0x14, 0xB2, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x00, 0x00, 0x00, 0x00, 0xB3,
        0x00, 0xB4, 0x49, 0x6E, 0x70, 0x75, 0x74, 0x20, 0x55, 0x73, 0xB5, 0x32, 0x31,
        0x30, 0x31, 0xB6, 0x00, 0x00, 0xE2, 0x00, 0xB7, 0x48, 0x36, 0x2E, 0x58, 0x5F,
        0x5F, 0x53, 0x36, 0x2E, 0x31, 0x2E, 0x33, 0x53, 0x5F, 0x5F, 0xB8, 0x00,
        0xB9, 0x00, 0x00, 0x00, 0x00, 0xBA, 0x42, 0x54, 0x33, 0x30, 0x37, 0x32, 0x30,
        0x32, 0x30, 0x31, 0x32, 0x30, 0x30, 0x30, 0x30, 0x32, 0x30, 0x30, 0x35, 0x32,
        0x31, 0x30, 0x30, 0x31, 0xC0, 0x01,
    ];

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.005
    }

    #[test]
    fn decodes_reference_payload() {
        let s = decode_status(&REFERENCE_PAYLOAD).unwrap();

        assert_eq!(s.cell_count, 14);
        assert!(close(s.cell_voltages[0], 3.821));
        assert!(close(s.cell_voltages[13], 3.826));
        assert!(close(s.min_cell_voltage, 3.811));
        assert_eq!(s.min_voltage_cell, 9);
        assert!(close(s.max_cell_voltage, 3.835));
        assert_eq!(s.max_voltage_cell, 12);
        assert!(close(s.delta_cell_voltage, 0.024));
        assert!(close(s.average_cell_voltage, 3.8282));

        assert_eq!(s.power_tube_temperature, 29.0);
        assert_eq!(s.temperature_sensors[0], 30.0);
        assert_eq!(s.temperature_sensors[1], 28.0);
        assert_eq!(s.temperature_sensor_count, 2);

        assert!(close(s.total_voltage, 53.59));
        assert!(close(s.current, 2.08));
        assert!(close(s.charging_current, 2.08));
        assert_eq!(s.discharging_current, 0.0);
        assert!((s.power - 111.47).abs() < 0.1);

        assert_eq!(s.capacity_remaining_pct, 15.0);
        assert!(close(s.capacity_remaining_ah, 2.1));
        assert_eq!(s.charging_cycles, 4);
        assert_eq!(s.total_charging_cycle_capacity, 0);
        assert_eq!(s.battery_strings, 14);

        assert_eq!(s.errors_bitmask, 0);
        assert_eq!(s.errors_text, "");
        assert_eq!(s.operation_mode_bitmask, 0x0007);
        assert_eq!(
            s.operation_mode_text,
            "Charging enabled;Discharging enabled;Balancer enabled"
        );
        assert!(s.charging);
        assert!(s.discharging);
        assert!(s.balancing);

        assert!(close(s.total_voltage_overvoltage_protection, 56.70));
        assert!(close(s.total_voltage_undervoltage_protection, 42.70));
        assert!(close(s.cell_voltage_overvoltage_protection, 4.050));
        assert!(close(s.cell_voltage_overvoltage_recovery, 4.000));
        assert_eq!(s.cell_voltage_overvoltage_delay, 5.0);
        assert!(close(s.cell_voltage_undervoltage_protection, 3.050));
        assert!(close(s.cell_voltage_undervoltage_recovery, 3.100));
        assert!(close(s.cell_pressure_difference_protection, 0.300));
        assert_eq!(s.discharging_overcurrent_protection, 7.0);
        assert_eq!(s.charging_overcurrent_protection, 5.0);
        assert!(close(s.balance_starting_voltage, 3.300));
        assert!(close(s.balance_opening_pressure_difference, 0.008));
        assert!(s.balancing_switch);
        assert_eq!(s.power_tube_temperature_protection, 90.0);
        assert_eq!(s.charging_low_temperature_protection, -20.0);
        assert_eq!(s.charging_low_temperature_recovery, -10.0);
        assert_eq!(s.discharging_low_temperature_protection, -20.0);

        assert_eq!(s.total_battery_capacity_ah, 14.0);
        assert!(s.charging_switch);
        assert!(s.discharging_switch);
        assert!(close(s.current_calibration, 1.041));
        assert_eq!(s.device_address, 1);
        assert_eq!(s.battery_type, "Ternary Lithium");
        assert_eq!(s.sleep_wait_time, 10.0);
        assert_eq!(s.alarm_low_volume, 20.0);
        assert_eq!(s.password, "123456\0\0\0\0");
        assert!(!s.dedicated_charger_switch);
        assert_eq!(s.device_type, "Input Us");
        assert_eq!(s.total_runtime_formatted, "40d 4h");
        assert!((s.total_runtime_hours - 964.27).abs() < 0.1);
        assert_eq!(s.software_version, "H6.X__S6.1.3S__");
        assert_eq!(s.actual_battery_capacity_ah, 0.0);
        assert_eq!(s.manufacturer, "BT3072020120000200521001");
        assert_eq!(s.protocol_version, 1);
    }

    #[test]
    fn temperature_sentinel_encoding() {
        assert_eq!(decode_temperature(0), 0.0);
        assert_eq!(decode_temperature(100), 100.0);
        assert_eq!(decode_temperature(101), -1.0);
        assert_eq!(decode_temperature(140), -40.0);
    }

    #[test]
    fn current_sign_depends_on_top_bit() {
        // bit 15 set: charging
        assert!(close(decode_current(0x80D0, 0x01), 2.08));
        // bit 15 clear: discharging
        assert!(close(decode_current(0x00D0, 0x01), -2.08));
        assert_eq!(decode_current(0x8000, 0x01), 0.0);
    }

    #[test]
    fn unknown_protocol_version_decodes_current_as_zero() {
        assert_eq!(decode_current(0x80D0, 0x00), 0.0);
        assert_eq!(decode_current(0x00D0, 0x02), 0.0);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert!(matches!(
            decode_status(&[]),
            Err(Error::PayloadTooShort { .. })
        ));
        assert!(matches!(
            decode_status(&REFERENCE_PAYLOAD[..264]),
            Err(Error::PayloadTooShort { got: 264, need: 265 })
        ));
    }

    #[test]
    fn oversized_cell_block_is_rejected() {
        // 25 cells would overrun the cell voltage array
        let payload = [0x79, 75, 0x00];
        assert!(matches!(
            decode_status(&payload),
            Err(Error::CellCountOutOfRange(25))
        ));
    }

    fn frame_around(payload: &[u8]) -> Vec<u8> {
        let length = (RESPONSE_HEADER_LEN - 4 + payload.len() + RESPONSE_TRAILER_LEN) as u16;
        let mut frame = vec![0x4E, 0x57, (length >> 8) as u8, length as u8];
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x01]);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x68]);
        let checksum = frame.iter().map(|b| *b as u32).sum::<u32>();
        frame.extend_from_slice(&checksum.to_be_bytes());
        frame
    }

    #[test]
    fn strips_and_decodes_a_full_frame() {
        let frame = frame_around(&REFERENCE_PAYLOAD);
        let payload = strip_status_frame(&frame).unwrap();
        assert_eq!(payload, &REFERENCE_PAYLOAD[..]);
        let s = decode_status(payload).unwrap();
        assert_eq!(s.cell_count, 14);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut frame = frame_around(&REFERENCE_PAYLOAD);
        frame[20] ^= 0xFF;
        assert!(matches!(
            strip_status_frame(&frame),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wrong_marker_is_rejected() {
        let mut frame = frame_around(&REFERENCE_PAYLOAD);
        frame[0] = 0x4F;
        assert!(matches!(
            strip_status_frame(&frame),
            Err(Error::BadFrameMarker([0x4F, 0x57]))
        ));
    }

    #[test]
    fn status_request_checksum_is_consistent() {
        let sum = STATUS_REQUEST[..17].iter().map(|b| *b as u32).sum::<u32>();
        assert_eq!(&sum.to_be_bytes()[..], &STATUS_REQUEST[17..]);
    }
}
