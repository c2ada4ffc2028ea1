//! Bridges decoded battery state to the register values the inverter
//! expects. Every getter returns the raw big-endian payload bytes for one
//! register read.

use crate::snapshot::{error_bits, SharedSnapshot, MAX_TEMPERATURE_SENSORS};

/// Register value is within its normal range.
pub const STATE_NORMAL: u8 = 0x00;
/// Register value is below the lower limit.
pub const STATE_BELOW_LOWER_LIMIT: u8 = 0x01;
/// Register value is above the higher limit.
pub const STATE_ABOVE_HIGHER_LIMIT: u8 = 0x02;

/// Source of register payloads for the inverter-facing dispatcher.
///
/// Scalings follow the inverter's register conventions: voltages in
/// 0.1 V steps, currents in 0.1 A, temperatures in 0.1 K, capacity in
/// mAh.
pub trait DataAdapter {
    /// False while no valid battery poll has been decoded recently.
    fn has_data(&self) -> bool;

    fn bms_firmware_version(&self) -> [u8; 4];
    fn bms_hardware_version(&self) -> [u8; 4];

    fn number_of_cells(&self) -> [u8; 2];
    /// Voltage of one cell, 1-based index.
    fn cell_voltage(&self, cell_number: u16) -> [u8; 2];
    fn number_of_temperature_sensors(&self) -> [u8; 2];
    /// Temperature of one sensor in 0.1 K, 1-based index.
    fn temperature_of_sensor(&self, sensor_number: u16) -> [u8; 2];
    fn module_charge_current(&self) -> [u8; 2];
    fn module_discharge_current(&self) -> [u8; 2];
    fn module_voltage(&self) -> [u8; 2];
    fn state_of_charge(&self) -> [u8; 2];
    fn module_total_capacity(&self) -> [u8; 4];

    fn number_of_cells_for_warning_info(&self) -> [u8; 2];
    fn cell_pair_voltage_state(&self, odd_cell_number: u16) -> [u8; 2];
    fn number_of_temperature_sensors_for_warning_info(&self) -> [u8; 2];
    fn temperature_sensor_pair_state(&self, odd_sensor_number: u16) -> [u8; 2];
    fn module_charge_voltage_state(&self) -> [u8; 2];
    fn module_discharge_voltage_state(&self) -> [u8; 2];
    fn cell_charge_voltage_state(&self) -> [u8; 2];
    fn cell_discharge_voltage_state(&self) -> [u8; 2];
    fn module_charge_current_state(&self) -> [u8; 2];
    fn module_discharge_current_state(&self) -> [u8; 2];
    fn module_charge_temperature_state(&self) -> [u8; 2];
    fn module_discharge_temperature_state(&self) -> [u8; 2];
    fn cell_charge_temperature_state(&self) -> [u8; 2];
    fn cell_discharge_temperature_state(&self) -> [u8; 2];

    fn charge_voltage_limit(&self) -> [u8; 2];
    fn discharge_voltage_limit(&self) -> [u8; 2];
    fn charge_current_limit(&self) -> [u8; 2];
    fn discharge_current_limit(&self) -> [u8; 2];
    fn charge_discharge_status(&self) -> [u8; 2];
    fn runtime_to_empty(&self) -> [u8; 2];
}

/// [`DataAdapter`] backed by the latest shared battery snapshot.
pub struct SnapshotAdapter {
    shared: SharedSnapshot,
}

impl SnapshotAdapter {
    pub fn new(shared: SharedSnapshot) -> Self {
        Self { shared }
    }
}

fn state(code: u8) -> [u8; 2] {
    [0x00, code]
}

impl DataAdapter for SnapshotAdapter {
    fn has_data(&self) -> bool {
        self.shared.online()
    }

    // Not carried in the status payload; the inverter tolerates zeros.
    fn bms_firmware_version(&self) -> [u8; 4] {
        [0x00, 0x00, 0x00, 0x00]
    }

    fn bms_hardware_version(&self) -> [u8; 4] {
        [0x00, 0x00, 0x00, 0x00]
    }

    fn number_of_cells(&self) -> [u8; 2] {
        self.shared.read(|s| [0x00, s.cell_count])
    }

    fn cell_voltage(&self, cell_number: u16) -> [u8; 2] {
        self.shared.read(|s| {
            if cell_number >= 1 && cell_number <= s.cell_count as u16 {
                // 0.1 V steps fit in the low byte for any sane cell
                let value = (s.cell_voltages[cell_number as usize - 1] * 10.0) as u8;
                [0x00, value]
            } else {
                [0x00, 0x00]
            }
        })
    }

    fn number_of_temperature_sensors(&self) -> [u8; 2] {
        self.shared.read(|s| [0x00, s.temperature_sensor_count])
    }

    fn temperature_of_sensor(&self, sensor_number: u16) -> [u8; 2] {
        self.shared.read(|s| {
            if sensor_number >= 1
                && sensor_number <= s.temperature_sensor_count as u16
                && sensor_number <= MAX_TEMPERATURE_SENSORS as u16
            {
                let celsius = s.temperature_sensors[sensor_number as usize - 1];
                let decikelvin = ((celsius + 273.15) * 10.0) as u16;
                decikelvin.to_be_bytes()
            } else {
                [0x00, 0x00]
            }
        })
    }

    fn module_charge_current(&self) -> [u8; 2] {
        self.shared
            .read(|s| ((s.charging_current * 10.0) as u16).to_be_bytes())
    }

    fn module_discharge_current(&self) -> [u8; 2] {
        self.shared
            .read(|s| ((s.discharging_current * 10.0) as u16).to_be_bytes())
    }

    fn module_voltage(&self) -> [u8; 2] {
        self.shared
            .read(|s| ((s.total_voltage * 10.0) as u16).to_be_bytes())
    }

    fn state_of_charge(&self) -> [u8; 2] {
        self.shared
            .read(|s| (s.capacity_remaining_pct as u16).to_be_bytes())
    }

    fn module_total_capacity(&self) -> [u8; 4] {
        self.shared
            .read(|s| ((s.total_battery_capacity_ah * 1000.0) as u32).to_be_bytes())
    }

    fn number_of_cells_for_warning_info(&self) -> [u8; 2] {
        [0x00, 0x00]
    }

    fn cell_pair_voltage_state(&self, _odd_cell_number: u16) -> [u8; 2] {
        // Per-cell warnings are not broken out of the pack-level bitmask.
        state(STATE_NORMAL)
    }

    fn number_of_temperature_sensors_for_warning_info(&self) -> [u8; 2] {
        self.shared.read(|s| [0x00, s.temperature_sensor_count])
    }

    fn temperature_sensor_pair_state(&self, _odd_sensor_number: u16) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn module_charge_voltage_state(&self) -> [u8; 2] {
        self.shared.read(|s| {
            if s.errors_bitmask & error_bits::CHARGING_OVERVOLTAGE != 0 {
                state(STATE_ABOVE_HIGHER_LIMIT)
            } else {
                state(STATE_NORMAL)
            }
        })
    }

    fn module_discharge_voltage_state(&self) -> [u8; 2] {
        self.shared.read(|s| {
            if s.errors_bitmask & error_bits::DISCHARGING_UNDERVOLTAGE != 0 {
                state(STATE_BELOW_LOWER_LIMIT)
            } else {
                state(STATE_NORMAL)
            }
        })
    }

    fn cell_charge_voltage_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn cell_discharge_voltage_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn module_charge_current_state(&self) -> [u8; 2] {
        self.shared.read(|s| {
            if s.errors_bitmask & error_bits::CHARGING_OVERCURRENT != 0 {
                state(STATE_ABOVE_HIGHER_LIMIT)
            } else {
                state(STATE_NORMAL)
            }
        })
    }

    fn module_discharge_current_state(&self) -> [u8; 2] {
        self.shared.read(|s| {
            if s.errors_bitmask & error_bits::DISCHARGING_OVERCURRENT != 0 {
                state(STATE_ABOVE_HIGHER_LIMIT)
            } else {
                state(STATE_NORMAL)
            }
        })
    }

    fn module_charge_temperature_state(&self) -> [u8; 2] {
        self.shared.read(|s| {
            if s.errors_bitmask & error_bits::BATTERY_LOW_TEMPERATURE != 0 {
                return state(STATE_BELOW_LOWER_LIMIT);
            }
            if s.errors_bitmask
                & (error_bits::BATTERY_OVER_TEMPERATURE
                    | error_bits::BATTERY_BOX_OVERTEMPERATURE
                    | error_bits::POWER_TUBE_OVERTEMPERATURE)
                != 0
            {
                return state(STATE_ABOVE_HIGHER_LIMIT);
            }
            state(STATE_NORMAL)
        })
    }

    fn module_discharge_temperature_state(&self) -> [u8; 2] {
        self.shared.read(|s| {
            if s.errors_bitmask
                & (error_bits::BATTERY_OVER_TEMPERATURE
                    | error_bits::BATTERY_BOX_OVERTEMPERATURE
                    | error_bits::POWER_TUBE_OVERTEMPERATURE)
                != 0
            {
                state(STATE_ABOVE_HIGHER_LIMIT)
            } else {
                state(STATE_NORMAL)
            }
        })
    }

    fn cell_charge_temperature_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn cell_discharge_temperature_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn charge_voltage_limit(&self) -> [u8; 2] {
        // Pack-level limit reconstructed from the per-cell recovery voltage
        self.shared.read(|s| {
            let volts = s.cell_voltage_overvoltage_recovery * s.cell_count as f32;
            ((volts * 10.0) as u16).to_be_bytes()
        })
    }

    fn discharge_voltage_limit(&self) -> [u8; 2] {
        self.shared.read(|s| {
            let volts = s.cell_voltage_undervoltage_recovery * s.cell_count as f32;
            ((volts * 10.0) as u16).to_be_bytes()
        })
    }

    fn charge_current_limit(&self) -> [u8; 2] {
        self.shared
            .read(|s| ((s.charging_overcurrent_protection * 10.0) as u16).to_be_bytes())
    }

    fn discharge_current_limit(&self) -> [u8; 2] {
        self.shared
            .read(|s| ((s.discharging_overcurrent_protection * 10.0) as u16).to_be_bytes())
    }

    fn charge_discharge_status(&self) -> [u8; 2] {
        self.shared.read(|s| {
            let cool_enough = s.temperature_sensors[0] < 35.0 && s.temperature_sensors[1] < 35.0;
            let mut flags = 0u8;
            if s.charging && cool_enough {
                flags |= 128; // charge enable
            }
            if s.discharging && cool_enough {
                flags |= 64; // discharge enable
            }
            if s.capacity_remaining_pct >= 10.0 && s.capacity_remaining_pct <= 15.0 {
                flags |= 16; // charge immediately (low SoC)
            }
            if s.capacity_remaining_pct < 10.0 {
                flags |= 32; // charge immediately (critical SoC)
            }
            [0x00, flags]
        })
    }

    fn runtime_to_empty(&self) -> [u8; 2] {
        [0x00, 0x00]
    }
}

/// Fixed-value adapter for exercising the inverter bus without a battery
/// attached.
pub struct MockDataAdapter;

impl DataAdapter for MockDataAdapter {
    fn has_data(&self) -> bool {
        true
    }

    fn bms_firmware_version(&self) -> [u8; 4] {
        [0x00, 0x00, 0x00, 0x01]
    }

    fn bms_hardware_version(&self) -> [u8; 4] {
        [0x00, 0x00, 0x00, 0x01]
    }

    fn number_of_cells(&self) -> [u8; 2] {
        [0x00, 8]
    }

    fn cell_voltage(&self, _cell_number: u16) -> [u8; 2] {
        // 3.3 V
        [0x00, 33]
    }

    fn number_of_temperature_sensors(&self) -> [u8; 2] {
        [0x00, 3]
    }

    fn temperature_of_sensor(&self, _sensor_number: u16) -> [u8; 2] {
        // 20 °C
        2931u16.to_be_bytes()
    }

    fn module_charge_current(&self) -> [u8; 2] {
        572u16.to_be_bytes()
    }

    fn module_discharge_current(&self) -> [u8; 2] {
        900u16.to_be_bytes()
    }

    fn module_voltage(&self) -> [u8; 2] {
        264u16.to_be_bytes()
    }

    fn state_of_charge(&self) -> [u8; 2] {
        [0x00, 70]
    }

    fn module_total_capacity(&self) -> [u8; 4] {
        // 280 Ah in mAh
        280_000u32.to_be_bytes()
    }

    fn number_of_cells_for_warning_info(&self) -> [u8; 2] {
        [0x00, 0x00]
    }

    fn cell_pair_voltage_state(&self, _odd_cell_number: u16) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn number_of_temperature_sensors_for_warning_info(&self) -> [u8; 2] {
        [0x00, 3]
    }

    fn temperature_sensor_pair_state(&self, _odd_sensor_number: u16) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn module_charge_voltage_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn module_discharge_voltage_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn cell_charge_voltage_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn cell_discharge_voltage_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn module_charge_current_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn module_discharge_current_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn module_charge_temperature_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn module_discharge_temperature_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn cell_charge_temperature_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn cell_discharge_temperature_state(&self) -> [u8; 2] {
        state(STATE_NORMAL)
    }

    fn charge_voltage_limit(&self) -> [u8; 2] {
        // 29.2 V
        292u16.to_be_bytes()
    }

    fn discharge_voltage_limit(&self) -> [u8; 2] {
        // 20.0 V
        200u16.to_be_bytes()
    }

    fn charge_current_limit(&self) -> [u8; 2] {
        // 140 A
        1400u16.to_be_bytes()
    }

    fn discharge_current_limit(&self) -> [u8; 2] {
        // 340 A
        3400u16.to_be_bytes()
    }

    fn charge_discharge_status(&self) -> [u8; 2] {
        // charge and discharge both enabled
        [0x00, 192]
    }

    fn runtime_to_empty(&self) -> [u8; 2] {
        [0x00, 0x00]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;

    fn shared_with(snapshot: Snapshot) -> SharedSnapshot {
        let shared = SharedSnapshot::new();
        shared.publish(snapshot);
        shared
    }

    fn reference_snapshot() -> Snapshot {
        let mut s = Snapshot::default();
        s.cell_count = 14;
        s.cell_voltages[0] = 3.821;
        s.cell_voltages[13] = 3.826;
        s.temperature_sensor_count = 2;
        s.temperature_sensors[0] = 30.0;
        s.temperature_sensors[1] = 28.0;
        s.total_voltage = 53.59;
        s.charging_current = 2.08;
        s.discharging_current = 0.0;
        s.capacity_remaining_pct = 15.0;
        s.total_battery_capacity_ah = 14.0;
        s.cell_voltage_overvoltage_recovery = 4.0;
        s.cell_voltage_undervoltage_recovery = 3.1;
        s.charging_overcurrent_protection = 5.0;
        s.discharging_overcurrent_protection = 7.0;
        s.charging = true;
        s.discharging = true;
        s
    }

    #[test]
    fn scalar_registers_scale_to_inverter_units() {
        let adapter = SnapshotAdapter::new(shared_with(reference_snapshot()));
        assert_eq!(adapter.number_of_cells(), [0, 14]);
        assert_eq!(adapter.module_voltage(), 535u16.to_be_bytes());
        assert_eq!(adapter.module_charge_current(), 20u16.to_be_bytes());
        assert_eq!(adapter.module_discharge_current(), [0, 0]);
        assert_eq!(adapter.state_of_charge(), [0, 15]);
        assert_eq!(adapter.module_total_capacity(), 14_000u32.to_be_bytes());
    }

    #[test]
    fn cell_voltage_is_bounds_checked() {
        let adapter = SnapshotAdapter::new(shared_with(reference_snapshot()));
        assert_eq!(adapter.cell_voltage(1), [0, 38]);
        assert_eq!(adapter.cell_voltage(14), [0, 38]);
        assert_eq!(adapter.cell_voltage(0), [0, 0]);
        assert_eq!(adapter.cell_voltage(15), [0, 0]);
    }

    #[test]
    fn sensor_temperature_converts_to_decikelvin() {
        let adapter = SnapshotAdapter::new(shared_with(reference_snapshot()));
        assert_eq!(adapter.temperature_of_sensor(1), 3031u16.to_be_bytes());
        assert_eq!(adapter.temperature_of_sensor(2), 3011u16.to_be_bytes());
        assert_eq!(adapter.temperature_of_sensor(3), [0, 0]);
        assert_eq!(adapter.temperature_of_sensor(0), [0, 0]);
    }

    #[test]
    fn limits_derive_from_protection_settings() {
        let adapter = SnapshotAdapter::new(shared_with(reference_snapshot()));
        // 4.0 V * 14 cells = 56.0 V
        assert_eq!(adapter.charge_voltage_limit(), 560u16.to_be_bytes());
        // 3.1 V * 14 cells, truncated in 0.1 V steps
        assert_eq!(adapter.discharge_voltage_limit(), 433u16.to_be_bytes());
        assert_eq!(adapter.charge_current_limit(), 50u16.to_be_bytes());
        assert_eq!(adapter.discharge_current_limit(), 70u16.to_be_bytes());
    }

    #[test]
    fn warning_states_follow_error_bits() {
        let mut snapshot = reference_snapshot();
        snapshot.errors_bitmask = error_bits::CHARGING_OVERVOLTAGE
            | error_bits::DISCHARGING_OVERCURRENT
            | error_bits::BATTERY_LOW_TEMPERATURE;
        let adapter = SnapshotAdapter::new(shared_with(snapshot));
        assert_eq!(
            adapter.module_charge_voltage_state(),
            [0, STATE_ABOVE_HIGHER_LIMIT]
        );
        assert_eq!(adapter.module_discharge_voltage_state(), [0, STATE_NORMAL]);
        assert_eq!(adapter.module_charge_current_state(), [0, STATE_NORMAL]);
        assert_eq!(
            adapter.module_discharge_current_state(),
            [0, STATE_ABOVE_HIGHER_LIMIT]
        );
        // low temperature wins over the overtemperature bits
        assert_eq!(
            adapter.module_charge_temperature_state(),
            [0, STATE_BELOW_LOWER_LIMIT]
        );
        assert_eq!(
            adapter.module_discharge_temperature_state(),
            [0, STATE_NORMAL]
        );
    }

    #[test]
    fn charge_discharge_status_flags() {
        let adapter = SnapshotAdapter::new(shared_with(reference_snapshot()));
        // charging + discharging enabled, SoC 15 asks for charge
        assert_eq!(adapter.charge_discharge_status(), [0, 128 + 64 + 16]);

        let mut hot = reference_snapshot();
        hot.temperature_sensors[0] = 40.0;
        hot.capacity_remaining_pct = 50.0;
        let adapter = SnapshotAdapter::new(shared_with(hot));
        assert_eq!(adapter.charge_discharge_status(), [0, 0]);

        let mut empty = reference_snapshot();
        empty.capacity_remaining_pct = 5.0;
        empty.charging = false;
        empty.discharging = false;
        let adapter = SnapshotAdapter::new(shared_with(empty));
        assert_eq!(adapter.charge_discharge_status(), [0, 32]);
    }

    #[test]
    fn offline_shared_state_reports_no_data() {
        let adapter = SnapshotAdapter::new(SharedSnapshot::new());
        assert!(!adapter.has_data());
        assert_eq!(adapter.number_of_cells(), [0, 0]);
    }

    #[test]
    fn mock_adapter_is_always_ready() {
        let mock = MockDataAdapter;
        assert!(mock.has_data());
        assert_eq!(mock.number_of_cells(), [0, 8]);
        assert_eq!(mock.module_voltage(), 264u16.to_be_bytes());
        assert_eq!(mock.module_total_capacity(), 280_000u32.to_be_bytes());
    }
}
