//! Decoded battery state shared between the polling side and the
//! inverter-facing side of the gateway.

use std::sync::{Arc, Mutex, PoisonError};

/// Upper bound on cells a single status payload can describe.
pub const MAX_CELLS: usize = 24;
/// External temperature sensors tracked per pack.
pub const MAX_TEMPERATURE_SENSORS: usize = 4;
/// Consecutive failed polls before the pack is reported offline.
pub const MAX_NO_RESPONSE_COUNT: u8 = 5;

/// Active error conditions reported by the battery, one bit each.
pub mod error_bits {
    pub const LOW_CAPACITY: u16 = 1 << 0;
    pub const POWER_TUBE_OVERTEMPERATURE: u16 = 1 << 1;
    pub const CHARGING_OVERVOLTAGE: u16 = 1 << 2;
    pub const DISCHARGING_UNDERVOLTAGE: u16 = 1 << 3;
    pub const BATTERY_OVER_TEMPERATURE: u16 = 1 << 4;
    pub const CHARGING_OVERCURRENT: u16 = 1 << 5;
    pub const DISCHARGING_OVERCURRENT: u16 = 1 << 6;
    pub const CELL_PRESSURE_DIFFERENCE: u16 = 1 << 7;
    pub const BATTERY_BOX_OVERTEMPERATURE: u16 = 1 << 8;
    pub const BATTERY_LOW_TEMPERATURE: u16 = 1 << 9;
    pub const CELL_OVERVOLTAGE: u16 = 1 << 10;
    pub const CELL_UNDERVOLTAGE: u16 = 1 << 11;
}

/// Operation mode flags reported by the battery.
pub mod mode_bits {
    pub const CHARGING_ENABLED: u16 = 1 << 0;
    pub const DISCHARGING_ENABLED: u16 = 1 << 1;
    pub const BALANCER_ENABLED: u16 = 1 << 2;
    pub const BATTERY_DROPPED: u16 = 1 << 3;
}

const ERROR_LABELS: [&str; 14] = [
    "Low capacity",
    "Power tube overtemperature",
    "Charging overvoltage",
    "Discharging undervoltage",
    "Battery over temperature",
    "Charging overcurrent",
    "Discharging overcurrent",
    "Cell pressure difference",
    "Overtemperature alarm in the battery box",
    "Battery low temperature",
    "Cell overvoltage",
    "Cell undervoltage",
    "309_A protection",
    "309_A protection",
];

const MODE_LABELS: [&str; 4] = [
    "Charging enabled",
    "Discharging enabled",
    "Balancer enabled",
    "Battery dropped",
];

const BATTERY_TYPES: [&str; 3] = [
    "Lithium Iron Phosphate",
    "Ternary Lithium",
    "Lithium Titanate",
];

/// One decoded battery status poll. All voltages in V, currents in A,
/// temperatures in °C and capacities in Ah unless a field name says
/// otherwise.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(serde::Serialize))]
pub struct Snapshot {
    pub cell_count: u8,
    pub cell_voltages: [f32; MAX_CELLS],
    pub min_cell_voltage: f32,
    pub max_cell_voltage: f32,
    /// 1-based index of the cell holding the minimum voltage.
    pub min_voltage_cell: u8,
    /// 1-based index of the cell holding the maximum voltage.
    pub max_voltage_cell: u8,
    pub delta_cell_voltage: f32,
    pub average_cell_voltage: f32,

    pub power_tube_temperature: f32,
    pub temperature_sensors: [f32; MAX_TEMPERATURE_SENSORS],
    pub temperature_sensor_count: u8,

    pub total_voltage: f32,
    /// Signed pack current, positive while charging.
    pub current: f32,
    pub charging_current: f32,
    pub discharging_current: f32,
    pub power: f32,
    pub charging_power: f32,
    pub discharging_power: f32,
    /// State of charge in percent.
    pub capacity_remaining_pct: f32,
    /// Remaining capacity derived from the configured pack capacity.
    pub capacity_remaining_ah: f32,
    pub charging_cycles: u16,
    pub total_charging_cycle_capacity: u32,
    pub battery_strings: u16,

    pub errors_bitmask: u16,
    pub errors_text: String,
    pub operation_mode_bitmask: u16,
    pub operation_mode_text: String,
    pub charging: bool,
    pub discharging: bool,
    pub balancing: bool,

    pub total_voltage_overvoltage_protection: f32,
    pub total_voltage_undervoltage_protection: f32,
    pub cell_voltage_overvoltage_protection: f32,
    pub cell_voltage_overvoltage_recovery: f32,
    pub cell_voltage_overvoltage_delay: f32,
    pub cell_voltage_undervoltage_protection: f32,
    pub cell_voltage_undervoltage_recovery: f32,
    pub cell_voltage_undervoltage_delay: f32,
    pub cell_pressure_difference_protection: f32,
    pub discharging_overcurrent_protection: f32,
    pub discharging_overcurrent_delay: f32,
    pub charging_overcurrent_protection: f32,
    pub charging_overcurrent_delay: f32,
    pub balance_starting_voltage: f32,
    pub balance_opening_pressure_difference: f32,
    pub power_tube_temperature_protection: f32,
    pub power_tube_temperature_recovery: f32,
    pub temperature_sensor_temperature_protection: f32,
    pub temperature_sensor_temperature_recovery: f32,
    pub temperature_sensor_temperature_difference_protection: f32,
    pub charging_high_temperature_protection: f32,
    pub discharging_high_temperature_protection: f32,
    pub charging_low_temperature_protection: f32,
    pub charging_low_temperature_recovery: f32,
    pub discharging_low_temperature_protection: f32,
    pub discharging_low_temperature_recovery: f32,

    pub balancing_switch: bool,
    pub charging_switch: bool,
    pub discharging_switch: bool,
    pub dedicated_charger_switch: bool,
    pub total_battery_capacity_ah: f32,
    pub current_calibration: f32,
    pub device_address: u8,
    pub battery_type: String,
    pub sleep_wait_time: f32,
    pub alarm_low_volume: f32,
    pub password: String,
    pub device_type: String,
    pub total_runtime_hours: f32,
    pub total_runtime_formatted: String,
    pub software_version: String,
    pub actual_battery_capacity_ah: f32,
    pub manufacturer: String,
    pub protocol_version: u8,
}

fn bits_to_string(mask: u16, labels: &[&str]) -> String {
    let mut out = String::new();
    for (bit, label) in labels.iter().enumerate() {
        if mask & (1 << bit) != 0 {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(label);
        }
    }
    out
}

pub(crate) fn errors_to_string(mask: u16) -> String {
    bits_to_string(mask, &ERROR_LABELS)
}

pub(crate) fn operation_modes_to_string(mask: u16) -> String {
    bits_to_string(mask, &MODE_LABELS)
}

pub(crate) fn battery_type_to_string(raw: u8) -> &'static str {
    BATTERY_TYPES.get(raw as usize).copied().unwrap_or("Unknown")
}

/// Renders a runtime in seconds as e.g. `4y 230d 7h`, omitting zero
/// components.
pub(crate) fn format_total_runtime(seconds: u32) -> String {
    const DAY: u32 = 24 * 3600;
    let years = seconds / (DAY * 365);
    let mut rest = seconds % (DAY * 365);
    let days = rest / DAY;
    rest %= DAY;
    let hours = rest / 3600;

    let mut out = String::new();
    if years > 0 {
        out.push_str(&format!("{years}y "));
    }
    if days > 0 {
        out.push_str(&format!("{days}d "));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    out
}

#[derive(Debug, Default)]
struct Inner {
    snapshot: Snapshot,
    online: bool,
    no_response_count: u8,
}

/// Single-writer, multi-reader holder for the latest [`Snapshot`].
///
/// The polling thread replaces the whole snapshot in one step so readers
/// never observe a half-updated poll. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct SharedSnapshot {
    inner: Arc<Mutex<Inner>>,
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a freshly decoded snapshot and marks the pack online.
    pub fn publish(&self, snapshot: Snapshot) {
        let mut inner = self.lock();
        inner.snapshot = snapshot;
        inner.online = true;
        inner.no_response_count = 0;
    }

    /// Records a failed poll. After [`MAX_NO_RESPONSE_COUNT`] consecutive
    /// misses the pack flips offline; the counter saturates afterwards so
    /// a long outage cannot wrap it back around.
    pub fn note_miss(&self) {
        let mut inner = self.lock();
        if inner.no_response_count < MAX_NO_RESPONSE_COUNT {
            inner.no_response_count += 1;
        }
        if inner.no_response_count == MAX_NO_RESPONSE_COUNT {
            inner.online = false;
            inner.no_response_count += 1;
        }
    }

    pub fn online(&self) -> bool {
        self.lock().online
    }

    pub fn consecutive_misses(&self) -> u8 {
        self.lock().no_response_count.min(MAX_NO_RESPONSE_COUNT)
    }

    /// Runs `f` against the current snapshot under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
        f(&self.lock().snapshot)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a reader panicked mid-access; the
        // snapshot itself is always whole, so keep serving it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
