use serde::Serialize;
use tracing::warn;

/// One merged measurement sample: net grid power at the metering point plus
/// the AC power the charger is currently drawing. Positive grid power means
/// importing from the utility, negative means exporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GridLoadState {
    pub grid_power_w: i16,
    pub psu_ac_input_power_w: i16,
}

/// Live mirror of the rectifier parameters, updated from periodic CAN status
/// reports. All values are SI units (W, V, A, degC); `efficiency` is in [0, 1].
///
/// Values reflect frames received within roughly the last status-request
/// period. Staleness is not distinguished from zero - consumers must not
/// assume freshness beyond best effort.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RectifierParams {
    pub input_voltage: f32,
    pub input_frequency: f32,
    pub input_current: f32,
    pub input_power: f32,
    pub input_temp: f32,
    pub efficiency: f32,
    pub output_voltage: f32,
    pub output_current: f32,
    pub max_output_current: f32,
    pub output_power: f32,
    pub output_temp: f32,
}

/// Inverter state as last reported by the OpenDTU gateway.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InverterSnapshot {
    pub battery_voltage_v: f32,
    pub battery_to_grid_power_w: f32,
    pub dpl_enabled: bool,
}

impl Default for InverterSnapshot {
    fn default() -> Self {
        Self {
            // conservative floor until the first fetch succeeds
            battery_voltage_v: BATTERY_VOLTAGE_MIN,
            battery_to_grid_power_w: 0.0,
            dpl_enabled: false,
        }
    }
}

pub const BATTERY_VOLTAGE_MIN: f32 = 47.0;
pub const BATTERY_VOLTAGE_MAX: f32 = 53.5;

/// Round to two decimals, half-up: `floor(x * 100 + 0.5) / 100`.
pub fn round2(x: f32) -> f32 {
    ((x * 100.0 + 0.5) as i32) as f32 / 100.0
}

/// Clamp a battery voltage reading into the physically plausible range before
/// it enters any calculation. Out-of-range readings are logged and replaced
/// with the nearest bound.
pub fn clamp_battery_voltage(volts: f32) -> f32 {
    if volts < BATTERY_VOLTAGE_MIN {
        warn!(volts, "invalid battery voltage measurement, clamping low");
        return BATTERY_VOLTAGE_MIN;
    }
    if volts > BATTERY_VOLTAGE_MAX {
        warn!(volts, "invalid battery voltage measurement, clamping high");
        return BATTERY_VOLTAGE_MAX;
    }
    volts
}
