//! Proportional charge-power regulator.
//!
//! While the plant is charging, every fresh grid sample is turned into one
//! bounded correction of the rectifier's maximum-current setpoint: the grid
//! error is added to the present AC charge power, clamped, translated through
//! the AC/DC conversion efficiency into a DC current and sent to the charger.
//! Small errors inside the dead-band are left alone to avoid hunting.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{clamp_battery_voltage, round2, ChargerPort};

pub struct Regulator {
    target_grid_power: i16,
    error_threshold: i32,
    min_charge_power: i16,
    max_charge_power: i16,
    idle_time: Duration,
}

impl Regulator {
    pub fn new(cfg: &Config) -> Self {
        Self {
            target_grid_power: cfg.target_grid_power,
            error_threshold: cfg.regulator_error_threshold,
            min_charge_power: cfg.min_charge_power,
            max_charge_power: cfg.max_charge_power,
            idle_time: Duration::from_millis(cfg.regulator_idle_time_ms),
        }
    }

    /// Run one regulation step against the charger, then idle briefly so the
    /// physical loop can settle before the next sample is processed.
    pub async fn step(&self, grid_load: i16, ac_charge_power: i16, charger: &dyn ChargerPort) {
        let error = i32::from(self.target_grid_power) - i32::from(grid_load);
        if error.abs() < self.error_threshold {
            return;
        }

        info!(
            grid_load,
            deviation = error,
            ac_charge = ac_charge_power,
            "processing received power state"
        );

        let power_cmd = self.bounded_power_command(error, ac_charge_power);
        let output_voltage = clamp_battery_voltage(charger.current_output_voltage());
        let max_current_cmd = self.current_for_power(power_cmd as f32, output_voltage);

        if let Err(e) = charger.set_max_current(max_current_cmd, false).await {
            warn!(error = %e, "failed to update charger current setpoint");
        }
        info!(power_cmd, "updated AC charge power target");

        tokio::time::sleep(self.idle_time).await;
    }

    /// Grid error plus present charge power, clamped to the configured
    /// window. Commands below the floor collapse to 0 W - the rectifier is
    /// not efficient enough down there to be worth running.
    fn bounded_power_command(&self, error: i32, ac_charge_power: i16) -> i32 {
        let mut power_cmd = i32::from(ac_charge_power) + error;
        if power_cmd > i32::from(self.max_charge_power) {
            power_cmd = i32::from(self.max_charge_power);
        }
        if power_cmd < i32::from(self.min_charge_power) {
            power_cmd = 0;
        }
        power_cmd
    }

    /// Translate an AC power command into a DC max-current command using the
    /// present output voltage, capped so a sagging battery can never pull
    /// more than the configured power limit allows at its lowest voltage.
    fn current_for_power(&self, power: f32, battery_voltage: f32) -> f32 {
        let efficiency = conversion_efficiency(power);
        let amps = round2(0.9876 * efficiency * power / battery_voltage);

        let max_allowed = round2(f32::from(self.max_charge_power) / 47.0);
        if amps > max_allowed {
            warn!(
                max_allowed_amps = max_allowed,
                "allowed maximum charge current reached"
            );
            return max_allowed;
        }
        amps
    }
}

/// Expected AC/DC conversion efficiency of the rectifier at a given power
/// command, measured piecewise on the real unit.
pub fn conversion_efficiency(power_w: f32) -> f32 {
    if (1.0..461.0).contains(&power_w) {
        0.88
    } else if (461.0..704.0).contains(&power_w) {
        0.937
    } else if (704.0..1050.0).contains(&power_w) {
        0.952
    } else if power_w >= 1050.0 {
        0.96
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Charger fake that records every issued current command.
    struct RecordingCharger {
        output_voltage: f32,
        commands: Mutex<Vec<(f32, bool)>>,
    }

    impl RecordingCharger {
        fn new(output_voltage: f32) -> Arc<Self> {
            Arc::new(Self {
                output_voltage,
                commands: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChargerPort for RecordingCharger {
        async fn set_max_voltage(&self, _volts: f32, _nonvolatile: bool) -> Result<()> {
            Ok(())
        }
        async fn set_max_current(&self, amps: f32, nonvolatile: bool) -> Result<()> {
            self.commands.lock().push((amps, nonvolatile));
            Ok(())
        }
        async fn request_status(&self) -> Result<()> {
            Ok(())
        }
        fn current_input_power(&self) -> f32 {
            0.0
        }
        fn current_output_voltage(&self) -> f32 {
            self.output_voltage
        }
        fn current_output_current(&self) -> f32 {
            0.0
        }
    }

    fn regulator(target: i16, threshold: i32, min: i16, max: i16) -> Regulator {
        Regulator::new(&Config {
            target_grid_power: target,
            regulator_error_threshold: threshold,
            min_charge_power: min,
            max_charge_power: max,
            regulator_idle_time_ms: 0,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn first_command_from_surplus() {
        // grid exporting 120 W, not charging yet: err = 120, eta = 0.88
        let charger = RecordingCharger::new(52.5);
        regulator(0, 7, 50, 700).step(-120, 0, &*charger).await;

        let commands = charger.commands.lock();
        assert_eq!(commands.as_slice(), &[(1.99, false)]);
    }

    #[tokio::test]
    async fn command_is_clamped_to_max_charge_power() {
        // err = 1200, 500 + 1200 clamps to 700 W, eta = 0.937 at 700 W
        let charger = RecordingCharger::new(50.0);
        regulator(0, 7, 50, 700).step(-1200, 500, &*charger).await;

        let commands = charger.commands.lock();
        assert_eq!(commands.len(), 1);
        let expected = round2(0.9876 * 0.937 * 700.0 / 50.0);
        assert_eq!(commands[0].0, expected);
    }

    #[tokio::test]
    async fn dead_band_suppresses_actuation() {
        let charger = RecordingCharger::new(52.5);
        regulator(0, 7, 50, 700).step(5, 60, &*charger).await;
        assert!(charger.commands.lock().is_empty());

        // the threshold itself is outside the dead-band
        regulator(0, 7, 50, 700).step(7, 60, &*charger).await;
        assert_eq!(charger.commands.lock().len(), 1);
    }

    #[tokio::test]
    async fn import_above_floor_drops_command_to_zero() {
        // importing 80 W while charging with 100 W: err = -80, cmd = 20 < min
        let charger = RecordingCharger::new(52.5);
        regulator(0, 7, 50, 700).step(80, 100, &*charger).await;

        let commands = charger.commands.lock();
        assert_eq!(commands.as_slice(), &[(0.0, false)]);
    }

    #[test]
    fn current_never_exceeds_low_voltage_ceiling() {
        let reg = regulator(0, 7, 50, 700);
        let ceiling = round2(700.0 / 47.0);
        // a voltage below the clamp window would otherwise yield 16+ A
        assert_eq!(reg.current_for_power(700.0, 40.0), ceiling);
        assert!(reg.current_for_power(700.0, 47.0) <= ceiling);
        assert!(reg.current_for_power(700.0, 53.5) <= ceiling);
    }

    #[tokio::test]
    async fn implausible_output_voltage_is_clamped_before_use() {
        // 12 V from a charger that has not reported yet clamps to 47 V
        let charger = RecordingCharger::new(12.0);
        regulator(0, 7, 50, 700).step(-120, 0, &*charger).await;

        let commands = charger.commands.lock();
        assert_eq!(
            commands.as_slice(),
            &[(round2(0.9876 * 0.88 * 120.0 / 47.0), false)]
        );
    }

    #[rstest::rstest]
    #[case(0.0, 0.0)]
    #[case(0.5, 0.0)]
    #[case(1.0, 0.88)]
    #[case(460.9, 0.88)]
    #[case(461.0, 0.937)]
    #[case(703.9, 0.937)]
    #[case(704.0, 0.952)]
    #[case(1049.9, 0.952)]
    #[case(1050.0, 0.96)]
    #[case(5000.0, 0.96)]
    fn efficiency_bands_have_half_open_boundaries(#[case] power_w: f32, #[case] expected: f32) {
        assert_eq!(conversion_efficiency(power_w), expected);
    }
}
