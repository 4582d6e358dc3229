use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

/// Default config file, read from the working directory.
pub const CONFIG_FILE: &str = "config.txt";

const DEFAULT_SLOT_DETECT_KEEP_ALIVE_S: u32 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

/// Which producer feeds grid samples onto the measurement bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterSourceKind {
    /// Modbus/TCP power meter (Shelly Pro 3EM class), polled periodically.
    Modbus,
    /// Tasmota-style UDP push meter.
    Udp,
}

/// Runtime configuration, loaded once at startup and handed to each component
/// by reference.
///
/// The file format is one `key : value` pair per line; `#` introduces a
/// comment and blank lines are ignored. A line that fails to parse keeps the
/// built-in default for its key.
#[derive(Debug, Clone)]
pub struct Config {
    pub can_interface: String,
    pub udp_listener_port: u16,

    /// Regulator set-point for net grid power (W, positive = import).
    pub target_grid_power: i16,
    /// Power commands below this floor collapse to 0 W.
    pub min_charge_power: i16,
    pub max_charge_power: i16,
    /// Dead-band: deviations smaller than this are not compensated (W).
    pub regulator_error_threshold: i32,
    /// Cool-down after each actuation before the next sample is processed (ms).
    pub regulator_idle_time_ms: u64,
    /// Initial voltage command sent to the charger at startup (V).
    pub absorption_voltage: f32,

    pub scheduled_exit_enabled: bool,
    pub scheduled_exit_hour: u32,
    pub scheduled_exit_minute: u32,

    pub slot_detect_enabled: bool,
    pub slot_detect_keep_alive_s: u32,

    pub opendtu_hostname: String,
    pub opendtu_admin_user: String,
    pub opendtu_admin_password: String,
    pub opendtu_battery_inverter_id: String,
    pub opendtu_start_discharge_voltage: f32,
    pub opendtu_stop_discharge_voltage: f32,

    pub powermeter_source: MeterSourceKind,
    pub powermeter_modbus_ip: String,
    pub powermeter_modbus_port: u16,
    pub powermeter_modbus_polling_period_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            can_interface: "can0".into(),
            udp_listener_port: 2000,
            target_grid_power: 0,
            min_charge_power: 50,
            max_charge_power: 700,
            regulator_error_threshold: 7,
            regulator_idle_time_ms: 1200,
            absorption_voltage: 52.5,
            scheduled_exit_enabled: false,
            scheduled_exit_hour: 18,
            scheduled_exit_minute: 22,
            slot_detect_enabled: false,
            slot_detect_keep_alive_s: DEFAULT_SLOT_DETECT_KEEP_ALIVE_S,
            opendtu_hostname: "opendtu.local".into(),
            opendtu_admin_user: "admin".into(),
            opendtu_admin_password: "openDTU42".into(),
            opendtu_battery_inverter_id: "0".into(),
            opendtu_start_discharge_voltage: 49.0,
            opendtu_stop_discharge_voltage: 48.3,
            powermeter_source: MeterSourceKind::Modbus,
            powermeter_modbus_ip: "192.168.1.240".into(),
            powermeter_modbus_port: 502,
            powermeter_modbus_polling_period_ms: 1000,
        }
    }
}

impl Config {
    /// Load configuration from a `key : value` text file. Missing keys keep
    /// their defaults; malformed lines and unknown keys are logged and
    /// skipped. Only a missing/unreadable file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg = Self::default();
        for line in text.lines() {
            cfg.parse_line(line);
        }
        Ok(cfg)
    }

    fn parse_line(&mut self, line: &str) {
        // strip all whitespace; neither keys nor values contain any
        let line: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if line.is_empty() || line.starts_with('#') {
            return;
        }

        let Some((key, value)) = line.split_once(':') else {
            warn!(line = %line, "invalid line in config file");
            return;
        };

        match key {
            "can-interface" => self.can_interface = value.into(),
            "udp-listener-port" => parse_into(key, value, &mut self.udp_listener_port),
            "target-grid-power" => parse_into(key, value, &mut self.target_grid_power),
            "min-charge-power" => parse_into(key, value, &mut self.min_charge_power),
            "max-charge-power" => parse_into(key, value, &mut self.max_charge_power),
            "regulator-error-threshold" => {
                parse_into(key, value, &mut self.regulator_error_threshold)
            }
            "regulator-idle-time" => parse_into(key, value, &mut self.regulator_idle_time_ms),
            "absorption-voltage" => parse_into(key, value, &mut self.absorption_voltage),
            "scheduled-exit-enabled" => self.scheduled_exit_enabled = value == "true",
            "scheduled-exit-hour" => {
                parse_into(key, value, &mut self.scheduled_exit_hour);
                if self.scheduled_exit_hour > 23 {
                    warn!("scheduled-exit-hour out of range, clamping to 23");
                    self.scheduled_exit_hour = 23;
                }
            }
            "scheduled-exit-minute" => {
                parse_into(key, value, &mut self.scheduled_exit_minute);
                if self.scheduled_exit_minute > 59 {
                    warn!("scheduled-exit-minute out of range, clamping to 59");
                    self.scheduled_exit_minute = 59;
                }
            }
            "slotdetect-control-enabled" => self.slot_detect_enabled = value == "true",
            "slotdetect-keep-alive-time" => {
                parse_into(key, value, &mut self.slot_detect_keep_alive_s);
                if self.slot_detect_keep_alive_s < 10 {
                    warn!("slot detect keep alive time must be at least 10 seconds, using default");
                    self.slot_detect_keep_alive_s = DEFAULT_SLOT_DETECT_KEEP_ALIVE_S;
                }
            }
            "opendtu-hostname" => self.opendtu_hostname = value.into(),
            "opendtu-admin-user" => self.opendtu_admin_user = value.into(),
            "opendtu-admin-password" => self.opendtu_admin_password = value.into(),
            "opendtu-battery-inverter-id" => self.opendtu_battery_inverter_id = value.into(),
            "opendtu-start-discharge-voltage" => {
                parse_into(key, value, &mut self.opendtu_start_discharge_voltage)
            }
            "opendtu-stop-discharge-voltage" => {
                parse_into(key, value, &mut self.opendtu_stop_discharge_voltage)
            }
            "powermeter-source" => match value {
                "modbus" => self.powermeter_source = MeterSourceKind::Modbus,
                "udp" => self.powermeter_source = MeterSourceKind::Udp,
                _ => warn!(value, "unknown powermeter source, keeping default"),
            },
            "powermeter-modbus-ip" => self.powermeter_modbus_ip = value.into(),
            "powermeter-modbus-port" => parse_into(key, value, &mut self.powermeter_modbus_port),
            "powermeter-modbus-polling-period" => {
                parse_into(key, value, &mut self.powermeter_modbus_polling_period_ms)
            }
            _ => warn!(key, "unknown config variable"),
        }
    }

    /// Log the effective configuration at startup.
    pub fn log_summary(&self) {
        info!("CAN interface:              {}", self.can_interface);
        info!("UDP listener port:          {}", self.udp_listener_port);
        info!("Target grid power:          {} W", self.target_grid_power);
        info!("Min charge power:           {} W", self.min_charge_power);
        info!("Max charge power:           {} W", self.max_charge_power);
        info!(
            "Regulator error threshold:  {} W",
            self.regulator_error_threshold
        );
        info!(
            "Regulator idle time:        {} ms",
            self.regulator_idle_time_ms
        );
        info!("Charger absorption voltage: {} V", self.absorption_voltage);
        info!(
            "Scheduled exit:             {}",
            if self.scheduled_exit_enabled {
                format!("{:02}:{:02}", self.scheduled_exit_hour, self.scheduled_exit_minute)
            } else {
                "disabled".into()
            }
        );
        info!(
            "Slot detect control:        {}",
            if self.slot_detect_enabled { "active" } else { "not active" }
        );
        info!(
            "Slot detect keep alive:     {} s",
            self.slot_detect_keep_alive_s
        );
        info!("OpenDTU host:               http://{}", self.opendtu_hostname);
        info!(
            "OpenDTU inverter id:        {}",
            self.opendtu_battery_inverter_id
        );
        info!(
            "OpenDTU start discharge:    {} V",
            self.opendtu_start_discharge_voltage
        );
        info!(
            "OpenDTU stop discharge:     {} V",
            self.opendtu_stop_discharge_voltage
        );
        info!(
            "Powermeter Modbus target:   {}:{} every {} ms",
            self.powermeter_modbus_ip,
            self.powermeter_modbus_port,
            self.powermeter_modbus_polling_period_ms
        );
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "failed to parse config value, keeping default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(text: &str) -> Config {
        let mut cfg = Config::default();
        for line in text.lines() {
            cfg.parse_line(line);
        }
        cfg
    }

    #[test]
    fn defaults_match_reference_values() {
        let cfg = Config::default();
        assert_eq!(cfg.can_interface, "can0");
        assert_eq!(cfg.target_grid_power, 0);
        assert_eq!(cfg.min_charge_power, 50);
        assert_eq!(cfg.max_charge_power, 700);
        assert_eq!(cfg.regulator_error_threshold, 7);
        assert_eq!(cfg.regulator_idle_time_ms, 1200);
        assert_eq!(cfg.absorption_voltage, 52.5);
        assert!(!cfg.scheduled_exit_enabled);
        assert!(!cfg.slot_detect_enabled);
    }

    #[test]
    fn parses_key_value_lines_with_whitespace() {
        let cfg = parse(
            "target-grid-power : 5\n\
             max-charge-power:650\n\
             absorption-voltage :  52.0\n\
             can-interface : can1\n",
        );
        assert_eq!(cfg.target_grid_power, 5);
        assert_eq!(cfg.max_charge_power, 650);
        assert_eq!(cfg.absorption_voltage, 52.0);
        assert_eq!(cfg.can_interface, "can1");
    }

    #[test]
    fn skips_comments_blanks_and_malformed_lines() {
        let cfg = parse(
            "# a comment\n\
             \n\
             not a pair\n\
             min-charge-power : 60\n",
        );
        assert_eq!(cfg.min_charge_power, 60);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = parse("does-not-exist : 1\ntarget-grid-power : 3\n");
        assert_eq!(cfg.target_grid_power, 3);
    }

    #[test]
    fn bad_numeric_value_keeps_default() {
        let cfg = parse("max-charge-power : seven-hundred\n");
        assert_eq!(cfg.max_charge_power, 700);
    }

    #[test]
    fn scheduled_exit_time_is_clamped() {
        let cfg = parse(
            "scheduled-exit-enabled : true\n\
             scheduled-exit-hour : 99\n\
             scheduled-exit-minute : 75\n",
        );
        assert!(cfg.scheduled_exit_enabled);
        assert_eq!(cfg.scheduled_exit_hour, 23);
        assert_eq!(cfg.scheduled_exit_minute, 59);
    }

    #[test]
    fn short_keep_alive_resets_to_default() {
        let cfg = parse("slotdetect-keep-alive-time : 3\n");
        assert_eq!(cfg.slot_detect_keep_alive_s, 60);

        let cfg = parse("slotdetect-keep-alive-time : 10\n");
        assert_eq!(cfg.slot_detect_keep_alive_s, 10);
    }

    #[test]
    fn load_reads_a_real_file() {
        let dir = std::env::temp_dir().join("energy-manager-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# test config").unwrap();
        writeln!(file, "opendtu-hostname : dtu.example").unwrap();
        writeln!(file, "powermeter-modbus-polling-period : 800").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.opendtu_hostname, "dtu.example");
        assert_eq!(cfg.powermeter_modbus_polling_period_ms, 800);

        assert!(Config::load(dir.join("missing.txt")).is_err());
    }
}
