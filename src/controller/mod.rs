pub mod fsm;
pub mod regulator;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::MeasurementBus;
use crate::config::Config;
use crate::domain::{clamp_battery_voltage, ChargerPort, GridLoadState, InverterPort, MeterControl};
use fsm::Fsm;

/// Pause between bus polls when no fresh sample is available.
const EMPTY_BUS_BACKOFF: Duration = Duration::from_millis(100);

/// The measurement pull loop: pops the freshest grid sample off the bus,
/// refreshes the inverter state and feeds both into the state machine.
pub struct Controller {
    bus: Arc<MeasurementBus>,
    inverter: Arc<dyn InverterPort>,
    fsm: Fsm,
    scheduled_exit: Option<(u32, u32)>,
}

impl Controller {
    pub fn new(
        cfg: &Config,
        bus: Arc<MeasurementBus>,
        charger: Arc<dyn ChargerPort>,
        inverter: Arc<dyn InverterPort>,
        meter: Arc<dyn MeterControl>,
    ) -> Self {
        Self {
            bus,
            inverter: Arc::clone(&inverter),
            fsm: Fsm::new(cfg, charger, inverter, meter),
            scheduled_exit: cfg
                .scheduled_exit_enabled
                .then_some((cfg.scheduled_exit_hour, cfg.scheduled_exit_minute)),
        }
    }

    /// Run until cancellation or the scheduled exit time.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("controller loop running");
        let mut sample = GridLoadState::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.scheduled_exit_due(Local::now().time()) {
                info!("scheduled exit time reached, closing down");
                break;
            }

            if !self.bus.try_pop_latest(&mut sample) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(EMPTY_BUS_BACKOFF) => {}
                }
                continue;
            }

            self.inverter.fetch_current_state().await;
            let battery_voltage = clamp_battery_voltage(self.inverter.battery_voltage());
            let inverter_power = self.inverter.battery_to_grid_power();

            self.fsm.update(sample, inverter_power, battery_voltage).await;
        }

        debug!("controller loop finished");
    }

    fn scheduled_exit_due(&self, now: chrono::NaiveTime) -> bool {
        let Some((hour, minute)) = self.scheduled_exit else {
            return false;
        };
        (now.hour(), now.minute()) >= (hour, minute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn controller_with_exit(exit: Option<(u32, u32)>) -> Controller {
        use anyhow::Result;
        use async_trait::async_trait;

        struct NullCharger;
        #[async_trait]
        impl ChargerPort for NullCharger {
            async fn set_max_voltage(&self, _v: f32, _nv: bool) -> Result<()> {
                Ok(())
            }
            async fn set_max_current(&self, _a: f32, _nv: bool) -> Result<()> {
                Ok(())
            }
            async fn request_status(&self) -> Result<()> {
                Ok(())
            }
            fn current_input_power(&self) -> f32 {
                0.0
            }
            fn current_output_voltage(&self) -> f32 {
                52.5
            }
            fn current_output_current(&self) -> f32 {
                0.0
            }
        }

        struct NullInverter;
        #[async_trait]
        impl InverterPort for NullInverter {
            async fn fetch_current_state(&self) {}
            async fn enable_dpl(&self) {}
            async fn disable_dpl(&self) {}
            fn battery_voltage(&self) -> f32 {
                49.0
            }
            fn battery_to_grid_power(&self) -> f32 {
                0.0
            }
            fn dpl_enabled(&self) -> bool {
                false
            }
        }

        struct NullMeter;
        impl MeterControl for NullMeter {
            fn increase_polling_rate(&self) {}
            fn decrease_polling_rate(&self) {}
        }

        let cfg = Config {
            scheduled_exit_enabled: exit.is_some(),
            scheduled_exit_hour: exit.map(|(h, _)| h).unwrap_or_default(),
            scheduled_exit_minute: exit.map(|(_, m)| m).unwrap_or_default(),
            ..Config::default()
        };
        Controller::new(
            &cfg,
            Arc::new(MeasurementBus::new()),
            Arc::new(NullCharger),
            Arc::new(NullInverter),
            Arc::new(NullMeter),
        )
    }

    #[test]
    fn scheduled_exit_fires_at_and_after_the_configured_time() {
        let controller = controller_with_exit(Some((18, 22)));
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();

        assert!(!controller.scheduled_exit_due(t(18, 21)));
        assert!(controller.scheduled_exit_due(t(18, 22)));
        assert!(controller.scheduled_exit_due(t(18, 40)));
        assert!(controller.scheduled_exit_due(t(19, 5)));
        assert!(!controller.scheduled_exit_due(t(17, 59)));
    }

    #[test]
    fn scheduled_exit_disabled_never_fires() {
        let controller = controller_with_exit(None);
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        assert!(!controller.scheduled_exit_due(noon));
    }
}
