pub mod opendtu;
pub mod powermeter;
pub mod rectifier;
pub mod udp_meter;

use std::sync::Arc;

use anyhow::Result;

use crate::bus::MeasurementBus;
use crate::config::{Config, MeterSourceKind};
use crate::domain::{ChargerPort, MeterControl};

/// The configured grid meter producer. Both variants satisfy the same
/// contract: push plausible `GridLoadState` samples onto the bus and accept
/// polling-rate adjustments from the controller.
pub enum MeterService {
    Modbus(Arc<powermeter::ModbusMeter>),
    Udp(Arc<udp_meter::UdpMeter>),
}

impl MeterService {
    pub async fn setup(
        cfg: &Config,
        bus: Arc<MeasurementBus>,
        charger: Arc<dyn ChargerPort>,
    ) -> Result<Self> {
        match cfg.powermeter_source {
            MeterSourceKind::Modbus => Ok(Self::Modbus(
                powermeter::ModbusMeter::setup(cfg, bus, charger).await?,
            )),
            MeterSourceKind::Udp => Ok(Self::Udp(
                udp_meter::UdpMeter::setup(cfg, bus, charger).await?,
            )),
        }
    }

    pub fn control(&self) -> Arc<dyn MeterControl> {
        match self {
            Self::Modbus(meter) => Arc::clone(meter) as Arc<dyn MeterControl>,
            Self::Udp(meter) => Arc::clone(meter) as Arc<dyn MeterControl>,
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Self::Modbus(meter) => meter.shutdown().await,
            Self::Udp(meter) => meter.shutdown().await,
        }
    }
}
