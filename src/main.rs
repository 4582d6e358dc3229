use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use energy_manager::bus::MeasurementBus;
use energy_manager::config::{Config, CONFIG_FILE};
use energy_manager::controller::Controller;
use energy_manager::domain::{ChargerPort, InverterPort};
use energy_manager::hardware::opendtu::OpenDtuClient;
use energy_manager::hardware::rectifier::RectifierClient;
use energy_manager::hardware::MeterService;
use energy_manager::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = telemetry::init_tracing();
    info!("energy manager starting");

    let cfg = match Config::load(CONFIG_FILE) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "no usable config file, continuing with defaults");
            Config::default()
        }
    };
    cfg.log_summary();

    let bus = Arc::new(MeasurementBus::new());

    // transport setup is fatal: without its inputs the controller cannot
    // make safe decisions
    let rectifier = RectifierClient::setup(&cfg)?;
    let charger: Arc<dyn ChargerPort> = rectifier.clone();

    let inverter = Arc::new(OpenDtuClient::new(&cfg)?);
    inverter.fetch_initial_dpl_state().await;

    let meter = MeterService::setup(&cfg, Arc::clone(&bus), Arc::clone(&charger)).await?;

    info!("setup completed");

    let cancel = CancellationToken::new();
    let controller = Controller::new(
        &cfg,
        Arc::clone(&bus),
        charger,
        inverter as Arc<dyn InverterPort>,
        meter.control(),
    );
    let mut controller_task = tokio::spawn(controller.run(cancel.clone()));

    tokio::select! {
        _ = telemetry::shutdown_signal() => cancel.cancel(),
        // the controller returns on its own at the scheduled exit time
        _ = &mut controller_task => {}
    }

    if !controller_task.is_finished() {
        let _ = controller_task.await;
    }

    meter.shutdown().await;
    rectifier.shutdown().await;
    bus.clear();

    info!("energy manager stopped");
    Ok(())
}
