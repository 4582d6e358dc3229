use anyhow::Result;
use async_trait::async_trait;

/// Command surface of the rectifier/charger as seen by the controller.
///
/// Setters never wait for the hardware to acknowledge; they fail only when
/// the frame cannot be written to the bus. Snapshot getters return the last
/// reported value (0.0 until the first status report arrives).
#[async_trait]
pub trait ChargerPort: Send + Sync {
    async fn set_max_voltage(&self, volts: f32, nonvolatile: bool) -> Result<()>;
    async fn set_max_current(&self, amps: f32, nonvolatile: bool) -> Result<()>;
    async fn request_status(&self) -> Result<()>;

    fn current_input_power(&self) -> f32;
    fn current_output_voltage(&self) -> f32;
    fn current_output_current(&self) -> f32;
}

/// Command/measurement surface of the battery inverter behind OpenDTU.
///
/// All operations are best-effort: failures are logged by the implementation
/// and leave the last known measurements in place. The controller simply
/// retries on its next iteration.
#[async_trait]
pub trait InverterPort: Send + Sync {
    /// Refresh `battery_voltage` / `battery_to_grid_power` from the device.
    async fn fetch_current_state(&self);

    async fn enable_dpl(&self);
    async fn disable_dpl(&self);

    fn battery_voltage(&self) -> f32;
    fn battery_to_grid_power(&self) -> f32;
    fn dpl_enabled(&self) -> bool;
}

/// Polling-rate control of whichever grid meter source is configured.
pub trait MeterControl: Send + Sync {
    /// Switch to the configured (fast) polling period for regulation.
    fn increase_polling_rate(&self);
    /// Switch to the slow 4 s period while the inverter DPL runs the loop.
    fn decrease_polling_rate(&self);
}
