//! CAN driver for the Huawei R4850G2-class rectifier.
//!
//! Owns the raw CAN socket and a worker task that keeps a live mirror of the
//! rectifier parameters, requests a status report every second and refreshes
//! the current setpoint every five seconds so the unit stays in volatile
//! "online" command mode instead of reverting to its stored configuration.

pub mod frame;
pub mod slot_detect;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::tokio::CanSocket;
use socketcan::{CanFrame, EmbeddedFrame};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::domain::{ChargerPort, RectifierParams};
use frame::{Ack, Parameter, ParameterReport};

const STATUS_REQUEST_PERIOD: Duration = Duration::from_secs(1);
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(5);

/// Live mirror of the rectifier state plus command bookkeeping. Separated
/// from the socket so the receive path is testable with synthetic frames.
struct Mirror {
    params: Mutex<RectifierParams>,
    last_current_cmd: Mutex<f32>,
    /// True while a changed current setpoint has not been acknowledged yet.
    ack_pending: AtomicBool,
}

impl Mirror {
    fn new() -> Self {
        Self {
            params: Mutex::new(RectifierParams::default()),
            last_current_cmd: Mutex::new(0.0),
            ack_pending: AtomicBool::new(false),
        }
    }

    fn apply_report(&self, report: ParameterReport) {
        let mut params = self.params.lock();
        match report.parameter {
            Parameter::InputPower => params.input_power = report.value,
            Parameter::InputFrequency => params.input_frequency = report.value,
            Parameter::InputCurrent => params.input_current = report.value,
            Parameter::InputVoltage => params.input_voltage = report.value,
            Parameter::InputTemp => params.input_temp = report.value,
            Parameter::OutputPower => params.output_power = report.value,
            Parameter::Efficiency => params.efficiency = report.value,
            Parameter::OutputVoltage => params.output_voltage = report.value,
            Parameter::OutputCurrent => params.output_current = report.value,
            Parameter::OutputCurrentMax => params.max_output_current = report.value,
            Parameter::OutputTemp => params.output_temp = report.value,
        }
    }

    fn handle_ack(&self, ack: Ack) {
        if ack.error {
            // the regulator re-issues its setpoint on the next cycle anyway
            debug!(opcode = ack.opcode, "rectifier rejected set command");
            return;
        }
        match ack.opcode {
            frame::OP_ONLINE_VOLTAGE => {
                debug!(volts = ack.volts(), "online voltage setpoint applied")
            }
            frame::OP_OFFLINE_VOLTAGE => {
                debug!(volts = ack.volts(), "offline voltage setpoint applied")
            }
            frame::OP_OVERVOLTAGE_PROTECTION => {
                debug!(volts = ack.volts(), "overvoltage protection applied")
            }
            frame::OP_ONLINE_CURRENT => {
                // compare at wire resolution: the echo is the scaled value
                let expected = (*self.last_current_cmd.lock() * frame::CURRENT_SCALE).round() as u32;
                if self.ack_pending.load(Ordering::Acquire) && ack.raw_value == expected {
                    info!(amps = ack.amps(), "online current setpoint acknowledged");
                    self.ack_pending.store(false, Ordering::Release);
                }
            }
            frame::OP_OFFLINE_CURRENT => {
                debug!(amps = ack.amps(), "offline current setpoint applied")
            }
            other => debug!(opcode = other, "acknowledgement for unknown parameter"),
        }
    }

    fn dispatch(&self, can_frame: &CanFrame) {
        match frame::raw_id(can_frame) {
            frame::ID_PARAMETER_REPORT => {
                if let Some(report) = ParameterReport::decode(can_frame.data()) {
                    self.apply_report(report);
                }
            }
            frame::ID_COMMAND_ACK => {
                if let Some(ack) = Ack::decode(can_frame.data()) {
                    self.handle_ack(ack);
                }
            }
            frame::ID_DESCRIPTOR => {}
            other => trace!(id = %format!("{other:08X}"), "ignoring unknown CAN frame"),
        }
    }
}

pub struct RectifierClient {
    socket: CanSocket,
    mirror: Mirror,
    slot_detect: slot_detect::SlotDetect,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RectifierClient {
    /// Open the CAN interface and start the worker task. The worker sends the
    /// configured absorption voltage as initial setpoint and asks for a first
    /// status report before entering its receive loop.
    pub fn setup(cfg: &Config) -> Result<Arc<Self>> {
        let socket = CanSocket::open(&cfg.can_interface)
            .with_context(|| format!("failed to open CAN interface {}", cfg.can_interface))?;

        let client = Arc::new(Self {
            socket,
            mirror: Mirror::new(),
            slot_detect: slot_detect::SlotDetect::new(
                cfg.slot_detect_enabled,
                Duration::from_secs(u64::from(cfg.slot_detect_keep_alive_s)),
            ),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run(Arc::clone(&client), cfg.absorption_voltage));
        *client.worker.lock() = Some(handle);

        Ok(client)
    }

    async fn run(self: Arc<Self>, absorption_voltage: f32) {
        info!("rectifier worker task running");

        if let Err(e) = self.set_max_voltage(absorption_voltage, false).await {
            warn!(error = %e, "failed to send initial voltage command");
        }
        if let Err(e) = self.request_status().await {
            warn!(error = %e, "failed to request initial status report");
        }

        let start = tokio::time::Instant::now();
        let mut status_tick =
            tokio::time::interval_at(start + STATUS_REQUEST_PERIOD, STATUS_REQUEST_PERIOD);
        let mut keep_alive_tick =
            tokio::time::interval_at(start + KEEP_ALIVE_PERIOD, KEEP_ALIVE_PERIOD);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keep_alive_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.read_frame() => match received {
                    Ok(can_frame) => self.mirror.dispatch(&can_frame),
                    // CAN link faults are transient, keep listening
                    Err(e) => warn!(error = %e, "problem reading CAN frame"),
                },
                _ = status_tick.tick() => {
                    if let Err(e) = self.request_status().await {
                        warn!(error = %e, "failed to request status report");
                    }
                }
                _ = keep_alive_tick.tick() => self.keep_alive().await,
            }
        }

        debug!("rectifier worker task finished");
    }

    /// Retransmit the latest current setpoint so the rectifier stays in
    /// online mode, and run the slot-detect standby accounting.
    async fn keep_alive(&self) {
        let last = *self.mirror.last_current_cmd.lock();
        if let Err(e) = self.send_current(last, false).await {
            warn!(error = %e, "failed to refresh current setpoint");
        }
        self.slot_detect.on_keep_alive(last);
    }

    async fn send_current(&self, amps: f32, nonvolatile: bool) -> Result<()> {
        if amps > 0.0 {
            // the rectifier ignores current commands while in standby
            self.slot_detect.ensure_active();
        }

        self.socket
            .write_frame(frame::set_current_frame(amps, nonvolatile))
            .await
            .context("failed to send current command")?;

        let mut last = self.mirror.last_current_cmd.lock();
        if amps != *last {
            self.mirror.ack_pending.store(true, Ordering::Release);
            info!(amps, "sent new current command");
            *last = amps;
        }
        Ok(())
    }

    /// Stop the worker, release the slot-detect line and close the socket.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.slot_detect.release();
    }

    pub fn params(&self) -> RectifierParams {
        *self.mirror.params.lock()
    }
}

#[async_trait]
impl ChargerPort for RectifierClient {
    async fn set_max_voltage(&self, volts: f32, nonvolatile: bool) -> Result<()> {
        self.socket
            .write_frame(frame::set_voltage_frame(volts, nonvolatile))
            .await
            .context("failed to send voltage command")
    }

    async fn set_max_current(&self, amps: f32, nonvolatile: bool) -> Result<()> {
        self.send_current(amps, nonvolatile).await
    }

    async fn request_status(&self) -> Result<()> {
        self.socket
            .write_frame(frame::status_request_frame())
            .await
            .context("failed to send status request")
    }

    fn current_input_power(&self) -> f32 {
        self.mirror.params.lock().input_power
    }

    fn current_output_voltage(&self) -> f32 {
        self.mirror.params.lock().output_voltage
    }

    fn current_output_current(&self) -> f32 {
        self.mirror.params.lock().output_current
    }
}
