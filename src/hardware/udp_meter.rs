//! Push-style grid meter ingest: a Tasmota-class meter sends the current net
//! grid power as an ASCII integer in small UDP datagrams. Interchangeable
//! with the Modbus poller; both feed the same measurement bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MeasurementBus;
use crate::config::Config;
use crate::domain::{ChargerPort, GridLoadState, MeterControl};
use crate::hardware::powermeter::PLAUSIBLE_POWER_RANGE_W;

/// After this long without a datagram the meter is considered down.
const SILENCE_WATCHDOG: Duration = Duration::from_secs(60);
/// Synthetic import pushed on watchdog expiry; large enough to drive the
/// regulator's charge command to zero.
const WATCHDOG_POWER_W: i16 = 30000;

const MAX_DATAGRAM: usize = 1024;

pub struct UdpMeter {
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UdpMeter {
    /// Bind the listener socket and start the receive task. A failing bind is
    /// fatal, like a failing Modbus setup.
    pub async fn setup(
        cfg: &Config,
        bus: Arc<MeasurementBus>,
        charger: Arc<dyn ChargerPort>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", cfg.udp_listener_port))
            .await
            .with_context(|| {
                format!("failed to bind UDP socket on port {}", cfg.udp_listener_port)
            })?;
        info!(port = cfg.udp_listener_port, "UDP meter listener running");

        let meter = Arc::new(Self {
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&meter).run(socket, bus, charger));
        *meter.worker.lock() = Some(handle);

        Ok(meter)
    }

    async fn run(
        self: Arc<Self>,
        socket: UdpSocket,
        bus: Arc<MeasurementBus>,
        charger: Arc<dyn ChargerPort>,
    ) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = tokio::time::timeout(SILENCE_WATCHDOG, socket.recv_from(&mut buf)) => received,
            };

            match received {
                Err(_elapsed) => {
                    warn!(
                        "no meter datagram for {}s, forcing charge power to zero",
                        SILENCE_WATCHDOG.as_secs()
                    );
                    bus.push(GridLoadState {
                        grid_power_w: WATCHDOG_POWER_W,
                        psu_ac_input_power_w: charger.current_input_power() as i16,
                    });
                }
                Ok(Ok((len, _peer))) => {
                    if let Some(power) = parse_datagram(&buf[..len]) {
                        debug!(power, "received updated power state");
                        bus.push(GridLoadState {
                            grid_power_w: power,
                            psu_ac_input_power_w: charger.current_input_power() as i16,
                        });
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "UDP receive failed"),
            }
        }

        debug!("UDP meter task finished");
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl MeterControl for UdpMeter {
    // push-based source, the sender dictates the rate
    fn increase_polling_rate(&self) {
        debug!("polling rate request ignored, meter is push-based");
    }

    fn decrease_polling_rate(&self) {
        debug!("polling rate request ignored, meter is push-based");
    }
}

/// Parse one datagram: an ASCII integer watt value within the plausible
/// range. Anything else was likely corrupted in transit and is dropped.
fn parse_datagram(payload: &[u8]) -> Option<i16> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    let power: i32 = match text.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(?payload, "unparsable meter datagram, ignoring");
            return None;
        }
    };
    if !PLAUSIBLE_POWER_RANGE_W.contains(&power) {
        warn!(power, "received invalid power state value, ignoring");
        return None;
    }
    Some(power as i16)
}
