//! Modbus/TCP poller for three-phase grid power meters (Shelly Pro 3EM
//! class). Reads the total active power register pair, merges the reading
//! with the rectifier's current AC input power and pushes the result onto
//! the measurement bus.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MeasurementBus;
use crate::config::Config;
use crate::domain::{ChargerPort, GridLoadState, MeterControl};

/// Total active power of the Shelly Pro 3EM: two input registers holding one
/// big-endian (ABCD) IEEE-754 float.
const POWER_REG_ADDR: u16 = 1014;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
/// Polling period while the inverter's own limiter governs the loop.
const SLOW_POLLING_PERIOD_MS: u64 = 4000;

/// Meter readings outside this window are physically implausible and dropped.
pub const PLAUSIBLE_POWER_RANGE_W: std::ops::RangeInclusive<i32> = -30000..=20000;

pub struct ModbusMeter {
    addr: SocketAddr,
    /// Current polling period in ms; the worker picks changes up on its next
    /// sleep.
    polling_period_ms: AtomicU64,
    configured_period_ms: u64,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ModbusMeter {
    /// Connect to the meter and start the polling worker. Setup failure is
    /// fatal for the process: the controller cannot make safe decisions
    /// without grid measurements.
    pub async fn setup(
        cfg: &Config,
        bus: Arc<MeasurementBus>,
        charger: Arc<dyn ChargerPort>,
    ) -> Result<Arc<Self>> {
        let addr: SocketAddr = format!(
            "{}:{}",
            cfg.powermeter_modbus_ip, cfg.powermeter_modbus_port
        )
        .parse()
        .context("invalid powermeter address")?;

        let ctx = connect(addr).await?;
        info!(%addr, "connected to modbus powermeter");

        let meter = Arc::new(Self {
            addr,
            polling_period_ms: AtomicU64::new(cfg.powermeter_modbus_polling_period_ms),
            configured_period_ms: cfg.powermeter_modbus_polling_period_ms,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&meter).run(ctx, bus, charger));
        *meter.worker.lock() = Some(handle);

        Ok(meter)
    }

    async fn run(
        self: Arc<Self>,
        mut ctx: Context,
        bus: Arc<MeasurementBus>,
        charger: Arc<dyn ChargerPort>,
    ) {
        debug!("powermeter polling task running");

        loop {
            match read_power(&mut ctx).await {
                Ok(value) => {
                    if let Some(sample) = plausible_sample(value, charger.current_input_power()) {
                        bus.push(sample);
                    }
                }
                Err(e) if is_connection_error(&e) => {
                    warn!(error = %e, "powermeter connection lost, attempting to reconnect");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    match connect(self.addr).await {
                        Ok(fresh) => {
                            ctx = fresh;
                            info!("reconnected to modbus powermeter");
                        }
                        Err(e) => warn!(error = %e, "reconnection attempt failed"),
                    }
                }
                Err(e) => warn!(error = %e, "powermeter read failed, skipping sample"),
            }

            let period = Duration::from_millis(self.polling_period_ms.load(Ordering::Relaxed));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }

        debug!("powermeter polling task finished");
    }

    /// Stop the worker and close the connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl MeterControl for ModbusMeter {
    fn increase_polling_rate(&self) {
        self.polling_period_ms
            .store(self.configured_period_ms, Ordering::Relaxed);
        info!("increased powermeter polling rate for regulation");
    }

    fn decrease_polling_rate(&self) {
        self.polling_period_ms
            .store(SLOW_POLLING_PERIOD_MS, Ordering::Relaxed);
        info!("decreased powermeter polling rate");
    }
}

/// Open the TCP transport with keep-alive probing enabled and hand it to the
/// Modbus client. Long idle periods between slow polls must not let a NAT or
/// the meter silently drop the connection.
async fn connect(addr: SocketAddr) -> Result<Context> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to powermeter at {addr}"))?;

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10))
        .with_retries(5);
    SockRef::from(&stream)
        .set_tcp_keepalive(&keepalive)
        .context("failed to configure TCP keep-alive")?;

    Ok(tcp::attach(stream))
}

async fn read_power(ctx: &mut Context) -> std::io::Result<f32> {
    let registers = tokio::time::timeout(
        RESPONSE_TIMEOUT,
        ctx.read_input_registers(POWER_REG_ADDR, 2),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "modbus response timeout"))??;

    Ok(decode_power_f32(&registers))
}

/// Combine the two 16-bit registers as a big-endian (ABCD) float.
pub fn decode_power_f32(registers: &[u16]) -> f32 {
    let bytes = [
        (registers[0] >> 8) as u8,
        registers[0] as u8,
        (registers[1] >> 8) as u8,
        registers[1] as u8,
    ];
    BigEndian::read_f32(&bytes)
}

/// Round a raw meter reading and compose the bus sample, or drop it when it
/// falls outside the physically plausible window.
pub fn plausible_sample(value: f32, psu_ac_input_power: f32) -> Option<GridLoadState> {
    let power = value.round() as i32;
    if !PLAUSIBLE_POWER_RANGE_W.contains(&power) {
        warn!(power, "received implausible power state value, ignoring");
        return None;
    }
    Some(GridLoadState {
        grid_power_w: power as i16,
        psu_ac_input_power_w: psu_ac_input_power as i16,
    })
}

fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof
    ) || e.raw_os_error() == Some(9) // EBADF, stale descriptor after a close
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_abcd_float_registers() {
        // -120.5f32 = 0xC2F10000 -> registers C2F1, 0000
        let registers = [0xC2F1, 0x0000];
        assert_eq!(decode_power_f32(&registers), -120.5);

        let registers = [0x0000, 0x0000];
        assert_eq!(decode_power_f32(&registers), 0.0);
    }

    #[test]
    fn sample_carries_rounded_power_and_psu_share() {
        let sample = plausible_sample(-120.4, 60.9).unwrap();
        assert_eq!(sample.grid_power_w, -120);
        assert_eq!(sample.psu_ac_input_power_w, 60);

        let sample = plausible_sample(149.5, 0.0).unwrap();
        assert_eq!(sample.grid_power_w, 150);
    }

    #[test]
    fn implausible_readings_are_dropped() {
        assert!(plausible_sample(-30001.0, 0.0).is_none());
        assert!(plausible_sample(20001.0, 0.0).is_none());
        // bounds themselves are accepted
        assert!(plausible_sample(-30000.0, 0.0).is_some());
        assert!(plausible_sample(20000.0, 0.0).is_some());
    }

    #[test]
    fn connection_errors_are_distinguished_from_transient_ones() {
        use std::io::{Error, ErrorKind};
        assert!(is_connection_error(&Error::new(ErrorKind::BrokenPipe, "")));
        assert!(is_connection_error(&Error::new(ErrorKind::ConnectionReset, "")));
        assert!(is_connection_error(&Error::from_raw_os_error(9)));
        assert!(!is_connection_error(&Error::new(ErrorKind::TimedOut, "")));
        assert!(!is_connection_error(&Error::new(ErrorKind::InvalidData, "")));
    }
}
