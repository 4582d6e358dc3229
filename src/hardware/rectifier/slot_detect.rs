//! "Slot detect" standby control.
//!
//! The rectifier only accepts current commands while its slot-detect input is
//! high, as if it were installed in a shelf. Driving the line from a GPIO pin
//! turns it into a remote on/off: high before any non-zero current command,
//! low during prolonged idle to save standby power.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// BCM pin driving the rectifier's slot-detect input, active-high.
pub const SLOT_DETECT_PIN: u8 = 17;

#[cfg(feature = "raspi")]
mod pin {
    use tracing::debug;

    pub struct Pin(Option<rppal::gpio::OutputPin>);

    impl Pin {
        pub fn acquire(bcm_pin: u8) -> Self {
            let pin = rppal::gpio::Gpio::new()
                .and_then(|gpio| gpio.get(bcm_pin))
                .map(|pin| pin.into_output())
                .map_err(|e| debug!(error = %e, "failed to acquire slot-detect GPIO"))
                .ok();
            Self(pin)
        }

        pub fn unused() -> Self {
            Self(None)
        }

        pub fn set_high(&mut self) {
            if let Some(pin) = self.0.as_mut() {
                pin.set_high();
            }
        }

        pub fn set_low(&mut self) {
            if let Some(pin) = self.0.as_mut() {
                pin.set_low();
            }
        }
    }
}

#[cfg(not(feature = "raspi"))]
mod pin {
    /// No-op stand-in off the target platform.
    pub struct Pin;

    impl Pin {
        pub fn acquire(_bcm_pin: u8) -> Self {
            Self
        }

        pub fn unused() -> Self {
            Self
        }

        pub fn set_high(&mut self) {}

        pub fn set_low(&mut self) {}
    }
}

struct State {
    pin: pin::Pin,
    asserted: bool,
    idle_since: Option<Instant>,
}

pub struct SlotDetect {
    enabled: bool,
    keep_alive: Duration,
    state: Mutex<State>,
}

impl SlotDetect {
    /// Acquire the pin and assert it so the rectifier powers up ready for
    /// commands. With `enabled == false` every operation is a no-op.
    pub fn new(enabled: bool, keep_alive: Duration) -> Self {
        let mut pin = if enabled {
            pin::Pin::acquire(SLOT_DETECT_PIN)
        } else {
            pin::Pin::unused()
        };
        if enabled {
            pin.set_high();
        }
        Self {
            enabled,
            keep_alive,
            state: Mutex::new(State {
                pin,
                asserted: enabled,
                idle_since: None,
            }),
        }
    }

    /// Raise the line ahead of a non-zero current command and restart the
    /// idle accounting.
    pub fn ensure_active(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        state.idle_since = None;
        if !state.asserted {
            info!("raising slot detect, waking rectifier from standby");
            state.pin.set_high();
            state.asserted = true;
        }
    }

    /// Called from the keep-alive path with the most recent current command.
    /// A zero setpoint accumulates idle time; once it exceeds the configured
    /// keep-alive window the line is dropped into standby.
    pub fn on_keep_alive(&self, last_current_cmd: f32) {
        if !self.enabled {
            return;
        }
        if last_current_cmd != 0.0 {
            self.state.lock().idle_since = None;
            return;
        }

        let mut state = self.state.lock();
        match state.idle_since {
            None => state.idle_since = Some(Instant::now()),
            Some(since) => {
                if state.asserted && since.elapsed() >= self.keep_alive {
                    info!(
                        idle_secs = since.elapsed().as_secs(),
                        "dropping slot detect, rectifier enters standby"
                    );
                    state.pin.set_low();
                    state.asserted = false;
                }
            }
        }
    }

    /// Drop the line at shutdown.
    pub fn release(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        if state.asserted {
            debug!("releasing slot detect line");
            state.pin.set_low();
            state.asserted = false;
        }
    }
}
