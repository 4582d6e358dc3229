//! Finite state machine deciding between idling, charging the battery from
//! PV surplus and discharging it through the inverter.
//!
//! Transitions are driven by debounced event predicates over the live
//! measurements: a predicate must hold continuously for its dwell time
//! before the event fires, so short load spikes or passing clouds do not
//! flap the plant between states.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::config::Config;
use crate::controller::regulator::Regulator;
use crate::domain::{ChargerPort, GridLoadState, InverterPort, MeterControl};

const IDLE_THROTTLE: Duration = Duration::from_secs(2);

const PV_OVERPRODUCTION_DWELL: Duration = Duration::from_secs(50);
const HIGH_DEMAND_DWELL: Duration = Duration::from_secs(15);
const BATTERY_FULL_DWELL: Duration = Duration::from_secs(200);
const BATTERY_LOW_DWELL: Duration = Duration::from_secs(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Charging,
    Discharging,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Idle => write!(f, "IDLE"),
            State::Charging => write!(f, "CHARGING"),
            State::Discharging => write!(f, "DISCHARGING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    PvOverproduction,
    HighDemand,
    BatteryFull,
    BatteryLow,
}

const EVENTS: [Event; 4] = [
    Event::PvOverproduction,
    Event::HighDemand,
    Event::BatteryFull,
    Event::BatteryLow,
];

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::PvOverproduction => write!(f, "PV Overproduction"),
            Event::HighDemand => write!(f, "High Demand"),
            Event::BatteryFull => write!(f, "Battery Full"),
            Event::BatteryLow => write!(f, "Battery Low"),
        }
    }
}

/// Static transition table. Pairs not listed here are ignored.
fn transition(state: State, event: Event) -> Option<State> {
    match (state, event) {
        (State::Idle, Event::PvOverproduction) => Some(State::Charging),
        (State::Idle, Event::HighDemand) => Some(State::Discharging),
        (State::Charging, Event::BatteryFull) => Some(State::Idle),
        (State::Charging, Event::HighDemand) => Some(State::Discharging),
        (State::Discharging, Event::BatteryLow) => Some(State::Idle),
        (State::Discharging, Event::PvOverproduction) => Some(State::Charging),
        _ => None,
    }
}

/// Dwell bookkeeping for one event predicate.
struct EventCondition {
    dwell: Duration,
    /// Instant the predicate most recently became true; `None` while false.
    since: Option<Instant>,
}

impl EventCondition {
    fn new(dwell: Duration) -> Self {
        Self { dwell, since: None }
    }

    /// Feed one predicate sample. Returns true exactly once per interval on
    /// which the predicate has been continuously true for the dwell time;
    /// any false sample resets the timer.
    fn sample(&mut self, now: Instant, active: bool) -> bool {
        if !active {
            self.since = None;
            return false;
        }
        match self.since {
            None => {
                self.since = Some(now);
                false
            }
            Some(since) if now.duration_since(since) >= self.dwell => {
                self.since = None;
                true
            }
            Some(_) => false,
        }
    }
}

pub struct Fsm {
    state: State,
    conditions: [EventCondition; 4],

    // latest measurements
    grid_load: i16,
    ac_charge_power: i16,
    inverter_to_grid_power: i32,
    battery_voltage: f32,

    min_charge_power: i16,
    start_discharge_voltage: f32,

    charger: Arc<dyn ChargerPort>,
    inverter: Arc<dyn InverterPort>,
    meter: Arc<dyn MeterControl>,
    regulator: Regulator,
}

impl Fsm {
    pub fn new(
        cfg: &Config,
        charger: Arc<dyn ChargerPort>,
        inverter: Arc<dyn InverterPort>,
        meter: Arc<dyn MeterControl>,
    ) -> Self {
        Self {
            state: State::Idle,
            conditions: [
                EventCondition::new(PV_OVERPRODUCTION_DWELL),
                EventCondition::new(HIGH_DEMAND_DWELL),
                EventCondition::new(BATTERY_FULL_DWELL),
                EventCondition::new(BATTERY_LOW_DWELL),
            ],
            grid_load: 0,
            ac_charge_power: 0,
            inverter_to_grid_power: 0,
            battery_voltage: 49.0,
            min_charge_power: cfg.min_charge_power,
            start_discharge_voltage: cfg.opendtu_start_discharge_voltage,
            charger,
            inverter,
            meter,
            regulator: Regulator::new(cfg),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Process one measurement sample: refresh the stored measurements,
    /// re-evaluate every event predicate and run the work of the current
    /// state.
    pub async fn update(
        &mut self,
        sample: GridLoadState,
        inverter_to_grid_power: f32,
        battery_voltage: f32,
    ) {
        self.update_at(
            Instant::now(),
            sample,
            inverter_to_grid_power,
            battery_voltage,
        )
        .await;
    }

    async fn update_at(
        &mut self,
        now: Instant,
        sample: GridLoadState,
        inverter_to_grid_power: f32,
        battery_voltage: f32,
    ) {
        self.grid_load = sample.grid_power_w;
        self.ac_charge_power = sample.psu_ac_input_power_w;
        self.inverter_to_grid_power = inverter_to_grid_power.round() as i32;
        self.battery_voltage = battery_voltage;

        for (index, event) in EVENTS.iter().enumerate() {
            let active = self.predicate(*event);
            if self.conditions[index].sample(now, active) {
                self.handle_event(*event).await;
            }
        }

        match self.state {
            State::Idle => tokio::time::sleep(IDLE_THROTTLE).await,
            State::Charging => {
                self.regulator
                    .step(self.grid_load, self.ac_charge_power, &*self.charger)
                    .await
            }
            // the inverter's own limiter regulates the discharge loop
            State::Discharging => {}
        }
    }

    fn predicate(&self, event: Event) -> bool {
        match event {
            // demand satisfied, surplus beyond the charger floor, inverter quiet
            Event::PvOverproduction => {
                i32::from(self.grid_load) < -i32::from(self.min_charge_power)
                    && self.inverter_to_grid_power == 0
                    && self.state != State::Charging
            }
            // sustained demand while neither charger nor inverter is active
            Event::HighDemand => {
                i32::from(self.grid_load) > 2 * i32::from(self.min_charge_power)
                    && self.battery_voltage >= self.start_discharge_voltage
                    && self.ac_charge_power == 0
                    && self.inverter_to_grid_power == 0
                    && self.state != State::Discharging
            }
            // reserved until a state-of-charge source is wired up
            Event::BatteryFull => false,
            // voltage-based cutoff is owned by the inverter's own limiter
            Event::BatteryLow => false,
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match transition(self.state, event) {
            Some(next) => {
                info!("state machine event: {event}");
                self.state = next;
                self.entry_action(next).await;
            }
            None => info!(
                "event ({event}) not defined for current state ({})",
                self.state
            ),
        }
    }

    async fn entry_action(&mut self, state: State) {
        match state {
            State::Idle => {
                info!("entering idle state");
            }
            State::Charging => {
                info!("entering charging state");
                self.inverter.disable_dpl().await;
                // regulate against fresh samples
                self.meter.increase_polling_rate();
            }
            State::Discharging => {
                info!("entering discharging state");
                self.inverter.enable_dpl().await;
                // sporadic updates suffice while the limiter runs the loop
                self.meter.decrease_polling_rate();
            }
        }
    }
}
