//! Wire codec for the Huawei R48xx rectifier CAN protocol.
//!
//! All traffic is 8-byte extended (29-bit id) frames. Set commands carry a
//! big-endian scaled 16-bit value in the last two payload bytes; parameter
//! reports carry a big-endian scaled 32-bit value in the last four.

use socketcan::{CanFrame, EmbeddedFrame, ExtendedId};

/// Periodic parameter report from the rectifier.
pub const ID_PARAMETER_REPORT: u32 = 0x1081_407F;
/// Acknowledgement of a set command.
pub const ID_COMMAND_ACK: u32 = 0x1081_807E;
/// Descriptor frame, not used by this controller.
pub const ID_DESCRIPTOR: u32 = 0x1081_D27F;
/// Outbound set command (voltage / current).
pub const ID_SET_COMMAND: u32 = 0x1081_80FE;
/// Outbound request for a fresh status report.
pub const ID_STATUS_REQUEST: u32 = 0x1081_40FE;

/// Volts are scaled by 1024, amps by 20 on the wire.
pub const VOLTAGE_SCALE: f32 = 1024.0;
pub const CURRENT_SCALE: f32 = 20.0;

pub const OP_ONLINE_VOLTAGE: u8 = 0x00;
pub const OP_OFFLINE_VOLTAGE: u8 = 0x01;
pub const OP_OVERVOLTAGE_PROTECTION: u8 = 0x02;
pub const OP_ONLINE_CURRENT: u8 = 0x03;
pub const OP_OFFLINE_CURRENT: u8 = 0x04;

// parameter selectors of the report frame
const SEL_INPUT_POWER: u8 = 0x70;
const SEL_INPUT_FREQ: u8 = 0x71;
const SEL_INPUT_CURRENT: u8 = 0x72;
const SEL_OUTPUT_POWER: u8 = 0x73;
const SEL_EFFICIENCY: u8 = 0x74;
const SEL_OUTPUT_VOLTAGE: u8 = 0x75;
const SEL_OUTPUT_CURRENT_MAX: u8 = 0x76;
const SEL_INPUT_VOLTAGE: u8 = 0x78;
const SEL_OUTPUT_TEMP: u8 = 0x7F;
const SEL_INPUT_TEMP: u8 = 0x80;
const SEL_OUTPUT_CURRENT: u8 = 0x81;
const SEL_OUTPUT_CURRENT_ALT: u8 = 0x82; // alternative measurement, ignored

/// Raw 29-bit identifier of a received frame, regardless of flavour.
pub fn raw_id(frame: &CanFrame) -> u32 {
    match frame.id() {
        socketcan::Id::Extended(id) => id.as_raw(),
        socketcan::Id::Standard(id) => u32::from(id.as_raw()),
    }
}

fn extended(id: u32) -> ExtendedId {
    ExtendedId::new(id).expect("29-bit CAN id")
}

fn set_command(opcode: u8, scaled: u16) -> CanFrame {
    let data = [
        0x01,
        opcode,
        0x00,
        0x00,
        0x00,
        0x00,
        (scaled >> 8) as u8,
        (scaled & 0xFF) as u8,
    ];
    CanFrame::new(extended(ID_SET_COMMAND), &data).expect("8-byte frame")
}

/// Voltage setpoint command. `nonvolatile` selects the offline (persisted)
/// opcode; online setpoints must be refreshed to stay effective.
pub fn set_voltage_frame(volts: f32, nonvolatile: bool) -> CanFrame {
    let opcode = if nonvolatile {
        OP_OFFLINE_VOLTAGE
    } else {
        OP_ONLINE_VOLTAGE
    };
    set_command(opcode, (volts * VOLTAGE_SCALE).round() as u16)
}

/// Current setpoint command, same online/offline split as the voltage one.
pub fn set_current_frame(amps: f32, nonvolatile: bool) -> CanFrame {
    let opcode = if nonvolatile {
        OP_OFFLINE_CURRENT
    } else {
        OP_ONLINE_CURRENT
    };
    set_command(opcode, (amps * CURRENT_SCALE).round() as u16)
}

pub fn status_request_frame() -> CanFrame {
    CanFrame::new(extended(ID_STATUS_REQUEST), &[0u8; 8]).expect("8-byte frame")
}

/// Rectifier parameters announced by report frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    InputPower,
    InputFrequency,
    InputCurrent,
    InputVoltage,
    InputTemp,
    OutputPower,
    Efficiency,
    OutputVoltage,
    OutputCurrent,
    OutputCurrentMax,
    OutputTemp,
}

/// One decoded parameter report. Reports with an unknown selector decode to
/// `None` and are dropped by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterReport {
    pub parameter: Parameter,
    pub value: f32,
}

impl ParameterReport {
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let raw = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        let parameter = match data[1] {
            SEL_INPUT_POWER => Parameter::InputPower,
            SEL_INPUT_FREQ => Parameter::InputFrequency,
            SEL_INPUT_CURRENT => Parameter::InputCurrent,
            SEL_INPUT_VOLTAGE => Parameter::InputVoltage,
            SEL_INPUT_TEMP => Parameter::InputTemp,
            SEL_OUTPUT_POWER => Parameter::OutputPower,
            SEL_EFFICIENCY => Parameter::Efficiency,
            SEL_OUTPUT_VOLTAGE => Parameter::OutputVoltage,
            SEL_OUTPUT_CURRENT => Parameter::OutputCurrent,
            SEL_OUTPUT_CURRENT_MAX => Parameter::OutputCurrentMax,
            SEL_OUTPUT_TEMP => Parameter::OutputTemp,
            SEL_OUTPUT_CURRENT_ALT => return None,
            _ => return None,
        };

        let value = match parameter {
            Parameter::OutputCurrentMax => raw as f32 / CURRENT_SCALE,
            _ => raw as f32 / VOLTAGE_SCALE,
        };

        Some(Self { parameter, value })
    }
}

/// Decoded acknowledgement of a set command. The payload echoes the opcode
/// and the applied value in the command's own scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub error: bool,
    pub opcode: u8,
    pub raw_value: u32,
}

impl Ack {
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            error: data[0] & 0x20 != 0,
            opcode: data[1],
            raw_value: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    pub fn volts(&self) -> f32 {
        self.raw_value as f32 / VOLTAGE_SCALE
    }

    pub fn amps(&self) -> f32 {
        self.raw_value as f32 / CURRENT_SCALE
    }
}
