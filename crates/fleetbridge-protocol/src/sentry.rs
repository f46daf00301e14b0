//! ESP32 quadruped ("sentry") opcode tables.
//!
//! Commands carry typed operands; the device also pushes unsolicited
//! responses (servo telemetry, obstacle triggers) on the command socket.

use fleetbridge_types::LinkError;
use serde_json::{json, Value};

use crate::command::{read_u32, Command, Opcode};
use crate::request::{bool_arg, expect_args, int_arg, unknown_tag, ControlRequest};
use crate::response::{DeviceResponse, RESPONSE_OPCODE_LEN};

/// Number of servos reported in a [`SentryResponseOp::ServoAngle`] message.
pub const SERVO_COUNT: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentryOp {
    /// `(servo index: int, offset: int)`
    SetOffset = 0,
    /// `(enabled: bool)`
    SetAutoAvoidance = 1,
    /// `(enabled: bool)`
    SetMotorMonitor = 2,
    /// `(steps: int)`
    Forward = 3,
    Backward = 4,
    TurnLeft = 5,
    TurnRight = 6,
    Stand = 7,
    Continue = 8,
}

impl Opcode for SentryOp {
    fn code(self) -> u32 {
        self as u32
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => SentryOp::SetOffset,
            1 => SentryOp::SetAutoAvoidance,
            2 => SentryOp::SetMotorMonitor,
            3 => SentryOp::Forward,
            4 => SentryOp::Backward,
            5 => SentryOp::TurnLeft,
            6 => SentryOp::TurnRight,
            7 => SentryOp::Stand,
            8 => SentryOp::Continue,
            _ => return None,
        })
    }
}

/// Opcodes of device-initiated responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentryResponseOp {
    ServoAngle = 0,
    TriggerObstacle = 1,
}

impl Opcode for SentryResponseOp {
    fn code(self) -> u32 {
        self as u32
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(SentryResponseOp::ServoAngle),
            1 => Some(SentryResponseOp::TriggerObstacle),
            _ => None,
        }
    }
}

/// A decoded sentry response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentryEvent {
    ServoAngles([u32; SERVO_COUNT]),
    ObstacleTriggered,
}

impl DeviceResponse for SentryEvent {
    fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, LinkError> {
        if buf.len() < RESPONSE_OPCODE_LEN {
            return Ok(None);
        }
        let code = read_u32(buf, 0, "response opcode")?;
        match SentryResponseOp::from_code(code) {
            Some(SentryResponseOp::ServoAngle) => {
                let len = RESPONSE_OPCODE_LEN + SERVO_COUNT * 4;
                if buf.len() < len {
                    return Ok(None);
                }
                let mut angles = [0u32; SERVO_COUNT];
                for (i, angle) in angles.iter_mut().enumerate() {
                    *angle = read_u32(buf, RESPONSE_OPCODE_LEN + i * 4, "servo angle")?;
                }
                Ok(Some((SentryEvent::ServoAngles(angles), len)))
            }
            Some(SentryResponseOp::TriggerObstacle) => {
                Ok(Some((SentryEvent::ObstacleTriggered, RESPONSE_OPCODE_LEN)))
            }
            None => Err(LinkError::Framing(format!("unknown response opcode {code}"))),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            SentryEvent::ServoAngles(angles) => json!(["servo", angles]),
            SentryEvent::ObstacleTriggered => json!(["obstacle"]),
        }
    }
}

/// Control requests accepted by the sentry bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentryRequest {
    /// `["offset", index, offset]`
    Offset { index: i32, offset: i32 },
    /// `["autoAvoidance", bool]`
    AutoAvoidance(bool),
    /// `["forward", steps]`
    Forward(i32),
    Backward(i32),
    TurnLeft(i32),
    TurnRight(i32),
    /// `["stand"]`
    Stand,
    /// `["monitor", bool]`
    Monitor(bool),
    /// `["continue"]`
    Continue,
}

impl SentryRequest {
    pub fn command(&self) -> Command<SentryOp> {
        match *self {
            SentryRequest::Offset { index, offset } => {
                Command::new(SentryOp::SetOffset).with(index).with(offset)
            }
            SentryRequest::AutoAvoidance(on) => Command::new(SentryOp::SetAutoAvoidance).with(on),
            SentryRequest::Forward(steps) => Command::new(SentryOp::Forward).with(steps),
            SentryRequest::Backward(steps) => Command::new(SentryOp::Backward).with(steps),
            SentryRequest::TurnLeft(steps) => Command::new(SentryOp::TurnLeft).with(steps),
            SentryRequest::TurnRight(steps) => Command::new(SentryOp::TurnRight).with(steps),
            SentryRequest::Stand => Command::new(SentryOp::Stand),
            SentryRequest::Monitor(on) => Command::new(SentryOp::SetMotorMonitor).with(on),
            SentryRequest::Continue => Command::new(SentryOp::Continue),
        }
    }
}

impl ControlRequest for SentryRequest {
    const ARITY: std::ops::RangeInclusive<usize> = 1..=3;

    fn from_fields(tag: &str, args: &[Value]) -> Result<Self, LinkError> {
        let steps = |args: &[Value]| -> Result<i32, LinkError> {
            expect_args(tag, args, 1)?;
            int_arg(tag, args, 0)
        };
        let toggle = |args: &[Value]| -> Result<bool, LinkError> {
            expect_args(tag, args, 1)?;
            bool_arg(tag, args, 0)
        };

        match tag {
            "offset" => {
                expect_args(tag, args, 2)?;
                Ok(SentryRequest::Offset {
                    index: int_arg(tag, args, 0)?,
                    offset: int_arg(tag, args, 1)?,
                })
            }
            "autoAvoidance" => Ok(SentryRequest::AutoAvoidance(toggle(args)?)),
            "forward" => Ok(SentryRequest::Forward(steps(args)?)),
            "backward" => Ok(SentryRequest::Backward(steps(args)?)),
            "turnLeft" => Ok(SentryRequest::TurnLeft(steps(args)?)),
            "turnRight" => Ok(SentryRequest::TurnRight(steps(args)?)),
            "stand" => expect_args(tag, args, 0).map(|_| SentryRequest::Stand),
            "monitor" => Ok(SentryRequest::Monitor(toggle(args)?)),
            "continue" => expect_args(tag, args, 0).map(|_| SentryRequest::Continue),
            _ => Err(unknown_tag(tag)),
        }
    }
}
