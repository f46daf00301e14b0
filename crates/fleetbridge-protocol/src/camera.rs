//! ESP32-CAM opcode table.
//!
//! Every camera command is a bare opcode.  Still capture is the only
//! request/response exchange: the device answers `TakePicture` on the same
//! socket with a [`FrameHeader`][crate::frame::FrameHeader] (`tag` is
//! reserved) followed by the JPEG bytes.

use fleetbridge_types::LinkError;
use serde_json::Value;

use crate::command::{Command, Opcode};
use crate::request::{bool_arg, expect_args, unknown_tag, ControlRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraOp {
    TakePicture = 0,
    StartStream = 1,
    StopStream = 2,
    StartLed = 3,
    StopLed = 4,
}

impl Opcode for CameraOp {
    fn code(self) -> u32 {
        self as u32
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(CameraOp::TakePicture),
            1 => Some(CameraOp::StartStream),
            2 => Some(CameraOp::StopStream),
            3 => Some(CameraOp::StartLed),
            4 => Some(CameraOp::StopLed),
            _ => None,
        }
    }
}

/// Control requests accepted by the camera bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraRequest {
    /// `["videoStream", bool]`
    VideoStream(bool),
    /// `["led", bool]`
    Led(bool),
    /// `["capture"]`
    Capture,
}

impl CameraRequest {
    /// The device command this request sends.
    pub fn command(&self) -> Command<CameraOp> {
        let opcode = match self {
            CameraRequest::VideoStream(true) => CameraOp::StartStream,
            CameraRequest::VideoStream(false) => CameraOp::StopStream,
            CameraRequest::Led(true) => CameraOp::StartLed,
            CameraRequest::Led(false) => CameraOp::StopLed,
            CameraRequest::Capture => CameraOp::TakePicture,
        };
        Command::new(opcode)
    }
}

impl ControlRequest for CameraRequest {
    const ARITY: std::ops::RangeInclusive<usize> = 1..=2;

    fn from_fields(tag: &str, args: &[Value]) -> Result<Self, LinkError> {
        match tag {
            "videoStream" => {
                expect_args(tag, args, 1)?;
                Ok(CameraRequest::VideoStream(bool_arg(tag, args, 0)?))
            }
            "led" => {
                expect_args(tag, args, 1)?;
                Ok(CameraRequest::Led(bool_arg(tag, args, 0)?))
            }
            "capture" => {
                expect_args(tag, args, 0)?;
                Ok(CameraRequest::Capture)
            }
            _ => Err(unknown_tag(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_camera_tag() {
        assert_eq!(
            CameraRequest::parse(r#"["videoStream", true]"#).unwrap(),
            CameraRequest::VideoStream(true)
        );
        assert_eq!(
            CameraRequest::parse(r#"["led", false]"#).unwrap(),
            CameraRequest::Led(false)
        );
        assert_eq!(
            CameraRequest::parse(r#"["capture"]"#).unwrap(),
            CameraRequest::Capture
        );
    }

    #[test]
    fn requests_map_to_opcodes() {
        let cases = [
            (CameraRequest::Capture, CameraOp::TakePicture),
            (CameraRequest::VideoStream(true), CameraOp::StartStream),
            (CameraRequest::VideoStream(false), CameraOp::StopStream),
            (CameraRequest::Led(true), CameraOp::StartLed),
            (CameraRequest::Led(false), CameraOp::StopLed),
        ];
        for (request, opcode) in cases {
            let cmd = request.command();
            assert_eq!(cmd.opcode, opcode);
            assert!(cmd.operands.is_empty());
        }
    }

    #[test]
    fn arity_outside_one_to_two_is_rejected() {
        assert!(matches!(CameraRequest::parse("[]"), Err(LinkError::Validation(_))));
        assert!(matches!(
            CameraRequest::parse(r#"["led", true, false]"#),
            Err(LinkError::Validation(_))
        ));
    }

    #[test]
    fn missing_or_mistyped_argument_is_rejected() {
        assert!(CameraRequest::parse(r#"["led"]"#).is_err());
        assert!(CameraRequest::parse(r#"["videoStream", "on"]"#).is_err());
        assert!(CameraRequest::parse(r#"["capture", 1]"#).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = CameraRequest::parse(r#"["zoom", 2]"#).unwrap_err();
        assert!(err.to_string().contains("zoom"));
        assert!(CameraRequest::parse(r#"[1, 2]"#).is_err());
    }

    #[test]
    fn opcode_table_roundtrips() {
        for code in 0..5 {
            assert_eq!(CameraOp::from_code(code).map(Opcode::code), Some(code));
        }
        assert_eq!(CameraOp::from_code(5), None);
    }
}
