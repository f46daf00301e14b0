//! `fleetbridge-protocol` – The Wire Codec
//!
//! Pure encode/decode of the fixed-layout binary messages spoken by the
//! ESP32 devices, plus the typed control requests accepted from the cloud
//! side.  Nothing in this crate performs I/O or holds state across calls
//! (apart from [`FrameAssembler`], which is fed bytes by its owner).
//!
//! # Modules
//!
//! - [`command`] – [`Command`], [`Operand`] and the [`Opcode`] trait every
//!   device opcode table implements.
//! - [`frame`] – length-prefixed frame headers and the datagram
//!   [`FrameAssembler`].
//! - [`request`] – the [`ControlRequest`] trait: JSON-array control messages
//!   parsed into closed, typed enums.
//! - [`response`] – the [`DeviceResponse`] trait for device-initiated
//!   messages on the command socket.
//! - [`camera`] / [`sentry`] – the two device opcode tables.
//!
//! # Byte order
//!
//! Every integer on the wire is a fixed-width little-endian field.

pub mod camera;
pub mod command;
pub mod frame;
pub mod request;
pub mod response;
pub mod sentry;

pub use camera::{CameraOp, CameraRequest};
pub use command::{Command, Opcode, Operand, OperandTag};
pub use frame::{FrameAssembler, FrameHeader, FRAME_HEADER_LEN, MAX_FRAME_LEN};
pub use request::ControlRequest;
pub use response::DeviceResponse;
pub use sentry::{SentryEvent, SentryOp, SentryRequest, SentryResponseOp};
