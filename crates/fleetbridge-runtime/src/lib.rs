//! `fleetbridge-runtime` – The Bridges
//!
//! Wires the middleware plumbing into the two concrete device bridges and
//! owns their lifecycle.
//!
//! # Modules
//!
//! - [`bridge`] – [`Bridge`] runs the control dispatcher and tears every
//!   task down on quit; [`BridgeHandle`] is the cloneable remote control;
//!   [`DeviceBridge`] is the seam each device implements.
//! - [`camera`] – [`CameraBridge`]: command socket, still capture to the
//!   analysis channel, and the live video relay.
//! - [`sentry`] – [`SentryBridge`]: command socket plus the servo/obstacle
//!   response listener.
//! - [`telemetry`] – [`init_tracing`]: the global `tracing` subscriber with
//!   an optional OTLP span exporter.

pub mod bridge;
pub mod camera;
pub mod sentry;
pub mod telemetry;

pub use bridge::{Bridge, BridgeConfig, BridgeHandle, DeviceBridge};
pub use camera::{CameraBridge, CameraLinks, CameraSettings};
pub use sentry::SentryBridge;
pub use telemetry::{init_tracing, TracerProviderGuard};
