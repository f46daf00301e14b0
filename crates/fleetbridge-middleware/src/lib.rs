//! `fleetbridge-middleware` – The Plumbing
//!
//! Moves bytes between the cloud control channel and a LAN device without
//! caring which device it is.  Everything device-specific arrives as a type
//! parameter from `fleetbridge-protocol`.
//!
//! # Modules
//!
//! - [`discovery`] – mDNS advertisement of the bridge's own endpoint and a
//!   retry-forever resolver for the device's endpoint.
//! - [`control`] – the [`ControlSink`] / [`ControlSource`] seams over the
//!   cloud WebSocket, plus an in-process channel implementation.
//! - [`command_channel`] – encoded commands to the device, still capture
//!   reads, and the device-response listener task.
//! - [`stream_relay`] – the bounded [`FrameQueue`] and the datagram
//!   receiver / frame publisher tasks.
//! - [`shutdown`] – the [`Shutdown`] flag every task polls.

pub mod command_channel;
pub mod control;
pub mod discovery;
pub mod shutdown;
pub mod stream_relay;

pub use command_channel::{listen_responses, CommandChannel, DeviceReader};
pub use control::{
    connect_control, drain_control, ChannelSink, ChannelSource, ControlMessage, ControlSink,
    ControlSource,
};
pub use discovery::{
    resolve_device, MdnsDiscovery, ServiceAdvertisement, ServiceQuery, ServiceResolver,
};
pub use shutdown::{LinkMonitor, Shutdown};
pub use stream_relay::{publish_frames, receive_frames, FrameQueue};
