use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A resolved network location for a named, discoverable service.
///
/// Produced by discovery and consumed once to open the device connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// e.g. `"_driver._tcp.local."`
    pub service_type: String,
    /// e.g. `"esp32-bot._driver._tcp.local."`
    pub instance: String,
    pub address: IpAddr,
    pub port: u16,
}

impl ServiceRecord {
    /// The endpoint to connect to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// One complete, length-delimited unit of video payload.
///
/// Only ever constructed once the full declared payload has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Opaque header field sent by the device (sequence number on current firmware).
    pub tag: u32,
    pub payload: Vec<u8>,
}

impl VideoFrame {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Connection state of a bridge's device link.
///
/// A link only moves forward: once `Degraded`, it stays there until the
/// bridge is torn down and rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    /// Waiting for the device to show up in service discovery.
    Discovering,
    Connected,
    /// The device socket failed after being established.
    Degraded,
}

/// Error type shared by every bridge component.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkError {
    /// Unknown opcode, unknown operand tag, or a structured message cut short.
    #[error("Framing Error: {0}")]
    Framing(String),

    /// A blocking wait elapsed. Never an application failure; callers loop.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Connection Error on {endpoint}: {details}")]
    Connection { endpoint: String, details: String },

    /// Inbound control message with a bad shape, tag, or argument type.
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Discovery Error: {0}")]
    Discovery(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl LinkError {
    /// Build a [`LinkError::Connection`] from any displayable error.
    pub fn connection(endpoint: impl Into<String>, details: impl std::fmt::Display) -> Self {
        LinkError::Connection {
            endpoint: endpoint.into(),
            details: details.to_string(),
        }
    }

    /// `true` for errors that only mean "try again".
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::Timeout(_))
    }
}
