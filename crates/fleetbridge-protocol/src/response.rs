//! Device-initiated messages on the command socket.

use std::fmt;

use fleetbridge_types::LinkError;
use serde_json::Value;

/// Width of the opcode that starts every response.
///
/// After an unknown opcode the listener discards exactly this many bytes and
/// tries again from the next position.
pub const RESPONSE_OPCODE_LEN: usize = 4;

/// A response shape table for one device kind.
pub trait DeviceResponse: Sized + Send + fmt::Debug + 'static {
    /// Decode one response from the front of `buf`.
    ///
    /// Returns `Ok(None)` while `buf` does not yet hold a complete response,
    /// otherwise the response and the number of bytes it used.
    ///
    /// # Errors
    ///
    /// [`LinkError::Framing`] when the opcode has no known mapping.
    fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, LinkError>;

    /// The JSON array forwarded to the control channel.
    fn to_json(&self) -> Value;
}
