//! Length-prefixed frames.
//!
//! Both the camera's capture response and its live video stream use the same
//! 8-byte header followed by exactly `len` payload bytes:
//!
//! ```text
//! ┌────────────┬────────────┬─────────────────────┐
//! │ tag (u32)  │ len (u32)  │ payload (len bytes) │
//! └────────────┴────────────┴─────────────────────┘
//! ```
//!
//! On the datagram socket the transport chunks a frame arbitrarily, so
//! [`FrameAssembler`] treats the datagrams as one byte stream and only
//! emits a [`VideoFrame`] once its full declared payload has arrived.

use fleetbridge_types::{LinkError, VideoFrame};

use crate::command::read_u32;

pub const FRAME_HEADER_LEN: usize = 8;

/// Largest payload length accepted from a header.
///
/// A header declaring more than this is treated as corruption (e.g. the
/// receiver lost sync after a dropped datagram).
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Opaque; `reserved` in capture responses.
    pub tag: u32,
    pub len: u32,
}

impl FrameHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, LinkError> {
        Ok(Self {
            tag: read_u32(buf, 0, "frame tag")?,
            len: read_u32(buf, 4, "frame length")?,
        })
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[..4].copy_from_slice(&self.tag.to_le_bytes());
        out[4..].copy_from_slice(&self.len.to_le_bytes());
        out
    }
}

/// Reassembles frames from arbitrarily chunked datagrams.
#[derive(Debug)]
pub struct FrameAssembler {
    max_len: u32,
    header: Vec<u8>,
    current: Option<Partial>,
}

#[derive(Debug)]
struct Partial {
    tag: u32,
    declared: usize,
    payload: Vec<u8>,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl FrameAssembler {
    pub fn new(max_len: u32) -> Self {
        Self {
            max_len,
            header: Vec::with_capacity(FRAME_HEADER_LEN),
            current: None,
        }
    }

    /// `true` when no header or payload bytes are buffered.
    pub fn is_idle(&self) -> bool {
        self.header.is_empty() && self.current.is_none()
    }

    /// Drop any partially assembled frame.
    pub fn reset(&mut self) {
        self.header.clear();
        self.current = None;
    }

    /// Feed one datagram.
    ///
    /// `on_frame` is called once per frame completed by this datagram, in
    /// stream order.  Bytes past the end of a frame start the next header.
    ///
    /// # Errors
    ///
    /// [`LinkError::Framing`] when a header declares more than the maximum
    /// frame length.  The assembler resets and the rest of the datagram is
    /// discarded; frames completed earlier in the datagram were already
    /// delivered.
    pub fn push(
        &mut self,
        mut datagram: &[u8],
        mut on_frame: impl FnMut(VideoFrame),
    ) -> Result<(), LinkError> {
        while !datagram.is_empty() {
            match self.current.as_mut() {
                None => {
                    let take = (FRAME_HEADER_LEN - self.header.len()).min(datagram.len());
                    self.header.extend_from_slice(&datagram[..take]);
                    datagram = &datagram[take..];
                    if self.header.len() < FRAME_HEADER_LEN {
                        break;
                    }
                    let header = FrameHeader::decode(&self.header)?;
                    self.header.clear();
                    if header.len > self.max_len {
                        self.reset();
                        return Err(LinkError::Framing(format!(
                            "frame {} declares {} bytes, limit is {}",
                            header.tag, header.len, self.max_len
                        )));
                    }
                    self.current = Some(Partial {
                        tag: header.tag,
                        declared: header.len as usize,
                        payload: Vec::with_capacity(header.len as usize),
                    });
                }
                Some(partial) => {
                    let take = (partial.declared - partial.payload.len()).min(datagram.len());
                    partial.payload.extend_from_slice(&datagram[..take]);
                    datagram = &datagram[take..];
                }
            }

            if let Some(partial) = self.current.take_if(|p| p.payload.len() == p.declared) {
                on_frame(VideoFrame {
                    tag: partial.tag,
                    payload: partial.payload,
                });
            }
        }
        Ok(())
    }
}
