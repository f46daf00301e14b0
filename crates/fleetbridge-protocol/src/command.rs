//! Device command encoding.
//!
//! ```text
//! ┌──────────────┬────────────────────┬──────────────────────────────────┐
//! │ opcode (u32) │ operand count (u32)│ {type tag (u32), value} × count  │
//! └──────────────┴────────────────────┴──────────────────────────────────┘
//! ```
//!
//! Values are a 4-byte `i32`, a 4-byte `f32`, or a single byte for `bool`.
//! The operand count sits in the header so a decoder always knows where a
//! command ends without looking ahead.

use std::fmt;

use fleetbridge_types::LinkError;

/// Size of the opcode + operand-count header.
pub const COMMAND_HEADER_LEN: usize = 8;

/// A per-device table of opcodes.
///
/// Implemented by each device's command (and response) enum so the codec,
/// command channel and response listener stay device-agnostic.
pub trait Opcode: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// The value written to the wire.
    fn code(self) -> u32;

    /// Map a wire value back to an opcode, `None` if the table has no entry.
    fn from_code(code: u32) -> Option<Self>;
}

/// Wire type tag preceding every operand value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandTag {
    Int = 0,
    Float = 1,
    Bool = 2,
}

impl OperandTag {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(OperandTag::Int),
            1 => Some(OperandTag::Float),
            2 => Some(OperandTag::Bool),
            _ => None,
        }
    }

    /// Width of the value that follows the tag.
    pub fn value_len(self) -> usize {
        match self {
            OperandTag::Int | OperandTag::Float => 4,
            OperandTag::Bool => 1,
        }
    }
}

/// One typed value attached to a command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Int(i32),
    Float(f32),
    Bool(bool),
}

impl Operand {
    pub fn tag(&self) -> OperandTag {
        match self {
            Operand::Int(_) => OperandTag::Int,
            Operand::Float(_) => OperandTag::Float,
            Operand::Bool(_) => OperandTag::Bool,
        }
    }

    /// Tag plus value.
    pub fn encoded_len(&self) -> usize {
        4 + self.tag().value_len()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.tag().code().to_le_bytes());
        match *self {
            Operand::Int(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Operand::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Operand::Bool(v) => buf.push(u8::from(v)),
        }
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Operand::Int(v)
    }
}

impl From<f32> for Operand {
    fn from(v: f32) -> Self {
        Operand::Float(v)
    }
}

impl From<bool> for Operand {
    fn from(v: bool) -> Self {
        Operand::Bool(v)
    }
}

/// An opcode with its ordered operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Command<Op> {
    pub opcode: Op,
    pub operands: Vec<Operand>,
}

impl<Op: Opcode> Command<Op> {
    /// A bare command with no operands.
    pub fn new(opcode: Op) -> Self {
        Self {
            opcode,
            operands: Vec::new(),
        }
    }

    /// Append an operand (builder-style).
    pub fn with(mut self, operand: impl Into<Operand>) -> Self {
        self.operands.push(operand.into());
        self
    }

    pub fn encoded_len(&self) -> usize {
        COMMAND_HEADER_LEN + self.operands.iter().map(Operand::encoded_len).sum::<usize>()
    }

    /// Serialise the command. Never fails.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.opcode.code().to_le_bytes());
        buf.extend_from_slice(&(self.operands.len() as u32).to_le_bytes());
        for operand in &self.operands {
            operand.encode_into(&mut buf);
        }
        buf
    }

    /// Decode one command from the front of `buf`.
    ///
    /// Returns the command and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// [`LinkError::Framing`] for an unknown opcode or operand tag, or when
    /// `buf` ends before the command does.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), LinkError> {
        let code = read_u32(buf, 0, "command opcode")?;
        let opcode = Op::from_code(code)
            .ok_or_else(|| LinkError::Framing(format!("unknown command opcode {code}")))?;
        let count = read_u32(buf, 4, "operand count")?;

        let mut offset = COMMAND_HEADER_LEN;
        let mut operands = Vec::new();
        for index in 0..count {
            let tag_code = read_u32(buf, offset, "operand tag")?;
            let tag = OperandTag::from_code(tag_code).ok_or_else(|| {
                LinkError::Framing(format!("unknown operand tag {tag_code} at operand {index}"))
            })?;
            offset += 4;
            let operand = match tag {
                OperandTag::Int => Operand::Int(read_u32(buf, offset, "int operand")? as i32),
                OperandTag::Float => {
                    Operand::Float(f32::from_bits(read_u32(buf, offset, "float operand")?))
                }
                OperandTag::Bool => match buf.get(offset) {
                    Some(b) => Operand::Bool(*b != 0),
                    None => return Err(short_read("bool operand", offset + 1, buf.len())),
                },
            };
            offset += tag.value_len();
            operands.push(operand);
        }

        Ok((Self { opcode, operands }, offset))
    }
}

/// Read a little-endian `u32` at `offset`.
pub(crate) fn read_u32(buf: &[u8], offset: usize, what: &str) -> Result<u32, LinkError> {
    buf.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| short_read(what, offset + 4, buf.len()))
}

pub(crate) fn short_read(what: &str, needed: usize, available: usize) -> LinkError {
    LinkError::Framing(format!(
        "short read on {what}: need {needed} bytes, have {available}"
    ))
}
