//! Fixed-length checksummed frames for the stepper-motor controller (TMCL).
//!
//! Request layout (9 bytes):
//!
//! ```text
//! [address, instruction, type, bank, value (i32, big-endian), checksum]
//! ```
//!
//! Reply layout (9 bytes):
//!
//! ```text
//! [reply address, module address, status, instruction, value (i32, big-endian), checksum]
//! ```
//!
//! The checksum is the sum of the first eight bytes modulo 256. Status 100 is
//! the only success code; 1-6 map to [`Rejection`] variants.

use crate::connection::Match;
use crate::error::ProtocolError;
use std::fmt;

/// Length of every request and reply frame.
pub const FRAME_LEN: usize = 9;

/// Reply status signalling success.
pub const STATUS_OK: u8 = 100;

/// TMCL instruction numbers used by the motor drivers.
pub mod instruction {
    /// Rotate right at the given velocity.
    pub const ROR: u8 = 1;
    /// Rotate left at the given velocity.
    pub const ROL: u8 = 2;
    /// Motor stop.
    pub const MST: u8 = 3;
    /// Move to position (type 0 absolute, 1 relative).
    pub const MVP: u8 = 4;
    /// Set axis parameter.
    pub const SAP: u8 = 5;
    /// Get axis parameter.
    pub const GAP: u8 = 6;
    /// Store axis parameter to EEPROM.
    pub const STAP: u8 = 7;
    /// Get global parameter.
    pub const GGP: u8 = 10;
    /// Firmware version query. Exempt from checksum verification.
    pub const FIRMWARE: u8 = 136;
}

/// Sum of `bytes` modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn verify(bytes: &[u8]) -> Result<&[u8; FRAME_LEN], ProtocolError> {
    let bytes: &[u8; FRAME_LEN] = bytes.try_into().map_err(|_| {
        ProtocolError::Malformed(format!(
            "frame must be {FRAME_LEN} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(bytes)
}

fn value_of(bytes: &[u8; FRAME_LEN]) -> i32 {
    i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
}

// =============================================================================
// Request frame
// =============================================================================

/// A request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    /// Target module address.
    pub address: u8,
    /// Instruction number.
    pub instruction: u8,
    /// Instruction type (parameter number for SAP/GAP).
    pub kind: u8,
    /// Motor or bank number.
    pub bank: u8,
    /// Signed 32-bit operand.
    pub value: i32,
}

impl Frame {
    /// Build a frame.
    pub fn new(address: u8, instruction: u8, kind: u8, bank: u8, value: i32) -> Self {
        Self {
            address,
            instruction,
            kind,
            bank,
            value,
        }
    }

    /// Serialize with the trailing checksum.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[0] = self.address;
        out[1] = self.instruction;
        out[2] = self.kind;
        out[3] = self.bank;
        out[4..8].copy_from_slice(&self.value.to_be_bytes());
        out[8] = checksum(&out[..8]);
        out
    }

    /// Parse a request frame, verifying its checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let bytes = verify(bytes)?;
        let computed = checksum(&bytes[..8]);
        if computed != bytes[8] {
            return Err(ProtocolError::Checksum {
                computed,
                received: bytes[8],
            });
        }
        Ok(Self {
            address: bytes[0],
            instruction: bytes[1],
            kind: bytes[2],
            bank: bytes[3],
            value: value_of(bytes),
        })
    }
}

// =============================================================================
// Reply frame
// =============================================================================

/// Negative reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// 1: the controller saw a bad checksum on our request.
    WrongChecksum,
    /// 2: unknown instruction.
    InvalidCommand,
    /// 3: type out of range for the instruction.
    WrongType,
    /// 4: operand out of range.
    InvalidValue,
    /// 5: configuration EEPROM is locked.
    EepromLocked,
    /// 6: instruction not available in this firmware.
    CommandUnavailable,
    /// Any other non-success status.
    Other(u8),
}

impl Rejection {
    /// Map a status byte. `None` for [`STATUS_OK`].
    pub fn from_status(status: u8) -> Option<Self> {
        match status {
            STATUS_OK => None,
            1 => Some(Rejection::WrongChecksum),
            2 => Some(Rejection::InvalidCommand),
            3 => Some(Rejection::WrongType),
            4 => Some(Rejection::InvalidValue),
            5 => Some(Rejection::EepromLocked),
            6 => Some(Rejection::CommandUnavailable),
            other => Some(Rejection::Other(other)),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::WrongChecksum => f.write_str("wrong checksum"),
            Rejection::InvalidCommand => f.write_str("invalid command"),
            Rejection::WrongType => f.write_str("wrong type"),
            Rejection::InvalidValue => f.write_str("invalid value"),
            Rejection::EepromLocked => f.write_str("configuration EEPROM locked"),
            Rejection::CommandUnavailable => f.write_str("command not available"),
            Rejection::Other(code) => write!(f, "status {code}"),
        }
    }
}

/// A decoded reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyFrame {
    /// Host address the reply is addressed to.
    pub reply_address: u8,
    /// Module that answered.
    pub module_address: u8,
    /// Raw status byte.
    pub status: u8,
    /// Echoed instruction.
    pub instruction: u8,
    /// Operand.
    pub value: i32,
}

impl ReplyFrame {
    /// Decode a reply to a request carrying instruction `sent`.
    ///
    /// Checks the checksum (skipped for [`instruction::FIRMWARE`]) and the
    /// echoed instruction. A negative status is *not* an error here; use
    /// [`ReplyFrame::outcome`].
    pub fn decode(bytes: &[u8], sent: u8) -> Result<Self, ProtocolError> {
        let bytes = verify(bytes)?;
        if sent != instruction::FIRMWARE {
            let computed = checksum(&bytes[..8]);
            if computed != bytes[8] {
                return Err(ProtocolError::Checksum {
                    computed,
                    received: bytes[8],
                });
            }
        }
        if bytes[3] != sent {
            return Err(ProtocolError::InstructionMismatch {
                sent,
                received: bytes[3],
            });
        }
        Ok(Self {
            reply_address: bytes[0],
            module_address: bytes[1],
            status: bytes[2],
            instruction: bytes[3],
            value: value_of(bytes),
        })
    }

    /// Serialize (used by simulated controllers).
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[0] = self.reply_address;
        out[1] = self.module_address;
        out[2] = self.status;
        out[3] = self.instruction;
        out[4..8].copy_from_slice(&self.value.to_be_bytes());
        out[8] = checksum(&out[..8]);
        out
    }

    /// Operand on success, the rejection otherwise.
    pub fn outcome(&self) -> Result<i32, Rejection> {
        match Rejection::from_status(self.status) {
            None => Ok(self.value),
            Some(rejection) => Err(rejection),
        }
    }
}

/// Matcher for a connection wait: the reply to `sent`.
///
/// The checksum is verified before the module address is trusted, so a
/// corrupted address byte fails the wait with a checksum error. Intact frames
/// from another module are left for other waiters; other integrity failures
/// consume the frame and fail the wait.
pub fn matcher(sent: Frame) -> impl FnMut(&[u8]) -> Match<ReplyFrame> + Send {
    move |raw: &[u8]| match ReplyFrame::decode(raw, sent.instruction) {
        Ok(reply) if reply.module_address != sent.address => Match::Reject,
        Ok(reply) => Match::Accept(reply),
        Err(ProtocolError::InstructionMismatch { .. }) if raw[1] != sent.address => Match::Reject,
        Err(e) => Match::Fail(e),
    }
}
