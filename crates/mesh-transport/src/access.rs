//! Access layer envelope: opcode + parameters
//!
//! ```text
//! 1-octet opcode:  0xxxxxxx                      (0x7F is reserved)
//! 2-octet opcode:  10xxxxxx xxxxxxxx
//! 3-octet opcode:  11xxxxxx [Company ID: 2, little-endian]
//! ```
//!
//! Opcodes are stored as the big-endian integer of their octets, e.g.
//! `0x8003` or `0xD50A00`.

use alloc::vec::Vec;

use crate::DecodeError;

/// An access message before upper transport encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPdu {
    pub opcode: u32,
    pub parameters: Vec<u8>,
}

impl AccessPdu {
    pub fn new(opcode: u32, parameters: Vec<u8>) -> Self {
        AccessPdu { opcode, parameters }
    }

    /// Number of octets the opcode takes on the wire.
    pub fn opcode_len(opcode: u32) -> usize {
        if opcode < 0x80 {
            1
        } else if opcode < 0x1_0000 {
            2
        } else {
            3
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = Self::opcode_len(self.opcode);
        let mut bytes = Vec::with_capacity(len + self.parameters.len());
        bytes.extend_from_slice(&self.opcode.to_be_bytes()[4 - len..]);
        bytes.extend_from_slice(&self.parameters);
        bytes
    }

    /// # Errors
    /// - `DecodeError::TooShort`: empty, or shorter than the opcode says
    /// - `DecodeError::InvalidHeader`: the reserved opcode 0x7F
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let first = *bytes.first().ok_or(DecodeError::TooShort)?;
        let len = match first >> 6 {
            0b00 | 0b01 if first == 0x7F => return Err(DecodeError::InvalidHeader),
            0b00 | 0b01 => 1,
            0b10 => 2,
            _ => 3,
        };
        if bytes.len() < len {
            return Err(DecodeError::TooShort);
        }
        let opcode = bytes[..len]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        Ok(AccessPdu {
            opcode,
            parameters: bytes[len..].to_vec(),
        })
    }
}
