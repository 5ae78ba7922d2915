//! Lower transport PDUs
//!
//! ## Unsegmented Access
//! ```text
//! [SEG=0:1|AKF:1|AID:6][Upper Transport PDU: 5..15]
//! ```
//!
//! ## Segmented Access
//! ```text
//! [SEG=1:1|AKF:1|AID:6][SZMIC:1|SeqZero:13|SegO:5|SegN:5][Segment: 1..12]
//! ```
//!
//! ## Unsegmented Control
//! ```text
//! [SEG=0:1|Opcode:7][Parameters: 0..11]
//! ```
//!
//! ## Segmented Control
//! ```text
//! [SEG=1:1|Opcode:7][RFU:1|SeqZero:13|SegO:5|SegN:5][Segment: 1..8]
//! ```
//!
//! ## Segment Acknowledgment (control opcode 0x00)
//! ```text
//! [0x00][OBO:1|SeqZero:13|RFU:2][BlockAck: 4 BE]
//! ```

use alloc::vec::Vec;

use crate::network::LowerPduType;
use crate::DecodeError;

/// Control opcode of the Segment Acknowledgment message.
pub const SEGMENT_ACK_OPCODE: u8 = 0x00;

/// Highest segment index (32 segments).
pub const MAX_SEG_N: u8 = 31;

/// 13-bit mask of SeqZero.
pub const SEQ_ZERO_MASK: u32 = 0x1FFF;

/// Rebuilds the 24-bit sequence number of the first segment from the
/// sequence number of any later segment and its SeqZero.
pub fn sequence_from_seq_zero(sequence: u32, seq_zero: u16) -> u32 {
    let seq_zero = u32::from(seq_zero) & SEQ_ZERO_MASK;
    let base = sequence & 0x00FF_E000;
    if (sequence & SEQ_ZERO_MASK) < seq_zero {
        base.wrapping_add(seq_zero).wrapping_sub(0x2000) & 0x00FF_FFFF
    } else {
        base + seq_zero
    }
}

/// Header of an upper transport message, shared by all of its segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `akf` is false for Device Key messages
    Access { akf: bool, aid: u8, szmic: bool },
    Control { opcode: u8 },
}

impl MessageKind {
    pub fn pdu_type(&self) -> LowerPduType {
        match self {
            MessageKind::Access { .. } => LowerPduType::Access,
            MessageKind::Control { .. } => LowerPduType::Control,
        }
    }

    fn first_octet(&self) -> u8 {
        match *self {
            MessageKind::Access { akf, aid, .. } => (u8::from(akf) << 6) | (aid & 0x3F),
            MessageKind::Control { opcode } => opcode & 0x7F,
        }
    }
}

/// One segment of a segmented message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: MessageKind,
    pub seq_zero: u16,
    pub seg_o: u8,
    pub seg_n: u8,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn is_last(&self) -> bool {
        self.seg_o == self.seg_n
    }
}

/// Segment Acknowledgment control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAcknowledgment {
    /// Sent by a Friend on behalf of a Low Power node
    pub on_behalf_of_lpn: bool,
    pub seq_zero: u16,
    /// Bit n set when segment n was received
    pub block_ack: u32,
}

impl SegmentAcknowledgment {
    /// Block ack with every segment up to `seg_n` set.
    pub fn all_received(seq_zero: u16, seg_n: u8) -> Self {
        SegmentAcknowledgment {
            on_behalf_of_lpn: false,
            seq_zero,
            block_ack: full_block_ack(seg_n),
        }
    }

    /// The receiver has no resources to take the message.
    pub fn is_busy(&self) -> bool {
        self.block_ack == 0
    }

    pub fn is_segment_received(&self, seg_o: u8) -> bool {
        seg_o <= MAX_SEG_N && self.block_ack & (1 << seg_o) != 0
    }

    pub fn are_all_received(&self, seg_n: u8) -> bool {
        self.block_ack == full_block_ack(seg_n)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(7);
        pdu.push(SEGMENT_ACK_OPCODE);
        pdu.push((u8::from(self.on_behalf_of_lpn) << 7) | ((self.seq_zero >> 6) as u8 & 0x7F));
        pdu.push(((self.seq_zero & 0x3F) as u8) << 2);
        pdu.extend_from_slice(&self.block_ack.to_be_bytes());
        pdu
    }

    fn decode_parameters(parameters: &[u8]) -> Result<Self, DecodeError> {
        if parameters.len() != 6 {
            return Err(DecodeError::TooShort);
        }
        Ok(SegmentAcknowledgment {
            on_behalf_of_lpn: parameters[0] & 0x80 != 0,
            seq_zero: (u16::from(parameters[0] & 0x7F) << 6) | u16::from(parameters[1] >> 2),
            block_ack: u32::from_be_bytes([parameters[2], parameters[3], parameters[4], parameters[5]]),
        })
    }
}

pub(crate) fn full_block_ack(seg_n: u8) -> u32 {
    if seg_n >= MAX_SEG_N {
        u32::MAX
    } else {
        (1u32 << (seg_n + 1)) - 1
    }
}

/// A decoded lower transport PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    UnsegmentedAccess { akf: bool, aid: u8, upper_pdu: Vec<u8> },
    UnsegmentedControl { opcode: u8, parameters: Vec<u8> },
    Segment(Segment),
    SegmentAcknowledgment(SegmentAcknowledgment),
}

impl LowerTransportPdu {
    /// # Errors
    /// - `DecodeError::TooShort`: header incomplete or empty payload
    /// - `DecodeError::InvalidSegmentation`: SegO greater than SegN
    /// - `DecodeError::InvalidHeader`: a segmented Segment Acknowledgment
    pub fn decode(pdu: &[u8], pdu_type: LowerPduType) -> Result<Self, DecodeError> {
        let first = *pdu.first().ok_or(DecodeError::TooShort)?;
        let segmented = first & 0x80 != 0;

        if !segmented {
            return match pdu_type {
                LowerPduType::Access => {
                    // Upper PDU carries at least one opcode byte and a 32-bit TransMIC
                    if pdu.len() < 6 {
                        return Err(DecodeError::TooShort);
                    }
                    Ok(LowerTransportPdu::UnsegmentedAccess {
                        akf: first & 0x40 != 0,
                        aid: first & 0x3F,
                        upper_pdu: pdu[1..].to_vec(),
                    })
                }
                LowerPduType::Control => {
                    let opcode = first & 0x7F;
                    if opcode == SEGMENT_ACK_OPCODE {
                        SegmentAcknowledgment::decode_parameters(&pdu[1..])
                            .map(LowerTransportPdu::SegmentAcknowledgment)
                    } else {
                        Ok(LowerTransportPdu::UnsegmentedControl {
                            opcode,
                            parameters: pdu[1..].to_vec(),
                        })
                    }
                }
            };
        }

        if pdu.len() < 5 {
            return Err(DecodeError::TooShort);
        }
        let kind = match pdu_type {
            LowerPduType::Access => MessageKind::Access {
                akf: first & 0x40 != 0,
                aid: first & 0x3F,
                szmic: pdu[1] & 0x80 != 0,
            },
            LowerPduType::Control => {
                let opcode = first & 0x7F;
                if opcode == SEGMENT_ACK_OPCODE {
                    return Err(DecodeError::InvalidHeader);
                }
                MessageKind::Control { opcode }
            }
        };
        let seq_zero = (u16::from(pdu[1] & 0x7F) << 6) | u16::from(pdu[2] >> 2);
        let seg_o = ((pdu[2] & 0x03) << 3) | (pdu[3] >> 5);
        let seg_n = pdu[3] & 0x1F;
        if seg_o > seg_n {
            return Err(DecodeError::InvalidSegmentation);
        }
        Ok(LowerTransportPdu::Segment(Segment {
            kind,
            seq_zero,
            seg_o,
            seg_n,
            data: pdu[4..].to_vec(),
        }))
    }

    pub fn pdu_type(&self) -> LowerPduType {
        match self {
            LowerTransportPdu::UnsegmentedAccess { .. } => LowerPduType::Access,
            LowerTransportPdu::Segment(segment) => segment.kind.pdu_type(),
            _ => LowerPduType::Control,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
                let mut pdu = Vec::with_capacity(1 + upper_pdu.len());
                pdu.push((u8::from(*akf) << 6) | (aid & 0x3F));
                pdu.extend_from_slice(upper_pdu);
                pdu
            }
            LowerTransportPdu::UnsegmentedControl { opcode, parameters } => {
                let mut pdu = Vec::with_capacity(1 + parameters.len());
                pdu.push(opcode & 0x7F);
                pdu.extend_from_slice(parameters);
                pdu
            }
            LowerTransportPdu::Segment(segment) => {
                let szmic = match segment.kind {
                    MessageKind::Access { szmic, .. } => szmic,
                    MessageKind::Control { .. } => false,
                };
                let seq_zero = segment.seq_zero & 0x1FFF;
                let mut pdu = Vec::with_capacity(4 + segment.data.len());
                pdu.push(0x80 | segment.kind.first_octet());
                pdu.push((u8::from(szmic) << 7) | (seq_zero >> 6) as u8);
                pdu.push((((seq_zero & 0x3F) as u8) << 2) | (segment.seg_o >> 3));
                pdu.push(((segment.seg_o & 0x07) << 5) | (segment.seg_n & 0x1F));
                pdu.extend_from_slice(&segment.data);
                pdu
            }
            LowerTransportPdu::SegmentAcknowledgment(ack) => ack.encode(),
        }
    }
}
