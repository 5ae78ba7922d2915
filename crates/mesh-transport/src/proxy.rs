//! Proxy protocol segmentation (GATT bearer)
//!
//! ## Proxy PDU
//! ```text
//! [SAR: 2 bits | Message Type: 6 bits][Data: 0..MTU-1]
//!   SAR: 0b00 complete, 0b01 first, 0b10 continuation, 0b11 last
//!   Type: 0x00 Network PDU, 0x01 Mesh Beacon, 0x02 Proxy Configuration,
//!         0x03 Provisioning PDU
//! ```
//!
//! A message longer than MTU-1 bytes is sent as first, continuation...,
//! last. Only one message is reassembled at a time.

use alloc::vec::Vec;

use tracing::{debug, trace};

use crate::DecodeError;

/// Message type of a Proxy PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyPduType {
    NetworkPdu = 0x00,
    MeshBeacon = 0x01,
    ProxyConfiguration = 0x02,
    ProvisioningPdu = 0x03,
}

impl ProxyPduType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ProxyPduType::NetworkPdu),
            0x01 => Some(ProxyPduType::MeshBeacon),
            0x02 => Some(ProxyPduType::ProxyConfiguration),
            0x03 => Some(ProxyPduType::ProvisioningPdu),
            _ => None,
        }
    }
}

/// SAR field of a Proxy PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SarType {
    Complete = 0b00,
    First = 0b01,
    Continuation = 0b10,
    Last = 0b11,
}

impl SarType {
    fn from_header(header: u8) -> Self {
        match header >> 6 {
            0b00 => SarType::Complete,
            0b01 => SarType::First,
            0b10 => SarType::Continuation,
            _ => SarType::Last,
        }
    }
}

/// Splits outgoing messages into Proxy PDUs and reassembles incoming ones.
#[derive(Debug, Default)]
pub struct ProxyProtocolHandler {
    buffer: Vec<u8>,
    buffer_type: Option<ProxyPduType>,
}

impl ProxyProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `data` into Proxy PDUs of at most `mtu` bytes.
    ///
    /// # Arguments
    /// - `data`: the message
    /// - `pdu_type`: message type written in every header
    /// - `mtu`: GATT MTU available for one Proxy PDU (header included).
    ///   Values below 2 are treated as 2.
    pub fn segment(data: &[u8], pdu_type: ProxyPduType, mtu: usize) -> Vec<Vec<u8>> {
        let chunk_len = mtu.saturating_sub(1).max(1);
        let type_bits = pdu_type as u8;

        if data.len() <= chunk_len {
            let mut packet = Vec::with_capacity(1 + data.len());
            packet.push(((SarType::Complete as u8) << 6) | type_bits);
            packet.extend_from_slice(data);
            return alloc::vec![packet];
        }

        let count = data.len().div_ceil(chunk_len);
        data.chunks(chunk_len)
            .enumerate()
            .map(|(i, chunk)| {
                let sar = match i {
                    0 => SarType::First,
                    i if i == count - 1 => SarType::Last,
                    _ => SarType::Continuation,
                };
                let mut packet = Vec::with_capacity(1 + chunk.len());
                packet.push(((sar as u8) << 6) | type_bits);
                packet.extend_from_slice(chunk);
                packet
            })
            .collect()
    }

    /// Adds a received Proxy PDU.
    ///
    /// # Returns
    /// - `Ok(Some((message, type)))`: a complete message
    /// - `Ok(None)`: more segments are needed
    ///
    /// # Errors
    /// - `DecodeError::TooShort`: empty packet
    /// - `DecodeError::UnsupportedType`: unknown message type
    /// - `DecodeError::InvalidSar`: continuation or last without a first
    ///   segment, or with a different message type
    pub fn reassemble(
        &mut self,
        packet: &[u8],
    ) -> Result<Option<(Vec<u8>, ProxyPduType)>, DecodeError> {
        let header = *packet.first().ok_or(DecodeError::TooShort)?;
        let pdu_type = ProxyPduType::from_byte(header & 0x3F).ok_or(DecodeError::UnsupportedType)?;
        let data = &packet[1..];

        match SarType::from_header(header) {
            SarType::Complete => {
                self.reset();
                Ok(Some((data.to_vec(), pdu_type)))
            }
            SarType::First => {
                if self.buffer_type.is_some() {
                    debug!("proxy SAR: unfinished message replaced");
                }
                self.buffer.clear();
                self.buffer.extend_from_slice(data);
                self.buffer_type = Some(pdu_type);
                Ok(None)
            }
            sar => {
                if self.buffer_type != Some(pdu_type) {
                    debug!(?sar, ?pdu_type, "proxy SAR: unexpected segment dropped");
                    self.reset();
                    return Err(DecodeError::InvalidSar);
                }
                self.buffer.extend_from_slice(data);
                if sar == SarType::Continuation {
                    return Ok(None);
                }
                self.buffer_type = None;
                let message = core::mem::take(&mut self.buffer);
                trace!(len = message.len(), ?pdu_type, "proxy SAR: message reassembled");
                Ok(Some((message, pdu_type)))
            }
        }
    }

    /// Drops a partially received message.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffer_type = None;
    }

    pub fn is_reassembling(&self) -> bool {
        self.buffer_type.is_some()
    }
}
