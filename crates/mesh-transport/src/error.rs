//! mesh-transport error types

use mesh_crypto::CryptoError;

/// Why an incoming PDU was dropped.
///
/// Every variant is a silent drop for the pipeline; the kind exists so that
/// logs and tests can tell the cases apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("PDU too short")]
    TooShort,
    /// A header field holds a value the protocol does not allow
    #[error("invalid header")]
    InvalidHeader,
    /// SegO greater than SegN, or more than 32 segments
    #[error("invalid segmentation fields")]
    InvalidSegmentation,
    /// SegN or message kind differ from the message being reassembled
    #[error("segment inconsistent with message in progress")]
    InconsistentSegment,
    /// No Network Key with a matching NID or Network ID
    #[error("no matching network key")]
    UnknownNetworkKey,
    /// A key matched the identifier but authentication failed
    #[error("MIC or authentication value mismatch")]
    InvalidMic,
    /// No Application or Device Key decrypted the upper transport PDU
    #[error("no matching application or device key")]
    UnknownApplicationKey,
    /// Proxy PDU segment arrived out of sequence
    #[error("invalid proxy SAR sequence")]
    InvalidSar,
    #[error("unsupported PDU type")]
    UnsupportedType,
}

/// Failures while building outgoing PDUs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Upper transport PDU needs more than 32 segments
    #[error("payload of {0} bytes does not fit in 32 segments")]
    PayloadTooLarge(usize),
    #[error("TTL {0} out of range (0..=127)")]
    InvalidTtl(u8),
    #[error("destination address 0x{0:04X} is not valid here")]
    InvalidDestination(u16),
    #[error("source address 0x{0:04X} is not a unicast address")]
    InvalidSource(u16),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
