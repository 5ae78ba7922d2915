//! mesh-stack error types

use mesh_crypto::CryptoError;
use mesh_keys::{KeyError, KeyIndex};
use mesh_proto::ProtoError;
use mesh_transport::TransportError;

use crate::transmitter::BearerError;

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration is not valid JSON: {0}")]
    Parse(String),
    /// TTL 1 is reserved, above 127 does not fit
    #[error("default TTL {0} must be 0 or 2..=127")]
    InvalidTtl(u8),
    #[error("proxy MTU {0} is below 2 bytes")]
    InvalidMtu(usize),
}

/// Failures surfaced to the caller of the pipeline.
///
/// Per-packet decode failures are not errors: they are dropped and counted.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Bearer(#[from] BearerError),
    #[error("network key {0} is not known")]
    UnknownNetworkKey(KeyIndex),
    #[error("application key {0} is not known")]
    UnknownApplicationKey(KeyIndex),
    #[error("no device key for node 0x{0:04X}")]
    MissingDeviceKey(u16),
    #[error("0x{0:04X} is not a local unicast address")]
    NotLocalAddress(u16),
    /// 24-bit sequence space used up; an IV Index update is required
    #[error("sequence numbers of 0x{0:04X} are exhausted")]
    SequenceExhausted(u16),
    #[error("no network key selected for the proxy connection")]
    NoProxyNetworkKey,
    #[error("storage rejected the state")]
    StorageFailed,
}
