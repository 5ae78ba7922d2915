//! Crypto error type

/// Configuration-time failures of the crypto layer.
///
/// Per-packet authentication failures are not errors: decrypt and
/// authenticate functions return `None` so that callers can move on to the
/// next candidate key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Key length is not 16 bytes
    #[error("invalid key length: {0} bytes (expected 16)")]
    InvalidKeyLength(usize),
    /// Hex string could not be decoded
    #[error("invalid hex encoding")]
    InvalidHex,
    /// The platform random source failed
    #[error("random number generator unavailable")]
    RandomUnavailable,
    /// AES-CCM refused the input (message longer than the 2-byte length field allows)
    #[error("encryption failed")]
    EncryptionFailed,
}
