//! Key management errors

use mesh_crypto::CryptoError;

use crate::KeyRefreshPhase;

/// Configuration-time failures when creating keys or moving them through
/// the Key Refresh procedure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Key indexes are 12-bit
    #[error("key index {0} out of range (0..=4095)")]
    InvalidKeyIndex(u16),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// A different new key was supplied while a refresh is already running
    #[error("key refresh already in progress with another key")]
    KeyRefreshInProgress,
    /// The requested phase change is not allowed from the current phase
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidPhaseTransition {
        from: KeyRefreshPhase,
        to: KeyRefreshPhase,
    },
    /// Old key material present in Normal Operation, or missing in another phase
    #[error("old key presence does not match phase {0:?}")]
    InconsistentOldKey(KeyRefreshPhase),
}
