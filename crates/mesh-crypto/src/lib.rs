//! # mesh-crypto
//!
//! Cryptographic primitives of the Bluetooth Mesh protocol.
//!
//! Every function in this crate is pure: no state, no I/O. The crate runs
//! in `no_std` + `alloc` environments (WASM included).
//!
//! ## Layered encryption
//!
//! ```text
//! Access payload
//!   └─ Upper Transport: AES-CCM(AppKey | DevKey, application/device nonce) + TransMIC (4 or 8)
//!        └─ Lower Transport: segmentation, no crypto
//!             └─ Network: AES-CCM(EncryptionKey, network nonce) + NetMIC (4 or 8)
//!                  └─ header obfuscation: CTL|TTL, SEQ, SRC XOR PECB(PrivacyKey)
//! ```
//!
//! ## Key derivation
//!
//! ```text
//! NetKey ──k2(0x00)──▶ NID, EncryptionKey, PrivacyKey
//!        ──k3────────▶ Network ID (8 bytes)
//!        ──k1(nkik)──▶ IdentityKey
//!        ──k1(nkbk)──▶ BeaconKey
//!        ──k1(nkpk)──▶ PrivateBeaconKey
//! AppKey ──k4────────▶ AID (6 bits)
//! ```

#![no_std]
extern crate alloc;

mod beacon;
mod ccm;
mod derivation;
mod error;
mod kdf;
mod nonce;
mod obfuscation;
mod provisioning;

pub use beacon::{
    authenticate_secure_beacon, decode_and_authenticate_private_beacon, encode_private_beacon,
    verify_tag, PrivateBeaconData, PRIVATE_BEACON_LEN,
};
pub use ccm::{decrypt, encrypt};
pub use derivation::{
    calculate_aid, calculate_key_derivatives, calculate_network_id, calculate_virtual_address,
    KeyDerivatives,
};
pub use error::CryptoError;
pub use kdf::{aes_cmac, aes_ecb, hmac_sha256, k1, k2, k3, k4, k5, s1, s2, K2Output};
pub use nonce::{MeshNonce, NonceType};
pub use obfuscation::obfuscate;
pub use provisioning::{
    calculate_confirmation, calculate_keys, decrypt_provisioning_data,
    encrypt_provisioning_data, Algorithm, ProvisioningKeys,
};

/// A 128-bit key (NetKey, AppKey, DevKey or any derived key).
pub type Key = [u8; 16];

/// Size of a Message Integrity Check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicSize {
    /// 32-bit MIC (access NetMIC, default TransMIC)
    Bits32,
    /// 64-bit MIC (control NetMIC, high-security TransMIC, provisioning data)
    Bits64,
}

impl MicSize {
    /// MIC length in bytes.
    pub const fn len(self) -> usize {
        match self {
            MicSize::Bits32 => 4,
            MicSize::Bits64 => 8,
        }
    }

    /// Maps a byte count back to a MIC size.
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            4 => Some(MicSize::Bits32),
            8 => Some(MicSize::Bits64),
            _ => None,
        }
    }
}

/// Decodes a 32-character hex string into a 16-byte key.
///
/// Mesh configuration databases store keys as upper-case hex, e.g.
/// `7DD7364CD842AD18C17C2B820C84C3D6`. Case is ignored.
pub fn decode_hex_key(key_hex: &str) -> Result<Key, CryptoError> {
    let bytes = hex::decode(key_hex.trim()).map_err(|_| CryptoError::InvalidHex)?;
    key_from_slice(&bytes)
}

/// Copies a 16-byte slice into a [`Key`].
pub fn key_from_slice(bytes: &[u8]) -> Result<Key, CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))
}

/// Fills an array with bytes from the platform random source.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(bytes)
}

/// Generates a new random 128-bit key.
pub fn random_key() -> Result<Key, CryptoError> {
    random_bytes::<16>()
}
