//! AES-CCM encryption with a 13-byte nonce
//!
//! ## Output layout
//! ```text
//! [ciphertext: data.len()][MIC: 4 or 8 bytes]
//! ```
//!
//! An empty `additional_data` slice is the same as "no additional data":
//! CCM sets the Adata flag in B0 only when the associated data is not empty.

use aead::consts::{U13, U4, U8};
use aead::generic_array::GenericArray;
use aead::{AeadInPlace, KeyInit};
use aes::Aes128;
use alloc::vec::Vec;
use ccm::Ccm;

use crate::{CryptoError, Key, MicSize};

type AesCcm32 = Ccm<Aes128, U4, U13>;
type AesCcm64 = Ccm<Aes128, U8, U13>;

/// Encrypts `data` and appends the MIC.
///
/// # Arguments
/// - `key`: 128-bit encryption key
/// - `nonce`: 13-byte nonce, see [`crate::MeshNonce`]
/// - `mic_size`: MIC length
/// - `additional_data`: associated data (the Label UUID for virtual destinations)
///
/// # Errors
/// - `CryptoError::EncryptionFailed`: `data` exceeds 65535 bytes
pub fn encrypt(
    data: &[u8],
    key: &Key,
    nonce: &[u8; 13],
    mic_size: MicSize,
    additional_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = GenericArray::from_slice(nonce);
    let mut buffer = data.to_vec();
    match mic_size {
        MicSize::Bits32 => {
            let tag = AesCcm32::new(key.into())
                .encrypt_in_place_detached(nonce, additional_data, &mut buffer)
                .map_err(|_| CryptoError::EncryptionFailed)?;
            buffer.extend_from_slice(&tag);
        }
        MicSize::Bits64 => {
            let tag = AesCcm64::new(key.into())
                .encrypt_in_place_detached(nonce, additional_data, &mut buffer)
                .map_err(|_| CryptoError::EncryptionFailed)?;
            buffer.extend_from_slice(&tag);
        }
    }
    Ok(buffer)
}

/// Decrypts `data` (ciphertext followed by the MIC) and verifies the MIC.
///
/// Returns `None` when the input is shorter than the MIC or the MIC does not
/// match. The tag comparison inside `ccm` is constant time.
pub fn decrypt(
    data: &[u8],
    key: &Key,
    nonce: &[u8; 13],
    mic_size: MicSize,
    additional_data: &[u8],
) -> Option<Vec<u8>> {
    let mic_len = mic_size.len();
    if data.len() < mic_len {
        return None;
    }
    let (ciphertext, mic) = data.split_at(data.len() - mic_len);
    let nonce = GenericArray::from_slice(nonce);
    let mut buffer = ciphertext.to_vec();
    let result = match mic_size {
        MicSize::Bits32 => AesCcm32::new(key.into()).decrypt_in_place_detached(
            nonce,
            additional_data,
            &mut buffer,
            GenericArray::from_slice(mic),
        ),
        MicSize::Bits64 => AesCcm64::new(key.into()).decrypt_in_place_detached(
            nonce,
            additional_data,
            &mut buffer,
            GenericArray::from_slice(mic),
        ),
    };
    result.ok().map(|_| buffer)
}
