//! Provisioning confirmation and session keys
//!
//! ```text
//! ConfirmationInputs = Invite ‖ Capabilities ‖ Start ‖ PubKeyProv ‖ PubKeyDev
//!
//! CMAC_AES128_AES_CCM:
//!   ConfirmationSalt = s1(ConfirmationInputs)
//!   ConfirmationKey  = k1(ECDHSecret, ConfirmationSalt, "prck")
//!   Confirmation     = AES-CMAC_ConfirmationKey(Random ‖ AuthValue)      (16 bytes)
//!
//! HMAC_SHA256_AES_CCM:
//!   ConfirmationSalt = s2(ConfirmationInputs)
//!   ConfirmationKey  = k5(ECDHSecret ‖ AuthValue, ConfirmationSalt, "prck256")
//!   Confirmation     = HMAC-SHA256_ConfirmationKey(Random)                (32 bytes)
//!
//! ProvisioningSalt = s1(ConfirmationSalt ‖ RandomProvisioner ‖ RandomDevice)
//! SessionKey       = k1(ECDHSecret, ProvisioningSalt, "prsk")
//! SessionNonce     = k1(ECDHSecret, ProvisioningSalt, "prsn")[3..16]
//! DeviceKey        = k1(ECDHSecret, ProvisioningSalt, "prdk")
//! ```
//!
//! The ECDH itself is out of scope: callers pass the 32-byte shared secret.

use alloc::vec::Vec;

use crate::ccm::{decrypt, encrypt};
use crate::kdf::{aes_cmac, hmac_sha256, k1, k5, s1, s2};
use crate::{CryptoError, Key, MicSize};

/// Provisioning algorithm negotiated in the Provisioning Start PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// BTM_ECDH_P256_CMAC_AES128_AES_CCM
    CmacAes128,
    /// BTM_ECDH_P256_HMAC_SHA256_AES_CCM
    HmacSha256,
}

impl Algorithm {
    /// Length of Random, AuthValue and Confirmation for this algorithm.
    pub const fn value_len(self) -> usize {
        match self {
            Algorithm::CmacAes128 => 16,
            Algorithm::HmacSha256 => 32,
        }
    }
}

/// Keys derived at the end of the provisioning exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningKeys {
    pub session_key: Key,
    pub session_nonce: [u8; 13],
    pub device_key: Key,
}

fn confirmation_salt(confirmation_inputs: &[u8], algorithm: Algorithm) -> Vec<u8> {
    match algorithm {
        Algorithm::CmacAes128 => s1(confirmation_inputs).to_vec(),
        Algorithm::HmacSha256 => s2(confirmation_inputs).to_vec(),
    }
}

/// Calculates a Provisioning Confirmation value.
///
/// # Arguments
/// - `confirmation_inputs`: concatenated Invite, Capabilities, Start and both public keys
/// - `shared_secret`: ECDH secret (32 bytes)
/// - `random` / `auth_value`: 16 bytes for CMAC, 32 bytes for HMAC
///
/// # Returns
/// 16-byte (CMAC) or 32-byte (HMAC) confirmation.
pub fn calculate_confirmation(
    confirmation_inputs: &[u8],
    shared_secret: &[u8],
    random: &[u8],
    auth_value: &[u8],
    algorithm: Algorithm,
) -> Vec<u8> {
    match algorithm {
        Algorithm::CmacAes128 => {
            let salt = s1(confirmation_inputs);
            let key = k1(shared_secret, &salt, b"prck");
            let mut data = Vec::with_capacity(random.len() + auth_value.len());
            data.extend_from_slice(random);
            data.extend_from_slice(auth_value);
            aes_cmac(&data, &key).to_vec()
        }
        Algorithm::HmacSha256 => {
            let salt = s2(confirmation_inputs);
            let mut secret = Vec::with_capacity(shared_secret.len() + auth_value.len());
            secret.extend_from_slice(shared_secret);
            secret.extend_from_slice(auth_value);
            let key = k5(&secret, &salt, b"prck256");
            hmac_sha256(random, &key).to_vec()
        }
    }
}

/// Derives the session key, session nonce and device key.
pub fn calculate_keys(
    confirmation_inputs: &[u8],
    shared_secret: &[u8],
    provisioner_random: &[u8],
    device_random: &[u8],
    algorithm: Algorithm,
) -> ProvisioningKeys {
    let mut salt_input = confirmation_salt(confirmation_inputs, algorithm);
    salt_input.extend_from_slice(provisioner_random);
    salt_input.extend_from_slice(device_random);
    let provisioning_salt = s1(&salt_input);

    let nonce = k1(shared_secret, &provisioning_salt, b"prsn");
    let mut session_nonce = [0u8; 13];
    session_nonce.copy_from_slice(&nonce[3..16]);

    ProvisioningKeys {
        session_key: k1(shared_secret, &provisioning_salt, b"prsk"),
        session_nonce,
        device_key: k1(shared_secret, &provisioning_salt, b"prdk"),
    }
}

/// Encrypts the 25-byte Provisioning Data with a 64-bit MIC.
pub fn encrypt_provisioning_data(
    data: &[u8],
    keys: &ProvisioningKeys,
) -> Result<Vec<u8>, CryptoError> {
    encrypt(data, &keys.session_key, &keys.session_nonce, MicSize::Bits64, &[])
}

/// Decrypts Provisioning Data. `None` when the MIC does not match.
pub fn decrypt_provisioning_data(data: &[u8], keys: &ProvisioningKeys) -> Option<Vec<u8>> {
    decrypt(data, &keys.session_key, &keys.session_nonce, MicSize::Bits64, &[])
}
