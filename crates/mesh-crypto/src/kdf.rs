//! AES-CMAC / HMAC-SHA256 based key derivation functions
//!
//! ```text
//! s1(M)          = AES-CMAC_ZERO(M)
//! k1(N, SALT, P) = AES-CMAC_T(P),   T = AES-CMAC_SALT(N)
//! k2(N, P)       = NID, EncryptionKey, PrivacyKey
//!                    T  = AES-CMAC_SALT(N), SALT = s1("smk2")
//!                    T1 = AES-CMAC_T(P ‖ 0x01)
//!                    T2 = AES-CMAC_T(T1 ‖ P ‖ 0x02)
//!                    T3 = AES-CMAC_T(T2 ‖ P ‖ 0x03)
//! k3(N)          = AES-CMAC_T("id64" ‖ 0x01) mod 2^64,  T = AES-CMAC_s1("smk3")(N)
//! k4(N)          = AES-CMAC_T("id6" ‖ 0x01)  mod 2^6,   T = AES-CMAC_s1("smk4")(N)
//! s2(M)          = HMAC-SHA256_ZERO(M)
//! k5(N, SALT, P) = HMAC-SHA256_T(P), T = HMAC-SHA256_SALT(N)
//! ```

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::Key;

/// Output of [`k2`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct K2Output {
    /// 7-bit Network ID discriminator
    pub nid: u8,
    pub encryption_key: Key,
    pub privacy_key: Key,
}

/// AES-CMAC of the concatenation of `parts`.
fn cmac_parts(parts: &[&[u8]], key: &Key) -> Key {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(key.into());
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// AES-CMAC (RFC 4493) of `data` with a 128-bit key.
pub fn aes_cmac(data: &[u8], key: &Key) -> Key {
    cmac_parts(&[data], key)
}

/// Encrypts a single block with AES-128 in ECB mode.
pub fn aes_ecb(block: &[u8; 16], key: &Key) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut block = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// Salt generation function s1.
pub fn s1(m: &[u8]) -> Key {
    aes_cmac(m, &[0u8; 16])
}

/// Key derivation function k1.
pub fn k1(n: &[u8], salt: &Key, p: &[u8]) -> Key {
    let t = aes_cmac(n, salt);
    aes_cmac(p, &t)
}

/// Network key material derivation function k2.
pub fn k2(n: &Key, p: &[u8]) -> K2Output {
    let salt = s1(b"smk2");
    let t = aes_cmac(n, &salt);
    let t1 = cmac_parts(&[p, &[0x01]], &t);
    let t2 = cmac_parts(&[&t1, p, &[0x02]], &t);
    let t3 = cmac_parts(&[&t2, p, &[0x03]], &t);
    K2Output {
        nid: t1[15] & 0x7F,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// Derivation function k3, used for the Network ID.
pub fn k3(n: &Key) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = aes_cmac(n, &salt);
    let result = aes_cmac(b"id64\x01", &t);
    let mut out = [0u8; 8];
    out.copy_from_slice(&result[8..]);
    out
}

/// Derivation function k4, used for the AID.
pub fn k4(n: &Key) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(n, &salt);
    aes_cmac(b"id6\x01", &t)[15] & 0x3F
}

/// HMAC-SHA256 of `data`.
pub fn hmac_sha256(data: &[u8], key: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Salt generation function s2.
pub fn s2(m: &[u8]) -> [u8; 32] {
    hmac_sha256(m, &[0u8; 32])
}

/// Key derivation function k5.
pub fn k5(n: &[u8], salt: &[u8; 32], p: &[u8]) -> [u8; 32] {
    let t = hmac_sha256(n, salt);
    hmac_sha256(p, &t)
}
