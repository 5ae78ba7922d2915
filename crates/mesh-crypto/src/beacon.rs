//! Network beacon authentication
//!
//! ## Secure Network beacon (22 bytes)
//! ```text
//! [0x01][flags][Network ID: 8][IV Index: 4 BE][Authentication Value: 8]
//! Authentication Value = AES-CMAC_BeaconKey(flags ‖ Network ID ‖ IV Index)[0..8]
//! ```
//!
//! ## Private beacon (27 bytes)
//! ```text
//! [0x02][Random: 13][Obfuscated Private Beacon Data: 5][Authentication Tag: 8]
//! Private Beacon Data = flags ‖ IV Index (4, BE)
//! ```
//!
//! The obfuscation and the tag of a Private beacon are exactly AES-CCM with
//! the Random as nonce and an 8-byte MIC:
//!
//! ```text
//! B0 = 0x19 ‖ Random ‖ 0x0005      T0 = AES(B0)
//! C0 = 0x01 ‖ Random ‖ 0x0000      T1 = AES(T0 XOR (data ‖ 0^11))
//! C1 = 0x01 ‖ Random ‖ 0x0001      Tag = (T1 XOR AES(C0))[0..8]
//! Obfuscated = data XOR AES(C1)[0..5]
//! ```

use subtle::ConstantTimeEq;

use crate::ccm::{decrypt, encrypt};
use crate::kdf::aes_cmac;
use crate::{CryptoError, Key, MicSize};

/// Private beacon PDU length.
pub const PRIVATE_BEACON_LEN: usize = 27;

const PRIVATE_BEACON_TYPE: u8 = 0x02;

/// Decoded and authenticated Private beacon content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateBeaconData {
    /// Bit 0: Key Refresh, bit 1: IV Update active
    pub flags: u8,
    pub iv_index: u32,
}

impl PrivateBeaconData {
    pub fn key_refresh(&self) -> bool {
        self.flags & 0x01 != 0
    }

    pub fn iv_update_active(&self) -> bool {
        self.flags & 0x02 != 0
    }
}

/// Calculates the 8-byte authentication value of a Secure Network beacon.
///
/// `body` is `flags ‖ Network ID ‖ IV Index` (13 bytes).
pub fn authenticate_secure_beacon(body: &[u8], beacon_key: &Key) -> [u8; 8] {
    let mac = aes_cmac(body, beacon_key);
    let mut out = [0u8; 8];
    out.copy_from_slice(&mac[..8]);
    out
}

/// Checks a received authentication value in constant time.
pub fn verify_tag(expected: &[u8], received: &[u8]) -> bool {
    expected.len() == received.len() && bool::from(expected.ct_eq(received))
}

/// Deobfuscates and authenticates a Private beacon in one step.
///
/// Returns `None` when the PDU is not a 27-byte Private beacon or the tag
/// does not match (the beacon was made with a different key).
pub fn decode_and_authenticate_private_beacon(
    pdu: &[u8],
    private_beacon_key: &Key,
) -> Option<PrivateBeaconData> {
    if pdu.len() != PRIVATE_BEACON_LEN || pdu[0] != PRIVATE_BEACON_TYPE {
        return None;
    }
    let random: &[u8; 13] = pdu[1..14].try_into().ok()?;
    let data = decrypt(&pdu[14..27], private_beacon_key, random, MicSize::Bits64, &[])?;
    Some(PrivateBeaconData {
        flags: data[0],
        iv_index: u32::from_be_bytes([data[1], data[2], data[3], data[4]]),
    })
}

/// Builds a Private beacon from the beacon data and a 13-byte random.
pub fn encode_private_beacon(
    data: &PrivateBeaconData,
    random: &[u8; 13],
    private_beacon_key: &Key,
) -> Result<[u8; PRIVATE_BEACON_LEN], CryptoError> {
    let mut plaintext = [0u8; 5];
    plaintext[0] = data.flags;
    plaintext[1..5].copy_from_slice(&data.iv_index.to_be_bytes());
    let sealed = encrypt(&plaintext, private_beacon_key, random, MicSize::Bits64, &[])?;

    let mut pdu = [0u8; PRIVATE_BEACON_LEN];
    pdu[0] = PRIVATE_BEACON_TYPE;
    pdu[1..14].copy_from_slice(random);
    pdu[14..27].copy_from_slice(&sealed);
    Ok(pdu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculate_key_derivatives;

    fn bytes(s: &str) -> alloc::vec::Vec<u8> {
        hex::decode(s).unwrap()
    }

    fn sample_key() -> Key {
        bytes("7dd7364cd842ad18c17c2b820c84c3d6").try_into().unwrap()
    }

    #[test]
    fn test_secure_beacon_authentication() {
        let beacon_key = calculate_key_derivatives(&sample_key()).beacon_key;
        let pdu = bytes("01003ecaff672f673370123456788ea261582f364f6f");
        assert_eq!(authenticate_secure_beacon(&pdu[1..14], &beacon_key), pdu[14..22]);
    }

    #[test]
    fn test_secure_beacon_authentication_with_flags() {
        let net_key: Key = bytes("8D65C0771C83FAC39E256F697EA3AAE1").try_into().unwrap();
        let beacon_key = calculate_key_derivatives(&net_key).beacon_key;
        let pdu = bytes("0102EE6C0EFF5298ECFF000000025E5AA7B268B5E044");
        let auth = authenticate_secure_beacon(&pdu[1..14], &beacon_key);
        assert!(verify_tag(&auth, &pdu[14..22]));
        assert!(!verify_tag(&auth, &pdu[13..21]));
    }

    #[test]
    fn test_private_beacon_decode() {
        let key = calculate_key_derivatives(&sample_key()).private_beacon_key;
        let pdu = bytes("020102030405060708090a0b0c0d88228d035bee36d568e75887b5");
        let data = decode_and_authenticate_private_beacon(&pdu, &key).unwrap();
        assert_eq!(data.iv_index, 0x12345678);
        assert!(data.iv_update_active());
        assert!(!data.key_refresh());
    }

    #[test]
    fn test_private_beacon_encode_matches_vector() {
        let key = calculate_key_derivatives(&sample_key()).private_beacon_key;
        let random: [u8; 13] = bytes("435f18f85c0af5f6d9d4a2b1c0").try_into().unwrap();
        let data = PrivateBeaconData { flags: 0x01, iv_index: 0x1000 };
        let pdu = encode_private_beacon(&data, &random, &key).unwrap();
        assert_eq!(
            hex::encode(pdu),
            "02435f18f85c0af5f6d9d4a2b1c05a919ae58f9a4b5184999b8ac7"
        );
        assert_eq!(decode_and_authenticate_private_beacon(&pdu, &key), Some(data));
    }

    #[test]
    fn test_private_beacon_wrong_key() {
        let key = calculate_key_derivatives(&sample_key()).private_beacon_key;
        let pdu = bytes("020102030405060708090a0b0c0d88228d035bee36d568e75887b5");
        let other = calculate_key_derivatives(&[0x55; 16]).private_beacon_key;
        assert!(decode_and_authenticate_private_beacon(&pdu, &other).is_none());
        // A flipped tag bit must fail too
        let mut tampered = pdu.clone();
        tampered[26] ^= 0x01;
        assert!(decode_and_authenticate_private_beacon(&tampered, &key).is_none());
    }

    #[test]
    fn test_private_beacon_rejects_wrong_length_and_type() {
        let key = [0u8; 16];
        assert!(decode_and_authenticate_private_beacon(&[0x02; 26], &key).is_none());
        let mut pdu = [0u8; PRIVATE_BEACON_LEN];
        pdu[0] = 0x01;
        assert!(decode_and_authenticate_private_beacon(&pdu, &key).is_none());
    }
}
