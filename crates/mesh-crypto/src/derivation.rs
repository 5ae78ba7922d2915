//! Key derivatives, identifiers and virtual addresses

use crate::kdf::{aes_cmac, k1, k2, k3, k4, s1};
use crate::Key;

/// Everything derived from one 128-bit Network Key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDerivatives {
    /// 7-bit NID carried in clear in every Network PDU
    pub nid: u8,
    pub encryption_key: Key,
    pub privacy_key: Key,
    /// Used by Node Identity advertising
    pub identity_key: Key,
    /// Authenticates Secure Network beacons
    pub beacon_key: Key,
    /// Authenticates and obfuscates Private beacons
    pub private_beacon_key: Key,
}

const ID128: &[u8] = b"id128\x01";

/// Derives the six sub-keys of a Network Key.
pub fn calculate_key_derivatives(key: &Key) -> KeyDerivatives {
    let k2 = k2(key, &[0x00]);
    KeyDerivatives {
        nid: k2.nid,
        encryption_key: k2.encryption_key,
        privacy_key: k2.privacy_key,
        identity_key: k1(key, &s1(b"nkik"), ID128),
        beacon_key: k1(key, &s1(b"nkbk"), ID128),
        private_beacon_key: k1(key, &s1(b"nkpk"), ID128),
    }
}

/// 64-bit public Network ID of a Network Key.
pub fn calculate_network_id(key: &Key) -> [u8; 8] {
    k3(key)
}

/// 6-bit Application Key identifier.
pub fn calculate_aid(key: &Key) -> u8 {
    k4(key)
}

/// Virtual address of a Label UUID.
///
/// The hash is the last 14 bits of `AES-CMAC_s1("vtad")(label)`, tagged
/// with the `0b10` virtual address prefix.
pub fn calculate_virtual_address(label: &[u8; 16]) -> u16 {
    let hash = aes_cmac(label, &s1(b"vtad"));
    let address = u16::from_be_bytes([hash[14], hash[15]]);
    (address | 0x8000) & 0xBFFF
}
