//! Network header obfuscation (PECB)
//!
//! ```text
//! Privacy Plaintext = 0x0000000000 ‖ IV Index (4, BE) ‖ Privacy Random (7)
//! PECB              = AES-ECB(PrivacyKey, Privacy Plaintext)
//! ObfuscatedData    = (CTL ‖ TTL ‖ SEQ ‖ SRC) XOR PECB[0..6]
//! ```
//!
//! The Privacy Random is the first 7 bytes of the encrypted
//! `DST ‖ TransportPDU ‖ NetMIC`, so a receiver can deobfuscate before
//! decrypting.

use crate::kdf::aes_ecb;
use crate::Key;

/// Obfuscates (or deobfuscates) the 6 header bytes of a Network PDU.
///
/// XOR with the same mask is an involution: applying it twice with the same
/// inputs returns the original bytes.
pub fn obfuscate(
    data: &[u8; 6],
    privacy_random: &[u8; 7],
    iv_index: u32,
    privacy_key: &Key,
) -> [u8; 6] {
    let mut plaintext = [0u8; 16];
    plaintext[5..9].copy_from_slice(&iv_index.to_be_bytes());
    plaintext[9..16].copy_from_slice(privacy_random);
    let pecb = aes_ecb(&plaintext, privacy_key);

    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = data[i] ^ pecb[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_obfuscation_vector() {
        let key: Key = hex::decode("0123456789ABCDEF0123456789ABCDEF")
            .unwrap()
            .try_into()
            .unwrap();
        let source = [0x05, 0x01, 0x02, 0x03, 0x00, 0x01];
        let random = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

        let obfuscated = obfuscate(&source, &random, 0x12345678, &key);
        assert_eq!(obfuscated, [0x9C, 0x0D, 0xAE, 0x8B, 0xC5, 0x12]);

        let deobfuscated = obfuscate(&obfuscated, &random, 0x12345678, &key);
        assert_eq!(deobfuscated, source);
    }

    #[test]
    fn test_iv_index_changes_mask() {
        let key = [0x42u8; 16];
        let data = [0u8; 6];
        let random = [7u8; 7];
        assert_ne!(
            obfuscate(&data, &random, 1, &key),
            obfuscate(&data, &random, 2, &key)
        );
    }

    proptest! {
        #[test]
        fn prop_obfuscation_is_involution(
            data in any::<[u8; 6]>(),
            random in any::<[u8; 7]>(),
            iv_index in any::<u32>(),
            key in any::<[u8; 16]>(),
        ) {
            let once = obfuscate(&data, &random, iv_index, &key);
            prop_assert_eq!(obfuscate(&once, &random, iv_index, &key), data);
        }
    }
}
