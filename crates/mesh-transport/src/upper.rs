//! Upper transport layer
//!
//! ```text
//! Upper Transport Access PDU = AES-CCM(AppKey | DevKey, nonce, Access PDU, AAD)
//!   nonce: [0x01 app | 0x02 device][ASZMIC:1|pad:7][SEQ: 3][SRC: 2][DST: 2][IV Index: 4]
//!   AAD:   Label UUID for virtual destinations, empty otherwise
//!   TransMIC: 4 bytes, 8 bytes when ASZMIC = 1 (segmented only)
//! ```
//!
//! Control messages are not encrypted at this layer.

use alloc::vec::Vec;

use mesh_crypto::{decrypt, encrypt, Key, MeshNonce, MicSize};
use mesh_keys::{ApplicationKey, ApplicationKeyMaterial, KeyIndex};
use tracing::trace;

use crate::address::{is_virtual, Address, MeshAddress};
use crate::{DecodeError, TransportError};

/// Fields of the message that enter the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpperTransportContext {
    /// Sequence number of the first (or only) segment
    pub sequence: u32,
    pub source: Address,
    pub destination: Address,
    pub iv_index: u32,
}

/// The key that decrypted an access message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKeyUsed {
    Application {
        index: KeyIndex,
        bound_network_key_index: KeyIndex,
        old_key_used: bool,
    },
    /// Device Key of the node with this unicast address
    Device(Address),
}

/// A decrypted access message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedAccess {
    pub access_pdu: Vec<u8>,
    pub key: AccessKeyUsed,
    /// Label UUID when the destination was virtual
    pub label: Option<[u8; 16]>,
}

fn nonce(akf: bool, aszmic: bool, context: &UpperTransportContext) -> MeshNonce {
    let UpperTransportContext { sequence, source, destination, iv_index } = *context;
    if akf {
        MeshNonce::application(aszmic, sequence, source, destination, iv_index)
    } else {
        MeshNonce::device(aszmic, sequence, source, destination, iv_index)
    }
}

fn trans_mic(aszmic: bool) -> MicSize {
    if aszmic {
        MicSize::Bits64
    } else {
        MicSize::Bits32
    }
}

/// Encrypts an access PDU.
///
/// # Arguments
/// - `akf`: true for an Application Key, false for a Device Key
/// - `aszmic`: 64-bit TransMIC; the caller must then send the message segmented
/// - `destination`: with its Label UUID when virtual
///
/// # Errors
/// - `TransportError::InvalidDestination`: a virtual destination without label
pub fn encrypt_access(
    access_pdu: &[u8],
    key: &Key,
    akf: bool,
    aszmic: bool,
    context: &UpperTransportContext,
    destination: &MeshAddress,
) -> Result<Vec<u8>, TransportError> {
    if destination.is_virtual() && destination.label.is_none() {
        return Err(TransportError::InvalidDestination(destination.address));
    }
    let nonce = nonce(akf, aszmic, context);
    Ok(encrypt(
        access_pdu,
        key,
        nonce.as_bytes(),
        trans_mic(aszmic),
        destination.additional_data(),
    )?)
}

fn labels_for<'l>(
    destination: Address,
    labels: &'l [[u8; 16]],
) -> impl Iterator<Item = Option<&'l [u8; 16]>> + 'l {
    let virtual_destination = is_virtual(destination);
    let matching = labels
        .iter()
        .filter(move |label| virtual_destination && MeshAddress::from_label(**label).address == destination)
        .map(Some);
    // Non-virtual destinations have exactly one candidate: no AAD
    (!virtual_destination).then_some(None).into_iter().chain(matching)
}

fn try_decrypt(
    upper_pdu: &[u8],
    key: &Key,
    nonce: &MeshNonce,
    aszmic: bool,
    label: Option<&[u8; 16]>,
) -> Option<Vec<u8>> {
    let aad: &[u8] = match label {
        Some(label) => label,
        None => &[],
    };
    decrypt(upper_pdu, key, nonce.as_bytes(), trans_mic(aszmic), aad)
}

/// Decrypts an upper transport access PDU sent with an Application Key.
///
/// Only keys whose AID matches are tried: the current key by its AID, then
/// the old key of a Key Refresh by its old AID. An AID collision moves on
/// to the next candidate.
///
/// # Arguments
/// - `labels`: known Label UUIDs, tried when the destination is virtual
/// - `keys`: Application Keys bound to the Network Key that decoded the PDU
///
/// # Errors
/// - `DecodeError::TooShort`: not longer than the TransMIC
/// - `DecodeError::UnknownApplicationKey`: no key decrypted the PDU
pub fn decrypt_with_application_keys<'a>(
    upper_pdu: &[u8],
    aid: u8,
    aszmic: bool,
    context: &UpperTransportContext,
    labels: &[[u8; 16]],
    keys: impl IntoIterator<Item = &'a ApplicationKey>,
) -> Result<DecryptedAccess, DecodeError> {
    if upper_pdu.len() <= trans_mic(aszmic).len() {
        return Err(DecodeError::TooShort);
    }
    let nonce = nonce(true, aszmic, context);
    for key in keys {
        let candidates: [(Option<&ApplicationKeyMaterial>, bool); 2] =
            [(Some(key.current()), false), (key.old(), true)];
        for (material, old_key_used) in candidates {
            let Some(material) = material.filter(|m| m.aid == aid) else {
                continue;
            };
            for label in labels_for(context.destination, labels) {
                if let Some(access_pdu) = try_decrypt(upper_pdu, &material.key, &nonce, aszmic, label) {
                    trace!(app_key = key.index(), old_key_used, "access message decrypted");
                    return Ok(DecryptedAccess {
                        access_pdu,
                        key: AccessKeyUsed::Application {
                            index: key.index(),
                            bound_network_key_index: key.bound_network_key_index(),
                            old_key_used,
                        },
                        label: label.copied(),
                    });
                }
            }
        }
    }
    Err(DecodeError::UnknownApplicationKey)
}

/// Decrypts an upper transport access PDU sent with a Device Key.
///
/// `device_keys` is tried in order; callers put the source node's key
/// first, then the destination node's.
///
/// # Errors
/// - `DecodeError::TooShort`: not longer than the TransMIC
/// - `DecodeError::UnknownApplicationKey`: no Device Key decrypted the PDU
pub fn decrypt_with_device_keys<'a>(
    upper_pdu: &[u8],
    aszmic: bool,
    context: &UpperTransportContext,
    device_keys: impl IntoIterator<Item = (Address, &'a Key)>,
) -> Result<DecryptedAccess, DecodeError> {
    if upper_pdu.len() <= trans_mic(aszmic).len() {
        return Err(DecodeError::TooShort);
    }
    let nonce = nonce(false, aszmic, context);
    device_keys
        .into_iter()
        .find_map(|(address, key)| {
            try_decrypt(upper_pdu, key, &nonce, aszmic, None).map(|access_pdu| DecryptedAccess {
                access_pdu,
                key: AccessKeyUsed::Device(address),
                label: None,
            })
        })
        .ok_or(DecodeError::UnknownApplicationKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    fn key(s: &str) -> Key {
        bytes(s).try_into().unwrap()
    }

    const LABEL: &str = "0073e7e4d8b9440faf8415df4c56c0e1";

    #[test]
    fn test_device_key_segmented_message() {
        let device_key = key("9d6dd0e96eb25dc19a40ed9914f8f03f");
        let context = UpperTransportContext {
            sequence: 0x3129AB,
            source: 0x0003,
            destination: 0x1201,
            iv_index: 0x12345678,
        };
        let access = bytes("0023614563964771734fbd76e3b40519d1d94a48");
        let upper =
            encrypt_access(&access, &device_key, false, false, &context, &MeshAddress::new(0x1201)).unwrap();
        assert_eq!(hex::encode(&upper), "eee888aa2169326d23f3afdfcfdc18c52fdef7720f8af48f");

        let other = [0x11; 16];
        let decrypted = decrypt_with_device_keys(
            &upper,
            false,
            &context,
            [(0x0003, &other), (0x1201, &device_key)],
        )
        .unwrap();
        assert_eq!(decrypted.access_pdu, access);
        assert_eq!(decrypted.key, AccessKeyUsed::Device(0x1201));
    }

    #[test]
    fn test_device_key_unsegmented_message() {
        let device_key = key("9d6dd0e96eb25dc19a40ed9914f8f03f");
        let context = UpperTransportContext {
            sequence: 0x000006,
            source: 0x1201,
            destination: 0x0003,
            iv_index: 0x12345678,
        };
        let access = bytes("800300236145");
        let upper =
            encrypt_access(&access, &device_key, false, false, &context, &MeshAddress::new(0x0003)).unwrap();
        assert_eq!(hex::encode(&upper), "89511b8484ff7501a689");
    }

    #[test]
    fn test_application_key_virtual_destination() {
        let app_key = ApplicationKey::from_hex(0, "63964771734fbd76e3b40519d1d94a48", 0).unwrap();
        assert_eq!(app_key.aid(), 0x26);
        let label: [u8; 16] = key(LABEL);
        let destination = MeshAddress::from_label(label);
        let context = UpperTransportContext {
            sequence: 0x07080B,
            source: 0x1234,
            destination: destination.address,
            iv_index: 0x12345677,
        };
        let access = bytes("d50a0048656c6c6f");
        let upper = encrypt_access(&access, app_key.key(), true, false, &context, &destination).unwrap();
        assert_eq!(hex::encode(&upper), "3871b904d431526316ca48a0");

        let unrelated = [0x55; 16];
        let decrypted =
            decrypt_with_application_keys(&upper, 0x26, false, &context, &[unrelated, label], [&app_key])
                .unwrap();
        assert_eq!(decrypted.access_pdu, access);
        assert_eq!(decrypted.label, Some(label));
        assert_eq!(
            decrypted.key,
            AccessKeyUsed::Application { index: 0, bound_network_key_index: 0, old_key_used: false }
        );

        // Without the label the message cannot be authenticated
        assert_eq!(
            decrypt_with_application_keys(&upper, 0x26, false, &context, &[], [&app_key]),
            Err(DecodeError::UnknownApplicationKey)
        );
        // Encrypting to a virtual address requires the label
        assert_eq!(
            encrypt_access(&access, app_key.key(), true, false, &context, &MeshAddress::new(0xB529)),
            Err(TransportError::InvalidDestination(0xB529))
        );
    }

    #[test]
    fn test_application_key_refresh_and_aid_collision() {
        let original = ApplicationKey::from_hex(1, "63964771734fbd76e3b40519d1d94a48", 0).unwrap();
        let context = UpperTransportContext {
            sequence: 100,
            source: 0x0005,
            destination: 0xC000,
            iv_index: 0,
        };
        let access = [0x82, 0x02, 0x01];
        let upper = encrypt_access(&access, original.key(), true, false, &context, &MeshAddress::new(0xC000)).unwrap();

        // Old key still decrypts after a refresh
        let refreshed = original.rotate_key([0x77; 16]).unwrap();
        let decrypted =
            decrypt_with_application_keys(&upper, 0x26, false, &context, &[], [&refreshed]).unwrap();
        assert_eq!(
            decrypted.key,
            AccessKeyUsed::Application { index: 1, bound_network_key_index: 0, old_key_used: true }
        );

        // A key with the right AID but wrong material does not stop the search
        let mut impostor_key = [0u8; 16];
        impostor_key[15] = 74;
        let impostor = ApplicationKey::new(2, impostor_key, 0).unwrap();
        assert_eq!(impostor.aid(), 0x26);
        let decrypted =
            decrypt_with_application_keys(&upper, 0x26, false, &context, &[], [&impostor, &original])
                .unwrap();
        assert_eq!(decrypted.access_pdu, access);

        assert_eq!(
            decrypt_with_application_keys(&upper, 0x27, false, &context, &[], [&original]),
            Err(DecodeError::UnknownApplicationKey)
        );
    }

    #[test]
    fn test_64_bit_trans_mic() {
        let device_key = [0x42; 16];
        let context = UpperTransportContext { sequence: 1, source: 0x0001, destination: 0x0002, iv_index: 0 };
        let access = [0x00; 12];
        let upper = encrypt_access(&access, &device_key, false, true, &context, &MeshAddress::new(0x0002)).unwrap();
        assert_eq!(upper.len(), 20);

        assert!(decrypt_with_device_keys(&upper, true, &context, [(0x0001, &device_key)]).is_ok());
        assert_eq!(
            decrypt_with_device_keys(&upper, false, &context, [(0x0001, &device_key)]),
            Err(DecodeError::UnknownApplicationKey)
        );
        assert_eq!(
            decrypt_with_device_keys(&upper[..8], true, &context, [(0x0001, &device_key)]),
            Err(DecodeError::TooShort)
        );
    }
}
