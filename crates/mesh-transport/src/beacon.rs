//! Secure Network and Private beacons
//!
//! ```text
//! Secure Network (22 bytes): [0x01][flags][Network ID: 8][IV Index: 4][Auth: 8]
//! Private        (27 bytes): [0x02][Random: 13][obfuscated flags ‖ IV Index: 5][Tag: 8]
//! flags: bit 0 Key Refresh, bit 1 IV Update
//! ```
//!
//! A beacon is accepted when one of the known Network Keys authenticates
//! it. Keys in a Key Refresh are tried with their new material first.

use alloc::vec::Vec;

use mesh_crypto::{
    authenticate_secure_beacon, decode_and_authenticate_private_beacon, encode_private_beacon,
    verify_tag, PrivateBeaconData, PRIVATE_BEACON_LEN,
};
use mesh_keys::{IvIndex, KeyIndex, KeyRefreshPhase, NetworkKey};
use tracing::trace;

use crate::network::candidates;
use crate::{DecodeError, TransportError};

/// Secure Network beacon length.
pub const SECURE_NETWORK_BEACON_LEN: usize = 22;

const FLAG_KEY_REFRESH: u8 = 0x01;
const FLAG_IV_UPDATE: u8 = 0x02;

/// Mesh beacon types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeaconType {
    UnprovisionedDevice = 0x00,
    SecureNetwork = 0x01,
    Private = 0x02,
}

impl BeaconType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(BeaconType::UnprovisionedDevice),
            0x01 => Some(BeaconType::SecureNetwork),
            0x02 => Some(BeaconType::Private),
            _ => None,
        }
    }
}

/// An authenticated Secure Network or Private beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkBeacon {
    pub beacon_type: BeaconType,
    pub network_key_index: KeyIndex,
    /// Authenticated with the old material of a Key Refresh
    pub old_key_used: bool,
    pub key_refresh: bool,
    pub iv_index: IvIndex,
}

impl NetworkBeacon {
    fn flags(key_refresh: bool, iv_index: &IvIndex) -> u8 {
        let mut flags = 0;
        if key_refresh {
            flags |= FLAG_KEY_REFRESH;
        }
        if iv_index.update_active {
            flags |= FLAG_IV_UPDATE;
        }
        flags
    }

    fn from_flags(
        beacon_type: BeaconType,
        network_key: &NetworkKey,
        old_key_used: bool,
        flags: u8,
        index: u32,
    ) -> Self {
        NetworkBeacon {
            beacon_type,
            network_key_index: network_key.index(),
            old_key_used,
            key_refresh: flags & FLAG_KEY_REFRESH != 0,
            iv_index: IvIndex::new(index, flags & FLAG_IV_UPDATE != 0),
        }
    }

    /// Decodes and authenticates a Secure Network or Private beacon.
    ///
    /// # Errors
    /// - `DecodeError::TooShort`: empty or wrong length for its type
    /// - `DecodeError::UnsupportedType`: not a network beacon
    /// - `DecodeError::UnknownNetworkKey`: no key matches the Network ID
    /// - `DecodeError::InvalidMic`: Network ID matched but authentication failed,
    ///   or no key authenticated a Private beacon
    pub fn decode<'a>(
        pdu: &[u8],
        network_keys: impl IntoIterator<Item = &'a NetworkKey>,
    ) -> Result<Self, DecodeError> {
        let first = *pdu.first().ok_or(DecodeError::TooShort)?;
        match BeaconType::from_byte(first) {
            Some(BeaconType::SecureNetwork) => Self::decode_secure(pdu, network_keys),
            Some(BeaconType::Private) => Self::decode_private(pdu, network_keys),
            _ => Err(DecodeError::UnsupportedType),
        }
    }

    fn decode_secure<'a>(
        pdu: &[u8],
        network_keys: impl IntoIterator<Item = &'a NetworkKey>,
    ) -> Result<Self, DecodeError> {
        if pdu.len() != SECURE_NETWORK_BEACON_LEN {
            return Err(DecodeError::TooShort);
        }
        let flags = pdu[1];
        let network_id = &pdu[2..10];
        let index = u32::from_be_bytes([pdu[10], pdu[11], pdu[12], pdu[13]]);

        let mut result = Err(DecodeError::UnknownNetworkKey);
        for network_key in network_keys {
            for (material, old_key_used) in candidates(network_key) {
                if material.network_id != network_id {
                    continue;
                }
                let auth = authenticate_secure_beacon(&pdu[1..14], &material.derivatives.beacon_key);
                if verify_tag(&auth, &pdu[14..22]) {
                    trace!(key_index = network_key.index(), flags, index, "secure network beacon");
                    return Ok(Self::from_flags(
                        BeaconType::SecureNetwork,
                        network_key,
                        old_key_used,
                        flags,
                        index,
                    ));
                }
                result = Err(DecodeError::InvalidMic);
            }
        }
        result
    }

    fn decode_private<'a>(
        pdu: &[u8],
        network_keys: impl IntoIterator<Item = &'a NetworkKey>,
    ) -> Result<Self, DecodeError> {
        if pdu.len() != PRIVATE_BEACON_LEN {
            return Err(DecodeError::TooShort);
        }
        for network_key in network_keys {
            for (material, old_key_used) in candidates(network_key) {
                let private_key = &material.derivatives.private_beacon_key;
                if let Some(data) = decode_and_authenticate_private_beacon(pdu, private_key) {
                    trace!(key_index = network_key.index(), flags = data.flags, "private beacon");
                    return Ok(Self::from_flags(
                        BeaconType::Private,
                        network_key,
                        old_key_used,
                        data.flags,
                        data.iv_index,
                    ));
                }
            }
        }
        Err(DecodeError::InvalidMic)
    }

    /// Builds the Secure Network beacon a node with this key and IV Index sends.
    ///
    /// The Key Refresh flag is set in Using New Keys; the material follows
    /// the transmit keys of the phase.
    pub fn encode_secure(network_key: &NetworkKey, iv_index: &IvIndex) -> Vec<u8> {
        let material = network_key.transmit_keys();
        let key_refresh = network_key.phase() == KeyRefreshPhase::UsingNewKeys;

        let mut pdu = Vec::with_capacity(SECURE_NETWORK_BEACON_LEN);
        pdu.push(BeaconType::SecureNetwork as u8);
        pdu.push(Self::flags(key_refresh, iv_index));
        pdu.extend_from_slice(&material.network_id);
        pdu.extend_from_slice(&iv_index.index.to_be_bytes());
        let auth = authenticate_secure_beacon(&pdu[1..14], &material.derivatives.beacon_key);
        pdu.extend_from_slice(&auth);
        pdu
    }

    /// Builds a Private beacon with the given 13-byte random.
    pub fn encode_private(
        network_key: &NetworkKey,
        iv_index: &IvIndex,
        random: &[u8; 13],
    ) -> Result<Vec<u8>, TransportError> {
        let material = network_key.transmit_keys();
        let key_refresh = network_key.phase() == KeyRefreshPhase::UsingNewKeys;
        let data = PrivateBeaconData {
            flags: Self::flags(key_refresh, iv_index),
            iv_index: iv_index.index,
        };
        let pdu = encode_private_beacon(&data, random, &material.derivatives.private_beacon_key)?;
        Ok(pdu.to_vec())
    }
}
