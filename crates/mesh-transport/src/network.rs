//! Network layer
//!
//! ## Network PDU
//! ```text
//! [IVI:1|NID:7][CTL:1|TTL:7][SEQ: 3][SRC: 2] [DST: 2][TransportPDU: 1..16][NetMIC: 4|8]
//!  clear        ───── obfuscated (PECB) ─────  ────────── AES-CCM(EncryptionKey) ──────────
//! ```
//!
//! NetMIC is 32-bit for access messages and 64-bit for control messages.
//! The NID is sent in clear so that a receiver can shortlist candidate keys
//! before trying to decrypt.

use alloc::vec::Vec;

use mesh_crypto::{decrypt, encrypt, obfuscate, MeshNonce, MicSize};
use mesh_keys::{IvIndex, KeyIndex, KeyRefreshPhase, NetworkKey, NetworkKeyMaterial};
use tracing::trace;

use crate::address::{is_unicast, Address};
use crate::{DecodeError, TransportError};

/// Shortest valid Network PDU: 9 header bytes, 1 transport byte and a 32-bit MIC.
pub const MIN_NETWORK_PDU_LEN: usize = 14;

/// Largest TTL value.
pub const MAX_TTL: u8 = 127;

/// CTL bit of a Network PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LowerPduType {
    Access = 0,
    Control = 1,
}

impl LowerPduType {
    pub fn from_ctl(ctl: u8) -> Self {
        if ctl & 0x01 == 0 {
            LowerPduType::Access
        } else {
            LowerPduType::Control
        }
    }

    pub fn net_mic_size(self) -> MicSize {
        match self {
            LowerPduType::Access => MicSize::Bits32,
            LowerPduType::Control => MicSize::Bits64,
        }
    }
}

/// Which nonce secures the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkPduKind {
    /// Regular mesh traffic (network nonce)
    Network,
    /// Proxy configuration messages (proxy nonce)
    ProxyConfiguration,
}

/// Clear fields of an outgoing Network PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkHeader {
    pub pdu_type: LowerPduType,
    pub ttl: u8,
    /// 24-bit sequence number
    pub sequence: u32,
    pub source: Address,
    pub destination: Address,
}

/// A decoded or freshly encoded Network PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Encoded bytes as sent on the bearer
    pub pdu: Vec<u8>,
    pub network_key_index: KeyIndex,
    /// Whether the old key of a Key Refresh secured this PDU
    pub old_key_used: bool,
    /// IV Index used by the nonce
    pub iv_index: u32,
    pub ivi: u8,
    pub nid: u8,
    pub pdu_type: LowerPduType,
    pub ttl: u8,
    pub sequence: u32,
    pub source: Address,
    pub destination: Address,
    /// Lower transport PDU
    pub transport_pdu: Vec<u8>,
}

impl NetworkPdu {
    /// Encrypts and obfuscates a lower transport PDU.
    ///
    /// The key material and IV Index follow the Key Refresh phase of
    /// `network_key` and the transmit index of `iv_index`.
    ///
    /// # Errors
    /// - `TransportError::InvalidTtl`: TTL above 127
    /// - `TransportError::InvalidSource`: source not unicast
    pub fn encode(
        header: &NetworkHeader,
        transport_pdu: &[u8],
        network_key: &NetworkKey,
        iv_index: &IvIndex,
        kind: NetworkPduKind,
    ) -> Result<Self, TransportError> {
        if header.ttl > MAX_TTL {
            return Err(TransportError::InvalidTtl(header.ttl));
        }
        if !is_unicast(header.source) {
            return Err(TransportError::InvalidSource(header.source));
        }
        let keys = network_key.transmit_keys();
        let iv = iv_index.transmit_index();
        let ivi = (iv & 0x01) as u8;
        let sequence = header.sequence & 0x00FF_FFFF;
        let ctl_ttl = ((header.pdu_type as u8) << 7) | header.ttl;

        let nonce = match kind {
            NetworkPduKind::Network => MeshNonce::network(ctl_ttl, sequence, header.source, iv),
            NetworkPduKind::ProxyConfiguration => MeshNonce::proxy(sequence, header.source, iv),
        };

        let mut plaintext = Vec::with_capacity(2 + transport_pdu.len());
        plaintext.extend_from_slice(&header.destination.to_be_bytes());
        plaintext.extend_from_slice(transport_pdu);
        let encrypted = encrypt(
            &plaintext,
            &keys.derivatives.encryption_key,
            nonce.as_bytes(),
            header.pdu_type.net_mic_size(),
            &[],
        )?;

        let mut clear = [0u8; 6];
        clear[0] = ctl_ttl;
        clear[1..4].copy_from_slice(&sequence.to_be_bytes()[1..4]);
        clear[4..6].copy_from_slice(&header.source.to_be_bytes());
        let mut privacy_random = [0u8; 7];
        privacy_random.copy_from_slice(&encrypted[..7]);
        let obfuscated = obfuscate(&clear, &privacy_random, iv, &keys.derivatives.privacy_key);

        let nid = keys.nid();
        let mut pdu = Vec::with_capacity(7 + encrypted.len());
        pdu.push((ivi << 7) | nid);
        pdu.extend_from_slice(&obfuscated);
        pdu.extend_from_slice(&encrypted);

        Ok(NetworkPdu {
            pdu,
            network_key_index: network_key.index(),
            old_key_used: network_key.phase() == KeyRefreshPhase::KeyDistribution
                && network_key.old().is_some(),
            iv_index: iv,
            ivi,
            nid,
            pdu_type: header.pdu_type,
            ttl: header.ttl,
            sequence,
            source: header.source,
            destination: header.destination,
            transport_pdu: transport_pdu.to_vec(),
        })
    }

    /// Decodes a Network PDU with the first key that authenticates it.
    ///
    /// Keys are tried in order, current material before old material.
    ///
    /// # Errors
    /// - `DecodeError::TooShort`: fewer than 14 bytes
    /// - `DecodeError::UnknownNetworkKey`: no key has this NID
    /// - `DecodeError::InvalidMic`: a NID matched but no key authenticated the PDU
    pub fn decode<'a>(
        pdu: &[u8],
        kind: NetworkPduKind,
        network_keys: impl IntoIterator<Item = &'a NetworkKey>,
        iv_index: &IvIndex,
    ) -> Result<Self, DecodeError> {
        if pdu.len() < MIN_NETWORK_PDU_LEN {
            return Err(DecodeError::TooShort);
        }
        let mut result = Err(DecodeError::UnknownNetworkKey);
        for network_key in network_keys {
            match Self::decode_with_key(pdu, kind, network_key, iv_index) {
                Ok(decoded) => return Ok(decoded),
                Err(DecodeError::UnknownNetworkKey) => {}
                Err(e) => result = Err(e),
            }
        }
        result
    }

    /// Decodes a Network PDU with one Network Key (current, then old material).
    pub fn decode_with_key(
        pdu: &[u8],
        kind: NetworkPduKind,
        network_key: &NetworkKey,
        iv_index: &IvIndex,
    ) -> Result<Self, DecodeError> {
        if pdu.len() < MIN_NETWORK_PDU_LEN {
            return Err(DecodeError::TooShort);
        }
        let ivi = pdu[0] >> 7;
        let nid = pdu[0] & 0x7F;
        let iv = iv_index.index_for(ivi);

        let mut matched = false;
        for (material, old_key_used) in candidates(network_key) {
            if material.nid() != nid {
                continue;
            }
            matched = true;
            if let Some(decoded) = Self::try_material(pdu, kind, material, iv) {
                trace!(
                    src = decoded.source,
                    dst = decoded.destination,
                    seq = decoded.sequence,
                    key_index = network_key.index(),
                    "network PDU decoded"
                );
                return Ok(NetworkPdu {
                    network_key_index: network_key.index(),
                    old_key_used,
                    ivi,
                    nid,
                    ..decoded
                });
            }
        }
        if matched {
            Err(DecodeError::InvalidMic)
        } else {
            Err(DecodeError::UnknownNetworkKey)
        }
    }

    fn try_material(
        pdu: &[u8],
        kind: NetworkPduKind,
        material: &NetworkKeyMaterial,
        iv: u32,
    ) -> Option<NetworkPdu> {
        let obfuscated: &[u8; 6] = pdu[1..7].try_into().ok()?;
        let privacy_random: &[u8; 7] = pdu[7..14].try_into().ok()?;
        let clear = obfuscate(obfuscated, privacy_random, iv, &material.derivatives.privacy_key);

        let pdu_type = LowerPduType::from_ctl(clear[0] >> 7);
        let mic_size = pdu_type.net_mic_size();
        // DST (2) + at least one transport byte
        if pdu.len() < 7 + 3 + mic_size.len() {
            return None;
        }
        let ttl = clear[0] & 0x7F;
        let sequence = u32::from_be_bytes([0, clear[1], clear[2], clear[3]]);
        let source = u16::from_be_bytes([clear[4], clear[5]]);

        let nonce = match kind {
            NetworkPduKind::Network => MeshNonce::network(clear[0], sequence, source, iv),
            NetworkPduKind::ProxyConfiguration => MeshNonce::proxy(sequence, source, iv),
        };
        let decrypted = decrypt(
            &pdu[7..],
            &material.derivatives.encryption_key,
            nonce.as_bytes(),
            mic_size,
            &[],
        )?;

        Some(NetworkPdu {
            pdu: pdu.to_vec(),
            network_key_index: 0,
            old_key_used: false,
            iv_index: iv,
            ivi: 0,
            nid: 0,
            pdu_type,
            ttl,
            sequence,
            source,
            destination: u16::from_be_bytes([decrypted[0], decrypted[1]]),
            transport_pdu: decrypted[2..].to_vec(),
        })
    }

    /// SEG bit of the lower transport PDU.
    pub fn is_segmented(&self) -> bool {
        self.transport_pdu.first().is_some_and(|b| b & 0x80 != 0)
    }

    /// Sequence number of the whole message (SeqAuth low bits).
    ///
    /// For segments this is rebuilt from SeqZero; otherwise it is the PDU's
    /// own sequence number.
    pub fn message_sequence(&self) -> u32 {
        if self.is_segmented() && self.transport_pdu.len() >= 3 {
            let seq_zero = (u16::from(self.transport_pdu[1] & 0x7F) << 6)
                | u16::from(self.transport_pdu[2] >> 2);
            crate::lower::sequence_from_seq_zero(self.sequence, seq_zero)
        } else {
            self.sequence
        }
    }
}

/// Key material of `network_key` with its old-key flag, current first.
pub(crate) fn candidates(
    network_key: &NetworkKey,
) -> impl Iterator<Item = (&NetworkKeyMaterial, bool)> {
    core::iter::once((network_key.current(), false))
        .chain(network_key.old().map(|old| (old, true)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    fn sample_key() -> NetworkKey {
        NetworkKey::from_hex(0x000, "7dd7364cd842ad18c17c2b820c84c3d6").unwrap()
    }

    const IV: IvIndex = IvIndex::new(0x12345678, false);

    #[test]
    fn test_decode_control_pdu() {
        let pdu = bytes("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df");
        let decoded =
            NetworkPdu::decode_with_key(&pdu, NetworkPduKind::Network, &sample_key(), &IV).unwrap();

        assert_eq!(decoded.ivi, 0);
        assert_eq!(decoded.nid, 0x68);
        assert_eq!(decoded.pdu_type, LowerPduType::Control);
        assert_eq!(decoded.ttl, 0);
        assert_eq!(decoded.sequence, 1);
        assert_eq!(decoded.source, 0x1201);
        assert_eq!(decoded.destination, 0xFFFD);
        assert_eq!(decoded.transport_pdu, bytes("034b50057e400000010000"));
        assert_eq!(decoded.iv_index, 0x12345678);
        assert!(!decoded.old_key_used);
    }

    #[test]
    fn test_encode_control_pdu() {
        let header = NetworkHeader {
            pdu_type: LowerPduType::Control,
            ttl: 0,
            sequence: 1,
            source: 0x1201,
            destination: 0xFFFD,
        };
        let encoded = NetworkPdu::encode(
            &header,
            &bytes("034b50057e400000010000"),
            &sample_key(),
            &IV,
            NetworkPduKind::Network,
        )
        .unwrap();
        assert_eq!(
            hex::encode(&encoded.pdu),
            "68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df"
        );
    }

    #[test]
    fn test_decode_segmented_access_pdu() {
        let pdu = bytes("68cab5c5348a230afba8c63d4e686364979deaf4fd40961145939cda0e");
        let decoded =
            NetworkPdu::decode_with_key(&pdu, NetworkPduKind::Network, &sample_key(), &IV).unwrap();
        assert_eq!(decoded.pdu_type, LowerPduType::Access);
        assert_eq!(decoded.ttl, 4);
        assert_eq!(decoded.sequence, 0x3129AB);
        assert_eq!(decoded.source, 0x0003);
        assert_eq!(decoded.destination, 0x1201);
        assert_eq!(decoded.transport_pdu, bytes("8026ac01ee9dddfd2169326d23f3afdf"));
        assert!(decoded.is_segmented());
        assert_eq!(decoded.message_sequence(), 0x3129AB);
    }

    #[test]
    fn test_proxy_configuration_pdu() {
        let header = NetworkHeader {
            pdu_type: LowerPduType::Control,
            ttl: 0,
            sequence: 1,
            source: 0x0001,
            destination: 0x0000,
        };
        let key = sample_key();
        let encoded = NetworkPdu::encode(
            &header,
            &[0x00, 0x00],
            &key,
            &IV,
            NetworkPduKind::ProxyConfiguration,
        )
        .unwrap();
        assert_eq!(hex::encode(&encoded.pdu), "6841f149fd627ad49705fdc07c4ef4b5113c0a");

        let decoded =
            NetworkPdu::decode_with_key(&encoded.pdu, NetworkPduKind::ProxyConfiguration, &key, &IV)
                .unwrap();
        assert_eq!(decoded.transport_pdu, [0x00, 0x00]);
        // The network nonce does not authenticate a proxy configuration PDU
        assert_eq!(
            NetworkPdu::decode_with_key(&encoded.pdu, NetworkPduKind::Network, &key, &IV),
            Err(DecodeError::InvalidMic)
        );
    }

    #[test]
    fn test_decode_with_previous_iv_index() {
        // Sender still on 0x12345677 (IVI = 1) while we are updating to 0x12345678
        let key = sample_key();
        let sender_iv = IvIndex::new(0x12345677, false);
        let header = NetworkHeader {
            pdu_type: LowerPduType::Access,
            ttl: 3,
            sequence: 0x07080B,
            source: 0x1234,
            destination: 0xC105,
        };
        let encoded =
            NetworkPdu::encode(&header, &[0x00, 0x01, 0x02], &key, &sender_iv, NetworkPduKind::Network)
                .unwrap();
        assert_eq!(encoded.ivi, 1);

        let receiver_iv = IvIndex::new(0x12345678, true);
        let decoded =
            NetworkPdu::decode_with_key(&encoded.pdu, NetworkPduKind::Network, &key, &receiver_iv)
                .unwrap();
        assert_eq!(decoded.iv_index, 0x12345677);
        assert_eq!(decoded.destination, 0xC105);
    }

    #[test]
    fn test_key_refresh_material_selection() {
        let original = sample_key();
        let refreshing = original.rotate_key([0x42; 16]).unwrap();
        let header = NetworkHeader {
            pdu_type: LowerPduType::Access,
            ttl: 5,
            sequence: 10,
            source: 0x0001,
            destination: 0x0002,
        };
        // Key Distribution still sends with the old key
        let encoded =
            NetworkPdu::encode(&header, &[0xAA], &refreshing, &IV, NetworkPduKind::Network).unwrap();
        assert_eq!(encoded.nid, 0x68);
        assert!(encoded.old_key_used);

        let decoded =
            NetworkPdu::decode_with_key(&encoded.pdu, NetworkPduKind::Network, &refreshing, &IV).unwrap();
        assert!(decoded.old_key_used);

        // After revocation the old key no longer decodes
        let revoked = refreshing.use_new_keys().unwrap().revoke_old_key();
        assert_eq!(
            NetworkPdu::decode_with_key(&encoded.pdu, NetworkPduKind::Network, &revoked, &IV),
            Err(DecodeError::UnknownNetworkKey)
        );
    }

    #[test]
    fn test_decode_errors() {
        let key = sample_key();
        assert_eq!(
            NetworkPdu::decode(&[0x68; 13], NetworkPduKind::Network, [&key], &IV),
            Err(DecodeError::TooShort)
        );

        let mut pdu = bytes("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df");
        let other = NetworkKey::new(1, [0x01; 16]).unwrap();
        assert_eq!(
            NetworkPdu::decode(&pdu, NetworkPduKind::Network, [&other], &IV),
            Err(DecodeError::UnknownNetworkKey)
        );
        // The right key is found after a non-matching one
        assert!(NetworkPdu::decode(&pdu, NetworkPduKind::Network, [&other, &key], &IV).is_ok());

        let last = pdu.len() - 1;
        pdu[last] ^= 0x01;
        assert_eq!(
            NetworkPdu::decode(&pdu, NetworkPduKind::Network, [&other, &key], &IV),
            Err(DecodeError::InvalidMic)
        );
    }

    #[test]
    fn test_encode_rejects_invalid_header() {
        let key = sample_key();
        let mut header = NetworkHeader {
            pdu_type: LowerPduType::Access,
            ttl: 128,
            sequence: 1,
            source: 0x0001,
            destination: 0x0002,
        };
        assert_eq!(
            NetworkPdu::encode(&header, &[0], &key, &IV, NetworkPduKind::Network),
            Err(TransportError::InvalidTtl(128))
        );
        header.ttl = 5;
        header.source = 0xC000;
        assert_eq!(
            NetworkPdu::encode(&header, &[0], &key, &IV, NetworkPduKind::Network),
            Err(TransportError::InvalidSource(0xC000))
        );
    }
}
