//! # mesh-proto
//!
//! Protocol Buffers messages for the state a mesh node must keep across
//! restarts to stay replay-safe.
//!
//! ## MeshState
//!
//! ```text
//! MeshState
//!   version        : format version (MESH_STATE_VERSION)
//!   iv_index       : IvIndexState (index, update_active, last transition, IV Recovery flag)
//!   replay         : SeqAuthEntry* (source → last and previous IV Index + sequence)
//!   sequences      : SequenceEntry* (local source → next sequence number)
//!   network_keys   : NetworkKeyState* (index, key, old key, Key Refresh phase)
//!   application_keys: ApplicationKeyState* (index, bound NetKey index, key, old key)
//! ```
//!
//! The messages are defined with `prost` derives, so no `.proto` compilation
//! step is needed. Field tags are part of the persisted format and never
//! change meaning.

#![no_std]
extern crate alloc;

use alloc::vec::Vec;

pub mod error;

pub use error::ProtoError;

/// Persisted state format version.
pub const MESH_STATE_VERSION: u32 = 1;

/// Key Refresh phase as stored on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StoredKeyRefreshPhase {
    NormalOperation = 0,
    KeyDistribution = 1,
    UsingNewKeys = 2,
}

/// IV Index and the bookkeeping of its last transition.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IvIndexState {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(bool, tag = "2")]
    pub update_active: bool,
    /// Milliseconds since the Unix epoch of the last IV state change
    #[prost(uint64, optional, tag = "3")]
    pub transition_ms: Option<u64>,
    /// Set when the last change was an IV Index Recovery
    #[prost(bool, tag = "4")]
    pub iv_recovery: bool,
}

/// Highest accepted SeqAuth of one remote source, and the one before it.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SeqAuthEntry {
    #[prost(uint32, tag = "1")]
    pub source: u32,
    #[prost(uint32, tag = "2")]
    pub iv_index: u32,
    #[prost(uint32, tag = "3")]
    pub sequence: u32,
    /// IV Index of the previous SeqAuth; unset until a second message arrives
    #[prost(uint32, optional, tag = "4")]
    pub previous_iv_index: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub previous_sequence: Option<u32>,
}

/// Next sequence number of one local element.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SequenceEntry {
    #[prost(uint32, tag = "1")]
    pub source: u32,
    #[prost(uint32, tag = "2")]
    pub next_sequence: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NetworkKeyState {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub old_key: Option<Vec<u8>>,
    #[prost(enumeration = "StoredKeyRefreshPhase", tag = "4")]
    pub phase: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplicationKeyState {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(uint32, tag = "2")]
    pub bound_network_key_index: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub old_key: Option<Vec<u8>>,
}

/// Snapshot of everything a node persists.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshState {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(message, optional, tag = "2")]
    pub iv_index: Option<IvIndexState>,
    #[prost(message, repeated, tag = "3")]
    pub replay: Vec<SeqAuthEntry>,
    #[prost(message, repeated, tag = "4")]
    pub sequences: Vec<SequenceEntry>,
    #[prost(message, repeated, tag = "5")]
    pub network_keys: Vec<NetworkKeyState>,
    #[prost(message, repeated, tag = "6")]
    pub application_keys: Vec<ApplicationKeyState>,
}

impl MeshState {
    /// Empty snapshot stamped with the current format version.
    pub fn new() -> Self {
        MeshState {
            version: Some(MESH_STATE_VERSION),
            ..Default::default()
        }
    }

    /// Decodes a snapshot.
    ///
    /// # Errors
    /// - `ProtoError::DecodeFailed`: not a valid protobuf encoding
    /// - `ProtoError::UnsupportedVersion`: written by another format version
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        use prost::Message;
        let state = MeshState::decode(bytes).map_err(ProtoError::DecodeFailed)?;

        // Snapshots without a version predate versioning and are accepted
        if let Some(version) = state.version {
            if version != MESH_STATE_VERSION {
                return Err(ProtoError::UnsupportedVersion(version));
            }
        }

        Ok(state)
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        use prost::Message;
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf).expect("MeshState encode into Vec should not fail");
        buf
    }

    /// Last accepted SeqAuth of `source`, if any.
    pub fn replay_entry(&self, source: u16) -> Option<&SeqAuthEntry> {
        self.replay.iter().find(|e| e.source == u32::from(source))
    }
}

impl NetworkKeyState {
    /// Stored phase, falling back to Normal Operation for unknown values.
    pub fn stored_phase(&self) -> StoredKeyRefreshPhase {
        StoredKeyRefreshPhase::try_from(self.phase).unwrap_or(StoredKeyRefreshPhase::NormalOperation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn sample_state() -> MeshState {
        let mut state = MeshState::new();
        state.iv_index = Some(IvIndexState {
            index: 0x12345678,
            update_active: true,
            transition_ms: Some(1_700_000_000_000),
            iv_recovery: false,
        });
        state.replay.push(SeqAuthEntry {
            source: 0x1201,
            iv_index: 0x12345678,
            sequence: 6,
            previous_iv_index: Some(0x12345678),
            previous_sequence: Some(2),
        });
        state.sequences.push(SequenceEntry { source: 0x0003, next_sequence: 0x3129AD });
        state.network_keys.push(NetworkKeyState {
            index: 0x123,
            key: vec![0x7D; 16],
            old_key: Some(vec![0x11; 16]),
            phase: StoredKeyRefreshPhase::KeyDistribution as i32,
        });
        state.application_keys.push(ApplicationKeyState {
            index: 0x456,
            bound_network_key_index: 0x123,
            key: vec![0x63; 16],
            old_key: None,
        });
        state
    }

    #[test]
    fn test_state_encode_decode_roundtrip() {
        let state = sample_state();
        let decoded = MeshState::decode_from_bytes(&state.encode_to_bytes()).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.replay_entry(0x1201).map(|e| e.sequence), Some(6));
        assert_eq!(decoded.replay_entry(0x1201).and_then(|e| e.previous_sequence), Some(2));
        assert!(decoded.replay_entry(0x1234).is_none());
        assert_eq!(
            decoded.network_keys[0].stored_phase(),
            StoredKeyRefreshPhase::KeyDistribution
        );
    }

    #[test]
    fn test_empty_state_has_version() {
        let bytes = MeshState::new().encode_to_bytes();
        let decoded = MeshState::decode_from_bytes(&bytes).unwrap();
        assert_eq!(decoded.version, Some(MESH_STATE_VERSION));
        assert!(decoded.iv_index.is_none());
    }

    #[test]
    fn test_unversioned_state_is_accepted() {
        let decoded = MeshState::decode_from_bytes(&[]).unwrap();
        assert_eq!(decoded.version, None);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut state = MeshState::new();
        state.version = Some(MESH_STATE_VERSION + 1);
        let result = MeshState::decode_from_bytes(&state.encode_to_bytes());
        assert!(matches!(result, Err(ProtoError::UnsupportedVersion(v)) if v == MESH_STATE_VERSION + 1));
    }

    #[test]
    fn test_garbage_rejected() {
        // Field 1 as a length-delimited value that runs past the end
        let result = MeshState::decode_from_bytes(&[0x0A, 0xFF, 0x01]);
        assert!(matches!(result, Err(ProtoError::DecodeFailed(_))));
    }

    #[test]
    fn test_unknown_phase_falls_back() {
        let key = NetworkKeyState { index: 0, key: vec![0; 16], old_key: None, phase: 7 };
        assert_eq!(key.stored_phase(), StoredKeyRefreshPhase::NormalOperation);
    }
}
