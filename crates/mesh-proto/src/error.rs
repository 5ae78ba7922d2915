//! mesh-proto error type

/// Failure to restore a persisted [`crate::MeshState`].
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Protobuf decoding failed
    #[error("state decode failed: {0}")]
    DecodeFailed(prost::DecodeError),
    /// Snapshot written by an incompatible format version
    #[error("unsupported state version: {0} (expected {expected})", expected = crate::MESH_STATE_VERSION)]
    UnsupportedVersion(u32),
}
