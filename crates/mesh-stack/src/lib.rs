//! # mesh-stack
//!
//! The send/receive pipeline of a Bluetooth Mesh node or proxy client,
//! built on the codecs of `mesh-transport`.
//!
//! ## Incoming Network PDU
//!
//! ```text
//! bytes ─▶ NetworkPdu::decode (NID, NetMIC, IVI)
//!       ─▶ own source / foreign unicast destination? drop
//!       ─▶ ReplayCache (SeqAuth of the message, segment 0 for segments)
//!       ─▶ LowerTransportPdu::decode
//!       ─▶ Reassembler (Segment Acknowledgment to the sender)
//!       ─▶ upper transport decrypt (Application or Device Key)
//!       ─▶ MeshEvent::Access / MeshEvent::Control
//! ```
//!
//! Beacons drive the IV Index and Key Refresh state. Drops are silent to
//! the caller, logged with `tracing` and counted in [`MeshStats`].
//!
//! ## Collaborators
//!
//! - [`Transmitter`]: takes finished PDUs to the bearer
//! - [`Storage`]: keeps the persisted [`mesh_proto::MeshState`] snapshot

pub mod config;
pub mod error;
pub mod replay;
pub mod sequence;
pub mod stack;
pub mod stats;
pub mod storage;
pub mod transmitter;

pub use config::MeshConfig;
pub use error::{ConfigError, StackError};
pub use replay::ReplayCache;
pub use sequence::SequenceCounters;
pub use stack::{
    AccessKey, BeaconReport, MeshEvent, MeshStack, OutgoingAccess, OutgoingControl,
    ReceivedAccess, ReceivedControl, PRIMARY_NETWORK_KEY_INDEX,
};
pub use stats::MeshStats;
pub use storage::{MemoryStorage, Storage};
pub use transmitter::{BearerError, PduType, QueueTransmitter, Transmitter};
