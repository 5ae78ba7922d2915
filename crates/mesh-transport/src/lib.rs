//! # mesh-transport
//!
//! Bluetooth Mesh network and transport layers: the Network PDU codec,
//! lower transport segmentation and reassembly, upper transport
//! encryption, network beacons and the GATT proxy SAR.
//!
//! ## Outgoing access message
//!
//! ```text
//! AccessPdu ──upper::encrypt_access──▶ Upper Transport PDU (+TransMIC)
//!           ──segmentation::segment──▶ 1..32 Lower Transport PDUs
//!           ──NetworkPdu::encode─────▶ Network PDUs (one per segment)
//!           ──ProxyProtocolHandler───▶ GATT Proxy PDUs (MTU sized)
//! ```
//!
//! Incoming traffic runs the same chain in reverse. Every decode function
//! returns a [`DecodeError`] kind; the caller drops the PDU silently.

#![no_std]
extern crate alloc;

pub mod access;
pub mod address;
pub mod beacon;
pub mod error;
pub mod lower;
pub mod network;
pub mod proxy;
pub mod segmentation;
pub mod upper;

pub use access::AccessPdu;
pub use address::{Address, MeshAddress};
pub use beacon::{BeaconType, NetworkBeacon};
pub use error::{DecodeError, TransportError};
pub use lower::{LowerTransportPdu, MessageKind, Segment, SegmentAcknowledgment};
pub use network::{LowerPduType, NetworkHeader, NetworkPdu, NetworkPduKind};
pub use proxy::{ProxyPduType, ProxyProtocolHandler};
pub use segmentation::{
    AckOutcome, OutgoingSegments, PendingAcknowledgment, ReassembledMessage, Reassembler,
    ReassemblyOutcome,
};
pub use upper::{AccessKeyUsed, DecryptedAccess, UpperTransportContext};
