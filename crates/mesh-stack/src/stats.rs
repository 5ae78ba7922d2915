//! Pipeline counters

use serde::Serialize;

/// Counters of what the pipeline sent, delivered and dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MeshStats {
    pub network_pdus_sent: u64,
    pub network_pdus_received: u64,
    /// No key or IV Index authenticated the PDU
    pub network_pdus_undecodable: u64,
    pub replays_rejected: u64,
    /// Malformed or inconsistent lower transport PDUs
    pub malformed_dropped: u64,
    /// Unicast messages for other nodes, or echoes of our own
    pub not_for_us_dropped: u64,
    pub access_messages_delivered: u64,
    pub access_messages_undecryptable: u64,
    pub control_messages_delivered: u64,
    pub segment_acks_sent: u64,
    pub segment_acks_received: u64,
    pub incomplete_discarded: u64,
    pub beacons_received: u64,
    pub beacons_rejected: u64,
    pub iv_index_updates: u64,
}

impl MeshStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
