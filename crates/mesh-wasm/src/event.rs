//! JSON form of the events handed to JavaScript
//!
//! ```json
//! {"type":"access","src":3,"dst":4609,"opcode":33282,"parameters":"0100",
//!  "key":{"app_key_index":1110,"old_key":false},"net_key_index":0,
//!  "iv_index":305419896,"seq":0,"ttl":4}
//! {"type":"control","opcode":10,"parameters":"...","src":1,"dst":2,"net_key_index":0,"ttl":5}
//! {"type":"proxy_configuration","opcode":3,"parameters":"...","src":1,"dst":0,"net_key_index":0,"ttl":0}
//! {"type":"beacon","beacon_type":"secure","net_key_index":0,"key_refresh":false,
//!  "iv_index":305419897,"iv_update_active":true,"iv_index_updated":true,"phase":0}
//! ```

use alloc::string::String;

use mesh_keys::KeyRefreshPhase;
use mesh_stack::{MeshEvent, ReceivedControl};
use mesh_transport::{AccessKeyUsed, BeaconType};
use serde_json::{json, Value};

fn control_json(kind: &str, message: &ReceivedControl) -> Value {
    json!({
        "type": kind,
        "opcode": message.opcode,
        "parameters": hex::encode(&message.parameters),
        "src": message.source,
        "dst": message.destination,
        "net_key_index": message.network_key_index,
        "ttl": message.ttl,
    })
}

fn phase_number(phase: KeyRefreshPhase) -> u8 {
    match phase {
        KeyRefreshPhase::NormalOperation => 0,
        KeyRefreshPhase::KeyDistribution => 1,
        KeyRefreshPhase::UsingNewKeys => 2,
    }
}

/// Converts a delivered event into its JSON value.
pub fn event_to_value(event: &MeshEvent) -> Value {
    match event {
        MeshEvent::Access(message) => {
            let key = match message.key {
                AccessKeyUsed::Application { index, old_key_used, .. } => {
                    json!({ "app_key_index": index, "old_key": old_key_used })
                }
                AccessKeyUsed::Device(address) => json!({ "device_key": address }),
            };
            let mut value = json!({
                "type": "access",
                "src": message.source,
                "dst": message.destination,
                "opcode": message.access.opcode,
                "parameters": hex::encode(&message.access.parameters),
                "key": key,
                "net_key_index": message.network_key_index,
                "iv_index": message.iv_index,
                "seq": message.sequence,
                "ttl": message.ttl,
            });
            if let Some(label) = message.label {
                value["label"] = Value::String(hex::encode(label));
            }
            value
        }
        MeshEvent::Control(message) => control_json("control", message),
        MeshEvent::ProxyConfiguration(message) => control_json("proxy_configuration", message),
        MeshEvent::Beacon(report) => {
            let beacon_type = match report.beacon.beacon_type {
                BeaconType::SecureNetwork => "secure",
                BeaconType::Private => "private",
                BeaconType::UnprovisionedDevice => "unprovisioned",
            };
            json!({
                "type": "beacon",
                "beacon_type": beacon_type,
                "net_key_index": report.beacon.network_key_index,
                "key_refresh": report.beacon.key_refresh,
                "iv_index": report.beacon.iv_index.index,
                "iv_update_active": report.beacon.iv_index.update_active,
                "iv_index_updated": report.iv_index_updated,
                "phase": phase_number(report.phase),
            })
        }
    }
}

pub fn event_to_json(event: &MeshEvent) -> String {
    serde_json::to_string(&event_to_value(event)).unwrap_or_default()
}
