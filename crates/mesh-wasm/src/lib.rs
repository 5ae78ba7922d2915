//! # mesh-wasm
//!
//! wasm-bindgen exports: the public API a browser (Web Bluetooth) client
//! uses to talk to a mesh network through a GATT proxy node.
//!
//! ## Usage (TypeScript)
//!
//! ```typescript
//! import { MeshProxyClient, init_panic_hook } from '../mesh-wasm-pkg/mesh_wasm';
//!
//! // Stack traces on panic (development)
//! init_panic_hook();
//!
//! // Client with the primary NetKey, one AppKey and our unicast address
//! const client = new MeshProxyClient(
//!     '{"default_ttl": 5}',
//!     "7dd7364cd842ad18c17c2b820c84c3d6",
//!     0x7f01,
//!     0x12345678,
//!     false,
//! );
//! client.addApplicationKey(0x456, "63964771734fbd76e3b40519d1d94a48", 0);
//!
//! // Notifications of the Mesh Proxy Data Out characteristic
//! const event = client.recvProxyPacket(value, Date.now());
//! if (event !== undefined) {
//!     handleMeshEvent(JSON.parse(event));
//! }
//!
//! // Generic OnOff Set to 0x0002
//! const packets = client.sendAccess(0x0002, 0x456, 0x8202, new Uint8Array([1, 0]), Date.now());
//! for (const pkt of packets) {
//!     await dataIn.writeValueWithoutResponse(pkt);
//! }
//!
//! // Periodic timer (every 50 ms): acknowledgments and expiries
//! const due = client.tick(Date.now());
//! ```

use wasm_bindgen::prelude::*;

pub mod client;
pub mod event;

pub use client::MeshProxyClient;

extern crate alloc;

/// Prints panics with a stack trace to the browser console.
///
/// Call it during development. Production builds can drop it with the
/// feature flag.
#[wasm_bindgen]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Converts a 32-character hex key into a 16-byte Uint8Array.
///
/// For tests and debugging; `MeshProxyClient` takes hex keys directly.
///
/// # Errors
/// - not valid hex
/// - not 16 bytes
#[wasm_bindgen(js_name = "decodeHexKey")]
pub fn decode_hex_key(key_hex: &str) -> Result<js_sys::Uint8Array, JsError> {
    let key = mesh_crypto::decode_hex_key(key_hex)
        .map_err(|e| JsError::new(&alloc::format!("{}", e)))?;
    let arr = js_sys::Uint8Array::new_with_length(16);
    arr.copy_from(&key);
    Ok(arr)
}

/// Virtual address of a Label UUID given in hex.
///
/// # Errors
/// - not valid hex
/// - not 16 bytes
#[wasm_bindgen(js_name = "virtualAddress")]
pub fn virtual_address(label_hex: &str) -> Result<u16, JsError> {
    let label = mesh_crypto::decode_hex_key(label_hex)
        .map_err(|e| JsError::new(&alloc::format!("Invalid Label UUID: {}", e)))?;
    Ok(mesh_crypto::calculate_virtual_address(&label))
}
