//! MeshProxyClient wasm-bindgen export
//!
//! Main entry point of a browser that joins a mesh network through a GATT
//! proxy node. It ties the network/transport pipeline to the proxy SAR.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Display;

use js_sys::Uint8Array;
use wasm_bindgen::prelude::*;

use mesh_crypto::decode_hex_key;
use mesh_keys::{ApplicationKey, IvIndex, KeyIndex, NetworkKey};
use mesh_proto::MeshState;
use mesh_stack::{
    AccessKey, MemoryStorage, MeshConfig, MeshEvent, MeshStack, OutgoingAccess, QueueTransmitter,
    StackError, PRIMARY_NETWORK_KEY_INDEX,
};
use mesh_transport::{AccessPdu, Address, MeshAddress, ProxyProtocolHandler};

use crate::event::event_to_json;

type ProxyStack = MeshStack<QueueTransmitter, MemoryStorage>;

fn js_error(context: &str, e: impl Display) -> JsError {
    JsError::new(&format!("{}: {}", context, e))
}

fn to_uint8_array(bytes: &[u8]) -> Uint8Array {
    let arr = Uint8Array::new_with_length(bytes.len() as u32);
    arr.copy_from(bytes);
    arr
}

fn to_js_array(packets: &[Vec<u8>]) -> js_sys::Array {
    let result = js_sys::Array::new();
    for packet in packets {
        result.push(&to_uint8_array(packet));
    }
    result
}

/// Mesh session of a proxy client
///
/// ## Internal architecture
///
/// ```text
/// MeshProxyClient
///   ├── MeshStack            (mesh-stack) - keys, IV Index, replay, segmentation
///   │     └── QueueTransmitter            - finished Network PDUs / proxy configs
///   └── ProxyProtocolHandler (mesh-transport) - GATT Proxy PDU SAR
/// ```
///
/// Every packet the client wants written to the Mesh Proxy Data In
/// characteristic is returned as an array of MTU-sized Uint8Arrays.
///
/// ## Thread safety
///
/// WASM is single-threaded; JS calls the client from one thread.
#[wasm_bindgen]
pub struct MeshProxyClient {
    stack: ProxyStack,
    sar: ProxyProtocolHandler,
    /// Unicast address of this client (source of everything it sends)
    address: Address,
}

#[wasm_bindgen]
impl MeshProxyClient {
    /// Creates a client on the primary subnet.
    ///
    /// # Arguments
    /// - `config_json`: `MeshConfig` as JSON, `"{}"` for the defaults
    /// - `network_key_hex`: primary Network Key (Key Index 0), 32 hex characters
    /// - `address`: unicast address assigned to this client at provisioning
    /// - `iv_index`, `iv_update_active`: current IV state of the network
    ///
    /// # Errors
    /// - invalid configuration
    /// - undecodable key
    /// - `address` is not a unicast address
    ///
    /// # Example (TypeScript)
    /// ```typescript
    /// const client = new MeshProxyClient("{}", "7dd7364cd842ad18c17c2b820c84c3d6", 0x7f01, 0x12345678, false);
    /// ```
    #[wasm_bindgen(constructor)]
    pub fn new(
        config_json: &str,
        network_key_hex: &str,
        address: u16,
        iv_index: u32,
        iv_update_active: bool,
    ) -> Result<MeshProxyClient, JsError> {
        let config = MeshConfig::from_json(config_json).map_err(|e| js_error("Invalid configuration", e))?;
        let network_key = NetworkKey::from_hex(PRIMARY_NETWORK_KEY_INDEX, network_key_hex)
            .map_err(|e| js_error("Invalid network key", e))?;
        MeshProxyClient::with_network_key(config, network_key, address, IvIndex::new(iv_index, iv_update_active))
            .map_err(|e| js_error("Client setup failed", e))
    }

    /// Adds a Network Key of another subnet.
    #[wasm_bindgen(js_name = "addNetworkKey")]
    pub fn add_network_key(&self, index: u16, key_hex: &str) -> Result<(), JsError> {
        let network_key = NetworkKey::from_hex(index, key_hex).map_err(|e| js_error("Invalid network key", e))?;
        self.stack.add_network_key(network_key);
        Ok(())
    }

    /// Adds an Application Key bound to a known Network Key.
    #[wasm_bindgen(js_name = "addApplicationKey")]
    pub fn add_application_key(
        &self,
        index: u16,
        key_hex: &str,
        network_key_index: u16,
    ) -> Result<(), JsError> {
        let app_key = ApplicationKey::from_hex(index, key_hex, network_key_index)
            .map_err(|e| js_error("Invalid application key", e))?;
        self.stack
            .add_application_key(app_key)
            .map_err(|e| js_error("Application key rejected", e))
    }

    /// Sets the Device Key of a node, for configuration messages.
    #[wasm_bindgen(js_name = "setDeviceKey")]
    pub fn set_device_key(&self, address: u16, key_hex: &str) -> Result<(), JsError> {
        let key = decode_hex_key(key_hex).map_err(|e| js_error("Invalid device key", e))?;
        self.stack.set_device_key(address, key);
        Ok(())
    }

    /// Subscribes to a Label UUID and returns its virtual address.
    #[wasm_bindgen(js_name = "addLabel")]
    pub fn add_label(&self, label_hex: &str) -> Result<u16, JsError> {
        let label = decode_hex_key(label_hex).map_err(|e| js_error("Invalid Label UUID", e))?;
        self.stack.add_label(label);
        Ok(MeshAddress::from_label(label).address)
    }

    /// Processes one notification of the Mesh Proxy Data Out characteristic.
    ///
    /// Processing:
    /// 1. Proxy SAR reassembly
    /// 2. Network PDU / beacon / proxy configuration handling
    /// 3. Lower transport reassembly and upper transport decryption
    ///
    /// # Arguments
    /// - `packet`: characteristic value
    /// - `now_ms`: current time (`Date.now()`)
    ///
    /// # Returns
    /// The delivered event as JSON, or `undefined` when the packet delivered
    /// nothing (partial message, replay, foreign network...).
    /// Acknowledgments it caused are returned by the next `takePackets` or `tick`.
    #[wasm_bindgen(js_name = "recvProxyPacket")]
    pub fn recv_proxy_packet(&mut self, packet: &[u8], now_ms: f64) -> Option<String> {
        self.receive(packet, now_ms as u64).map(|event| event_to_json(&event))
    }

    /// Sends an access message with an Application Key.
    ///
    /// # Arguments
    /// - `destination`: unicast, group or virtual address
    /// - `app_key_index`: Key Index of the Application Key
    /// - `opcode`: 1, 2 or 3-byte opcode
    /// - `parameters`: message parameters
    /// - `now_ms`: current time (`Date.now()`)
    ///
    /// # Returns
    /// Proxy PDUs to write to the Mesh Proxy Data In characteristic, in order.
    ///
    /// # Errors
    /// - unknown key
    /// - payload too large for 32 segments
    /// - sequence numbers exhausted
    #[wasm_bindgen(js_name = "sendAccess")]
    pub fn send_access(
        &self,
        destination: u16,
        app_key_index: u16,
        opcode: u32,
        parameters: &[u8],
        now_ms: f64,
    ) -> Result<js_sys::Array, JsError> {
        let message = self.outgoing(MeshAddress::new(destination), AccessKey::Application(app_key_index), opcode, parameters);
        let packets = self.send(&message, now_ms as u64).map_err(|e| js_error("Send failed", e))?;
        Ok(to_js_array(&packets))
    }

    /// Sends an access message to the virtual address of a Label UUID.
    #[wasm_bindgen(js_name = "sendAccessToLabel")]
    pub fn send_access_to_label(
        &self,
        label_hex: &str,
        app_key_index: u16,
        opcode: u32,
        parameters: &[u8],
        now_ms: f64,
    ) -> Result<js_sys::Array, JsError> {
        let label = decode_hex_key(label_hex).map_err(|e| js_error("Invalid Label UUID", e))?;
        let message = self.outgoing(MeshAddress::from_label(label), AccessKey::Application(app_key_index), opcode, parameters);
        let packets = self.send(&message, now_ms as u64).map_err(|e| js_error("Send failed", e))?;
        Ok(to_js_array(&packets))
    }

    /// Sends a configuration message encrypted with the Device Key of `destination`.
    #[wasm_bindgen(js_name = "sendConfigMessage")]
    pub fn send_config_message(
        &self,
        destination: u16,
        opcode: u32,
        parameters: &[u8],
        now_ms: f64,
    ) -> Result<js_sys::Array, JsError> {
        let network_key_index = self.stack.proxy_network_key().unwrap_or(PRIMARY_NETWORK_KEY_INDEX);
        let key = AccessKey::Device { network_key_index };
        let message = self.outgoing(MeshAddress::new(destination), key, opcode, parameters);
        let packets = self.send(&message, now_ms as u64).map_err(|e| js_error("Send failed", e))?;
        Ok(to_js_array(&packets))
    }

    /// Sends a proxy configuration message (filter type, add/remove addresses).
    ///
    /// # Example (TypeScript)
    /// ```typescript
    /// // Set Filter Type: accept list
    /// const packets = client.sendProxyConfiguration(0x00, new Uint8Array([0x00]));
    /// ```
    #[wasm_bindgen(js_name = "sendProxyConfiguration")]
    pub fn send_proxy_configuration(&self, opcode: u8, parameters: &[u8]) -> Result<js_sys::Array, JsError> {
        self.stack
            .send_proxy_configuration(opcode, parameters)
            .map_err(|e| js_error("Send failed", e))?;
        Ok(to_js_array(&self.drain_packets()))
    }

    /// Periodic timer tick (every 50 ms from `setInterval`).
    ///
    /// - sends Segment Acknowledgments whose timer expired
    /// - drops incomplete incoming and unacknowledged outgoing messages
    ///
    /// # Returns
    /// Proxy PDUs to write
    #[wasm_bindgen]
    pub fn tick(&self, now_ms: f64) -> js_sys::Array {
        self.stack.tick(now_ms as u64);
        to_js_array(&self.drain_packets())
    }

    /// Proxy PDUs queued since the last call (acknowledgments, retransmissions).
    #[wasm_bindgen(js_name = "takePackets")]
    pub fn take_packets(&self) -> js_sys::Array {
        to_js_array(&self.drain_packets())
    }

    #[wasm_bindgen(js_name = "ivIndex")]
    pub fn iv_index(&self) -> u32 {
        self.stack.iv_index().index
    }

    #[wasm_bindgen(js_name = "ivUpdateActive")]
    pub fn iv_update_active(&self) -> bool {
        self.stack.iv_index().update_active
    }

    /// Whether the network should start an IV Update before sequence numbers run out.
    #[wasm_bindgen(js_name = "needsIvUpdate")]
    pub fn needs_iv_update(&self) -> bool {
        self.stack.needs_iv_update()
    }

    /// Replay-safe state as a Protocol Buffers message, for IndexedDB.
    #[wasm_bindgen(js_name = "exportState")]
    pub fn export_state(&self) -> Uint8Array {
        to_uint8_array(&self.stack.export_state().encode_to_bytes())
    }

    /// Restores a state saved with `exportState`.
    ///
    /// # Errors
    /// - not a valid state message
    /// - keys in the state are invalid
    #[wasm_bindgen(js_name = "importState")]
    pub fn import_state(&mut self, bytes: &[u8]) -> Result<(), JsError> {
        self.restore(bytes).map_err(|e| js_error("Invalid state", e))
    }

    /// Pipeline counters as a JSON string.
    ///
    /// # Returns
    /// ```json
    /// {
    ///   "network_pdus_sent": 12,
    ///   "network_pdus_received": 30,
    ///   "replays_rejected": 1,
    ///   "access_messages_delivered": 9,
    ///   ...
    /// }
    /// ```
    #[wasm_bindgen(js_name = "getStats")]
    pub fn get_stats(&self) -> String {
        self.stack.stats().to_json()
    }
}

impl MeshProxyClient {
    /// Builds a client from parsed values.
    ///
    /// # Errors
    /// - `StackError::Config`: invalid configuration
    /// - `StackError::Transport`: `address` is not a unicast address
    pub fn with_network_key(
        config: MeshConfig,
        network_key: NetworkKey,
        address: Address,
        iv_index: IvIndex,
    ) -> Result<Self, StackError> {
        let stack = MeshStack::new(config, QueueTransmitter::new(), MemoryStorage::new())?;
        let network_key_index: KeyIndex = network_key.index();
        stack.add_network_key(network_key);
        stack.add_local_address(address)?;
        stack.set_iv_index(iv_index, None);
        stack.set_proxy_network_key(network_key_index)?;
        Ok(MeshProxyClient {
            stack,
            sar: ProxyProtocolHandler::new(),
            address,
        })
    }

    pub fn stack(&self) -> &MeshStack<QueueTransmitter, MemoryStorage> {
        &self.stack
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Adds one Proxy PDU; returns what a completed message delivered.
    pub fn receive(&mut self, packet: &[u8], now_ms: u64) -> Option<MeshEvent> {
        let (message, pdu_type) = self.sar.reassemble(packet).ok()??;
        self.stack.handle_incoming(&message, pdu_type, now_ms)
    }

    /// Sends an access message and returns its Proxy PDUs.
    ///
    /// # Errors
    /// See [`MeshStack::send_access`].
    pub fn send(&self, message: &OutgoingAccess, now_ms: u64) -> Result<Vec<Vec<u8>>, StackError> {
        self.stack.send_access(message, now_ms)?;
        Ok(self.drain_packets())
    }

    /// Takes everything the pipeline sent and splits it into Proxy PDUs.
    pub fn drain_packets(&self) -> Vec<Vec<u8>> {
        let mtu = self.stack.config().proxy_mtu;
        self.stack
            .transmitter()
            .drain()
            .into_iter()
            .flat_map(|(pdu, pdu_type)| ProxyProtocolHandler::segment(&pdu, pdu_type, mtu))
            .collect()
    }

    /// Replaces the pipeline state with a saved one.
    ///
    /// # Errors
    /// - `StackError::Proto`: undecodable message
    /// - see [`MeshStack::import_state`]
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), StackError> {
        let snapshot = MeshState::decode_from_bytes(bytes)?;
        self.stack.import_state(&snapshot)?;
        self.sar.reset();
        Ok(())
    }

    fn outgoing(&self, destination: MeshAddress, key: AccessKey, opcode: u32, parameters: &[u8]) -> OutgoingAccess {
        OutgoingAccess {
            access: AccessPdu::new(opcode, parameters.to_vec()),
            source: self.address,
            destination,
            key,
            ttl: None,
            high_security: false,
        }
    }
}
