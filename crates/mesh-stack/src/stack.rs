//! Send/receive pipeline of one mesh network instance
//!
//! ```text
//! send_access     ─▶ upper encrypt ─▶ segment ─▶ NetworkPdu::encode ─▶ Transmitter
//! handle_incoming ─▶ NetworkPdu::decode ─▶ replay check ─▶ lower decode
//!                 ─▶ reassembly (+ Segment Acknowledgment) ─▶ upper decrypt ─▶ MeshEvent
//! ```
//!
//! All mutable state (keys, IV Index, sequence numbers, reassembly buffers)
//! sits behind one `Mutex`, so a `MeshStack` can be shared between the
//! thread that receives from the bearer and the one that sends.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mesh_crypto::{key_from_slice, Key};
use mesh_keys::{ApplicationKey, IvIndex, KeyError, KeyIndex, KeyRefreshPhase, NetworkKey};
use mesh_proto::{
    ApplicationKeyState, IvIndexState, MeshState, NetworkKeyState, StoredKeyRefreshPhase,
};
use mesh_transport::address::{is_unicast, UNASSIGNED_ADDRESS};
use mesh_transport::segmentation::{
    is_segmentation_required, segment, MAX_UNSEGMENTED_CONTROL_LEN,
};
use mesh_transport::upper::{decrypt_with_application_keys, decrypt_with_device_keys, encrypt_access};
use mesh_transport::{
    AccessKeyUsed, AccessPdu, Address, AckOutcome, LowerPduType, LowerTransportPdu, MeshAddress,
    MessageKind, NetworkBeacon, NetworkHeader, NetworkPdu, NetworkPduKind, OutgoingSegments,
    Reassembler, ReassemblyOutcome, SegmentAcknowledgment, TransportError, UpperTransportContext,
};
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::error::StackError;
use crate::replay::ReplayCache;
use crate::sequence::SequenceCounters;
use crate::stats::MeshStats;
use crate::storage::Storage;
use crate::transmitter::{PduType, Transmitter};

/// Key Index of the primary subnet.
pub const PRIMARY_NETWORK_KEY_INDEX: KeyIndex = 0;

/// Key an outgoing access message is encrypted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKey {
    Application(KeyIndex),
    /// Device Key of the destination (or, failing that, of the source),
    /// sent on the given subnet
    Device { network_key_index: KeyIndex },
}

/// An access message to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAccess {
    pub access: AccessPdu,
    /// Local element sending the message
    pub source: Address,
    pub destination: MeshAddress,
    pub key: AccessKey,
    /// `None` uses the configured default TTL
    pub ttl: Option<u8>,
    /// 64-bit TransMIC when the message ends up segmented
    pub high_security: bool,
}

/// A transport control message to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingControl {
    pub opcode: u8,
    pub parameters: Vec<u8>,
    pub source: Address,
    pub destination: Address,
    pub network_key_index: KeyIndex,
    pub ttl: Option<u8>,
}

/// A decrypted access message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAccess {
    pub access: AccessPdu,
    pub source: Address,
    pub destination: Address,
    /// Label UUID of a virtual destination
    pub label: Option<[u8; 16]>,
    pub key: AccessKeyUsed,
    pub network_key_index: KeyIndex,
    pub iv_index: u32,
    /// Sequence number of the message (of its first segment)
    pub sequence: u32,
    pub ttl: u8,
}

/// A transport control or proxy configuration message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedControl {
    pub opcode: u8,
    pub parameters: Vec<u8>,
    pub source: Address,
    pub destination: Address,
    pub network_key_index: KeyIndex,
    pub ttl: u8,
}

/// An authenticated network beacon and what it changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconReport {
    pub beacon: NetworkBeacon,
    /// The beacon's IV state replaced ours
    pub iv_index_updated: bool,
    /// Phase of the beacon's Network Key after processing
    pub phase: KeyRefreshPhase,
}

/// What an incoming PDU delivered upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Access(ReceivedAccess),
    Control(ReceivedControl),
    ProxyConfiguration(ReceivedControl),
    Beacon(BeaconReport),
}

/// Fields shared by unsegmented and reassembled messages.
#[derive(Debug, Clone, Copy)]
struct Delivery {
    source: Address,
    destination: Address,
    sequence: u32,
    iv_index: u32,
    network_key_index: KeyIndex,
    ttl: u8,
}

/// A segmented message sent to a unicast address, waiting for its acknowledgment.
#[derive(Debug)]
struct Outgoing {
    segments: OutgoingSegments,
    network_key_index: KeyIndex,
    ttl: u8,
    sent_ms: u64,
}

#[derive(Debug, Default)]
struct StackState {
    network_keys: BTreeMap<KeyIndex, NetworkKey>,
    application_keys: BTreeMap<KeyIndex, ApplicationKey>,
    device_keys: BTreeMap<Address, Key>,
    local_addresses: BTreeSet<Address>,
    labels: Vec<[u8; 16]>,
    iv_index: IvIndex,
    /// Time of the last IV state change; `None` when never recorded
    iv_transition_ms: Option<u64>,
    iv_recovery: bool,
    sequences: SequenceCounters,
    reassembler: Reassembler,
    /// Keyed by (destination, SeqZero)
    outgoing: BTreeMap<(Address, u16), Outgoing>,
    proxy_network_key: Option<KeyIndex>,
    stats: MeshStats,
}

impl StackState {
    fn apply_iv_index(&mut self, iv_index: IvIndex, transition_ms: Option<u64>) {
        let last = self.iv_index;
        self.iv_index = iv_index;
        self.iv_transition_ms = transition_ms;
        if iv_index.transmit_index() > last.transmit_index() {
            self.sequences.reset_all();
        }
        self.stats.iv_index_updates += 1;
        info!(from = %last, to = %iv_index, "IV Index updated");
    }

    /// Ends the Key Refresh of a Network Key and of its bound Application Keys.
    fn revoke_old_keys(&mut self, index: KeyIndex) -> Result<(), StackError> {
        let network_key = self
            .network_keys
            .get_mut(&index)
            .ok_or(StackError::UnknownNetworkKey(index))?;
        *network_key = network_key.revoke_old_key();
        for app_key in self.application_keys.values_mut() {
            if app_key.bound_network_key_index() == index && app_key.old().is_some() {
                *app_key = app_key.revoke_old_key();
            }
        }
        info!(key_index = index, "old keys revoked");
        Ok(())
    }

    fn use_new_keys(&mut self, index: KeyIndex) -> Result<(), StackError> {
        let network_key = self
            .network_keys
            .get_mut(&index)
            .ok_or(StackError::UnknownNetworkKey(index))?;
        *network_key = network_key.use_new_keys()?;
        info!(key_index = index, "using new keys");
        Ok(())
    }

    fn phase_of(&self, index: KeyIndex) -> KeyRefreshPhase {
        self.network_keys
            .get(&index)
            .map(NetworkKey::phase)
            .unwrap_or_default()
    }
}

/// Network and transport layers of one mesh network.
///
/// Received bytes are pushed in with [`MeshStack::handle_incoming`];
/// outgoing Network PDUs leave through the [`Transmitter`].
pub struct MeshStack<T: Transmitter, S: Storage> {
    config: MeshConfig,
    transmitter: T,
    storage: S,
    replay: ReplayCache,
    state: Mutex<StackState>,
}

impl<T: Transmitter, S: Storage> MeshStack<T, S> {
    /// Creates an empty stack: no keys, no local addresses, IV Index 0.
    ///
    /// # Errors
    /// - `StackError::Config`: the configuration does not validate
    pub fn new(config: MeshConfig, transmitter: T, storage: S) -> Result<Self, StackError> {
        config.validate()?;
        Ok(MeshStack {
            config,
            transmitter,
            storage,
            replay: ReplayCache::new(),
            state: Mutex::new(StackState::default()),
        })
    }

    /// Creates a stack and loads the state last saved in `storage`.
    pub fn open(config: MeshConfig, transmitter: T, storage: S) -> Result<Self, StackError> {
        let stack = Self::new(config, transmitter, storage)?;
        stack.reload()?;
        Ok(stack)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn transmitter(&self) -> &T {
        &self.transmitter
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn state(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Keys and addresses =====

    /// Adds a Network Key, replacing one with the same index.
    pub fn add_network_key(&self, network_key: NetworkKey) {
        let mut state = self.state();
        debug!(key_index = network_key.index(), phase = ?network_key.phase(), "network key added");
        state.network_keys.insert(network_key.index(), network_key);
    }

    pub fn network_key(&self, index: KeyIndex) -> Option<NetworkKey> {
        self.state().network_keys.get(&index).cloned()
    }

    /// Starts a Key Refresh of a Network Key with `new_key`.
    ///
    /// # Errors
    /// - `StackError::UnknownNetworkKey`
    /// - `StackError::Key`: another refresh is running
    pub fn update_network_key(&self, index: KeyIndex, new_key: Key) -> Result<(), StackError> {
        let mut state = self.state();
        let network_key = state
            .network_keys
            .get_mut(&index)
            .ok_or(StackError::UnknownNetworkKey(index))?;
        *network_key = network_key.rotate_key(new_key)?;
        info!(key_index = index, "key refresh started");
        Ok(())
    }

    /// Moves a Network Key from Key Distribution to Using New Keys.
    pub fn use_new_keys(&self, index: KeyIndex) -> Result<(), StackError> {
        self.state().use_new_keys(index)
    }

    /// Finishes a Key Refresh, dropping the old Network and Application Keys.
    pub fn revoke_old_keys(&self, index: KeyIndex) -> Result<(), StackError> {
        self.state().revoke_old_keys(index)
    }

    /// Adds an Application Key, replacing one with the same index.
    ///
    /// # Errors
    /// - `StackError::UnknownNetworkKey`: the bound Network Key is not known
    pub fn add_application_key(&self, app_key: ApplicationKey) -> Result<(), StackError> {
        let mut state = self.state();
        let bound = app_key.bound_network_key_index();
        if !state.network_keys.contains_key(&bound) {
            return Err(StackError::UnknownNetworkKey(bound));
        }
        debug!(app_key = app_key.index(), net_key = bound, aid = app_key.aid(), "application key added");
        state.application_keys.insert(app_key.index(), app_key);
        Ok(())
    }

    pub fn application_key(&self, index: KeyIndex) -> Option<ApplicationKey> {
        self.state().application_keys.get(&index).cloned()
    }

    /// Distributes a new Application Key during a Key Refresh.
    ///
    /// # Errors
    /// - `StackError::UnknownApplicationKey`
    /// - `StackError::Key`: the bound Network Key is not in Key Distribution,
    ///   or another new key is already being distributed
    pub fn update_application_key(&self, index: KeyIndex, new_key: Key) -> Result<(), StackError> {
        let mut state = self.state();
        let app_key = state
            .application_keys
            .get(&index)
            .ok_or(StackError::UnknownApplicationKey(index))?;
        let phase = state.phase_of(app_key.bound_network_key_index());
        if phase != KeyRefreshPhase::KeyDistribution {
            return Err(KeyError::InvalidPhaseTransition {
                from: phase,
                to: KeyRefreshPhase::KeyDistribution,
            }
            .into());
        }
        let updated = app_key.rotate_key(new_key)?;
        state.application_keys.insert(index, updated);
        info!(app_key = index, "application key updated");
        Ok(())
    }

    /// Sets the Device Key of the node whose primary element is `address`.
    pub fn set_device_key(&self, address: Address, key: Key) {
        self.state().device_keys.insert(address, key);
    }

    /// Registers a unicast address of a local element.
    ///
    /// # Errors
    /// - `StackError::Transport`: `address` is not unicast
    pub fn add_local_address(&self, address: Address) -> Result<(), StackError> {
        if !is_unicast(address) {
            return Err(TransportError::InvalidSource(address).into());
        }
        self.state().local_addresses.insert(address);
        Ok(())
    }

    /// Registers a Label UUID, so messages to its virtual address can be decrypted.
    pub fn add_label(&self, label: [u8; 16]) {
        let mut state = self.state();
        if !state.labels.contains(&label) {
            state.labels.push(label);
        }
    }

    pub fn iv_index(&self) -> IvIndex {
        self.state().iv_index
    }

    /// Sets the IV Index, e.g. from the provisioning data.
    ///
    /// # Arguments
    /// - `transition_ms`: time the IV state was entered; `None` lets the next
    ///   beacon move it without waiting
    pub fn set_iv_index(&self, iv_index: IvIndex, transition_ms: Option<u64>) {
        let mut state = self.state();
        state.iv_recovery = false;
        state.apply_iv_index(iv_index, transition_ms);
    }

    /// Network Key used for proxy configuration messages.
    pub fn proxy_network_key(&self) -> Option<KeyIndex> {
        self.state().proxy_network_key
    }

    pub fn set_proxy_network_key(&self, index: KeyIndex) -> Result<(), StackError> {
        let mut state = self.state();
        if !state.network_keys.contains_key(&index) {
            return Err(StackError::UnknownNetworkKey(index));
        }
        state.proxy_network_key = Some(index);
        Ok(())
    }

    /// Next sequence number of a local element.
    pub fn next_sequence(&self, source: Address) -> u32 {
        self.state().sequences.peek(source)
    }

    /// Whether any local element is running out of sequence numbers.
    pub fn needs_iv_update(&self) -> bool {
        let state = self.state();
        state
            .local_addresses
            .iter()
            .any(|address| state.sequences.needs_iv_update(*address))
    }

    pub fn stats(&self) -> MeshStats {
        self.state().stats
    }

    /// Number of incoming segmented messages being reassembled.
    pub fn pending_reassemblies(&self) -> usize {
        self.state().reassembler.pending()
    }

    /// Number of outgoing segmented messages waiting for an acknowledgment.
    pub fn pending_outgoing(&self) -> usize {
        self.state().outgoing.len()
    }

    // ===== Sending =====

    /// Encrypts, segments and sends an access message.
    ///
    /// # Returns
    /// The sequence numbers used, one per Network PDU. The first one is the
    /// sequence number of the message.
    ///
    /// # Errors
    /// - `StackError::NotLocalAddress`: the source is not a local element
    /// - `StackError::UnknownApplicationKey` / `UnknownNetworkKey` / `MissingDeviceKey`
    /// - `StackError::SequenceExhausted`: an IV Index update is needed first
    /// - `StackError::Transport`: invalid TTL, oversized message
    /// - `StackError::Bearer`: the transmitter refused a PDU
    pub fn send_access(&self, message: &OutgoingAccess, now_ms: u64) -> Result<Vec<u32>, StackError> {
        let mut state = self.state();
        let source = message.source;
        let destination = message.destination;
        if !state.local_addresses.contains(&source) {
            return Err(StackError::NotLocalAddress(source));
        }

        let (key, akf, aid, network_key_index) = match message.key {
            AccessKey::Application(index) => {
                let app_key = state
                    .application_keys
                    .get(&index)
                    .ok_or(StackError::UnknownApplicationKey(index))?;
                let bound = app_key.bound_network_key_index();
                let network_key = state
                    .network_keys
                    .get(&bound)
                    .ok_or(StackError::UnknownNetworkKey(bound))?;
                let material = app_key.transmit_keys(network_key.phase());
                (material.key, true, material.aid, bound)
            }
            AccessKey::Device { network_key_index } => {
                if !state.network_keys.contains_key(&network_key_index) {
                    return Err(StackError::UnknownNetworkKey(network_key_index));
                }
                let key = state
                    .device_keys
                    .get(&destination.address)
                    .or_else(|| state.device_keys.get(&source))
                    .copied()
                    .ok_or(StackError::MissingDeviceKey(destination.address))?;
                (key, false, 0, network_key_index)
            }
        };
        let ttl = message.ttl.unwrap_or(self.config.default_ttl);

        let access_pdu = message.access.encode();
        // Length with the 32-bit TransMIC decides whether segmentation is needed
        let segmented = is_segmentation_required(LowerPduType::Access, access_pdu.len() + 4);
        let aszmic = message.high_security && segmented;

        let sequence = state.sequences.next(source)?;
        let context = UpperTransportContext {
            sequence,
            source,
            destination: destination.address,
            iv_index: state.iv_index.transmit_index(),
        };
        let upper_pdu = encrypt_access(&access_pdu, &key, akf, aszmic, &context, &destination)?;
        let lower_pdus = segment(MessageKind::Access { akf, aid, szmic: aszmic }, &upper_pdu, sequence)?;

        let sequences = self.send_lower_pdus(
            &mut state,
            &lower_pdus,
            sequence,
            network_key_index,
            source,
            destination.address,
            ttl,
        )?;
        debug!(
            src = source,
            dst = destination.address,
            opcode = message.access.opcode,
            seq = sequence,
            segments = lower_pdus.len(),
            "access message sent"
        );
        Self::track_outgoing(&mut state, lower_pdus, source, destination.address, network_key_index, ttl, now_ms);
        Ok(sequences)
    }

    /// Segments and sends a transport control message.
    ///
    /// # Errors
    /// Same as [`MeshStack::send_access`].
    pub fn send_control(&self, message: &OutgoingControl, now_ms: u64) -> Result<Vec<u32>, StackError> {
        let mut state = self.state();
        let source = message.source;
        if !state.local_addresses.contains(&source) {
            return Err(StackError::NotLocalAddress(source));
        }
        if !state.network_keys.contains_key(&message.network_key_index) {
            return Err(StackError::UnknownNetworkKey(message.network_key_index));
        }
        let ttl = message.ttl.unwrap_or(self.config.default_ttl);

        let sequence = state.sequences.next(source)?;
        let lower_pdus = segment(
            MessageKind::Control { opcode: message.opcode },
            &message.parameters,
            sequence,
        )?;
        let sequences = self.send_lower_pdus(
            &mut state,
            &lower_pdus,
            sequence,
            message.network_key_index,
            source,
            message.destination,
            ttl,
        )?;
        debug!(
            src = source,
            dst = message.destination,
            opcode = message.opcode,
            seq = sequence,
            "control message sent"
        );
        Self::track_outgoing(
            &mut state,
            lower_pdus,
            source,
            message.destination,
            message.network_key_index,
            ttl,
            now_ms,
        );
        Ok(sequences)
    }

    /// Sends a proxy configuration message to the connected proxy node.
    ///
    /// The message is sent from the first local address, with TTL 0 to the
    /// unassigned address, under the proxy Network Key (or the first known
    /// key when no beacon selected one yet).
    ///
    /// # Errors
    /// - `StackError::NotLocalAddress`: no local address is set
    /// - `StackError::NoProxyNetworkKey`: no Network Key is known
    /// - `StackError::Transport`: parameters longer than 11 bytes
    pub fn send_proxy_configuration(&self, opcode: u8, parameters: &[u8]) -> Result<u32, StackError> {
        let mut state = self.state();
        if parameters.len() > MAX_UNSEGMENTED_CONTROL_LEN {
            return Err(TransportError::PayloadTooLarge(parameters.len()).into());
        }
        let source = *state
            .local_addresses
            .first()
            .ok_or(StackError::NotLocalAddress(UNASSIGNED_ADDRESS))?;
        let index = state
            .proxy_network_key
            .or_else(|| state.network_keys.keys().next().copied())
            .ok_or(StackError::NoProxyNetworkKey)?;

        let sequence = state.sequences.next(source)?;
        let lower = LowerTransportPdu::UnsegmentedControl {
            opcode,
            parameters: parameters.to_vec(),
        };
        let header = NetworkHeader {
            pdu_type: LowerPduType::Control,
            ttl: 0,
            sequence,
            source,
            destination: UNASSIGNED_ADDRESS,
        };
        let network_key = state
            .network_keys
            .get(&index)
            .ok_or(StackError::UnknownNetworkKey(index))?;
        let pdu = NetworkPdu::encode(
            &header,
            &lower.encode(),
            network_key,
            &state.iv_index,
            NetworkPduKind::ProxyConfiguration,
        )?;
        self.transmitter.send(&pdu.pdu, PduType::ProxyConfiguration)?;
        state.stats.network_pdus_sent += 1;
        debug!(opcode, seq = sequence, key_index = index, "proxy configuration sent");
        Ok(sequence)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_lower_pdus(
        &self,
        state: &mut StackState,
        pdus: &[LowerTransportPdu],
        first_sequence: u32,
        network_key_index: KeyIndex,
        source: Address,
        destination: Address,
        ttl: u8,
    ) -> Result<Vec<u32>, StackError> {
        let mut sequences = Vec::with_capacity(pdus.len());
        for (i, pdu) in pdus.iter().enumerate() {
            let sequence = if i == 0 {
                first_sequence
            } else {
                state.sequences.next(source)?
            };
            self.send_network_pdu(state, pdu, sequence, network_key_index, source, destination, ttl)?;
            sequences.push(sequence);
        }
        Ok(sequences)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_network_pdu(
        &self,
        state: &mut StackState,
        pdu: &LowerTransportPdu,
        sequence: u32,
        network_key_index: KeyIndex,
        source: Address,
        destination: Address,
        ttl: u8,
    ) -> Result<(), StackError> {
        let network_key = state
            .network_keys
            .get(&network_key_index)
            .ok_or(StackError::UnknownNetworkKey(network_key_index))?;
        let header = NetworkHeader {
            pdu_type: pdu.pdu_type(),
            ttl,
            sequence,
            source,
            destination,
        };
        let network_pdu = NetworkPdu::encode(
            &header,
            &pdu.encode(),
            network_key,
            &state.iv_index,
            NetworkPduKind::Network,
        )?;
        self.transmitter.send(&network_pdu.pdu, PduType::NetworkPdu)?;
        state.stats.network_pdus_sent += 1;
        trace!(src = source, dst = destination, seq = sequence, ttl, "network PDU sent");
        Ok(())
    }

    /// Remembers a segmented message to a unicast address until it is acknowledged.
    fn track_outgoing(
        state: &mut StackState,
        lower_pdus: Vec<LowerTransportPdu>,
        source: Address,
        destination: Address,
        network_key_index: KeyIndex,
        ttl: u8,
        now_ms: u64,
    ) {
        let segmented = matches!(lower_pdus.first(), Some(LowerTransportPdu::Segment(_)));
        if !segmented || !is_unicast(destination) {
            return;
        }
        let segments = OutgoingSegments::new(source, destination, lower_pdus);
        state.outgoing.insert(
            (destination, segments.seq_zero),
            Outgoing { segments, network_key_index, ttl, sent_ms: now_ms },
        );
    }

    fn send_segment_acknowledgment(
        &self,
        state: &mut StackState,
        delivery: &Delivery,
        ack: SegmentAcknowledgment,
    ) {
        // The acknowledgment goes back from the local destination to the sender
        let from = delivery.destination;
        let to = delivery.source;
        let ttl = if delivery.ttl > 0 { self.config.default_ttl } else { 0 };
        let result = state.sequences.next(from).and_then(|sequence| {
            self.send_network_pdu(
                state,
                &LowerTransportPdu::SegmentAcknowledgment(ack),
                sequence,
                delivery.network_key_index,
                from,
                to,
                ttl,
            )
        });
        match result {
            Ok(()) => {
                state.stats.segment_acks_sent += 1;
                trace!(src = from, dst = to, seq_zero = ack.seq_zero, block_ack = ack.block_ack, "segment acknowledgment sent");
            }
            Err(e) => warn!(dst = to, error = %e, "segment acknowledgment not sent"),
        }
    }

    // ===== Receiving =====

    /// Processes one complete PDU received from the bearer.
    ///
    /// # Returns
    /// The message it delivered, if any. Undecodable, replayed, malformed
    /// and foreign PDUs are dropped and counted in [`MeshStats`].
    pub fn handle_incoming(&self, data: &[u8], pdu_type: PduType, now_ms: u64) -> Option<MeshEvent> {
        match pdu_type {
            PduType::NetworkPdu => self.handle_network_pdu(data, now_ms),
            PduType::MeshBeacon => self.handle_beacon(data, now_ms),
            PduType::ProxyConfiguration => self.handle_proxy_configuration(data),
            PduType::ProvisioningPdu => {
                debug!(len = data.len(), "provisioning PDU ignored");
                None
            }
        }
    }

    fn handle_network_pdu(&self, data: &[u8], now_ms: u64) -> Option<MeshEvent> {
        let mut state = self.state();
        state.stats.network_pdus_received += 1;

        let network_pdu = match NetworkPdu::decode(
            data,
            NetworkPduKind::Network,
            state.network_keys.values(),
            &state.iv_index,
        ) {
            Ok(pdu) => pdu,
            Err(e) => {
                trace!(reason = %e, "network PDU not for this network");
                state.stats.network_pdus_undecodable += 1;
                return None;
            }
        };
        let source = network_pdu.source;
        let destination = network_pdu.destination;

        if state.local_addresses.contains(&source) {
            trace!(src = source, seq = network_pdu.sequence, "own network PDU dropped");
            state.stats.not_for_us_dropped += 1;
            return None;
        }
        let local_unicast = state.local_addresses.contains(&destination);
        if is_unicast(destination) && !local_unicast {
            trace!(src = source, dst = destination, "network PDU for another node");
            state.stats.not_for_us_dropped += 1;
            return None;
        }
        let fresh = if network_pdu.is_segmented() {
            let sequence = network_pdu.message_sequence();
            let reassembling = state.reassembler.is_receiving(source, sequence);
            self.replay.accept_segment(source, network_pdu.iv_index, sequence, reassembling)
        } else {
            self.replay.accept(source, network_pdu.iv_index, network_pdu.sequence)
        };
        if !fresh {
            state.stats.replays_rejected += 1;
            return None;
        }

        let lower = match LowerTransportPdu::decode(&network_pdu.transport_pdu, network_pdu.pdu_type) {
            Ok(lower) => lower,
            Err(e) => {
                debug!(src = source, reason = %e, "malformed lower transport PDU");
                state.stats.malformed_dropped += 1;
                return None;
            }
        };
        let delivery = Delivery {
            source,
            destination,
            sequence: network_pdu.sequence,
            iv_index: network_pdu.iv_index,
            network_key_index: network_pdu.network_key_index,
            ttl: network_pdu.ttl,
        };

        match lower {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
                self.deliver_access(&mut state, &delivery, akf, aid, false, &upper_pdu)
            }
            LowerTransportPdu::UnsegmentedControl { opcode, parameters } => {
                Self::deliver_control(&mut state, &delivery, opcode, parameters)
            }
            LowerTransportPdu::SegmentAcknowledgment(ack) => {
                self.handle_segment_acknowledgment(&mut state, &delivery, &ack);
                None
            }
            LowerTransportPdu::Segment(segment) => {
                let outcome = match state.reassembler.insert(&network_pdu, segment, now_ms) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        debug!(src = source, reason = %e, "segment dropped");
                        state.stats.malformed_dropped += 1;
                        return None;
                    }
                };
                match outcome {
                    ReassemblyOutcome::Incomplete(_) => None,
                    ReassemblyOutcome::AlreadyComplete(ack) => {
                        if local_unicast {
                            self.send_segment_acknowledgment(&mut state, &delivery, ack);
                        }
                        None
                    }
                    ReassemblyOutcome::Complete(message) => {
                        let delivery = Delivery {
                            sequence: message.sequence,
                            iv_index: message.iv_index,
                            network_key_index: message.network_key_index,
                            ttl: message.ttl,
                            ..delivery
                        };
                        if local_unicast {
                            self.send_segment_acknowledgment(&mut state, &delivery, message.ack);
                        }
                        match message.kind {
                            MessageKind::Access { akf, aid, szmic } => self.deliver_access(
                                &mut state,
                                &delivery,
                                akf,
                                aid,
                                szmic,
                                &message.upper_pdu,
                            ),
                            MessageKind::Control { opcode } => {
                                Self::deliver_control(&mut state, &delivery, opcode, message.upper_pdu)
                            }
                        }
                    }
                }
            }
        }
    }

    fn deliver_access(
        &self,
        state: &mut StackState,
        delivery: &Delivery,
        akf: bool,
        aid: u8,
        aszmic: bool,
        upper_pdu: &[u8],
    ) -> Option<MeshEvent> {
        let context = UpperTransportContext {
            sequence: delivery.sequence,
            source: delivery.source,
            destination: delivery.destination,
            iv_index: delivery.iv_index,
        };
        let decrypted = if akf {
            let keys = state
                .application_keys
                .values()
                .filter(|key| key.bound_network_key_index() == delivery.network_key_index);
            decrypt_with_application_keys(upper_pdu, aid, aszmic, &context, &state.labels, keys)
        } else {
            let device_keys = [delivery.source, delivery.destination]
                .into_iter()
                .filter_map(|address| state.device_keys.get(&address).map(|key| (address, key)));
            decrypt_with_device_keys(upper_pdu, aszmic, &context, device_keys)
        };
        let decrypted = match decrypted {
            Ok(decrypted) => decrypted,
            Err(e) => {
                debug!(src = delivery.source, seq = delivery.sequence, reason = %e, "access message not decrypted");
                state.stats.access_messages_undecryptable += 1;
                return None;
            }
        };
        let access = match AccessPdu::decode(&decrypted.access_pdu) {
            Ok(access) => access,
            Err(e) => {
                debug!(src = delivery.source, reason = %e, "malformed access PDU");
                state.stats.malformed_dropped += 1;
                return None;
            }
        };

        state.stats.access_messages_delivered += 1;
        debug!(
            src = delivery.source,
            dst = delivery.destination,
            opcode = access.opcode,
            seq = delivery.sequence,
            "access message received"
        );
        Some(MeshEvent::Access(ReceivedAccess {
            access,
            source: delivery.source,
            destination: delivery.destination,
            label: decrypted.label,
            key: decrypted.key,
            network_key_index: delivery.network_key_index,
            iv_index: delivery.iv_index,
            sequence: delivery.sequence,
            ttl: delivery.ttl,
        }))
    }

    fn deliver_control(
        state: &mut StackState,
        delivery: &Delivery,
        opcode: u8,
        parameters: Vec<u8>,
    ) -> Option<MeshEvent> {
        state.stats.control_messages_delivered += 1;
        debug!(src = delivery.source, dst = delivery.destination, opcode, "control message received");
        Some(MeshEvent::Control(ReceivedControl {
            opcode,
            parameters,
            source: delivery.source,
            destination: delivery.destination,
            network_key_index: delivery.network_key_index,
            ttl: delivery.ttl,
        }))
    }

    fn handle_segment_acknowledgment(
        &self,
        state: &mut StackState,
        delivery: &Delivery,
        ack: &SegmentAcknowledgment,
    ) {
        state.stats.segment_acks_received += 1;
        let key = (delivery.source, ack.seq_zero);
        let Some(outgoing) = state.outgoing.get_mut(&key) else {
            trace!(src = delivery.source, seq_zero = ack.seq_zero, "acknowledgment for unknown message");
            return;
        };
        if outgoing.segments.source != delivery.destination {
            return;
        }
        match outgoing.segments.apply(ack) {
            AckOutcome::Ignored => {}
            AckOutcome::Complete => {
                debug!(dst = delivery.source, seq_zero = ack.seq_zero, "segmented message acknowledged");
                state.outgoing.remove(&key);
            }
            AckOutcome::Busy => {
                state.outgoing.remove(&key);
            }
            AckOutcome::Retransmit(missing) => {
                let pdus: Vec<LowerTransportPdu> = outgoing.segments.remaining().cloned().collect();
                let (source, network_key_index, ttl) =
                    (outgoing.segments.source, outgoing.network_key_index, outgoing.ttl);
                debug!(dst = delivery.source, seq_zero = ack.seq_zero, ?missing, "retransmitting segments");
                for pdu in &pdus {
                    let result = state.sequences.next(source).and_then(|sequence| {
                        self.send_network_pdu(state, pdu, sequence, network_key_index, source, delivery.source, ttl)
                    });
                    if let Err(e) = result {
                        warn!(dst = delivery.source, error = %e, "segment retransmission failed");
                        break;
                    }
                }
            }
        }
    }

    fn handle_proxy_configuration(&self, data: &[u8]) -> Option<MeshEvent> {
        let mut state = self.state();
        let network_pdu = match NetworkPdu::decode(
            data,
            NetworkPduKind::ProxyConfiguration,
            state.network_keys.values(),
            &state.iv_index,
        ) {
            Ok(pdu) => pdu,
            Err(e) => {
                debug!(reason = %e, "proxy configuration PDU dropped");
                state.stats.network_pdus_undecodable += 1;
                return None;
            }
        };
        // Proxy configuration messages are unsegmented control messages
        // whose opcode 0x00 is Set Filter Type, not a Segment Acknowledgment
        let header = network_pdu.transport_pdu.split_first();
        match header {
            Some((&first, parameters)) if network_pdu.pdu_type == LowerPduType::Control && first & 0x80 == 0 => {
                let opcode = first & 0x7F;
                debug!(src = network_pdu.source, opcode, "proxy configuration received");
                Some(MeshEvent::ProxyConfiguration(ReceivedControl {
                    opcode,
                    parameters: parameters.to_vec(),
                    source: network_pdu.source,
                    destination: network_pdu.destination,
                    network_key_index: network_pdu.network_key_index,
                    ttl: network_pdu.ttl,
                }))
            }
            _ => {
                debug!(src = network_pdu.source, "proxy configuration PDU malformed");
                state.stats.malformed_dropped += 1;
                None
            }
        }
    }

    /// Applies the IV Index and Key Refresh flags of an authenticated beacon.
    ///
    /// Only beacons of the primary subnet (or of any subnet while the
    /// primary key is not known) can move the IV Index. The Key Refresh
    /// flag is honoured only when the beacon was authenticated with the new key.
    fn handle_beacon(&self, data: &[u8], now_ms: u64) -> Option<MeshEvent> {
        let mut state = self.state();
        let beacon = match NetworkBeacon::decode(data, state.network_keys.values()) {
            Ok(beacon) => beacon,
            Err(e) => {
                debug!(reason = %e, "beacon dropped");
                state.stats.beacons_rejected += 1;
                return None;
            }
        };
        state.stats.beacons_received += 1;
        let key_index = beacon.network_key_index;

        if key_index != PRIMARY_NETWORK_KEY_INDEX
            && state.network_keys.contains_key(&PRIMARY_NETWORK_KEY_INDEX)
        {
            trace!(key_index, "beacon of a secondary subnet");
            if state.proxy_network_key.is_none() {
                state.proxy_network_key = Some(key_index);
            }
            return Some(MeshEvent::Beacon(BeaconReport {
                beacon,
                iv_index_updated: false,
                phase: state.phase_of(key_index),
            }));
        }

        let last = state.iv_index;
        let elapsed = state
            .iv_transition_ms
            .map(|since| Duration::from_millis(now_ms.saturating_sub(since)));
        let policy = self.config.iv_update_policy(state.iv_recovery);
        let mut iv_index_updated = false;

        if beacon.iv_index.can_overwrite(&last, elapsed, &policy) {
            if beacon.iv_index != last {
                state.iv_recovery =
                    beacon.iv_index.index > last.index.saturating_add(1) && !beacon.iv_index.update_active;
                if state.iv_recovery {
                    info!(from = %last, to = %beacon.iv_index, "IV Index recovery");
                }
                state.apply_iv_index(beacon.iv_index, Some(now_ms));
                iv_index_updated = true;
            }
            if !beacon.old_key_used {
                Self::apply_key_refresh_flag(&mut state, key_index, beacon.key_refresh);
            }
        } else if last.previous() != Some(beacon.iv_index) {
            warn!(current = %last, received = %beacon.iv_index, key_index, "IV Index of beacon rejected");
        }
        state.proxy_network_key = Some(key_index);

        Some(MeshEvent::Beacon(BeaconReport {
            beacon,
            iv_index_updated,
            phase: state.phase_of(key_index),
        }))
    }

    fn apply_key_refresh_flag(state: &mut StackState, index: KeyIndex, key_refresh: bool) {
        let result = match (state.phase_of(index), key_refresh) {
            (KeyRefreshPhase::KeyDistribution, true) => state.use_new_keys(index),
            (KeyRefreshPhase::UsingNewKeys, false) => state.revoke_old_keys(index),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(key_index = index, error = %e, "key refresh flag not applied");
        }
    }

    // ===== Timers =====

    /// Runs the timers: acknowledgments of incomplete messages whose ACK
    /// timer fired are sent, and expired messages are discarded.
    ///
    /// # Arguments
    /// - `now_ms`: current time, on the clock passed to `handle_incoming`
    pub fn tick(&self, now_ms: u64) {
        self.discard_incomplete(now_ms);

        let mut state = self.state();
        let config = &self.config;
        let due = state
            .reassembler
            .due_acknowledgments(now_ms, |seg_n| config.acknowledgment_timer_ms(seg_n));
        for pending in due {
            if !is_unicast(pending.destination) || !state.local_addresses.contains(&pending.destination) {
                continue;
            }
            let delivery = Delivery {
                source: pending.source,
                destination: pending.destination,
                sequence: 0,
                iv_index: pending.iv_index,
                network_key_index: pending.network_key_index,
                ttl: pending.ttl,
            };
            self.send_segment_acknowledgment(&mut state, &delivery, pending.ack);
        }
    }

    /// Drops incoming and outgoing segmented messages idle for longer than
    /// the discard timeout.
    ///
    /// Returns the number of dropped incoming messages.
    pub fn discard_incomplete(&self, now_ms: u64) -> usize {
        let mut state = self.state();
        let timeout_ms = self.config.discard_timeout_ms;
        let discarded = state.reassembler.discard_expired(now_ms, timeout_ms);
        state.stats.incomplete_discarded += discarded as u64;
        state.outgoing.retain(|(destination, seq_zero), outgoing| {
            let keep = now_ms.saturating_sub(outgoing.sent_ms) < timeout_ms;
            if !keep {
                debug!(dst = destination, seq_zero, "unacknowledged message given up");
            }
            keep
        });
        discarded
    }

    // ===== Persistence =====

    /// Snapshot of the keys, IV Index, sequence numbers and replay cache.
    pub fn export_state(&self) -> MeshState {
        let state = self.state();
        let mut snapshot = MeshState::new();
        snapshot.iv_index = Some(IvIndexState {
            index: state.iv_index.index,
            update_active: state.iv_index.update_active,
            transition_ms: state.iv_transition_ms,
            iv_recovery: state.iv_recovery,
        });
        snapshot.replay = self.replay.snapshot();
        snapshot.sequences = state.sequences.snapshot();
        snapshot.network_keys = state
            .network_keys
            .values()
            .map(|key| NetworkKeyState {
                index: u32::from(key.index()),
                key: key.key().to_vec(),
                old_key: key.old_key().map(|k| k.to_vec()),
                phase: stored_phase(key.phase()) as i32,
            })
            .collect();
        snapshot.application_keys = state
            .application_keys
            .values()
            .map(|key| ApplicationKeyState {
                index: u32::from(key.index()),
                bound_network_key_index: u32::from(key.bound_network_key_index()),
                key: key.key().to_vec(),
                old_key: key.old_key().map(|k| k.to_vec()),
            })
            .collect();
        snapshot
    }

    /// Replaces the persisted parts of the state with a snapshot.
    ///
    /// Device keys, local addresses and labels are kept. Nothing changes
    /// when a key in the snapshot is invalid.
    ///
    /// # Errors
    /// - `StackError::Key` / `StackError::Crypto`: invalid key or key index
    pub fn import_state(&self, snapshot: &MeshState) -> Result<(), StackError> {
        let network_keys = snapshot
            .network_keys
            .iter()
            .map(|stored| -> Result<(KeyIndex, NetworkKey), StackError> {
                let key = NetworkKey::restore(
                    stored_key_index(stored.index),
                    key_from_slice(&stored.key)?,
                    stored.old_key.as_deref().map(key_from_slice).transpose()?,
                    phase_from_stored(stored.stored_phase()),
                )?;
                Ok((key.index(), key))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        let application_keys = snapshot
            .application_keys
            .iter()
            .map(|stored| -> Result<(KeyIndex, ApplicationKey), StackError> {
                let key = ApplicationKey::restore(
                    stored_key_index(stored.index),
                    key_from_slice(&stored.key)?,
                    stored.old_key.as_deref().map(key_from_slice).transpose()?,
                    stored_key_index(stored.bound_network_key_index),
                )?;
                Ok((key.index(), key))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let mut state = self.state();
        state.network_keys = network_keys;
        state.application_keys = application_keys;
        if let Some(iv) = &snapshot.iv_index {
            state.iv_index = IvIndex::new(iv.index, iv.update_active);
            state.iv_transition_ms = iv.transition_ms;
            state.iv_recovery = iv.iv_recovery;
        }
        state.sequences = SequenceCounters::restore(&snapshot.sequences);
        if state
            .proxy_network_key
            .is_some_and(|index| !state.network_keys.contains_key(&index))
        {
            state.proxy_network_key = None;
        }
        self.replay.replace(&snapshot.replay);
        info!(
            network_keys = state.network_keys.len(),
            application_keys = state.application_keys.len(),
            iv_index = %state.iv_index,
            "state restored"
        );
        Ok(())
    }

    /// Saves the state snapshot to storage.
    ///
    /// # Errors
    /// - `StackError::StorageFailed`: the storage refused the write
    pub fn persist(&self) -> Result<(), StackError> {
        let bytes = self.export_state().encode_to_bytes();
        if !self.storage.save(&bytes) {
            warn!(len = bytes.len(), "state not saved");
            return Err(StackError::StorageFailed);
        }
        trace!(len = bytes.len(), "state saved");
        Ok(())
    }

    /// Loads the snapshot saved in storage.
    ///
    /// # Returns
    /// `false` when the storage holds nothing yet.
    ///
    /// # Errors
    /// - `StackError::Proto`: the saved bytes are not a snapshot
    /// - see [`MeshStack::import_state`]
    pub fn reload(&self) -> Result<bool, StackError> {
        let Some(bytes) = self.storage.load() else {
            return Ok(false);
        };
        let snapshot = MeshState::decode_from_bytes(&bytes)?;
        self.import_state(&snapshot)?;
        Ok(true)
    }
}

/// Out-of-range stored indexes map to a value key constructors reject.
fn stored_key_index(index: u32) -> KeyIndex {
    KeyIndex::try_from(index).unwrap_or(KeyIndex::MAX)
}

fn stored_phase(phase: KeyRefreshPhase) -> StoredKeyRefreshPhase {
    match phase {
        KeyRefreshPhase::NormalOperation => StoredKeyRefreshPhase::NormalOperation,
        KeyRefreshPhase::KeyDistribution => StoredKeyRefreshPhase::KeyDistribution,
        KeyRefreshPhase::UsingNewKeys => StoredKeyRefreshPhase::UsingNewKeys,
    }
}

fn phase_from_stored(phase: StoredKeyRefreshPhase) -> KeyRefreshPhase {
    match phase {
        StoredKeyRefreshPhase::NormalOperation => KeyRefreshPhase::NormalOperation,
        StoredKeyRefreshPhase::KeyDistribution => KeyRefreshPhase::KeyDistribution,
        StoredKeyRefreshPhase::UsingNewKeys => KeyRefreshPhase::UsingNewKeys,
    }
}
