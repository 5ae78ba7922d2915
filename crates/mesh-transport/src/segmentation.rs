//! Lower transport segmentation and reassembly
//!
//! An upper transport PDU that does not fit one Network PDU is split into
//! at most 32 segments sharing SeqZero (the low 13 bits of the sequence
//! number of the first segment) and SegN. Segments may arrive in any order;
//! SegO places each chunk.
//!
//! ```text
//!                    unsegmented up to   segment size   max upper PDU
//! Access             15 bytes            12 bytes       384 bytes
//! Control            11 bytes             8 bytes       256 bytes
//! ```

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use tracing::{debug, trace};

use crate::address::Address;
use crate::lower::{
    full_block_ack, sequence_from_seq_zero, LowerTransportPdu, MessageKind, Segment,
    SegmentAcknowledgment, MAX_SEG_N, SEQ_ZERO_MASK,
};
use crate::network::{LowerPduType, NetworkPdu};
use crate::{DecodeError, TransportError};
use mesh_keys::KeyIndex;

/// Largest upper transport access PDU sent unsegmented (TransMIC included).
pub const MAX_UNSEGMENTED_ACCESS_LEN: usize = 15;
/// Largest control message parameters sent unsegmented.
pub const MAX_UNSEGMENTED_CONTROL_LEN: usize = 11;
pub const ACCESS_SEGMENT_LEN: usize = 12;
pub const CONTROL_SEGMENT_LEN: usize = 8;
pub const MAX_SEGMENTS: usize = MAX_SEG_N as usize + 1;

/// Bytes carried by each segment of a message of this type.
pub fn segment_len(pdu_type: LowerPduType) -> usize {
    match pdu_type {
        LowerPduType::Access => ACCESS_SEGMENT_LEN,
        LowerPduType::Control => CONTROL_SEGMENT_LEN,
    }
}

/// Whether an upper transport PDU of `len` bytes needs segmentation.
pub fn is_segmentation_required(pdu_type: LowerPduType, len: usize) -> bool {
    match pdu_type {
        LowerPduType::Access => len > MAX_UNSEGMENTED_ACCESS_LEN,
        LowerPduType::Control => len > MAX_UNSEGMENTED_CONTROL_LEN,
    }
}

/// Splits an upper transport PDU into lower transport PDUs.
///
/// # Arguments
/// - `kind`: AKF/AID/SZMIC or control opcode. An access message with
///   `szmic` set (64-bit TransMIC) is always segmented.
/// - `upper_pdu`: encrypted upper transport PDU (or control parameters)
/// - `sequence`: sequence number the first segment will be sent with
///
/// # Errors
/// - `TransportError::PayloadTooLarge`: more than 32 segments needed
pub fn segment(
    kind: MessageKind,
    upper_pdu: &[u8],
    sequence: u32,
) -> Result<Vec<LowerTransportPdu>, TransportError> {
    let pdu_type = kind.pdu_type();
    let forced = matches!(kind, MessageKind::Access { szmic: true, .. });

    if !forced && !is_segmentation_required(pdu_type, upper_pdu.len()) {
        let pdu = match kind {
            MessageKind::Access { akf, aid, .. } => LowerTransportPdu::UnsegmentedAccess {
                akf,
                aid,
                upper_pdu: upper_pdu.to_vec(),
            },
            MessageKind::Control { opcode } => LowerTransportPdu::UnsegmentedControl {
                opcode,
                parameters: upper_pdu.to_vec(),
            },
        };
        return Ok(alloc::vec![pdu]);
    }

    let chunk_len = segment_len(pdu_type);
    let count = upper_pdu.len().div_ceil(chunk_len).max(1);
    if count > MAX_SEGMENTS {
        return Err(TransportError::PayloadTooLarge(upper_pdu.len()));
    }
    let seq_zero = (sequence & SEQ_ZERO_MASK) as u16;
    let seg_n = (count - 1) as u8;

    Ok(upper_pdu
        .chunks(chunk_len)
        .enumerate()
        .map(|(i, chunk)| {
            LowerTransportPdu::Segment(Segment {
                kind,
                seq_zero,
                seg_o: i as u8,
                seg_n,
                data: chunk.to_vec(),
            })
        })
        .collect())
}

/// A fully reassembled upper transport PDU with the fields of its first segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    pub source: Address,
    pub destination: Address,
    pub kind: MessageKind,
    pub upper_pdu: Vec<u8>,
    /// Sequence number of segment 0 (SeqAuth low bits)
    pub sequence: u32,
    pub iv_index: u32,
    pub network_key_index: KeyIndex,
    pub ttl: u8,
    pub ack: SegmentAcknowledgment,
}

/// Result of feeding one segment to the [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// More segments are needed. Carries the block ack so far.
    Incomplete(SegmentAcknowledgment),
    Complete(ReassembledMessage),
    /// Segment of a message already delivered; the acknowledgment is sent again
    AlreadyComplete(SegmentAcknowledgment),
}

/// Acknowledgment of an incomplete message whose ACK timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAcknowledgment {
    /// Original sender, destination of the acknowledgment
    pub source: Address,
    /// Local address the message was sent to
    pub destination: Address,
    pub network_key_index: KeyIndex,
    pub iv_index: u32,
    pub ttl: u8,
    pub ack: SegmentAcknowledgment,
}

#[derive(Debug)]
struct Incoming {
    kind: MessageKind,
    seg_n: u8,
    sequence: u32,
    iv_index: u32,
    destination: Address,
    network_key_index: KeyIndex,
    ttl: u8,
    arrived: BTreeMap<u8, Vec<u8>>,
    block_ack: u32,
    last_segment_ms: u64,
    last_ack_ms: u64,
}

impl Incoming {
    fn ack(&self, seq_zero: u16) -> SegmentAcknowledgment {
        SegmentAcknowledgment {
            on_behalf_of_lpn: false,
            seq_zero,
            block_ack: self.block_ack,
        }
    }

    fn try_assemble(&self) -> Option<Vec<u8>> {
        if self.block_ack != full_block_ack(self.seg_n) {
            return None;
        }
        let mut assembled = Vec::new();
        for seg_o in 0..=self.seg_n {
            assembled.extend_from_slice(self.arrived.get(&seg_o)?);
        }
        Some(assembled)
    }
}

#[derive(Debug, Clone, Copy)]
struct Completed {
    sequence: u32,
    ack: SegmentAcknowledgment,
}

/// Reassembly buffers for incoming segmented messages.
///
/// Buffers are keyed by `source << 16 | SeqZero`, so messages from
/// different sources never interfere. The last completed message of each
/// source is remembered to answer retransmitted segments.
#[derive(Debug, Default)]
pub struct Reassembler {
    incoming: BTreeMap<u32, Incoming>,
    completed: BTreeMap<Address, Completed>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(source: Address, seq_zero: u16) -> u32 {
        (u32::from(source) << 16) | u32::from(seq_zero)
    }

    /// Adds a segment received in `network_pdu`.
    ///
    /// # Errors
    /// - `DecodeError::InvalidSegmentation`: SegO greater than SegN
    /// - `DecodeError::InconsistentSegment`: SegN or message kind differ from
    ///   the message being reassembled with the same SeqZero
    pub fn insert(
        &mut self,
        network_pdu: &NetworkPdu,
        segment: Segment,
        now_ms: u64,
    ) -> Result<ReassemblyOutcome, DecodeError> {
        if segment.seg_o > segment.seg_n {
            return Err(DecodeError::InvalidSegmentation);
        }
        let source = network_pdu.source;
        let sequence = sequence_from_seq_zero(network_pdu.sequence, segment.seq_zero);

        if let Some(done) = self.completed.get(&source) {
            if done.sequence == sequence {
                trace!(src = source, seq_zero = segment.seq_zero, "segment of completed message");
                return Ok(ReassemblyOutcome::AlreadyComplete(done.ack));
            }
        }

        let key = Self::key(source, segment.seq_zero);
        if let Some(existing) = self.incoming.get(&key) {
            if existing.sequence != sequence {
                debug!(src = source, seq_zero = segment.seq_zero, "stale reassembly replaced");
                self.incoming.remove(&key);
            } else if existing.seg_n != segment.seg_n || existing.kind != segment.kind {
                debug!(src = source, seq_zero = segment.seq_zero, "inconsistent segment dropped");
                return Err(DecodeError::InconsistentSegment);
            }
        }

        let entry = self.incoming.entry(key).or_insert_with(|| Incoming {
            kind: segment.kind,
            seg_n: segment.seg_n,
            sequence,
            iv_index: network_pdu.iv_index,
            destination: network_pdu.destination,
            network_key_index: network_pdu.network_key_index,
            ttl: network_pdu.ttl,
            arrived: BTreeMap::new(),
            block_ack: 0,
            last_segment_ms: now_ms,
            last_ack_ms: now_ms,
        });
        entry.block_ack |= 1 << segment.seg_o;
        entry.last_segment_ms = now_ms;
        entry.arrived.insert(segment.seg_o, segment.data);

        let Some(upper_pdu) = entry.try_assemble() else {
            return Ok(ReassemblyOutcome::Incomplete(entry.ack(segment.seq_zero)));
        };

        let ack = entry.ack(segment.seq_zero);
        let message = ReassembledMessage {
            source,
            destination: entry.destination,
            kind: entry.kind,
            upper_pdu,
            sequence,
            iv_index: entry.iv_index,
            network_key_index: entry.network_key_index,
            ttl: entry.ttl,
            ack,
        };
        self.incoming.remove(&key);
        self.completed.insert(source, Completed { sequence, ack });
        debug!(
            src = source,
            seq = sequence,
            len = message.upper_pdu.len(),
            "segmented message reassembled"
        );
        Ok(ReassemblyOutcome::Complete(message))
    }

    /// Whether segments of the message from `source` whose segment 0 had
    /// `sequence` were already taken in, or the message was just completed.
    pub fn is_receiving(&self, source: Address, sequence: u32) -> bool {
        let seq_zero = (sequence & 0x1FFF) as u16;
        self.incoming
            .get(&Self::key(source, seq_zero))
            .is_some_and(|entry| entry.sequence == sequence)
            || self.completed.get(&source).is_some_and(|done| done.sequence == sequence)
    }

    /// Abandons the reassembly of one message.
    pub fn cancel(&mut self, source: Address, seq_zero: u16) -> bool {
        self.incoming.remove(&Self::key(source, seq_zero)).is_some()
    }

    /// Drops incomplete messages with no new segment for `timeout_ms`.
    ///
    /// Returns the number of discarded messages.
    pub fn discard_expired(&mut self, now_ms: u64, timeout_ms: u64) -> usize {
        let before = self.incoming.len();
        self.incoming.retain(|key, entry| {
            let keep = now_ms.saturating_sub(entry.last_segment_ms) < timeout_ms;
            if !keep {
                debug!(src = key >> 16, seq = entry.sequence, "incomplete message discarded");
            }
            keep
        });
        before - self.incoming.len()
    }

    /// Acknowledgments of incomplete messages whose ACK timer has fired.
    ///
    /// # Arguments
    /// - `now_ms`: current time
    /// - `ack_timer_ms`: ACK timer for a message with the given SegN
    pub fn due_acknowledgments(
        &mut self,
        now_ms: u64,
        ack_timer_ms: impl Fn(u8) -> u64,
    ) -> Vec<PendingAcknowledgment> {
        let mut due = Vec::new();
        for (key, entry) in self.incoming.iter_mut() {
            if now_ms.saturating_sub(entry.last_ack_ms) < ack_timer_ms(entry.seg_n) {
                continue;
            }
            entry.last_ack_ms = now_ms;
            due.push(PendingAcknowledgment {
                source: (key >> 16) as Address,
                destination: entry.destination,
                network_key_index: entry.network_key_index,
                iv_index: entry.iv_index,
                ttl: entry.ttl,
                ack: entry.ack((key & 0xFFFF) as u16),
            });
        }
        due
    }

    /// Number of messages being reassembled.
    pub fn pending(&self) -> usize {
        self.incoming.len()
    }
}

/// What a received Segment Acknowledgment means for an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Complete,
    /// The receiver is busy; the message is cancelled
    Busy,
    /// Segments still missing, by SegO
    Retransmit(Vec<u8>),
    /// The acknowledgment is for another message
    Ignored,
}

/// Tracks the segments of one outgoing segmented message.
#[derive(Debug, Clone)]
pub struct OutgoingSegments {
    pub source: Address,
    pub destination: Address,
    pub seq_zero: u16,
    segments: Vec<LowerTransportPdu>,
    seg_n: u8,
    acked: u32,
}

impl OutgoingSegments {
    pub fn new(source: Address, destination: Address, segments: Vec<LowerTransportPdu>) -> Self {
        let (seq_zero, seg_n) = segments
            .iter()
            .find_map(|pdu| match pdu {
                LowerTransportPdu::Segment(s) => Some((s.seq_zero, s.seg_n)),
                _ => None,
            })
            .unwrap_or((0, 0));
        OutgoingSegments {
            source,
            destination,
            seq_zero,
            segments,
            seg_n,
            acked: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.acked == full_block_ack(self.seg_n)
    }

    /// Segments not yet acknowledged, in SegO order.
    pub fn remaining(&self) -> impl Iterator<Item = &LowerTransportPdu> {
        self.segments.iter().enumerate().filter_map(|(i, pdu)| {
            (self.acked & (1 << i) == 0).then_some(pdu)
        })
    }

    /// Applies an acknowledgment received from the destination.
    pub fn apply(&mut self, ack: &SegmentAcknowledgment) -> AckOutcome {
        if ack.seq_zero != self.seq_zero {
            return AckOutcome::Ignored;
        }
        if ack.is_busy() {
            debug!(dst = self.destination, seq_zero = self.seq_zero, "receiver busy");
            return AckOutcome::Busy;
        }
        self.acked |= ack.block_ack & full_block_ack(self.seg_n);
        if self.is_complete() {
            return AckOutcome::Complete;
        }
        AckOutcome::Retransmit(
            (0..=self.seg_n)
                .filter(|seg_o| self.acked & (1 << seg_o) == 0)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use proptest::prelude::*;

    fn received(source: Address, sequence: u32) -> NetworkPdu {
        NetworkPdu {
            pdu: Vec::new(),
            network_key_index: 0,
            old_key_used: false,
            iv_index: 0x12345678,
            ivi: 0,
            nid: 0x68,
            pdu_type: LowerPduType::Access,
            ttl: 4,
            sequence,
            source,
            destination: 0x1201,
            transport_pdu: Vec::new(),
        }
    }

    fn into_segment(pdu: LowerTransportPdu) -> Segment {
        match pdu {
            LowerTransportPdu::Segment(segment) => segment,
            other => panic!("expected segment, got {other:?}"),
        }
    }

    const APP: MessageKind = MessageKind::Access { akf: false, aid: 0, szmic: false };

    #[test]
    fn test_segment_access_message() {
        let upper = hex::decode("eee888aa2169326d23f3afdfcfdc18c52fdef7720f8af48f").unwrap();
        let pdus = segment(APP, &upper, 0x3129AB).unwrap();
        assert_eq!(pdus.len(), 2);
        assert_eq!(hex::encode(pdus[0].encode()), "8026ac01eee888aa2169326d23f3afdf");
        assert_eq!(hex::encode(pdus[1].encode()), "8026ac21cfdc18c52fdef7720f8af48f");
    }

    #[test]
    fn test_unsegmented_when_it_fits() {
        let pdus = segment(APP, &[0u8; 15], 1).unwrap();
        assert!(matches!(pdus[0], LowerTransportPdu::UnsegmentedAccess { .. }));

        let pdus = segment(APP, &[0u8; 16], 1).unwrap();
        assert_eq!(pdus.len(), 2);

        // A 64-bit TransMIC forces segmentation
        let szmic = MessageKind::Access { akf: true, aid: 1, szmic: true };
        let pdus = segment(szmic, &[0u8; 10], 1).unwrap();
        assert_eq!(pdus.len(), 1);
        assert!(matches!(pdus[0], LowerTransportPdu::Segment(_)));

        let control = MessageKind::Control { opcode: 0x0A };
        assert_eq!(segment(control, &[0u8; 11], 1).unwrap().len(), 1);
        assert_eq!(segment(control, &[0u8; 12], 1).unwrap().len(), 2);
    }

    #[test]
    fn test_segment_too_large() {
        assert!(segment(APP, &[0u8; 384], 0).is_ok());
        assert_eq!(
            segment(APP, &[0u8; 385], 0),
            Err(TransportError::PayloadTooLarge(385))
        );
        let control = MessageKind::Control { opcode: 0x0A };
        assert_eq!(
            segment(control, &[0u8; 257], 0),
            Err(TransportError::PayloadTooLarge(257))
        );
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let upper: Vec<u8> = (0..30).collect();
        let pdus = segment(APP, &upper, 0x000100).unwrap();
        assert_eq!(pdus.len(), 3);
        let mut reassembler = Reassembler::new();

        let mut segments: Vec<Segment> = pdus.into_iter().map(into_segment).collect();
        let last = segments.pop().unwrap();
        let first = segments.remove(0);
        let middle = segments.pop().unwrap();

        assert!(!reassembler.is_receiving(0x0003, 0x000100));
        let outcome = reassembler.insert(&received(0x0003, 0x000102), last, 0).unwrap();
        assert!(reassembler.is_receiving(0x0003, 0x000100));
        assert!(!reassembler.is_receiving(0x0004, 0x000100));
        assert!(!reassembler.is_receiving(0x0003, 0x002100));
        assert_eq!(
            outcome,
            ReassemblyOutcome::Incomplete(SegmentAcknowledgment {
                on_behalf_of_lpn: false,
                seq_zero: 0x100,
                block_ack: 0b100,
            })
        );
        assert!(matches!(
            reassembler.insert(&received(0x0003, 0x000100), first, 10).unwrap(),
            ReassemblyOutcome::Incomplete(_)
        ));
        let ReassemblyOutcome::Complete(message) =
            reassembler.insert(&received(0x0003, 0x000101), middle.clone(), 20).unwrap()
        else {
            panic!("message not complete");
        };
        assert_eq!(message.upper_pdu, upper);
        assert_eq!(message.sequence, 0x000100);
        assert_eq!(message.source, 0x0003);
        assert!(message.ack.are_all_received(2));
        assert_eq!(reassembler.pending(), 0);
        assert!(reassembler.is_receiving(0x0003, 0x000100));

        // A retransmitted segment is answered with the same acknowledgment
        assert_eq!(
            reassembler.insert(&received(0x0003, 0x000105), middle, 30).unwrap(),
            ReassemblyOutcome::AlreadyComplete(message.ack)
        );
    }

    #[test]
    fn test_inconsistent_segment_rejected() {
        let mut reassembler = Reassembler::new();
        let first = Segment { kind: APP, seq_zero: 5, seg_o: 0, seg_n: 2, data: vec![1; 12] };
        reassembler.insert(&received(0x0010, 5), first, 0).unwrap();

        let wrong_n = Segment { kind: APP, seq_zero: 5, seg_o: 1, seg_n: 3, data: vec![2; 12] };
        assert_eq!(
            reassembler.insert(&received(0x0010, 6), wrong_n, 1),
            Err(DecodeError::InconsistentSegment)
        );
        let wrong_kind = Segment {
            kind: MessageKind::Control { opcode: 0x0A },
            seq_zero: 5,
            seg_o: 1,
            seg_n: 2,
            data: vec![2; 8],
        };
        assert_eq!(
            reassembler.insert(&received(0x0010, 6), wrong_kind, 1),
            Err(DecodeError::InconsistentSegment)
        );
        // Another source with the same SeqZero is independent
        let other = Segment { kind: APP, seq_zero: 5, seg_o: 1, seg_n: 3, data: vec![2; 12] };
        assert!(reassembler.insert(&received(0x0011, 6), other, 1).is_ok());
        assert_eq!(reassembler.pending(), 2);

        let invalid = Segment { kind: APP, seq_zero: 7, seg_o: 4, seg_n: 3, data: vec![0] };
        assert_eq!(
            reassembler.insert(&received(0x0010, 7), invalid, 1),
            Err(DecodeError::InvalidSegmentation)
        );
    }

    #[test]
    fn test_discard_and_cancel() {
        let mut reassembler = Reassembler::new();
        let a = Segment { kind: APP, seq_zero: 1, seg_o: 0, seg_n: 1, data: vec![0; 12] };
        let b = Segment { kind: APP, seq_zero: 2, seg_o: 0, seg_n: 1, data: vec![0; 12] };
        reassembler.insert(&received(0x0001, 1), a, 0).unwrap();
        reassembler.insert(&received(0x0002, 2), b, 5_000).unwrap();

        assert_eq!(reassembler.discard_expired(10_000, 10_000), 1);
        assert_eq!(reassembler.pending(), 1);
        assert!(!reassembler.cancel(0x0001, 1));
        assert!(reassembler.cancel(0x0002, 2));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_due_acknowledgments() {
        let mut reassembler = Reassembler::new();
        let a = Segment { kind: APP, seq_zero: 1, seg_o: 1, seg_n: 3, data: vec![0; 12] };
        reassembler.insert(&received(0x0001, 2), a, 0).unwrap();
        let timer = |seg_n: u8| 150 + 50 * u64::from(seg_n);

        assert!(reassembler.due_acknowledgments(299, timer).is_empty());
        let due = reassembler.due_acknowledgments(300, timer);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].source, 0x0001);
        assert_eq!(due[0].destination, 0x1201);
        assert_eq!(due[0].ack.block_ack, 0b10);
        assert_eq!(due[0].ack.seq_zero, 1);
        // Timer restarts
        assert!(reassembler.due_acknowledgments(400, timer).is_empty());
    }

    #[test]
    fn test_outgoing_segments() {
        let pdus = segment(APP, &[0u8; 40], 0x20).unwrap();
        let mut outgoing = OutgoingSegments::new(0x0001, 0x0002, pdus);
        assert_eq!(outgoing.remaining().count(), 4);

        let other = SegmentAcknowledgment { on_behalf_of_lpn: false, seq_zero: 0x21, block_ack: 0xF };
        assert_eq!(outgoing.apply(&other), AckOutcome::Ignored);

        let partial = SegmentAcknowledgment { on_behalf_of_lpn: false, seq_zero: 0x20, block_ack: 0b0101 };
        assert_eq!(outgoing.apply(&partial), AckOutcome::Retransmit(vec![1, 3]));
        assert_eq!(outgoing.remaining().count(), 2);

        let busy = SegmentAcknowledgment { block_ack: 0, ..partial };
        assert_eq!(outgoing.apply(&busy), AckOutcome::Busy);

        let rest = SegmentAcknowledgment { block_ack: 0b1010, ..partial };
        assert_eq!(outgoing.apply(&rest), AckOutcome::Complete);
        assert!(outgoing.is_complete());
        assert_eq!(outgoing.remaining().count(), 0);
    }

    proptest! {
        #[test]
        fn prop_segment_reassemble(
            upper in proptest::collection::vec(any::<u8>(), 16..=384),
            sequence in 0u32..0x00FF_0000,
        ) {
            let pdus = segment(APP, &upper, sequence).unwrap();
            prop_assert_eq!(pdus.len(), upper.len().div_ceil(ACCESS_SEGMENT_LEN));

            let mut reassembler = Reassembler::new();
            let mut result = None;
            for (i, pdu) in pdus.into_iter().enumerate().rev() {
                let encoded = pdu.encode();
                prop_assert!(encoded.len() <= 16);
                let decoded = LowerTransportPdu::decode(&encoded, LowerPduType::Access).unwrap();
                let network = received(0x0042, sequence + i as u32);
                if let ReassemblyOutcome::Complete(message) =
                    reassembler.insert(&network, into_segment(decoded), 0).unwrap()
                {
                    result = Some(message);
                }
            }
            let message = result.unwrap();
            prop_assert_eq!(message.upper_pdu, upper);
            prop_assert_eq!(message.sequence, sequence);
        }
    }
}
