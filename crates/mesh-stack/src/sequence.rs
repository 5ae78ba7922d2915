//! Outgoing sequence numbers, one 24-bit counter per local element

use std::collections::BTreeMap;

use mesh_proto::SequenceEntry;
use mesh_transport::Address;
use tracing::{info, warn};

use crate::error::StackError;

/// Largest sequence number.
pub const MAX_SEQUENCE: u32 = 0x00FF_FFFF;

/// Past this value an IV Update should be started before the counter runs out.
pub const IV_UPDATE_THRESHOLD: u32 = 0x007F_FFFF;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceCounters {
    next: BTreeMap<Address, u32>,
}

impl SequenceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next sequence number of `source`.
    ///
    /// # Errors
    /// - `StackError::SequenceExhausted`: the 24-bit space is used up
    pub fn next(&mut self, source: Address) -> Result<u32, StackError> {
        let next = self.next.entry(source).or_insert(0);
        if *next > MAX_SEQUENCE {
            warn!(src = source, "sequence numbers exhausted");
            return Err(StackError::SequenceExhausted(source));
        }
        let sequence = *next;
        *next += 1;
        Ok(sequence)
    }

    /// Next value `next(source)` would return.
    pub fn peek(&self, source: Address) -> u32 {
        self.next.get(&source).copied().unwrap_or(0)
    }

    pub fn needs_iv_update(&self, source: Address) -> bool {
        self.peek(source) > IV_UPDATE_THRESHOLD
    }

    /// Restarts every counter at 0 after the transmit IV Index grew.
    pub fn reset_all(&mut self) {
        if !self.next.is_empty() {
            info!(elements = self.next.len(), "sequence numbers reset");
        }
        self.next.clear();
    }

    pub fn snapshot(&self) -> Vec<SequenceEntry> {
        self.next
            .iter()
            .map(|(source, next)| SequenceEntry {
                source: u32::from(*source),
                next_sequence: *next,
            })
            .collect()
    }

    pub fn restore(entries: &[SequenceEntry]) -> Self {
        SequenceCounters {
            next: entries
                .iter()
                .filter_map(|e| Some((Address::try_from(e.source).ok()?, e.next_sequence)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_source() {
        let mut counters = SequenceCounters::new();
        assert_eq!(counters.next(0x0001).unwrap(), 0);
        assert_eq!(counters.next(0x0001).unwrap(), 1);
        assert_eq!(counters.next(0x0002).unwrap(), 0);
        assert_eq!(counters.peek(0x0001), 2);
        counters.reset_all();
        assert_eq!(counters.next(0x0001).unwrap(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut counters = SequenceCounters::restore(&[SequenceEntry {
            source: 0x0001,
            next_sequence: MAX_SEQUENCE,
        }]);
        assert!(counters.needs_iv_update(0x0001));
        assert_eq!(counters.next(0x0001).unwrap(), MAX_SEQUENCE);
        assert!(matches!(counters.next(0x0001), Err(StackError::SequenceExhausted(0x0001))));
    }

    #[test]
    fn test_iv_update_threshold() {
        let mut counters = SequenceCounters::restore(&[SequenceEntry {
            source: 0x0005,
            next_sequence: IV_UPDATE_THRESHOLD,
        }]);
        assert!(!counters.needs_iv_update(0x0005));
        counters.next(0x0005).unwrap();
        assert!(counters.needs_iv_update(0x0005));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut counters = SequenceCounters::new();
        counters.next(0x0003).unwrap();
        counters.next(0x0004).unwrap();
        counters.next(0x0004).unwrap();
        let restored = SequenceCounters::restore(&counters.snapshot());
        assert_eq!(restored, counters);
        // Entries with an out-of-range source are skipped
        let restored = SequenceCounters::restore(&[SequenceEntry { source: 0x1_0000, next_sequence: 1 }]);
        assert_eq!(restored, SequenceCounters::new());
    }
}
