//! Bearer collaborator

use std::sync::Mutex;

pub use mesh_transport::ProxyPduType as PduType;

/// Why a bearer could not take a PDU.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BearerError {
    #[error("bearer is closed")]
    Closed,
    #[error("bearer does not support {0:?} PDUs")]
    UnsupportedPduType(PduType),
    #[error("bearer error: {0}")]
    Other(String),
}

/// Hands complete PDUs to the link layer (GATT proxy, advertising bearer).
pub trait Transmitter {
    fn send(&self, data: &[u8], pdu_type: PduType) -> Result<(), BearerError>;
}

/// Collects sent PDUs in order, to be drained by the owner.
#[derive(Debug, Default)]
pub struct QueueTransmitter {
    queue: Mutex<Vec<(Vec<u8>, PduType)>>,
}

impl QueueTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every queued PDU.
    pub fn drain(&self) -> Vec<(Vec<u8>, PduType)> {
        match self.queue.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transmitter for QueueTransmitter {
    fn send(&self, data: &[u8], pdu_type: PduType) -> Result<(), BearerError> {
        self.queue
            .lock()
            .map_err(|_| BearerError::Closed)?
            .push((data.to_vec(), pdu_type));
        Ok(())
    }
}

impl<T: Transmitter + ?Sized> Transmitter for &T {
    fn send(&self, data: &[u8], pdu_type: PduType) -> Result<(), BearerError> {
        (**self).send(data, pdu_type)
    }
}
