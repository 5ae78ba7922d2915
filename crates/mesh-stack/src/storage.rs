//! Persistence collaborator

use std::sync::Mutex;

/// Byte storage for the persisted mesh state.
///
/// Implementations decide where the bytes live (IndexedDB, a file, ...).
pub trait Storage {
    /// Last saved bytes, `None` when nothing was saved yet.
    fn load(&self) -> Option<Vec<u8>>;

    /// Replaces the saved bytes. Returns false when the write failed.
    fn save(&self, data: &[u8]) -> bool;
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<Option<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        MemoryStorage { data: Mutex::new(Some(data)) }
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Option<Vec<u8>> {
        self.data.lock().ok()?.clone()
    }

    fn save(&self, data: &[u8]) -> bool {
        match self.data.lock() {
            Ok(mut slot) => {
                *slot = Some(data.to_vec());
                true
            }
            Err(_) => false,
        }
    }
}

impl<S: Storage + ?Sized> Storage for &S {
    fn load(&self) -> Option<Vec<u8>> {
        (**self).load()
    }

    fn save(&self, data: &[u8]) -> bool {
        (**self).save(data)
    }
}
