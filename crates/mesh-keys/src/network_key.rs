//! Network Keys and the Key Refresh phase machine
//!
//! ```text
//!   NormalOperation ──rotate_key(new)──▶ KeyDistribution ──use_new_keys()──▶ UsingNewKeys
//!          ▲                                  │                                  │
//!          └──────────────── revoke_old_key() ┴──────────────────────────────────┘
//! ```
//!
//! | Phase           | Transmit | Receive     | Old key |
//! |-----------------|----------|-------------|---------|
//! | NormalOperation | current  | current     | none    |
//! | KeyDistribution | old      | current+old | kept    |
//! | UsingNewKeys    | current  | current+old | kept    |
//!
//! Transitions return a new [`NetworkKey`]; derivatives are recomputed only
//! when a transition asks for it.

use mesh_crypto::{
    calculate_key_derivatives, calculate_network_id, decode_hex_key, random_key, Key,
    KeyDerivatives,
};
use tracing::info;

use crate::{check_key_index, KeyError, KeyIndex};

/// Key Refresh procedure phase of a Network Key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyRefreshPhase {
    #[default]
    NormalOperation,
    /// Phase 1: new key distributed, old key still used to transmit
    KeyDistribution,
    /// Phase 2: new key used to transmit, old key still accepted
    UsingNewKeys,
}

/// One 128-bit Network Key with everything derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkKeyMaterial {
    pub key: Key,
    pub derivatives: KeyDerivatives,
    pub network_id: [u8; 8],
}

impl NetworkKeyMaterial {
    pub fn new(key: Key) -> Self {
        NetworkKeyMaterial {
            key,
            derivatives: calculate_key_derivatives(&key),
            network_id: calculate_network_id(&key),
        }
    }

    pub fn nid(&self) -> u8 {
        self.derivatives.nid
    }
}

/// A subnet key, with optional old material while a Key Refresh runs.
///
/// Invariant: `old.is_some()` exactly when `phase != NormalOperation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkKey {
    index: KeyIndex,
    current: NetworkKeyMaterial,
    old: Option<NetworkKeyMaterial>,
    phase: KeyRefreshPhase,
}

impl NetworkKey {
    /// Creates a Network Key in Normal Operation.
    ///
    /// # Errors
    /// - `KeyError::InvalidKeyIndex`: index above 4095
    pub fn new(index: KeyIndex, key: Key) -> Result<Self, KeyError> {
        check_key_index(index)?;
        Ok(NetworkKey {
            index,
            current: NetworkKeyMaterial::new(key),
            old: None,
            phase: KeyRefreshPhase::NormalOperation,
        })
    }

    /// Creates a Network Key from a 32-character hex string.
    pub fn from_hex(index: KeyIndex, key_hex: &str) -> Result<Self, KeyError> {
        Self::new(index, decode_hex_key(key_hex)?)
    }

    /// Creates a Network Key with fresh random key bytes.
    pub fn random(index: KeyIndex) -> Result<Self, KeyError> {
        Self::new(index, random_key()?)
    }

    /// Rebuilds a key from persisted parts, checking the phase invariant.
    pub fn restore(
        index: KeyIndex,
        key: Key,
        old_key: Option<Key>,
        phase: KeyRefreshPhase,
    ) -> Result<Self, KeyError> {
        check_key_index(index)?;
        let in_refresh = phase != KeyRefreshPhase::NormalOperation;
        if in_refresh != old_key.is_some() {
            return Err(KeyError::InconsistentOldKey(phase));
        }
        Ok(NetworkKey {
            index,
            current: NetworkKeyMaterial::new(key),
            old: old_key.map(NetworkKeyMaterial::new),
            phase,
        })
    }

    pub fn index(&self) -> KeyIndex {
        self.index
    }

    pub fn key(&self) -> &Key {
        &self.current.key
    }

    pub fn old_key(&self) -> Option<&Key> {
        self.old.as_ref().map(|m| &m.key)
    }

    pub fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    /// Material of the newest key.
    pub fn current(&self) -> &NetworkKeyMaterial {
        &self.current
    }

    /// Material of the key being replaced, during a Key Refresh.
    pub fn old(&self) -> Option<&NetworkKeyMaterial> {
        self.old.as_ref()
    }

    pub fn network_id(&self) -> &[u8; 8] {
        &self.current.network_id
    }

    pub fn old_network_id(&self) -> Option<&[u8; 8]> {
        self.old.as_ref().map(|m| &m.network_id)
    }

    /// Material used to encrypt outgoing messages and beacons.
    pub fn transmit_keys(&self) -> &NetworkKeyMaterial {
        match (self.phase, &self.old) {
            (KeyRefreshPhase::KeyDistribution, Some(old)) => old,
            _ => &self.current,
        }
    }

    /// Material accepted on receive, current first.
    pub fn receive_candidates(&self) -> impl Iterator<Item = &NetworkKeyMaterial> {
        core::iter::once(&self.current).chain(self.old.iter())
    }

    /// Starts a Key Refresh by distributing `new_key`.
    ///
    /// In Key Distribution the same key is accepted again without change, so
    /// a repeated NetKey Update is harmless.
    ///
    /// # Errors
    /// - `KeyError::KeyRefreshInProgress`: a different key while already distributing
    /// - `KeyError::InvalidPhaseTransition`: called in Using New Keys
    pub fn rotate_key(&self, new_key: Key) -> Result<Self, KeyError> {
        match self.phase {
            KeyRefreshPhase::NormalOperation => {
                info!(index = self.index, "network key refresh: key distribution");
                Ok(NetworkKey {
                    index: self.index,
                    current: NetworkKeyMaterial::new(new_key),
                    old: Some(self.current),
                    phase: KeyRefreshPhase::KeyDistribution,
                })
            }
            KeyRefreshPhase::KeyDistribution if self.current.key == new_key => Ok(self.clone()),
            KeyRefreshPhase::KeyDistribution => Err(KeyError::KeyRefreshInProgress),
            KeyRefreshPhase::UsingNewKeys => Err(KeyError::InvalidPhaseTransition {
                from: self.phase,
                to: KeyRefreshPhase::KeyDistribution,
            }),
        }
    }

    /// Switches transmission to the new key. Old material stays for receive.
    ///
    /// # Errors
    /// - `KeyError::InvalidPhaseTransition`: not in Key Distribution (Using
    ///   New Keys is accepted as a no-op)
    pub fn use_new_keys(&self) -> Result<Self, KeyError> {
        match self.phase {
            KeyRefreshPhase::KeyDistribution => {
                info!(index = self.index, "network key refresh: using new keys");
                Ok(NetworkKey {
                    phase: KeyRefreshPhase::UsingNewKeys,
                    ..self.clone()
                })
            }
            KeyRefreshPhase::UsingNewKeys => Ok(self.clone()),
            KeyRefreshPhase::NormalOperation => Err(KeyError::InvalidPhaseTransition {
                from: self.phase,
                to: KeyRefreshPhase::UsingNewKeys,
            }),
        }
    }

    /// Drops the old key and all its derivatives, returning to Normal Operation.
    pub fn revoke_old_key(&self) -> Self {
        if self.old.is_some() {
            info!(index = self.index, "network key refresh: old key revoked");
        }
        NetworkKey {
            index: self.index,
            current: self.current,
            old: None,
            phase: KeyRefreshPhase::NormalOperation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn key(s: &str) -> Key {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    fn sample() -> NetworkKey {
        NetworkKey::from_hex(0x123, "7dd7364cd842ad18c17c2b820c84c3d6").unwrap()
    }

    #[test]
    fn test_new_key_derivatives() {
        let net_key = sample();
        assert_eq!(net_key.index(), 0x123);
        assert_eq!(net_key.phase(), KeyRefreshPhase::NormalOperation);
        assert_eq!(net_key.current().nid(), 0x68);
        assert_eq!(net_key.network_id(), &[0x3e, 0xca, 0xff, 0x67, 0x2f, 0x67, 0x33, 0x70]);
        assert!(net_key.old().is_none());
        assert_eq!(net_key.receive_candidates().count(), 1);
    }

    #[test]
    fn test_index_out_of_range() {
        assert_eq!(
            NetworkKey::new(4096, [0; 16]),
            Err(KeyError::InvalidKeyIndex(4096))
        );
        assert!(NetworkKey::new(4095, [0; 16]).is_ok());
    }

    #[test]
    fn test_invalid_hex_key() {
        assert!(matches!(
            NetworkKey::from_hex(0, "7dd7364c"),
            Err(KeyError::Crypto(mesh_crypto::CryptoError::InvalidKeyLength(4)))
        ));
    }

    #[test]
    fn test_rotate_key_keeps_previous_as_old() {
        let original = sample();
        let new_key = key("f7a2a44f8e8a8029064f173ddc1e2b00");
        let rotated = original.rotate_key(new_key).unwrap();

        assert_eq!(rotated.phase(), KeyRefreshPhase::KeyDistribution);
        assert_eq!(rotated.key(), &new_key);
        assert_eq!(rotated.old_key(), Some(original.key()));
        assert_eq!(rotated.old_network_id(), Some(original.network_id()));
        // Old key transmits while the new one is being distributed
        assert_eq!(rotated.transmit_keys(), original.current());
        let nids: Vec<u8> = rotated.receive_candidates().map(|m| m.nid()).collect();
        assert_eq!(nids, vec![0x7F, 0x68]);
    }

    #[test]
    fn test_rotate_key_idempotent_in_key_distribution() {
        let new_key = [0x42; 16];
        let rotated = sample().rotate_key(new_key).unwrap();
        assert_eq!(rotated.rotate_key(new_key).unwrap(), rotated);
        assert_eq!(
            rotated.rotate_key([0x43; 16]),
            Err(KeyError::KeyRefreshInProgress)
        );
    }

    #[test]
    fn test_use_new_keys_keeps_old() {
        let original = sample();
        let rotated = original.rotate_key([0x42; 16]).unwrap();
        let switched = rotated.use_new_keys().unwrap();

        assert_eq!(switched.phase(), KeyRefreshPhase::UsingNewKeys);
        assert_eq!(switched.old_key(), Some(original.key()));
        assert_eq!(switched.transmit_keys().key, [0x42; 16]);
        assert_eq!(switched.receive_candidates().count(), 2);
        assert!(matches!(
            switched.rotate_key([0x42; 16]),
            Err(KeyError::InvalidPhaseTransition { .. })
        ));
    }

    #[test]
    fn test_use_new_keys_requires_refresh() {
        assert_eq!(
            sample().use_new_keys(),
            Err(KeyError::InvalidPhaseTransition {
                from: KeyRefreshPhase::NormalOperation,
                to: KeyRefreshPhase::UsingNewKeys,
            })
        );
    }

    #[test]
    fn test_revoke_clears_old_material() {
        let refreshed = sample()
            .rotate_key([0x42; 16])
            .unwrap()
            .use_new_keys()
            .unwrap()
            .revoke_old_key();
        assert_eq!(refreshed.phase(), KeyRefreshPhase::NormalOperation);
        assert!(refreshed.old().is_none());
        assert!(refreshed.old_network_id().is_none());
        assert_eq!(refreshed.key(), &[0x42; 16]);

        // Revoking from Key Distribution also ends the procedure
        let aborted = sample().rotate_key([0x42; 16]).unwrap().revoke_old_key();
        assert_eq!(aborted.phase(), KeyRefreshPhase::NormalOperation);
    }

    #[test]
    fn test_restore_checks_invariant() {
        assert_eq!(
            NetworkKey::restore(1, [1; 16], None, KeyRefreshPhase::UsingNewKeys),
            Err(KeyError::InconsistentOldKey(KeyRefreshPhase::UsingNewKeys))
        );
        assert_eq!(
            NetworkKey::restore(1, [1; 16], Some([2; 16]), KeyRefreshPhase::NormalOperation),
            Err(KeyError::InconsistentOldKey(KeyRefreshPhase::NormalOperation))
        );
        let restored =
            NetworkKey::restore(1, [1; 16], Some([2; 16]), KeyRefreshPhase::KeyDistribution).unwrap();
        assert_eq!(restored, NetworkKey::new(1, [2; 16]).unwrap().rotate_key([1; 16]).unwrap());
    }

    #[test]
    fn test_random_keys_differ() {
        let a = NetworkKey::random(0).unwrap();
        let b = NetworkKey::random(0).unwrap();
        assert_ne!(a.key(), b.key());
    }
}
