//! Application Keys
//!
//! An Application Key is bound to exactly one Network Key and follows that
//! key's Key Refresh phase: while the bound Network Key is in Key
//! Distribution, messages are still sent with the old Application Key.

use mesh_crypto::{calculate_aid, decode_hex_key, random_key, Key};

use crate::{check_key_index, KeyError, KeyIndex, KeyRefreshPhase};

/// Application Key bytes and their 6-bit AID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplicationKeyMaterial {
    pub key: Key,
    pub aid: u8,
}

impl ApplicationKeyMaterial {
    pub fn new(key: Key) -> Self {
        ApplicationKeyMaterial { key, aid: calculate_aid(&key) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationKey {
    index: KeyIndex,
    bound_network_key_index: KeyIndex,
    current: ApplicationKeyMaterial,
    old: Option<ApplicationKeyMaterial>,
}

impl ApplicationKey {
    /// # Errors
    /// - `KeyError::InvalidKeyIndex`: either index above 4095
    pub fn new(index: KeyIndex, key: Key, bound_network_key_index: KeyIndex) -> Result<Self, KeyError> {
        check_key_index(index)?;
        check_key_index(bound_network_key_index)?;
        Ok(ApplicationKey {
            index,
            bound_network_key_index,
            current: ApplicationKeyMaterial::new(key),
            old: None,
        })
    }

    pub fn from_hex(
        index: KeyIndex,
        key_hex: &str,
        bound_network_key_index: KeyIndex,
    ) -> Result<Self, KeyError> {
        Self::new(index, decode_hex_key(key_hex)?, bound_network_key_index)
    }

    pub fn random(index: KeyIndex, bound_network_key_index: KeyIndex) -> Result<Self, KeyError> {
        Self::new(index, random_key()?, bound_network_key_index)
    }

    /// Rebuilds a key from persisted parts.
    pub fn restore(
        index: KeyIndex,
        key: Key,
        old_key: Option<Key>,
        bound_network_key_index: KeyIndex,
    ) -> Result<Self, KeyError> {
        let mut app_key = Self::new(index, key, bound_network_key_index)?;
        app_key.old = old_key.map(ApplicationKeyMaterial::new);
        Ok(app_key)
    }

    pub fn index(&self) -> KeyIndex {
        self.index
    }

    pub fn bound_network_key_index(&self) -> KeyIndex {
        self.bound_network_key_index
    }

    pub fn key(&self) -> &Key {
        &self.current.key
    }

    pub fn aid(&self) -> u8 {
        self.current.aid
    }

    pub fn old_key(&self) -> Option<&Key> {
        self.old.as_ref().map(|m| &m.key)
    }

    pub fn old_aid(&self) -> Option<u8> {
        self.old.map(|m| m.aid)
    }

    pub fn current(&self) -> &ApplicationKeyMaterial {
        &self.current
    }

    pub fn old(&self) -> Option<&ApplicationKeyMaterial> {
        self.old.as_ref()
    }

    /// Key used to send, given the phase of the bound Network Key.
    pub fn transmit_keys(&self, phase: KeyRefreshPhase) -> &ApplicationKeyMaterial {
        match (phase, &self.old) {
            (KeyRefreshPhase::KeyDistribution, Some(old)) => old,
            _ => &self.current,
        }
    }

    /// Keys accepted on receive, current first.
    pub fn receive_candidates(&self) -> impl Iterator<Item = &ApplicationKeyMaterial> {
        core::iter::once(&self.current).chain(self.old.iter())
    }

    /// Distributes a new key, keeping the previous one as old.
    ///
    /// # Errors
    /// - `KeyError::KeyRefreshInProgress`: an old key is already held and
    ///   `new_key` is not the one being distributed
    pub fn rotate_key(&self, new_key: Key) -> Result<Self, KeyError> {
        match self.old {
            None => Ok(ApplicationKey {
                current: ApplicationKeyMaterial::new(new_key),
                old: Some(self.current),
                ..self.clone()
            }),
            Some(_) if self.current.key == new_key => Ok(self.clone()),
            Some(_) => Err(KeyError::KeyRefreshInProgress),
        }
    }

    pub fn revoke_old_key(&self) -> Self {
        ApplicationKey { old: None, ..self.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ApplicationKey {
        ApplicationKey::from_hex(0x456, "63964771734fbd76e3b40519d1d94a48", 0x123).unwrap()
    }

    #[test]
    fn test_aid_and_binding() {
        let app_key = sample();
        assert_eq!(app_key.aid(), 0x26);
        assert_eq!(app_key.index(), 0x456);
        assert_eq!(app_key.bound_network_key_index(), 0x123);
        assert!(app_key.old_aid().is_none());
    }

    #[test]
    fn test_bound_index_validated() {
        assert_eq!(
            ApplicationKey::new(0, [0; 16], 0x1000),
            Err(KeyError::InvalidKeyIndex(0x1000))
        );
    }

    #[test]
    fn test_rotate_and_transmit_selection() {
        let original = sample();
        let new_key: Key = hex::decode("3216d1509884b533248541792b877f98")
            .unwrap()
            .try_into()
            .unwrap();
        let rotated = original.rotate_key(new_key).unwrap();

        assert_eq!(rotated.aid(), 0x38);
        assert_eq!(rotated.old_aid(), Some(0x26));
        assert_eq!(rotated.transmit_keys(KeyRefreshPhase::KeyDistribution).aid, 0x26);
        assert_eq!(rotated.transmit_keys(KeyRefreshPhase::UsingNewKeys).aid, 0x38);
        assert_eq!(rotated.receive_candidates().count(), 2);

        assert_eq!(rotated.rotate_key(new_key).unwrap(), rotated);
        assert_eq!(rotated.rotate_key([9; 16]), Err(KeyError::KeyRefreshInProgress));

        let revoked = rotated.revoke_old_key();
        assert!(revoked.old().is_none());
        assert_eq!(revoked.aid(), 0x38);
    }
}
