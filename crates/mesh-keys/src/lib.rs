//! # mesh-keys
//!
//! Key material and the two security state machines of a mesh network.
//!
//! ## Key Refresh
//!
//! ```text
//! NormalOperation ─rotate_key─▶ KeyDistribution ─use_new_keys─▶ UsingNewKeys
//!        ▲                                                           │
//!        └──────────────────────── revoke_old_key ───────────────────┘
//!
//! phase            transmit   receive
//! NormalOperation  current    current
//! KeyDistribution  old        old, new
//! UsingNewKeys     new        old, new
//! ```
//!
//! Application Keys follow the phase of the Network Key they are bound to.
//!
//! ## IV Index
//!
//! ```text
//! (X, normal) ─▶ (X+1, update active) ─▶ (X+1, normal) ─▶ ...
//! ```
//!
//! Each state lasts at least 96 hours. [`IvIndex::can_overwrite`] decides
//! whether an authenticated beacon may move the local state forward.
//!
//! State changes are explicit functions returning new values, so a caller
//! always knows when derived keys are recomputed.

#![no_std]
extern crate alloc;

mod application_key;
mod error;
mod iv_index;
mod network_key;

pub use application_key::{ApplicationKey, ApplicationKeyMaterial};
pub use error::KeyError;
pub use iv_index::{
    IvIndex, IvUpdatePolicy, HOURS_BETWEEN_RECOVERIES, HOURS_PER_STATE, MAX_IV_RECOVERY_DELTA,
};
pub use network_key::{KeyRefreshPhase, NetworkKey, NetworkKeyMaterial};

/// 12-bit global key index.
pub type KeyIndex = u16;

/// Highest valid key index.
pub const MAX_KEY_INDEX: KeyIndex = 4095;

pub(crate) fn check_key_index(index: KeyIndex) -> Result<(), KeyError> {
    if index > MAX_KEY_INDEX {
        return Err(KeyError::InvalidKeyIndex(index));
    }
    Ok(())
}
