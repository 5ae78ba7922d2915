//! Mesh addresses
//!
//! ```text
//! 0x0000            unassigned
//! 0x0001 - 0x7FFF   unicast
//! 0x8000 - 0xBFFF   virtual (hash of a 128-bit Label UUID)
//! 0xC000 - 0xFFFF   group
//!   0xFF00 - 0xFFFB   reserved
//!   0xFFFC - 0xFFFF   fixed groups (All Proxies, Friends, Relays, Nodes)
//! ```

use mesh_crypto::calculate_virtual_address;

/// A 16-bit mesh address.
pub type Address = u16;

pub const UNASSIGNED_ADDRESS: Address = 0x0000;
pub const ALL_PROXIES: Address = 0xFFFC;
pub const ALL_FRIENDS: Address = 0xFFFD;
pub const ALL_RELAYS: Address = 0xFFFE;
pub const ALL_NODES: Address = 0xFFFF;

pub fn is_unassigned(address: Address) -> bool {
    address == UNASSIGNED_ADDRESS
}

pub fn is_unicast(address: Address) -> bool {
    address & 0x8000 == 0 && address != UNASSIGNED_ADDRESS
}

pub fn is_virtual(address: Address) -> bool {
    address & 0xC000 == 0x8000
}

pub fn is_group(address: Address) -> bool {
    address & 0xC000 == 0xC000
}

/// Fixed group addresses (All Proxies, All Friends, All Relays, All Nodes).
pub fn is_fixed_group(address: Address) -> bool {
    address >= ALL_PROXIES
}

/// A destination, with its Label UUID when it is virtual.
///
/// The Label UUID is the additional data of the upper transport AES-CCM
/// for virtual destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshAddress {
    pub address: Address,
    pub label: Option<[u8; 16]>,
}

impl MeshAddress {
    pub fn new(address: Address) -> Self {
        MeshAddress { address, label: None }
    }

    /// Virtual address computed from a Label UUID.
    pub fn from_label(label: [u8; 16]) -> Self {
        MeshAddress {
            address: calculate_virtual_address(&label),
            label: Some(label),
        }
    }

    pub fn is_unicast(&self) -> bool {
        is_unicast(self.address)
    }

    pub fn is_virtual(&self) -> bool {
        is_virtual(self.address)
    }

    pub fn is_group(&self) -> bool {
        is_group(self.address)
    }

    /// Additional data for the upper transport AES-CCM.
    pub fn additional_data(&self) -> &[u8] {
        match &self.label {
            Some(label) => label,
            None => &[],
        }
    }
}

impl From<Address> for MeshAddress {
    fn from(address: Address) -> Self {
        MeshAddress::new(address)
    }
}
