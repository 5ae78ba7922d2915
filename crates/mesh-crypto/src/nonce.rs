//! Mesh nonces
//!
//! ## Nonce layout (13 bytes)
//! ```text
//! network:     0x00 ‖ CTL|TTL   ‖ SEQ (3) ‖ SRC (2) ‖ 0x0000  ‖ IV Index (4)
//! application: 0x01 ‖ ASZMIC<<7 ‖ SEQ (3) ‖ SRC (2) ‖ DST (2) ‖ IV Index (4)
//! device:      0x02 ‖ ASZMIC<<7 ‖ SEQ (3) ‖ SRC (2) ‖ DST (2) ‖ IV Index (4)
//! proxy:       0x03 ‖ 0x00      ‖ SEQ (3) ‖ SRC (2) ‖ 0x0000  ‖ IV Index (4)
//! ```
//!
//! All multi-byte fields are big-endian. SEQ is the 24-bit sequence number.

/// Nonce type, the first byte of the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonceType {
    /// Network PDU encryption
    Network = 0x00,
    /// Upper transport with an Application Key
    Application = 0x01,
    /// Upper transport with a Device Key
    Device = 0x02,
    /// Proxy configuration messages
    Proxy = 0x03,
}

impl NonceType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(NonceType::Network),
            0x01 => Some(NonceType::Application),
            0x02 => Some(NonceType::Device),
            0x03 => Some(NonceType::Proxy),
            _ => None,
        }
    }
}

/// A 13-byte AES-CCM nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshNonce([u8; 13]);

impl MeshNonce {
    /// Builds a nonce of any type from the message fields.
    ///
    /// # Arguments
    /// - `nonce_type`: selects the layout
    /// - `iv_index`: IV Index used for this message
    /// - `segmented` / `szmic`: ASZMIC is set only for segmented access
    ///   messages with a 64-bit TransMIC
    /// - `ctl_ttl`: CTL bit and TTL, only read by network nonces
    /// - `sequence`: 24-bit sequence number (upper bits are ignored)
    /// - `source` / `destination`: 16-bit addresses
    ///
    /// # Example
    /// ```
    /// use mesh_crypto::{MeshNonce, NonceType};
    /// let nonce = MeshNonce::new(NonceType::Device, 0x12345678, false, false, 0, 0x3129AB, 0x0003, 0x1201);
    /// assert_eq!(nonce.as_bytes()[0], 0x02);
    /// assert_eq!(nonce.sequence(), 0x3129AB);
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nonce_type: NonceType,
        iv_index: u32,
        segmented: bool,
        szmic: bool,
        ctl_ttl: u8,
        sequence: u32,
        source: u16,
        destination: u16,
    ) -> Self {
        match nonce_type {
            NonceType::Network => Self::network(ctl_ttl, sequence, source, iv_index),
            NonceType::Proxy => Self::proxy(sequence, source, iv_index),
            NonceType::Application | NonceType::Device => Self::transport(
                nonce_type,
                segmented && szmic,
                sequence,
                source,
                destination,
                iv_index,
            ),
        }
    }

    /// Network nonce.
    pub fn network(ctl_ttl: u8, sequence: u32, source: u16, iv_index: u32) -> Self {
        Self::build(NonceType::Network, ctl_ttl, sequence, source, 0x0000, iv_index)
    }

    /// Proxy nonce, used for proxy configuration Network PDUs.
    pub fn proxy(sequence: u32, source: u16, iv_index: u32) -> Self {
        Self::build(NonceType::Proxy, 0x00, sequence, source, 0x0000, iv_index)
    }

    /// Application nonce.
    pub fn application(aszmic: bool, sequence: u32, source: u16, destination: u16, iv_index: u32) -> Self {
        Self::transport(NonceType::Application, aszmic, sequence, source, destination, iv_index)
    }

    /// Device nonce.
    pub fn device(aszmic: bool, sequence: u32, source: u16, destination: u16, iv_index: u32) -> Self {
        Self::transport(NonceType::Device, aszmic, sequence, source, destination, iv_index)
    }

    fn transport(
        nonce_type: NonceType,
        aszmic: bool,
        sequence: u32,
        source: u16,
        destination: u16,
        iv_index: u32,
    ) -> Self {
        let pad = if aszmic { 0x80 } else { 0x00 };
        Self::build(nonce_type, pad, sequence, source, destination, iv_index)
    }

    fn build(
        nonce_type: NonceType,
        second: u8,
        sequence: u32,
        source: u16,
        destination: u16,
        iv_index: u32,
    ) -> Self {
        let mut bytes = [0u8; 13];
        bytes[0] = nonce_type as u8;
        bytes[1] = second;
        bytes[2..5].copy_from_slice(&sequence.to_be_bytes()[1..4]);
        bytes[5..7].copy_from_slice(&source.to_be_bytes());
        bytes[7..9].copy_from_slice(&destination.to_be_bytes());
        bytes[9..13].copy_from_slice(&iv_index.to_be_bytes());
        MeshNonce(bytes)
    }

    pub fn nonce_type(&self) -> Option<NonceType> {
        NonceType::from_byte(self.0[0])
    }

    /// 24-bit sequence number.
    pub fn sequence(&self) -> u32 {
        u32::from_be_bytes([0, self.0[2], self.0[3], self.0[4]])
    }

    pub fn iv_index(&self) -> u32 {
        u32::from_be_bytes([self.0[9], self.0[10], self.0[11], self.0[12]])
    }

    /// The raw nonce, passed to [`crate::encrypt`] / [`crate::decrypt`].
    pub fn as_bytes(&self) -> &[u8; 13] {
        &self.0
    }
}
