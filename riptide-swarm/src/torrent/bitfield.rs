//! Piece availability bitfield with MSB-first wire layout

use bytes::Bytes;

use super::{PieceIndex, TorrentError};

/// Set of piece indices held by some node.
///
/// Bit `i` is the `7 - i % 8` bit of byte `i / 8`, matching the BEP 3
/// `bitfield` message so the raw bytes can be sent unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: u32,
}

impl Bitfield {
    /// Creates an empty bitfield for `len` pieces.
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8) as usize],
            len,
        }
    }

    /// Creates a bitfield with every piece set.
    pub fn full(len: u32) -> Self {
        let mut bitfield = Self::new(len);
        for index in 0..len {
            bitfield.set(PieceIndex::new(index));
        }
        bitfield
    }

    /// Creates bitfield from raw bytes received from a peer.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Byte count does not match `len`
    pub fn from_bytes(bytes: &[u8], len: u32) -> Result<Self, TorrentError> {
        let expected_bytes = len.div_ceil(8);
        if bytes.len() != expected_bytes as usize {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Invalid bitfield size: expected {} bytes for {} pieces, got {}",
                    expected_bytes,
                    len,
                    bytes.len()
                ),
            });
        }

        let mut bitfield = Self {
            bits: bytes.to_vec(),
            len,
        };
        bitfield.clear_spare_bits();
        Ok(bitfield)
    }

    /// Creates a bitfield sized to the raw bytes, before the piece count is known.
    pub fn from_unsized_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: bytes.to_vec(),
            len: bytes.len() as u32 * 8,
        }
    }

    /// Number of pieces this bitfield describes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// True when the bitfield describes zero pieces.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if the piece is set.
    pub fn has(&self, index: PieceIndex) -> bool {
        let index = index.as_u32();
        if index >= self.len {
            return false;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] & (1 << bit_index)) != 0
    }

    /// Marks piece as present. Out-of-range indices are ignored.
    pub fn set(&mut self, index: PieceIndex) {
        let index = index.as_u32();
        if index >= self.len {
            return;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Marks piece as absent. Out-of-range indices are ignored.
    pub fn clear(&mut self, index: PieceIndex) {
        let index = index.as_u32();
        if index >= self.len {
            return;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] &= !(1 << bit_index);
    }

    /// Grows or truncates to `len` pieces, keeping the bits that remain in range.
    pub fn resize(&mut self, len: u32) {
        self.bits.resize(len.div_ceil(8) as usize, 0);
        self.len = len;
        self.clear_spare_bits();
    }

    /// Sets every piece that `other` has. Bits past `self.len()` are ignored.
    pub fn union_with(&mut self, other: &Bitfield) {
        for index in other.pieces() {
            self.set(index);
        }
    }

    /// Number of pieces set.
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// True when every piece is set.
    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    /// Iterates over set piece indices in ascending order.
    pub fn pieces(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.len)
            .map(PieceIndex::new)
            .filter(|index| self.has(*index))
    }

    /// True when `self` holds at least one piece that `local` lacks.
    pub fn has_missing_from(&self, local: &Bitfield) -> bool {
        self.pieces().any(|index| !local.has(index))
    }

    /// Raw bytes for transmission.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Copies the raw bytes into a `Bytes` buffer for a wire message.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() as u32 * 8 - self.len;
        if spare > 0
            && let Some(last) = self.bits.last_mut()
        {
            *last &= 0xffu8 << spare;
        }
    }
}
