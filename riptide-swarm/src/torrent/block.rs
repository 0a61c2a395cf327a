//! Piece and block addressing
//!
//! Pieces are split into fixed-size blocks, the unit actually requested and
//! transferred over the wire. The last block of a piece, and the last piece
//! of a torrent, may be shorter.

use std::fmt;

use super::{PieceIndex, TorrentError};

/// Standard block size used by practically every client (16 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Address of a byte range inside a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex {
    pub piece: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

impl BlockIndex {
    /// Creates a block address without bounds checking.
    pub fn new(piece: PieceIndex, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// Validates that the block lies inside a piece of `piece_length` bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidBlock` - Zero length or range past the piece end
    pub fn validate(&self, piece_length: u32) -> Result<(), TorrentError> {
        if self.length == 0 {
            return Err(TorrentError::InvalidBlock {
                block: *self,
                reason: "zero length".to_string(),
            });
        }

        let end = self.offset as u64 + self.length as u64;
        if end > piece_length as u64 {
            return Err(TorrentError::InvalidBlock {
                block: *self,
                reason: format!("range ends at {end}, piece has {piece_length} bytes"),
            });
        }

        Ok(())
    }

    /// Cuts the addressed range out of a stored piece.
    ///
    /// # Errors
    /// - `TorrentError::InvalidBlock` - Range does not fit in `piece_bytes`
    pub fn slice<'a>(&self, piece_bytes: &'a [u8]) -> Result<&'a [u8], TorrentError> {
        self.validate(piece_bytes.len() as u32)?;
        let start = self.offset as usize;
        Ok(&piece_bytes[start..start + self.length as usize])
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.piece, self.offset, self.length)
    }
}

/// A concrete payload for a block address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block<T> {
    pub piece: PieceIndex,
    pub offset: u32,
    pub data: T,
}

impl<T: AsRef<[u8]>> Block<T> {
    /// Creates a block carrying `data` at `offset` within `piece`.
    pub fn new(piece: PieceIndex, offset: u32, data: T) -> Self {
        Self {
            piece,
            offset,
            data,
        }
    }

    /// Returns the address this payload would satisfy.
    pub fn index(&self) -> BlockIndex {
        BlockIndex::new(self.piece, self.offset, self.data.as_ref().len() as u32)
    }
}

/// Piece geometry of a torrent.
///
/// Knows the nominal piece length and the total content length so it can
/// answer the size of the short trailing piece and enumerate blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    piece_length: u32,
    total_length: u64,
    piece_count: u32,
}

impl PieceLayout {
    /// Creates a layout for `total_length` bytes split into `piece_length` pieces.
    pub fn new(piece_length: u32, total_length: u64) -> Self {
        let piece_count = if piece_length == 0 {
            0
        } else {
            total_length.div_ceil(piece_length as u64) as u32
        };

        Self {
            piece_length,
            total_length,
            piece_count,
        }
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Nominal piece length.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Total content length in bytes.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Size of a given piece, or zero if the index is out of range.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        if index.as_u32() >= self.piece_count {
            return 0;
        }

        let start = index.as_u32() as u64 * self.piece_length as u64;
        (self.total_length - start).min(self.piece_length as u64) as u32
    }

    /// Validates a block address against the size of its piece.
    ///
    /// # Errors
    /// - `TorrentError::InvalidBlock` - Piece out of range or block out of bounds
    pub fn validate_block(&self, block: &BlockIndex) -> Result<(), TorrentError> {
        if block.piece.as_u32() >= self.piece_count {
            return Err(TorrentError::InvalidBlock {
                block: *block,
                reason: format!("torrent has {} pieces", self.piece_count),
            });
        }
        block.validate(self.piece_size(block.piece))
    }

    /// Splits a piece into consecutive blocks of at most `block_size` bytes.
    pub fn blocks(&self, index: PieceIndex, block_size: u32) -> impl Iterator<Item = BlockIndex> {
        let piece_size = self.piece_size(index);
        let block_size = block_size.max(1);

        (0..piece_size.div_ceil(block_size)).map(move |n| {
            let offset = n * block_size;
            BlockIndex::new(index, offset, block_size.min(piece_size - offset))
        })
    }
}
