//! In-progress piece assembly and verification shared by storage backends

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::StorageError;
use crate::torrent::{Block, InfoDictionary, PieceIndex, TorrentError};

/// Collects blocks until a piece is whole, then verifies it.
///
/// Only bookkeeping happens under the lock; hashing runs after the finished
/// buffer has been taken out of the map.
pub struct PieceAssembler {
    info: Arc<InfoDictionary>,
    partial: Mutex<HashMap<PieceIndex, PartialPiece>>,
}

struct PartialPiece {
    buffer: Vec<u8>,
    ranges: BTreeMap<u32, u32>,
}

impl PartialPiece {
    fn new(size: u32) -> Self {
        Self {
            buffer: vec![0u8; size as usize],
            ranges: BTreeMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        let mut covered = 0u32;
        for (&offset, &end) in &self.ranges {
            if offset > covered {
                return false;
            }
            covered = covered.max(end);
        }
        covered as usize == self.buffer.len()
    }
}

impl PieceAssembler {
    /// Creates an assembler for the pieces described by `info`.
    pub fn new(info: Arc<InfoDictionary>) -> Self {
        Self {
            info,
            partial: Mutex::new(HashMap::new()),
        }
    }

    /// Torrent this assembler verifies against.
    pub fn info(&self) -> &Arc<InfoDictionary> {
        &self.info
    }

    /// Adds a block. Returns the verified piece once its last byte arrives.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidBlock` - Block outside the piece bounds
    /// - `StorageError::PieceHashMismatch` - Completed piece failed SHA-1 check;
    ///   the partial piece is discarded
    pub fn accept(&self, block: &Block<Bytes>) -> Result<Option<Bytes>, StorageError> {
        let index = block.index();
        self.info
            .layout()
            .validate_block(&index)
            .map_err(|e| match e {
                TorrentError::InvalidBlock { block, reason } => {
                    StorageError::InvalidBlock { block, reason }
                }
                other => StorageError::InvalidBlock {
                    block: index,
                    reason: other.to_string(),
                },
            })?;

        let finished = {
            let mut partial = self.partial.lock();
            let piece_size = self.info.layout().piece_size(block.piece);
            let piece = partial
                .entry(block.piece)
                .or_insert_with(|| PartialPiece::new(piece_size));

            let start = block.offset as usize;
            piece.buffer[start..start + block.data.len()].copy_from_slice(&block.data);
            let end = block.offset + index.length;
            let previous = piece.ranges.get(&block.offset).copied().unwrap_or(0);
            piece.ranges.insert(block.offset, previous.max(end));

            if piece.is_complete() {
                partial.remove(&block.piece).map(|piece| piece.buffer)
            } else {
                None
            }
        };

        let Some(buffer) = finished else {
            return Ok(None);
        };

        if !self.verify(block.piece, &buffer) {
            return Err(StorageError::PieceHashMismatch { index: block.piece });
        }
        Ok(Some(Bytes::from(buffer)))
    }

    /// Checks piece bytes against the expected hash.
    pub fn verify(&self, index: PieceIndex, piece_bytes: &[u8]) -> bool {
        let Some(expected) = self.info.piece_hash(index) else {
            return false;
        };
        if piece_bytes.len() as u32 != self.info.layout().piece_size(index) {
            return false;
        }

        let mut hasher = Sha1::new();
        hasher.update(piece_bytes);
        hasher.finalize().as_slice() == expected
    }

    /// Drops every partially assembled piece.
    pub fn clear(&self) {
        self.partial.lock().clear();
    }
}
