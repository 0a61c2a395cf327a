//! In-memory storage implementation for tests and seeding from memory

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::assembly::PieceAssembler;
use super::{PieceStorage, StorageError};
use crate::torrent::{Bitfield, Block, BlockIndex, InfoDictionary, PieceIndex};

/// Storage keeping verified pieces in a map.
pub struct MemoryStorage {
    assembler: PieceAssembler,
    pieces: Mutex<HashMap<PieceIndex, Bytes>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    /// Creates empty storage for `info`.
    pub fn new(info: Arc<InfoDictionary>) -> Self {
        Self {
            assembler: PieceAssembler::new(info),
            pieces: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates storage already holding the whole of `content`.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidBlock` - Content length differs from the torrent's
    /// - `StorageError::PieceHashMismatch` - A piece of `content` fails verification
    pub fn seeded(info: Arc<InfoDictionary>, content: Bytes) -> Result<Self, StorageError> {
        let layout = info.layout();
        if content.len() as u64 != layout.total_length() {
            return Err(StorageError::InvalidBlock {
                block: BlockIndex::new(PieceIndex::new(0), 0, content.len() as u32),
                reason: format!(
                    "content has {} bytes, torrent describes {}",
                    content.len(),
                    layout.total_length()
                ),
            });
        }

        let storage = Self::new(info);
        {
            let mut pieces = storage.pieces.lock();
            for index in (0..layout.piece_count()).map(PieceIndex::new) {
                let start = index.as_u32() as usize * layout.piece_length() as usize;
                let end = start + layout.piece_size(index) as usize;
                let piece_bytes = content.slice(start..end);
                if !storage.assembler.verify(index, &piece_bytes) {
                    return Err(StorageError::PieceHashMismatch { index });
                }
                pieces.insert(index, piece_bytes);
            }
        }
        Ok(storage)
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PieceStorage for MemoryStorage {
    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        self.ensure_open()?;
        self.pieces
            .lock()
            .get(&index)
            .cloned()
            .ok_or(StorageError::PieceNotFound { index })
    }

    async fn write_block(&self, block: Block<Bytes>) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let index = block.piece;
        if self.pieces.lock().contains_key(&index) {
            return Ok(false);
        }

        let Some(piece_bytes) = self.assembler.accept(&block)? else {
            return Ok(false);
        };
        self.pieces.lock().insert(index, piece_bytes);
        Ok(true)
    }

    fn total_pieces(&self) -> u32 {
        self.assembler.info().piece_count()
    }

    async fn verified_pieces(&self) -> Result<Bitfield, StorageError> {
        self.ensure_open()?;
        let mut bitfield = Bitfield::new(self.total_pieces());
        for index in self.pieces.lock().keys() {
            bitfield.set(*index);
        }
        Ok(bitfield)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        self.assembler.clear();
        Ok(())
    }
}
