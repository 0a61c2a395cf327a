//! Storage layer for torrent piece data.
//!
//! Defines the block-level storage contract used by the exchange engine and
//! file-backed and in-memory implementations. Storage owns piece assembly and
//! SHA-1 verification; callers only learn whether a write completed a piece.

pub mod assembly;
pub mod file_storage;
pub mod memory_storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
pub use file_storage::FileStorage;
pub use memory_storage::MemoryStorage;

use crate::torrent::{Bitfield, Block, BlockIndex, InfoDictionary, PieceIndex};

/// Block-level storage for one torrent.
///
/// Shared by every connection of a session; implementations must accept
/// concurrent reads and writes to different pieces.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    /// Loads a complete, verified piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceNotFound` - Piece not yet downloaded and verified
    /// - `StorageError::Closed` - Storage was closed
    /// - `StorageError::Io` - Backend read failed
    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError>;

    /// Writes a block and reports whether its piece is now complete and verified.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidBlock` - Block outside the piece bounds
    /// - `StorageError::PieceHashMismatch` - Piece assembled but failed verification
    /// - `StorageError::Closed` - Storage was closed
    /// - `StorageError::Io` - Backend write failed
    async fn write_block(&self, block: Block<Bytes>) -> Result<bool, StorageError>;

    /// Number of pieces in the torrent.
    fn total_pieces(&self) -> u32;

    /// Pieces already present and verified, used to resume.
    ///
    /// # Errors
    ///
    /// - `StorageError::Closed` - Storage was closed
    async fn verified_pieces(&self) -> Result<Bitfield, StorageError>;

    /// Releases the storage. Later operations fail with `Closed`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Backend failed to flush
    async fn close(&self) -> Result<(), StorageError>;
}

/// Opens storage once a torrent's metadata is known.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Opens (or resumes) storage for `info`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Backend could not be prepared
    /// - `StorageError::PieceHashMismatch` - Seed content does not match the torrent
    async fn open(&self, info: &Arc<InfoDictionary>) -> Result<Arc<dyn PieceStorage>, StorageError>;
}

/// Provider creating `FileStorage` under a download directory.
#[derive(Debug, Clone)]
pub struct FileStorageProvider {
    download_dir: PathBuf,
}

impl FileStorageProvider {
    /// Creates provider rooted at `download_dir`.
    pub fn new(download_dir: PathBuf) -> Self {
        Self { download_dir }
    }
}

#[async_trait]
impl StorageProvider for FileStorageProvider {
    async fn open(&self, info: &Arc<InfoDictionary>) -> Result<Arc<dyn PieceStorage>, StorageError> {
        let storage = FileStorage::open(self.download_dir.clone(), Arc::clone(info)).await?;
        Ok(Arc::new(storage))
    }
}

/// Provider creating `MemoryStorage`, optionally pre-filled with content.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageProvider {
    content: Option<Bytes>,
}

impl MemoryStorageProvider {
    /// Provider for an empty download.
    pub fn empty() -> Self {
        Self { content: None }
    }

    /// Provider whose storage already holds the complete `content`.
    pub fn seeded(content: Bytes) -> Self {
        Self {
            content: Some(content),
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn open(&self, info: &Arc<InfoDictionary>) -> Result<Arc<dyn PieceStorage>, StorageError> {
        let storage = match &self.content {
            Some(content) => MemoryStorage::seeded(Arc::clone(info), content.clone())?,
            None => MemoryStorage::new(Arc::clone(info)),
        };
        Ok(Arc::new(storage))
    }
}

/// Errors that occur during storage operations.
///
/// Covers bounds violations, verification failures and backend I/O during
/// piece storage and retrieval.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Block does not fit inside its piece
    #[error("Invalid block {block}: {reason}")]
    InvalidBlock {
        /// Offending block address
        block: BlockIndex,
        /// Why the block was rejected
        reason: String,
    },

    /// Piece was fully assembled but its SHA-1 did not match
    #[error("Piece {index} failed hash verification")]
    PieceHashMismatch {
        /// Index of the corrupted piece
        index: PieceIndex,
    },

    /// Requested piece has not been downloaded yet
    #[error("Piece {index} not found")]
    PieceNotFound {
        /// Index of the piece that was not found
        index: PieceIndex,
    },

    /// Storage was closed by its session
    #[error("Storage closed")]
    Closed,

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
