//! File-based storage implementation

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs;

use super::assembly::PieceAssembler;
use super::{PieceStorage, StorageError};
use crate::torrent::{Bitfield, Block, InfoDictionary, PieceIndex};

/// File system-based storage implementation.
///
/// Stores verified pieces as individual files in a directory named after
/// the torrent's info hash. Blocks are assembled in memory and only reach
/// disk once their piece passes verification, so every piece file on disk
/// is complete.
pub struct FileStorage {
    torrent_dir: PathBuf,
    assembler: PieceAssembler,
    verified: Mutex<Bitfield>,
    closed: AtomicBool,
}

impl FileStorage {
    /// Opens storage for `info` under `download_dir`, resuming verified pieces.
    ///
    /// Existing piece files that fail verification are ignored and will be
    /// downloaded again.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Torrent directory could not be created or read
    pub async fn open(download_dir: PathBuf, info: Arc<InfoDictionary>) -> Result<Self, StorageError> {
        let torrent_dir = download_dir.join(info.info_hash.to_string());
        fs::create_dir_all(&torrent_dir).await?;

        let assembler = PieceAssembler::new(Arc::clone(&info));
        let mut verified = Bitfield::new(info.piece_count());

        for index in (0..info.piece_count()).map(PieceIndex::new) {
            let path = torrent_dir.join(format!("piece_{}", index.as_u32()));
            match fs::read(&path).await {
                Ok(piece_bytes) if assembler.verify(index, &piece_bytes) => verified.set(index),
                Ok(_) => {
                    tracing::warn!(piece = index.as_u32(), "Discarding unverifiable piece file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(
            dir = %torrent_dir.display(),
            verified = verified.count(),
            total = info.piece_count(),
            "Opened file storage"
        );

        Ok(Self {
            torrent_dir,
            assembler,
            verified: Mutex::new(verified),
            closed: AtomicBool::new(false),
        })
    }

    fn piece_path(&self, index: PieceIndex) -> PathBuf {
        self.torrent_dir.join(format!("piece_{}", index.as_u32()))
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PieceStorage for FileStorage {
    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        self.ensure_open()?;
        if !self.verified.lock().has(index) {
            return Err(StorageError::PieceNotFound { index });
        }

        match fs::read(self.piece_path(index)).await {
            Ok(piece_bytes) => Ok(Bytes::from(piece_bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.verified.lock().clear(index);
                Err(StorageError::PieceNotFound { index })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_block(&self, block: Block<Bytes>) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let index = block.piece;
        if self.verified.lock().has(index) {
            return Ok(false);
        }

        let Some(piece_bytes) = self.assembler.accept(&block)? else {
            return Ok(false);
        };

        fs::write(self.piece_path(index), &piece_bytes).await?;
        self.verified.lock().set(index);
        tracing::debug!(piece = index.as_u32(), "Piece written to disk");
        Ok(true)
    }

    fn total_pieces(&self) -> u32 {
        self.assembler.info().piece_count()
    }

    async fn verified_pieces(&self) -> Result<Bitfield, StorageError> {
        self.ensure_open()?;
        Ok(self.verified.lock().clone())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        self.assembler.clear();
        Ok(())
    }
}
