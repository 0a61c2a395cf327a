//! Torrent identity, piece model and BitTorrent wire protocol

pub mod bencode;
pub mod bitfield;
pub mod block;
pub mod creation;
pub mod info;
pub mod protocol;

use std::fmt;
use std::str::FromStr;

pub use bitfield::Bitfield;
pub use block::{Block, BlockIndex, PieceLayout};
pub use creation::TorrentCreator;
pub use info::{CachedInfoDict, InfoDictionary, TorrentFile};
pub use protocol::{PeerHandshake, PeerId, PeerMessage};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    fn from_str(hex_hash: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(hex_hash).map_err(|e| TorrentError::InvalidMetadata {
            reason: format!("Invalid info hash hex: {e}"),
        })?;
        let hash: [u8; 20] =
            decoded
                .try_into()
                .map_err(|_| TorrentError::InvalidMetadata {
                    reason: "Info hash must be 20 bytes".to_string(),
                })?;
        Ok(Self(hash))
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during piece and metadata exchange.
///
/// Protocol violations and storage failures are fatal to the connection that
/// triggered them; the session itself keeps running.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Unsolicited block {block} from {peer}")]
    UnsolicitedBlock {
        peer: std::net::SocketAddr,
        block: BlockIndex,
    },

    #[error("Piece {index} failed verification")]
    CorruptedPiece { index: PieceIndex },

    #[error("Invalid block {block}: {reason}")]
    InvalidBlock { block: BlockIndex, reason: String },

    #[error("Invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Session closed")]
    SessionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
