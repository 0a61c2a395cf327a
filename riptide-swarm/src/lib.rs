//! Riptide Swarm - BitTorrent peer exchange engine
//!
//! Manages live connections to the peers of a single torrent: membership
//! bookkeeping, per-peer protocol actors, block scheduling and the BEP 9
//! metadata exchange used when a download starts from an info hash alone.

pub mod config;
pub mod connection;
pub mod exchange;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

pub use config::{ReclaimPolicy, RiptideConfig};
pub use connection::{BoxedStream, Connector, PendingConnection, TcpConnector};
pub use exchange::PeerAddress;
pub use session::{ConnectionRecord, Session, SessionStats, TorrentSource};
pub use storage::{FileStorage, MemoryStorage, PieceStorage, StorageError, StorageProvider};
pub use torrent::{CachedInfoDict, InfoDictionary, InfoHash, PeerId, TorrentCreator, TorrentError};

/// Core errors that can bubble up from any Riptide subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum RiptideError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RiptideError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            RiptideError::Torrent(e) => match e {
                TorrentError::InvalidMetadata { reason } => {
                    format!("Invalid torrent metadata: {reason}")
                }
                TorrentError::PeerConnectionError { reason } => {
                    format!("Could not reach peer: {reason}")
                }
                TorrentError::SessionClosed => "Session was closed".to_string(),
                _ => "Transfer error occurred".to_string(),
            },
            RiptideError::Storage(StorageError::PieceHashMismatch { index }) => {
                format!("Local data does not match the torrent (piece {index})")
            }
            RiptideError::Storage(_) => "Storage error occurred".to_string(),
            RiptideError::Configuration { reason } => format!("Configuration error: {reason}"),
            RiptideError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            RiptideError::Configuration { .. }
                | RiptideError::Torrent(TorrentError::InvalidMetadata { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, RiptideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_invalid_metadata_is_user_error() {
        let error = RiptideError::from(TorrentError::InvalidMetadata {
            reason: "bad hex".to_string(),
        });
        assert!(error.is_user_error());
        assert_eq!(error.user_message(), "Invalid torrent metadata: bad hex");
    }

    #[test]
    fn test_user_message_storage_error_not_user_error() {
        let error = RiptideError::from(StorageError::Closed);
        assert!(!error.is_user_error());
        assert_eq!(error.user_message(), "Storage error occurred");
    }
}
