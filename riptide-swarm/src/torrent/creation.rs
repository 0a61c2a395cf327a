//! Torrent creation from local content with piece splitting and hashing
//!
//! Produces the canonical bencoded info dictionary for a single-file torrent,
//! so a node can seed content and advertise it by info hash.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::bencode::BencodeValue;
use super::info::compute_info_hash;
use super::{CachedInfoDict, InfoDictionary, TorrentError, TorrentFile};

/// Standard BitTorrent piece size (256KB)
pub const DEFAULT_PIECE_SIZE: u32 = 262_144;

/// Torrent creator for converting local content to torrent format
pub struct TorrentCreator {
    piece_size: u32,
}

impl Default for TorrentCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl TorrentCreator {
    /// Creates torrent creator with default piece size (256KB)
    pub fn new() -> Self {
        Self {
            piece_size: DEFAULT_PIECE_SIZE,
        }
    }

    /// Creates torrent creator with custom piece size
    pub fn with_piece_size(piece_size: u32) -> Self {
        Self {
            piece_size: piece_size.max(1),
        }
    }

    /// Builds the info dictionary for `content` published under `name`.
    pub fn create(&self, name: &str, content: &[u8]) -> CachedInfoDict {
        let piece_hashes: Vec<[u8; 20]> = content
            .chunks(self.piece_size as usize)
            .map(|piece| {
                let mut hasher = Sha1::new();
                hasher.update(piece);
                hasher.finalize().into()
            })
            .collect();
        let pieces = piece_hashes.concat();

        let mut info = BTreeMap::new();
        info.insert(
            b"length".as_slice(),
            BencodeValue::Integer(content.len() as i64),
        );
        info.insert(b"name".as_slice(), BencodeValue::Bytes(name.as_bytes()));
        info.insert(
            b"piece length".as_slice(),
            BencodeValue::Integer(self.piece_size as i64),
        );
        info.insert(b"pieces".as_slice(), BencodeValue::Bytes(&pieces));

        let bytes = Bytes::from(BencodeValue::Dictionary(info).encode());
        let info = InfoDictionary {
            info_hash: compute_info_hash(&bytes),
            name: name.to_string(),
            piece_length: self.piece_size,
            piece_hashes,
            total_length: content.len() as u64,
            files: vec![TorrentFile {
                path: vec![name.to_string()],
                length: content.len() as u64,
            }],
        };
        CachedInfoDict::from_parts(info, bytes)
    }

    /// Reads a file and builds its info dictionary.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File read error or access denied
    /// - `TorrentError::InvalidMetadata` - Empty file or unusable file name
    pub async fn create_from_file(&self, file_path: &Path) -> Result<(CachedInfoDict, Bytes), TorrentError> {
        let content = tokio::fs::read(file_path).await?;
        if content.is_empty() {
            return Err(TorrentError::InvalidMetadata {
                reason: "Cannot create torrent from empty file".to_string(),
            });
        }

        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TorrentError::InvalidMetadata {
                reason: "Invalid filename".to_string(),
            })?;

        let cached = self.create(file_name, &content);
        Ok((cached, Bytes::from(content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceIndex;

    #[test]
    fn test_create_piece_hashes_match_chunks() {
        let content: Vec<u8> = (0..=255).collect();
        let cached = TorrentCreator::with_piece_size(100).create("bytes", &content);
        let info = cached.info();

        let mut hasher = Sha1::new();
        hasher.update(&content[200..]);
        let expected: [u8; 20] = hasher.finalize().into();

        assert_eq!(info.piece_count(), 3);
        assert_eq!(info.piece_hash(PieceIndex::new(2)), Some(&expected));
    }

    #[test]
    fn test_create_same_content_same_info_hash() {
        let first = TorrentCreator::with_piece_size(16).create("x", b"hello world");
        let second = TorrentCreator::with_piece_size(16).create("x", b"hello world");
        assert_eq!(first.info().info_hash, second.info().info_hash);
    }

    #[tokio::test]
    async fn test_create_from_file_empty_file_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let result = TorrentCreator::new().create_from_file(&path).await;
        assert!(matches!(result, Err(TorrentError::InvalidMetadata { .. })));
    }
}
