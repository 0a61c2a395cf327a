//! Test fixtures for storage and exchange testing.
//!
//! Builds deterministic synthetic torrents and temporary download
//! directories for consistent testing across modules.

use std::sync::Arc;

use bytes::Bytes;

use crate::torrent::{CachedInfoDict, InfoDictionary, TorrentCreator};

/// Synthetic torrent together with the content it describes.
#[derive(Debug, Clone)]
pub struct TestTorrent {
    pub cached: CachedInfoDict,
    pub content: Bytes,
}

impl TestTorrent {
    /// Parsed info dictionary.
    pub fn info(&self) -> &Arc<InfoDictionary> {
        self.cached.info()
    }
}

/// Creates a torrent over `total_length` bytes of patterned content.
///
/// Bytes vary with position so that swapped or misplaced blocks fail
/// verification.
pub fn create_test_torrent(piece_length: u32, total_length: usize) -> TestTorrent {
    let content: Bytes = (0..total_length)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
        .collect::<Vec<u8>>()
        .into();
    let cached = TorrentCreator::with_piece_size(piece_length).create("fixture.bin", &content);
    TestTorrent { cached, content }
}

/// Creates temporary directory for test downloads.
///
/// # Panics
///
/// Panics if temporary directory creation fails.
/// This is acceptable in test fixtures where failures indicate environment issues.
pub fn create_temp_download_dir() -> (tempfile::TempDir, std::path::PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let downloads_dir = temp_dir.path().join("downloads");
    std::fs::create_dir_all(&downloads_dir).unwrap();
    (temp_dir, downloads_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_torrent_deterministic() {
        let first = create_test_torrent(16, 100);
        let second = create_test_torrent(16, 100);
        assert_eq!(first.info().info_hash, second.info().info_hash);
        assert_eq!(first.info().piece_count(), 7);
    }

    #[test]
    fn test_temp_download_dir_exists() {
        let (_temp_dir, downloads) = create_temp_download_dir();
        assert!(downloads.is_dir());
    }
}
