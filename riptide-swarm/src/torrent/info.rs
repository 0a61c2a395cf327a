//! Info dictionary parsing and the cached metadata shared by all connections

use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::bencode::{self, BencodeDict};
use super::{InfoHash, PieceIndex, PieceLayout, TorrentError};

/// Structural description of a torrent: layout, piece hashes and files.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoDictionary {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
}

/// Individual file within a torrent.
///
/// Represents a single file entry in multi-file torrents with its
/// relative path components and byte length.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

impl InfoDictionary {
    /// Parses raw bencoded info dictionary bytes.
    ///
    /// The info hash is the SHA-1 of exactly these bytes. When `expected` is
    /// given the computed hash must match it.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Malformed bencode, missing fields,
    ///   inconsistent piece count or info hash mismatch
    pub fn parse(info_bytes: &[u8], expected: Option<InfoHash>) -> Result<Self, TorrentError> {
        let info_hash = compute_info_hash(info_bytes);
        if let Some(expected) = expected
            && expected != info_hash
        {
            return Err(TorrentError::InvalidMetadata {
                reason: format!("Info hash mismatch: expected {expected}, got {info_hash}"),
            });
        }

        let dict = bencode::parse_dictionary(info_bytes)?;
        let name = required_string(&dict, b"name")?;

        let piece_length = bencode::integer(&dict, b"piece length")
            .filter(|length| *length > 0 && *length <= u32::MAX as i64)
            .ok_or_else(|| invalid("Missing or invalid 'piece length'"))?
            as u32;

        let pieces_bytes =
            bencode::bytes(&dict, b"pieces").ok_or_else(|| invalid("Missing 'pieces' field"))?;
        if !pieces_bytes.len().is_multiple_of(20) {
            return Err(invalid("Invalid pieces length"));
        }

        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length) = match bencode::integer(&dict, b"length") {
            Some(length) if length >= 0 => {
                let files = vec![TorrentFile {
                    path: vec![name.clone()],
                    length: length as u64,
                }];
                (files, length as u64)
            }
            _ => match dict.get(b"files".as_slice()) {
                Some(bencode_rs::Value::List(files_list)) => extract_files(files_list)?,
                _ => return Err(invalid("Missing 'files' or 'length' field")),
            },
        };

        let layout = PieceLayout::new(piece_length, total_length);
        if layout.piece_count() as usize != piece_hashes.len() {
            return Err(TorrentError::InvalidMetadata {
                reason: format!(
                    "{} piece hashes for {} pieces",
                    piece_hashes.len(),
                    layout.piece_count()
                ),
            });
        }

        Ok(Self {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
        })
    }

    /// Piece geometry of this torrent.
    pub fn layout(&self) -> PieceLayout {
        PieceLayout::new(self.piece_length, self.total_length)
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Expected SHA-1 of a piece, if the index is in range.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index.as_u32() as usize)
    }
}

/// Parsed info dictionary together with the exact bytes it was parsed from.
///
/// The bytes are what peers receive through the metadata extension, so they
/// are kept verbatim rather than re-encoded.
#[derive(Debug, Clone)]
pub struct CachedInfoDict {
    info: Arc<InfoDictionary>,
    bytes: Bytes,
}

impl CachedInfoDict {
    /// Parses and caches raw info dictionary bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Bytes do not parse or hash mismatch
    pub fn from_bytes(bytes: Bytes, expected: Option<InfoHash>) -> Result<Self, TorrentError> {
        let info = InfoDictionary::parse(&bytes, expected)?;
        Ok(Self {
            info: Arc::new(info),
            bytes,
        })
    }

    /// Pairs an already-built dictionary with the bytes it was encoded to.
    pub(crate) fn from_parts(info: InfoDictionary, bytes: Bytes) -> Self {
        Self {
            info: Arc::new(info),
            bytes,
        }
    }

    /// Extracts the info dictionary from a complete `.torrent` file.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - File is not a dictionary with an `info` entry
    pub fn from_torrent_file(torrent_bytes: &[u8]) -> Result<Self, TorrentError> {
        let dict = bencode::parse_dictionary(torrent_bytes)?;
        if !dict.contains_key(b"info".as_slice()) {
            return Err(invalid("Missing 'info' field"));
        }

        let info_start = torrent_bytes
            .windows(b"4:info".len())
            .position(|window| window == b"4:info")
            .ok_or_else(|| invalid("Could not find info dictionary in data"))?
            + b"4:info".len();
        let info_end = info_start + bencode::find_dictionary_end(&torrent_bytes[info_start..])?;

        Self::from_bytes(
            Bytes::copy_from_slice(&torrent_bytes[info_start..info_end]),
            None,
        )
    }

    /// Parsed dictionary.
    pub fn info(&self) -> &Arc<InfoDictionary> {
        &self.info
    }

    /// Serialized dictionary, exactly as hashed.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

/// SHA-1 over raw info dictionary bytes.
pub fn compute_info_hash(info_bytes: &[u8]) -> InfoHash {
    let mut hasher = Sha1::new();
    hasher.update(info_bytes);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&hasher.finalize());
    InfoHash::new(hash)
}

fn invalid(reason: &str) -> TorrentError {
    TorrentError::InvalidMetadata {
        reason: reason.to_string(),
    }
}

fn required_string(dict: &BencodeDict<'_>, key: &[u8]) -> Result<String, TorrentError> {
    let bytes = bencode::bytes(dict, key).ok_or_else(|| TorrentError::InvalidMetadata {
        reason: format!("Missing field: {:?}", String::from_utf8_lossy(key)),
    })?;
    String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidMetadata {
        reason: format!("Invalid UTF-8 in field: {:?}", String::from_utf8_lossy(key)),
    })
}

fn extract_files(files_list: &[bencode_rs::Value<'_>]) -> Result<(Vec<TorrentFile>, u64), TorrentError> {
    let mut files = Vec::new();
    let mut total_length = 0u64;

    for file_value in files_list {
        let bencode_rs::Value::Dictionary(file_dict) = file_value else {
            return Err(invalid("Invalid file entry type"));
        };

        let length = bencode::integer(file_dict, b"length")
            .filter(|length| *length >= 0)
            .ok_or_else(|| invalid("Missing or invalid file length"))? as u64;
        total_length += length;

        let Some(bencode_rs::Value::List(path_list)) = file_dict.get(b"path".as_slice()) else {
            return Err(invalid("Missing or invalid path in file"));
        };

        let mut path = Vec::with_capacity(path_list.len());
        for component in path_list {
            let bencode_rs::Value::Bytes(component) = component else {
                return Err(invalid("Invalid path component type"));
            };
            let component = String::from_utf8(component.to_vec())
                .map_err(|_| invalid("Invalid UTF-8 in file path"))?;
            path.push(component);
        }

        files.push(TorrentFile { path, length });
    }

    Ok((files, total_length))
}
