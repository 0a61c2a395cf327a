//! Extension protocol (BEP 10) handshake and ut_metadata (BEP 9) messages
//!
//! Both travel inside `PeerMessage::Extended`. The extension handshake always
//! uses id 0; metadata messages use whatever id the receiver advertised for
//! `ut_metadata` in its own handshake.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::torrent::TorrentError;
use crate::torrent::bencode::{self, BencodeValue};

/// Extended message id reserved for the extension handshake.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;
/// Id under which this client accepts `ut_metadata` messages.
pub const LOCAL_UT_METADATA_ID: u8 = 1;
/// Extension name for metadata exchange.
pub const UT_METADATA: &str = "ut_metadata";
/// Metadata is exchanged in pieces of this size; only the last may be shorter.
pub const METADATA_PIECE_SIZE: u32 = 16 * 1024;

/// Payload of the BEP 10 handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtensionHandshake {
    /// Extension name to the id the sender wants to receive it under
    pub extensions: HashMap<String, u8>,
    /// Size of the info dictionary, when the sender has it
    pub metadata_size: Option<u64>,
    /// Free-form client name and version
    pub client: Option<String>,
}

impl ExtensionHandshake {
    /// Handshake advertising `ut_metadata` under the local id.
    pub fn local(metadata_size: Option<u64>, client: &str) -> Self {
        let mut extensions = HashMap::new();
        extensions.insert(UT_METADATA.to_string(), LOCAL_UT_METADATA_ID);
        Self {
            extensions,
            metadata_size,
            client: Some(client.to_string()),
        }
    }

    /// Id the remote wants `ut_metadata` messages sent with. Id 0 disables it.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extensions
            .get(UT_METADATA)
            .copied()
            .filter(|id| *id != 0)
    }

    /// Encodes as a bencoded dictionary.
    pub fn encode(&self) -> Bytes {
        let m: BTreeMap<&[u8], BencodeValue<'_>> = self
            .extensions
            .iter()
            .map(|(name, id)| (name.as_bytes(), BencodeValue::Integer(*id as i64)))
            .collect();

        let mut dict = BTreeMap::new();
        dict.insert(b"m".as_slice(), BencodeValue::Dictionary(m));
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".as_slice(), BencodeValue::Integer(size as i64));
        }
        if let Some(client) = &self.client {
            dict.insert(b"v".as_slice(), BencodeValue::Bytes(client.as_bytes()));
        }

        Bytes::from(BencodeValue::Dictionary(dict).encode())
    }

    /// Decodes a handshake payload. Unknown keys are ignored.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Payload is not a bencoded dictionary
    pub fn decode(payload: &[u8]) -> Result<Self, TorrentError> {
        let dict = bencode::parse_dictionary(payload).map_err(malformed)?;

        let mut extensions = HashMap::new();
        if let Some(bencode_rs::Value::Dictionary(m)) = dict.get(b"m".as_slice()) {
            for (name, value) in m {
                if let bencode_rs::Value::Integer(id) = value
                    && let Ok(id) = u8::try_from(*id)
                {
                    extensions.insert(String::from_utf8_lossy(name).into_owned(), id);
                }
            }
        }

        let metadata_size = bencode::integer(&dict, b"metadata_size")
            .and_then(|size| u64::try_from(size).ok());
        let client = bencode::bytes(&dict, b"v").map(|v| String::from_utf8_lossy(v).into_owned());

        Ok(Self {
            extensions,
            metadata_size,
            client,
        })
    }
}

/// A `ut_metadata` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    /// Ask for one metadata piece
    Request { piece: u32 },
    /// Deliver one metadata piece
    Data {
        piece: u32,
        total_size: u64,
        data: Bytes,
    },
    /// Sender will not serve the piece
    Reject { piece: u32 },
}

impl MetadataMessage {
    /// Encodes as a bencoded dictionary, followed by raw bytes for `Data`.
    pub fn encode(&self) -> Bytes {
        let (msg_type, piece) = match self {
            MetadataMessage::Request { piece } => (0, *piece),
            MetadataMessage::Data { piece, .. } => (1, *piece),
            MetadataMessage::Reject { piece } => (2, *piece),
        };

        let mut dict = BTreeMap::new();
        dict.insert(b"msg_type".as_slice(), BencodeValue::Integer(msg_type));
        dict.insert(b"piece".as_slice(), BencodeValue::Integer(piece as i64));
        if let MetadataMessage::Data { total_size, .. } = self {
            dict.insert(b"total_size".as_slice(), BencodeValue::Integer(*total_size as i64));
        }

        let mut buf = BencodeValue::Dictionary(dict).encode();
        if let MetadataMessage::Data { data, .. } = self {
            buf.extend_from_slice(data);
        }
        Bytes::from(buf)
    }

    /// Decodes a `ut_metadata` payload.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Malformed dictionary, missing fields or unknown type
    pub fn decode(payload: &Bytes) -> Result<Self, TorrentError> {
        let end = bencode::find_dictionary_end(payload).map_err(malformed)?;
        let dict = bencode::parse_dictionary(&payload[..end]).map_err(malformed)?;

        let piece = bencode::integer(&dict, b"piece")
            .and_then(|piece| u32::try_from(piece).ok())
            .ok_or_else(|| missing("piece"))?;
        let msg_type = bencode::integer(&dict, b"msg_type").ok_or_else(|| missing("msg_type"))?;

        match msg_type {
            0 => Ok(MetadataMessage::Request { piece }),
            1 => {
                let total_size = bencode::integer(&dict, b"total_size")
                    .and_then(|size| u64::try_from(size).ok())
                    .ok_or_else(|| missing("total_size"))?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: payload.slice(end..),
                })
            }
            2 => Ok(MetadataMessage::Reject { piece }),
            other => Err(TorrentError::ProtocolError {
                message: format!("Unknown ut_metadata msg_type {other}"),
            }),
        }
    }
}

/// Number of metadata pieces for an info dictionary of `total_size` bytes.
pub fn metadata_piece_count(total_size: u64) -> u32 {
    total_size.div_ceil(METADATA_PIECE_SIZE as u64) as u32
}

fn malformed(error: TorrentError) -> TorrentError {
    TorrentError::ProtocolError {
        message: format!("Malformed extension message: {error}"),
    }
}

fn missing(field: &str) -> TorrentError {
    TorrentError::ProtocolError {
        message: format!("ut_metadata message missing '{field}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_handshake_decode_reads_metadata_id() {
        let encoded = ExtensionHandshake::local(Some(31_235), "riptide/0.1").encode();
        let decoded = ExtensionHandshake::decode(&encoded).unwrap();
        assert_eq!(decoded.ut_metadata_id(), Some(LOCAL_UT_METADATA_ID));
        assert_eq!(decoded.metadata_size, Some(31_235));
        assert_eq!(decoded.client.as_deref(), Some("riptide/0.1"));
    }

    #[test]
    fn test_extension_handshake_zero_id_disables_extension() {
        let decoded = ExtensionHandshake::decode(b"d1:md11:ut_metadatai0eee").unwrap();
        assert_eq!(decoded.ut_metadata_id(), None);
        assert_eq!(decoded.metadata_size, None);
    }

    #[test]
    fn test_metadata_data_trailing_bytes_preserved() {
        let message = MetadataMessage::Data {
            piece: 2,
            total_size: 40_000,
            data: Bytes::from_static(b"d4:infoe"),
        };
        let encoded = message.encode();
        assert!(encoded.starts_with(b"d8:msg_typei1e5:piecei2e10:total_sizei40000ee"));
        assert_eq!(MetadataMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_metadata_decode_unknown_type_rejected() {
        let payload = Bytes::from_static(b"d8:msg_typei7e5:piecei0ee");
        assert!(matches!(
            MetadataMessage::decode(&payload),
            Err(TorrentError::ProtocolError { .. })
        ));
    }

    #[test]
    fn test_metadata_decode_garbage_rejected() {
        let payload = Bytes::from_static(b"not bencode");
        assert!(MetadataMessage::decode(&payload).is_err());
    }

    #[test]
    fn test_metadata_piece_count_rounds_up() {
        assert_eq!(metadata_piece_count(0), 0);
        assert_eq!(metadata_piece_count(16 * 1024), 1);
        assert_eq!(metadata_piece_count(16 * 1024 + 1), 2);
    }
}
