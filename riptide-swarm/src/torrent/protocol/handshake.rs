//! BitTorrent handshake serialization, deserialization and exchange

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Length of a standard handshake: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LENGTH: usize = 68;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LENGTH);
        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Invalid handshake format or length
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        if data.len() < 49 {
            return Err(TorrentError::ProtocolError {
                message: "Handshake too short".to_string(),
            });
        }

        let protocol_len = data[0] as usize;
        if data.len() < 1 + protocol_len + 8 + 20 + 20 {
            return Err(TorrentError::ProtocolError {
                message: "Invalid handshake length".to_string(),
            });
        }

        let protocol = String::from_utf8_lossy(&data[1..1 + protocol_len]).to_string();
        let mut offset = 1 + protocol_len;

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[offset..offset + 8]);
        offset += 8;

        let mut info_hash_bytes = [0u8; 20];
        info_hash_bytes.copy_from_slice(&data[offset..offset + 20]);
        offset += 20;

        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes.copy_from_slice(&data[offset..offset + 20]);

        Ok(PeerHandshake {
            protocol,
            reserved,
            info_hash: InfoHash::new(info_hash_bytes),
            peer_id: PeerId::new(peer_id_bytes),
        })
    }

    /// Writes our handshake to `writer`.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn write_handshake<W>(writer: &mut W, handshake: &PeerHandshake) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let data = Self::serialize_handshake(handshake);
        writer
            .write_all(&data)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to send handshake: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to flush handshake: {e}"),
            })
    }

    /// Reads a standard-length handshake from `reader`.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Stream closed before a full handshake
    /// - `TorrentError::ProtocolError` - Malformed handshake
    pub async fn read_handshake<R>(reader: &mut R) -> Result<PeerHandshake, TorrentError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = [0u8; HANDSHAKE_LENGTH];
        reader
            .read_exact(&mut buffer)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to read handshake: {e}"),
            })?;
        Self::deserialize_handshake(&buffer)
    }
}
