//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Largest frame accepted from a peer (2 MiB).
pub const MAX_MESSAGE_LENGTH: u32 = 2 * 1024 * 1024;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => put_signal(&mut buf, 0),
            PeerMessage::Unchoke => put_signal(&mut buf, 1),
            PeerMessage::Interested => put_signal(&mut buf, 2),
            PeerMessage::NotInterested => put_signal(&mut buf, 3),
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => put_block_address(&mut buf, 6, *piece_index, *offset, *length),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => put_block_address(&mut buf, 8, *piece_index, *offset, *length),
            PeerMessage::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            PeerMessage::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(20);
                buf.put_u8(*id);
                buf.extend_from_slice(payload);
            }
        }

        buf
    }

    /// Deserializes peer message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Truncated frame, bad length or unknown id
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(protocol_error("Message too short"));
        }

        let mut buf = data;
        let length = buf.get_u32();

        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        if data.len() < 4 + length as usize {
            return Err(protocol_error("Incomplete message"));
        }

        let message_id = buf.get_u8();

        match message_id {
            0..=3 => {
                if length != 1 {
                    return Err(protocol_error("Invalid signal message length"));
                }
                Ok(match message_id {
                    0 => PeerMessage::Choke,
                    1 => PeerMessage::Unchoke,
                    2 => PeerMessage::Interested,
                    _ => PeerMessage::NotInterested,
                })
            }
            4 => {
                if length != 5 {
                    return Err(protocol_error("Invalid Have message length"));
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                Ok(PeerMessage::Have { piece_index })
            }
            5 => {
                let bitfield_len = length - 1;
                let bitfield = Bytes::copy_from_slice(&buf[..bitfield_len as usize]);
                Ok(PeerMessage::Bitfield { bitfield })
            }
            6 | 8 => {
                if length != 13 {
                    return Err(protocol_error("Invalid Request/Cancel message length"));
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                if message_id == 6 {
                    Ok(PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    })
                } else {
                    Ok(PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    })
                }
            }
            7 => {
                if length < 9 {
                    return Err(protocol_error("Invalid Piece message length"));
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let data_len = length - 9;
                let data = Bytes::copy_from_slice(&buf[..data_len as usize]);
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data,
                })
            }
            9 => {
                if length != 3 {
                    return Err(protocol_error("Invalid Port message length"));
                }
                let port = buf.get_u16();
                Ok(PeerMessage::Port { port })
            }
            20 => {
                if length < 2 {
                    return Err(protocol_error("Invalid Extended message length"));
                }
                let id = buf.get_u8();
                let payload = Bytes::copy_from_slice(&buf[..length as usize - 2]);
                Ok(PeerMessage::Extended { id, payload })
            }
            _ => Err(TorrentError::ProtocolError {
                message: format!("Unknown message ID: {message_id}"),
            }),
        }
    }

    /// Reads one length-prefixed message from `reader`.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Stream closed or read failed
    /// - `TorrentError::ProtocolError` - Oversized frame or undecodable message
    pub async fn read_message<R>(reader: &mut R) -> Result<PeerMessage, TorrentError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut length_buf = [0u8; 4];
        reader
            .read_exact(&mut length_buf)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to read message length: {e}"),
            })?;

        let length = u32::from_be_bytes(length_buf);
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if length > MAX_MESSAGE_LENGTH {
            return Err(TorrentError::ProtocolError {
                message: format!("Message of {length} bytes exceeds limit"),
            });
        }

        let mut frame = vec![0u8; 4 + length as usize];
        frame[..4].copy_from_slice(&length_buf);
        reader
            .read_exact(&mut frame[4..])
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to read message payload: {e}"),
            })?;

        Self::deserialize_message(&frame)
    }

    /// Writes one message to `writer` and flushes it.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write or flush failed
    pub async fn write_message<W>(writer: &mut W, message: &PeerMessage) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = Self::serialize_message(message);
        writer
            .write_all(&frame)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to send message: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to flush message: {e}"),
            })
    }
}

fn put_signal(buf: &mut Vec<u8>, id: u8) {
    buf.put_u32(1);
    buf.put_u8(id);
}

fn put_block_address(buf: &mut Vec<u8>, id: u8, piece: PieceIndex, offset: u32, length: u32) {
    buf.put_u32(13);
    buf.put_u8(id);
    buf.put_u32(piece.as_u32());
    buf.put_u32(offset);
    buf.put_u32(length);
}

fn protocol_error(message: &str) -> TorrentError {
    TorrentError::ProtocolError {
        message: message.to_string(),
    }
}
