//! Connection actor: performs the I/O and session calls `dispatch` asks for.
//!
//! Each established peer gets one actor task plus a reader and a writer
//! task. The reader decodes frames into a bounded channel, the writer drains
//! the outbound queue, and the actor selects over incoming messages, the
//! session broadcast stream and, until metadata arrives, both the session
//! metadata and notices of metadata pieces freed by other peers.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::dispatch::{self, ConnectionState, Effect, LocalView};
use super::outbound::OutboundQueue;
use super::transport::BoxedStream;
use crate::exchange::PeerAddress;
use crate::session::Session;
use crate::storage::StorageError;
use crate::torrent::protocol::extension::METADATA_PIECE_SIZE;
use crate::torrent::protocol::{MessageCodec, MetadataMessage};
use crate::torrent::{Block, BlockIndex, CachedInfoDict, PeerMessage, TorrentError};

type Incoming = Result<PeerMessage, TorrentError>;

/// Aborts the helper tasks when the actor exits by any path.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Runs the conversation with an established peer until it ends.
///
/// # Errors
///
/// - `TorrentError::PeerConnectionError` - Stream closed or failed
/// - `TorrentError::ProtocolError` - Remote violated the protocol
/// - `TorrentError::UnsolicitedBlock` - Remote sent data that was not requested
/// - `TorrentError::CorruptedPiece` - Piece from this peer failed verification
/// - `TorrentError::Storage` - Storage failed while serving or storing
pub(crate) async fn run(
    session: Arc<Session>,
    address: PeerAddress,
    supports_extensions: bool,
    stream: BoxedStream,
) -> Result<(), TorrentError> {
    let mut broadcasts = session.subscribe();
    let mut freed_metadata = session.watch_freed_metadata();

    let (reader, writer) = tokio::io::split(stream);
    let outbound = Arc::new(OutboundQueue::new());
    let capacity = session.config().exchange.incoming_queue_capacity.max(1);
    let (incoming_tx, mut incoming_rx) = mpsc::channel(capacity);

    let reader_task = tokio::spawn(read_loop(reader, incoming_tx));
    let mut writer_task = tokio::spawn(write_loop(writer, Arc::clone(&outbound)));
    let _tasks = AbortOnDrop(vec![reader_task.abort_handle(), writer_task.abort_handle()]);

    let mut actor = ConnectionActor {
        state: ConnectionState::new(address, supports_extensions),
        session: Arc::clone(&session),
        outbound,
    };

    let metadata_size = session.cached_metadata().map(|cached| cached.bytes().len() as u64);
    let greeting = dispatch::on_connected(&actor.state, metadata_size, &session.config().exchange.client_version);
    actor.apply(greeting).await?;
    if let Some(cached) = session.cached_metadata() {
        actor.metadata_ready(&cached).await?;
    }

    loop {
        tokio::select! {
            incoming = incoming_rx.recv() => match incoming {
                Some(Ok(message)) => actor.handle(message).await?,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
            broadcast = broadcasts.recv(), if actor.state.metadata_ready() => match broadcast {
                Ok(message) => actor.send(message),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(peer = %address, skipped, "Connection lagged behind session broadcasts");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            freed = freed_metadata.changed(), if actor.state.can_request_metadata() => {
                if freed.is_err() {
                    return Ok(());
                }
                actor.request_metadata();
            }
            cached = session.wait_cached_metadata(), if !actor.state.metadata_ready() => {
                actor.metadata_ready(&cached?).await?;
            }
            written = &mut writer_task => {
                return match written {
                    Ok(result) => result,
                    Err(e) => Err(TorrentError::PeerConnectionError {
                        reason: format!("Writer task failed: {e}"),
                    }),
                };
            }
        }
    }
}

async fn read_loop<R>(mut reader: R, incoming: mpsc::Sender<Incoming>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let message = MessageCodec::read_message(&mut reader).await;
        let failed = message.is_err();
        if incoming.send(message).await.is_err() || failed {
            return;
        }
    }
}

async fn write_loop<W>(mut writer: W, outbound: Arc<OutboundQueue>) -> Result<(), TorrentError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.pop().await {
        MessageCodec::write_message(&mut writer, &message).await?;
    }
    Ok(())
}

struct ConnectionActor {
    state: ConnectionState,
    session: Arc<Session>,
    outbound: Arc<OutboundQueue>,
}

impl ConnectionActor {
    fn address(&self) -> PeerAddress {
        self.state.address
    }

    async fn handle(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        tracing::trace!(peer = %self.address(), ?message, "Received");

        let have = self.session.status().have_bitfield();
        let local = LocalView {
            have: &have,
            metadata_complete: self.session.metadata().is_complete(),
        };
        let effects = dispatch::dispatch(&mut self.state, message, local)?;
        self.apply(effects).await?;
        self.sync_record();
        Ok(())
    }

    async fn metadata_ready(&mut self, cached: &CachedInfoDict) -> Result<(), TorrentError> {
        let have = self.session.status().have_bitfield();
        let local = LocalView {
            have: &have,
            metadata_complete: true,
        };
        let effects = dispatch::on_metadata_ready(&mut self.state, cached.info().layout(), local);
        tracing::debug!(
            peer = %self.address(),
            pieces = cached.info().piece_count(),
            remote_has = self.state.remote.bitfield().count(),
            "Metadata ready, starting piece exchange"
        );
        self.apply(effects).await?;
        self.sync_record();
        Ok(())
    }

    async fn apply(&mut self, effects: Vec<Effect>) -> Result<(), TorrentError> {
        for effect in effects {
            match effect {
                Effect::Send(message) => self.send(message),
                Effect::FillRequests => self.fill_requests(),
                Effect::ResetPending => {
                    let released = self.session.status().reset_pending(&self.address());
                    if released > 0 {
                        tracing::debug!(peer = %self.address(), released, "Choked, released requests");
                    }
                }
                Effect::ResendPending => self.resend_pending(),
                Effect::Serve(block) => self.serve(block).await?,
                Effect::CancelUpload(block) => {
                    if self.outbound.cancel_piece(&block) {
                        tracing::trace!(peer = %self.address(), block = %block, "Cancelled queued upload");
                    }
                }
                Effect::Store(block) => self.store(block).await?,
                Effect::LearnMetadataSize(size) => {
                    self.session.metadata().set_total_size(size);
                }
                Effect::RequestMetadata => self.request_metadata(),
                Effect::StoreMetadataPiece { piece, data } => self.store_metadata_piece(piece, data).await?,
                Effect::MetadataRejected(piece) => {
                    tracing::debug!(peer = %self.address(), piece, "Metadata request rejected");
                    self.session.metadata_rejected(&self.address(), piece);
                }
                Effect::ServeMetadata(piece) => self.serve_metadata(piece),
            }
        }
        Ok(())
    }

    fn send(&self, message: PeerMessage) {
        tracing::trace!(peer = %self.address(), ?message, "Queued");
        self.outbound.push(message);
    }

    /// Requests blocks until the configured number are outstanding.
    fn fill_requests(&mut self) {
        if !self.state.metadata_ready() || self.state.peer_choking {
            return;
        }

        let status = self.session.status();
        let address = self.address();
        let pending = status.pending_count(&address);
        let wanted = self
            .session
            .config()
            .exchange
            .max_outstanding_requests
            .saturating_sub(pending);
        let blocks = status.schedule_requests(address, self.state.remote.bitfield(), wanted);

        for block in &blocks {
            self.send(PeerMessage::Request {
                piece_index: block.piece,
                offset: block.offset,
                length: block.length,
            });
        }

        if blocks.is_empty()
            && pending == 0
            && self.state.am_interested
            && !self.state.remote.is_interesting(&status.have_bitfield())
        {
            self.state.am_interested = false;
            self.send(PeerMessage::NotInterested);
        }
    }

    fn resend_pending(&self) {
        let blocks = self.session.status().resend_pending(&self.address());
        if !blocks.is_empty() {
            tracing::debug!(peer = %self.address(), count = blocks.len(), "Unchoked, repeating early requests");
        }
        for block in blocks {
            self.send(PeerMessage::Request {
                piece_index: block.piece,
                offset: block.offset,
                length: block.length,
            });
        }
    }

    async fn serve(&self, block: BlockIndex) -> Result<(), TorrentError> {
        let Some(storage) = self.session.storage() else {
            return Ok(());
        };

        match storage.read_piece(block.piece).await {
            Ok(piece) => {
                let data = piece.slice_ref(block.slice(&piece)?);
                self.send(PeerMessage::Piece {
                    piece_index: block.piece,
                    offset: block.offset,
                    data,
                });
                Ok(())
            }
            Err(StorageError::PieceNotFound { .. }) => {
                tracing::trace!(peer = %self.address(), block = %block, "Requested piece not stored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&mut self, block: Block<Bytes>) -> Result<(), TorrentError> {
        let storage = self.session.storage().ok_or(TorrentError::SessionClosed)?;
        let piece = block.piece;

        let completed = self
            .session
            .status()
            .fulfill_block(self.address(), block, storage.as_ref())
            .await?;

        if completed {
            let reached = self.session.broadcast(PeerMessage::Have { piece_index: piece });
            tracing::info!(peer = %self.address(), piece = %piece, announced_to = reached, "Piece verified");
            if self.session.status().is_complete() {
                tracing::info!(info_hash = %self.session.info_hash(), "All pieces verified");
            }
        }

        self.fill_requests();
        Ok(())
    }

    fn request_metadata(&self) {
        if !self.state.can_request_metadata() {
            return;
        }
        let Some(remote_id) = self.state.remote_metadata_id else {
            return;
        };
        if let Some(piece) = self.session.metadata().schedule_block(self.address()) {
            tracing::debug!(peer = %self.address(), piece, "Requesting metadata piece");
            self.send(PeerMessage::Extended {
                id: remote_id,
                payload: MetadataMessage::Request { piece }.encode(),
            });
        }
    }

    async fn store_metadata_piece(&self, piece: u32, data: Bytes) -> Result<(), TorrentError> {
        if let Some(cached) = self.session.metadata().push_block(data, piece, self.address()) {
            self.session.install_metadata(cached).await?;
        }
        Ok(())
    }

    fn serve_metadata(&self, piece: u32) {
        let Some(remote_id) = self.state.remote_metadata_id else {
            tracing::debug!(peer = %self.address(), piece, "Metadata request from peer without ut_metadata");
            return;
        };

        let reply = match self.session.cached_metadata() {
            Some(cached) => metadata_piece(&cached, piece).unwrap_or(MetadataMessage::Reject { piece }),
            None => MetadataMessage::Reject { piece },
        };
        self.send(PeerMessage::Extended {
            id: remote_id,
            payload: reply.encode(),
        });
    }

    /// Mirrors the connection state into the session's membership record.
    fn sync_record(&self) {
        let pending = self.session.status().pending_count(&self.address());
        self.session.registry().update(&self.address(), |record| {
            self.state.apply_to(record);
            record.outstanding_requests = pending;
        });
    }
}

/// One `ut_metadata` data message, or `None` past the end.
fn metadata_piece(cached: &CachedInfoDict, piece: u32) -> Option<MetadataMessage> {
    let bytes = cached.bytes();
    let start = piece as usize * METADATA_PIECE_SIZE as usize;
    if start >= bytes.len() {
        return None;
    }
    let end = (start + METADATA_PIECE_SIZE as usize).min(bytes.len());
    Some(MetadataMessage::Data {
        piece,
        total_size: bytes.len() as u64,
        data: bytes.slice(start..end),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentCreator;

    #[test]
    fn test_metadata_piece_slices_last_piece_short() {
        let cached = TorrentCreator::with_piece_size(16).create("large.bin", &vec![5u8; 2200 * 16]);
        let len = cached.bytes().len();

        let Some(MetadataMessage::Data { total_size, data, .. }) = metadata_piece(&cached, 2) else {
            panic!("expected data for the last piece");
        };
        assert_eq!(total_size, len as u64);
        assert_eq!(data.len(), len - 2 * METADATA_PIECE_SIZE as usize);
        assert!(metadata_piece(&cached, 3).is_none());
    }
}
