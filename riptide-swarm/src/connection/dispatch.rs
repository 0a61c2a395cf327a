//! Pure message dispatch for one peer connection.
//!
//! `dispatch` takes the connection's state and one decoded message and
//! returns the effects the actor must carry out: messages to send, tracker
//! calls and storage I/O. Nothing here touches the network or the session,
//! so every protocol rule can be tested by feeding messages in directly.

use bytes::Bytes;

use crate::config::MAX_BLOCK_SIZE;
use crate::exchange::{Availability, PeerAddress, RemoteBitfield};
use crate::session::ConnectionRecord;
use crate::torrent::protocol::extension::{EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID};
use crate::torrent::protocol::{ExtensionHandshake, MetadataMessage};
use crate::torrent::{Bitfield, Block, BlockIndex, PeerMessage, PieceLayout, TorrentError};

/// Protocol state of one connection, owned by its actor.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub address: PeerAddress,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    /// Remote has sent Choke or Unchoke at least once
    pub choke_announced: bool,
    pub peer_interested: bool,
    pub remote: RemoteBitfield,
    pub supports_extensions: bool,
    /// Id the remote wants `ut_metadata` messages under
    pub remote_metadata_id: Option<u8>,
    /// Remote rejected a metadata request; it is not asked again
    pub metadata_refused: bool,
    /// Piece geometry, present once metadata is installed
    pub layout: Option<PieceLayout>,
}

impl ConnectionState {
    /// State right after the handshake: we choke the remote and assume it
    /// does not choke us until told otherwise.
    pub fn new(address: PeerAddress, supports_extensions: bool) -> Self {
        Self {
            address,
            am_choking: true,
            am_interested: false,
            peer_choking: false,
            choke_announced: false,
            peer_interested: false,
            remote: RemoteBitfield::unsized(),
            supports_extensions,
            remote_metadata_id: None,
            metadata_refused: false,
            layout: None,
        }
    }

    /// True once data exchange may start.
    pub fn metadata_ready(&self) -> bool {
        self.layout.is_some()
    }

    /// True when metadata pieces may still be requested from this peer.
    pub fn can_request_metadata(&self) -> bool {
        !self.metadata_ready() && !self.metadata_refused && self.remote_metadata_id.is_some()
    }

    /// Copies the negotiated flags into a membership record.
    pub fn apply_to(&self, record: &mut ConnectionRecord) {
        record.supports_extensions = self.supports_extensions;
        record.remote_metadata_id = self.remote_metadata_id;
        record.am_choking = self.am_choking;
        record.am_interested = self.am_interested;
        record.peer_choking = self.peer_choking;
        record.peer_interested = self.peer_interested;
        record.remote_bitfield = self.remote.bitfield().clone();
    }
}

/// What the local node currently holds.
#[derive(Debug, Clone, Copy)]
pub struct LocalView<'a> {
    pub have: &'a Bitfield,
    pub metadata_complete: bool,
}

/// Work requested by `dispatch`, carried out in order by the actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Queue a message to the remote
    Send(PeerMessage),
    /// Top up block requests to the configured maximum
    FillRequests,
    /// Forget every block requested from this peer
    ResetPending,
    /// Ask again for every block still requested from this peer
    ResendPending,
    /// Read a block from storage and send it as a `Piece`
    Serve(BlockIndex),
    /// Withdraw a queued `Piece` the remote no longer wants
    CancelUpload(BlockIndex),
    /// Hand a received block to the status tracker
    Store(Block<Bytes>),
    /// Remote advertised the info dictionary size
    LearnMetadataSize(u64),
    /// Ask this peer for the next missing metadata piece
    RequestMetadata,
    /// Hand a received metadata piece to the metadata tracker
    StoreMetadataPiece { piece: u32, data: Bytes },
    /// Remote will not serve this metadata piece
    MetadataRejected(u32),
    /// Remote asked for a metadata piece
    ServeMetadata(u32),
}

/// Effects of a fresh connection: the extension handshake when supported.
pub fn on_connected(state: &ConnectionState, metadata_size: Option<u64>, client: &str) -> Vec<Effect> {
    if !state.supports_extensions {
        return Vec::new();
    }
    let handshake = ExtensionHandshake::local(metadata_size, client);
    vec![Effect::Send(PeerMessage::Extended {
        id: EXTENSION_HANDSHAKE_ID,
        payload: handshake.encode(),
    })]
}

/// Effects of metadata becoming available: size the remote view, announce
/// our pieces and decide interest in what the remote announced so far.
pub fn on_metadata_ready(state: &mut ConnectionState, layout: PieceLayout, local: LocalView<'_>) -> Vec<Effect> {
    state.layout = Some(layout);
    state.remote.resize(layout.piece_count());

    let mut effects = vec![Effect::Send(PeerMessage::Bitfield {
        bitfield: local.have.to_bytes(),
    })];
    evaluate_interest(state, local, &mut effects);
    effects
}

/// Applies one incoming message to `state`.
///
/// # Errors
///
/// - `TorrentError::ProtocolError` - Malformed extension payload, availability
///   that does not fit the torrent or a request outside piece bounds
/// - `TorrentError::UnsolicitedBlock` - Block data arrived before any was requested
pub fn dispatch(
    state: &mut ConnectionState,
    message: PeerMessage,
    local: LocalView<'_>,
) -> Result<Vec<Effect>, TorrentError> {
    let mut effects = Vec::new();

    match message {
        PeerMessage::KeepAlive | PeerMessage::Port { .. } => {}
        PeerMessage::Choke => {
            state.peer_choking = true;
            state.choke_announced = true;
            effects.push(Effect::ResetPending);
        }
        PeerMessage::Unchoke => {
            state.peer_choking = false;
            // Requests sent before the first Unchoke may have been dropped.
            let first = !std::mem::replace(&mut state.choke_announced, true);
            if state.metadata_ready() {
                if first {
                    effects.push(Effect::ResendPending);
                }
                if state.am_interested {
                    effects.push(Effect::FillRequests);
                }
            }
        }
        PeerMessage::Interested => {
            state.peer_interested = true;
            if state.am_choking {
                state.am_choking = false;
                effects.push(Effect::Send(PeerMessage::Unchoke));
            }
        }
        PeerMessage::NotInterested => {
            state.peer_interested = false;
        }
        PeerMessage::Have { piece_index } => {
            state.remote.merge(&Availability::Have(piece_index))?;
            evaluate_interest(state, local, &mut effects);
        }
        PeerMessage::Bitfield { bitfield } => {
            state.remote.merge(&Availability::Bitfield(bitfield))?;
            evaluate_interest(state, local, &mut effects);
        }
        PeerMessage::Request {
            piece_index,
            offset,
            length,
        } => {
            let block = BlockIndex::new(piece_index, offset, length);
            if let Some(layout) = state.layout {
                check_request(&layout, &block)?;
                if !state.am_choking && local.have.has(piece_index) {
                    effects.push(Effect::Serve(block));
                } else {
                    tracing::trace!(peer = %state.address, block = %block, "Ignoring request we cannot serve");
                }
            }
        }
        PeerMessage::Piece {
            piece_index,
            offset,
            data,
        } => {
            let block = Block::new(piece_index, offset, data);
            if !state.metadata_ready() {
                return Err(TorrentError::UnsolicitedBlock {
                    peer: state.address.socket(),
                    block: block.index(),
                });
            }
            effects.push(Effect::Store(block));
        }
        PeerMessage::Cancel {
            piece_index,
            offset,
            length,
        } => {
            effects.push(Effect::CancelUpload(BlockIndex::new(piece_index, offset, length)));
        }
        PeerMessage::Extended { id, payload } => {
            dispatch_extended(state, id, &payload, local, &mut effects)?;
        }
    }

    Ok(effects)
}

fn dispatch_extended(
    state: &mut ConnectionState,
    id: u8,
    payload: &Bytes,
    local: LocalView<'_>,
    effects: &mut Vec<Effect>,
) -> Result<(), TorrentError> {
    match id {
        EXTENSION_HANDSHAKE_ID => {
            let handshake = ExtensionHandshake::decode(payload)?;
            state.remote_metadata_id = handshake.ut_metadata_id();
            tracing::debug!(
                peer = %state.address,
                client = handshake.client.as_deref().unwrap_or("unknown"),
                ut_metadata = ?state.remote_metadata_id,
                metadata_size = ?handshake.metadata_size,
                "Extension handshake received"
            );

            if local.metadata_complete {
                return Ok(());
            }
            if let Some(size) = handshake.metadata_size {
                effects.push(Effect::LearnMetadataSize(size));
            }
            if state.can_request_metadata() {
                effects.push(Effect::RequestMetadata);
            }
        }
        LOCAL_UT_METADATA_ID => match MetadataMessage::decode(payload)? {
            MetadataMessage::Request { piece } => effects.push(Effect::ServeMetadata(piece)),
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => {
                if local.metadata_complete {
                    return Ok(());
                }
                effects.push(Effect::LearnMetadataSize(total_size));
                effects.push(Effect::StoreMetadataPiece { piece, data });
                if state.can_request_metadata() {
                    effects.push(Effect::RequestMetadata);
                }
            }
            MetadataMessage::Reject { piece } => {
                state.metadata_refused = true;
                effects.push(Effect::MetadataRejected(piece));
            }
        },
        other => {
            tracing::debug!(peer = %state.address, id = other, "Ignoring unknown extension message");
        }
    }
    Ok(())
}

/// Becomes interested when the remote holds something we lack.
fn evaluate_interest(state: &mut ConnectionState, local: LocalView<'_>, effects: &mut Vec<Effect>) {
    if !state.metadata_ready() || !state.remote.is_interesting(local.have) {
        return;
    }

    if !state.am_interested {
        state.am_interested = true;
        effects.push(Effect::Send(PeerMessage::Interested));
    }
    if state.am_choking {
        state.am_choking = false;
        effects.push(Effect::Send(PeerMessage::Unchoke));
    }
    if !state.peer_choking {
        effects.push(Effect::FillRequests);
    }
}

fn check_request(layout: &PieceLayout, block: &BlockIndex) -> Result<(), TorrentError> {
    if block.length > MAX_BLOCK_SIZE {
        return Err(TorrentError::ProtocolError {
            message: format!("Request for {} bytes exceeds block limit", block.length),
        });
    }
    layout
        .validate_block(block)
        .map_err(|e| TorrentError::ProtocolError {
            message: format!("Invalid request: {e}"),
        })
}
