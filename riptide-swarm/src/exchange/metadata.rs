//! Metadata (info dictionary) fetching progress for the ut_metadata extension

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::PeerAddress;
use crate::torrent::protocol::extension::{METADATA_PIECE_SIZE, metadata_piece_count};
use crate::torrent::{CachedInfoDict, InfoHash};

/// Largest info dictionary accepted from peers (8 MiB).
pub const MAX_METADATA_SIZE: u64 = 8 * 1024 * 1024;

/// Collects metadata pieces from peers until the info dictionary verifies.
///
/// Each piece moves through requested, held and (on a failed verification)
/// discarded. Once verification succeeds the tracker is complete for good
/// and schedules nothing further.
pub struct MetadataTracker {
    info_hash: InfoHash,
    inner: Mutex<MetadataInner>,
}

#[derive(Default)]
struct MetadataInner {
    total_size: Option<u64>,
    pieces: BTreeMap<u32, Bytes>,
    requested: HashMap<PeerAddress, BTreeSet<u32>>,
    complete: bool,
}

impl MetadataInner {
    fn piece_count(&self) -> u32 {
        self.total_size.map_or(0, metadata_piece_count)
    }

    fn is_requested(&self, piece: u32) -> bool {
        self.requested.values().any(|pieces| pieces.contains(&piece))
    }

    fn restart(&mut self) {
        self.pieces.clear();
        self.requested.clear();
    }
}

impl MetadataTracker {
    /// Tracker still missing the info dictionary for `info_hash`.
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            inner: Mutex::new(MetadataInner::default()),
        }
    }

    /// Tracker for a session that started with full metadata.
    pub fn completed(info_hash: InfoHash, total_size: u64) -> Self {
        Self {
            info_hash,
            inner: Mutex::new(MetadataInner {
                total_size: Some(total_size),
                complete: true,
                ..MetadataInner::default()
            }),
        }
    }

    /// True once the info dictionary has been reassembled and verified.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    /// Marks the tracker complete when metadata arrived some other way.
    pub fn mark_complete(&self, total_size: u64) {
        let mut inner = self.inner.lock();
        inner.total_size = Some(total_size);
        inner.complete = true;
        inner.restart();
    }

    /// Size advertised by peers, once known.
    pub fn total_size(&self) -> Option<u64> {
        self.inner.lock().total_size
    }

    /// Records the size advertised in a peer's extension handshake.
    ///
    /// The first plausible size wins. Returns false when the size was ignored.
    pub fn set_total_size(&self, size: u64) -> bool {
        if size == 0 || size > MAX_METADATA_SIZE {
            tracing::debug!(size, "Ignoring implausible metadata size");
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.total_size.is_some() {
            return inner.total_size == Some(size);
        }
        inner.total_size = Some(size);
        true
    }

    /// Picks the lowest piece neither held nor requested and marks it for `peer`.
    ///
    /// Returns `None` while the size is unknown, when complete, or when
    /// every missing piece is already in flight.
    pub fn schedule_block(&self, peer: PeerAddress) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.complete {
            return None;
        }

        let piece = (0..inner.piece_count())
            .find(|piece| !inner.pieces.contains_key(piece) && !inner.is_requested(*piece))?;
        inner.requested.entry(peer).or_default().insert(piece);
        Some(piece)
    }

    /// Stores a piece from `peer`.
    ///
    /// When this was the last missing piece the pieces are concatenated,
    /// parsed and checked against the expected info hash. A failure discards
    /// every piece so collection starts over. Pieces of the wrong length or
    /// index are dropped.
    pub fn push_block(&self, data: Bytes, piece: u32, peer: PeerAddress) -> Option<CachedInfoDict> {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.requested.get_mut(&peer) {
            pending.remove(&piece);
        }

        let total_size = inner.total_size?;
        if inner.complete || piece >= inner.piece_count() {
            return None;
        }

        let offset = piece as u64 * METADATA_PIECE_SIZE as u64;
        let expected = (total_size - offset).min(METADATA_PIECE_SIZE as u64);
        if data.len() as u64 != expected {
            tracing::warn!(
                peer = %peer,
                piece,
                len = data.len(),
                expected,
                "Dropping metadata piece with wrong length"
            );
            return None;
        }

        inner.pieces.insert(piece, data);
        if inner.pieces.len() as u32 != inner.piece_count() {
            return None;
        }

        let mut assembled = BytesMut::with_capacity(total_size as usize);
        for bytes in inner.pieces.values() {
            assembled.extend_from_slice(bytes);
        }

        match CachedInfoDict::from_bytes(assembled.freeze(), Some(self.info_hash)) {
            Ok(cached) => {
                inner.complete = true;
                inner.restart();
                tracing::info!(info_hash = %self.info_hash, size = total_size, "Metadata verified");
                Some(cached)
            }
            Err(e) => {
                tracing::warn!(info_hash = %self.info_hash, error = %e, "Metadata verification failed, restarting");
                inner.restart();
                None
            }
        }
    }

    /// Clears the pending mark after `peer` rejected `piece`.
    ///
    /// Returns true when the piece was marked for `peer`.
    pub fn cancel_pending(&self, peer: &PeerAddress, piece: u32) -> bool {
        self.inner
            .lock()
            .requested
            .get_mut(peer)
            .is_some_and(|pending| pending.remove(&piece))
    }

    /// Clears every pending mark held by a departing peer.
    ///
    /// Returns true when the peer held any.
    pub fn release_peer(&self, peer: &PeerAddress) -> bool {
        self.inner
            .lock()
            .requested
            .remove(peer)
            .is_some_and(|pending| !pending.is_empty())
    }

    /// Number of pieces currently held.
    pub fn held_count(&self) -> usize {
        self.inner.lock().pieces.len()
    }
}
