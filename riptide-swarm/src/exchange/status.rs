//! Local piece completion and per-peer in-flight block requests

use std::collections::{BTreeSet, HashMap, HashSet};

use bytes::Bytes;
use parking_lot::Mutex;

use super::PeerAddress;
use super::metadata::MAX_METADATA_SIZE;
use crate::storage::{PieceStorage, StorageError};
use crate::torrent::{Bitfield, Block, BlockIndex, PieceIndex, PieceLayout, TorrentError};

/// Most pieces an info dictionary of `MAX_METADATA_SIZE` bytes can list.
pub const MAX_UNSIZED_PIECES: u32 = (MAX_METADATA_SIZE / 20) as u32;

/// Availability announced by a remote peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    /// A single `have` message
    Have(PieceIndex),
    /// A full `bitfield` message
    Bitfield(Bytes),
}

/// A connection's view of what the remote holds.
///
/// Starts unsized when announcements arrive before the piece count is known
/// and is truncated to the real count once metadata is available.
#[derive(Debug, Clone, Default)]
pub struct RemoteBitfield {
    bits: Bitfield,
    sized: bool,
}

impl RemoteBitfield {
    /// View for a torrent whose piece count is not yet known.
    pub fn unsized() -> Self {
        Self::default()
    }

    /// Empty view for `piece_count` pieces.
    pub fn sized(piece_count: u32) -> Self {
        Self {
            bits: Bitfield::new(piece_count),
            sized: true,
        }
    }

    /// Fixes the piece count, dropping announcements past it.
    pub fn resize(&mut self, piece_count: u32) {
        self.bits.resize(piece_count);
        self.sized = true;
    }

    /// True once the piece count is known.
    pub fn is_sized(&self) -> bool {
        self.sized
    }

    /// Current bits.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bits
    }

    /// Merges an announcement into the view.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Piece index or bitfield size does not
    ///   fit the known piece count
    pub fn merge(&mut self, availability: &Availability) -> Result<(), TorrentError> {
        match availability {
            Availability::Have(index) => {
                if index.as_u32() >= self.bits.len() {
                    if self.sized {
                        return Err(TorrentError::ProtocolError {
                            message: format!(
                                "Have for piece {index} but torrent has {} pieces",
                                self.bits.len()
                            ),
                        });
                    }
                    let needed = index
                        .as_u32()
                        .checked_add(1)
                        .filter(|count| *count <= MAX_UNSIZED_PIECES)
                        .ok_or_else(|| TorrentError::ProtocolError {
                            message: format!("Have for piece {index} exceeds any possible torrent"),
                        })?;
                    self.bits.resize(needed);
                }
                self.bits.set(*index);
            }
            Availability::Bitfield(bytes) => {
                let incoming = if self.sized {
                    Bitfield::from_bytes(bytes, self.bits.len())?
                } else if bytes.len() as u64 * 8 > MAX_UNSIZED_PIECES as u64 + 7 {
                    return Err(TorrentError::ProtocolError {
                        message: format!("Bitfield of {} bytes exceeds any possible torrent", bytes.len()),
                    });
                } else {
                    Bitfield::from_unsized_bytes(bytes)
                };
                if incoming.len() > self.bits.len() {
                    self.bits.resize(incoming.len());
                }
                self.bits.union_with(&incoming);
            }
        }
        Ok(())
    }

    /// True when the remote holds a piece `local` lacks.
    pub fn is_interesting(&self, local: &Bitfield) -> bool {
        self.sized && self.bits.has_missing_from(local)
    }
}

/// Tracks which pieces the local node holds and which blocks are in flight.
///
/// A block is requested from at most one peer at a time, so concurrent
/// writes to the same byte range cannot happen.
pub struct StatusTracker {
    inner: Mutex<StatusInner>,
}

struct StatusInner {
    have: Bitfield,
    layout: Option<PieceLayout>,
    block_size: u32,
    requested: HashMap<PeerAddress, BTreeSet<BlockIndex>>,
    /// Blocks asked for twice from the same peer; one extra copy is dropped
    resent: HashMap<PeerAddress, HashSet<BlockIndex>>,
    in_flight: HashSet<BlockIndex>,
    received: HashMap<PieceIndex, BTreeSet<u32>>,
}

impl StatusTracker {
    /// Creates a tracker that schedules nothing until `initialize` is called.
    pub fn new(block_size: u32) -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                have: Bitfield::default(),
                layout: None,
                block_size: block_size.max(1),
                requested: HashMap::new(),
                resent: HashMap::new(),
                in_flight: HashSet::new(),
                received: HashMap::new(),
            }),
        }
    }

    /// Installs the piece layout and the pieces storage already holds.
    pub fn initialize(&self, layout: PieceLayout, mut have: Bitfield) {
        have.resize(layout.piece_count());
        let mut inner = self.inner.lock();
        inner.have = have;
        inner.layout = Some(layout);
        inner.received.clear();
    }

    /// Piece layout, once metadata is known.
    pub fn layout(&self) -> Option<PieceLayout> {
        self.inner.lock().layout
    }

    /// Snapshot of the local completion state.
    pub fn have_bitfield(&self) -> Bitfield {
        self.inner.lock().have.clone()
    }

    /// True when every piece is held.
    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        inner.layout.is_some() && inner.have.is_complete()
    }

    /// Merges a peer announcement and reports whether the peer is now interesting.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Announcement does not fit the piece count
    pub fn record_remote_has(
        &self,
        remote: &mut RemoteBitfield,
        availability: &Availability,
    ) -> Result<bool, TorrentError> {
        remote.merge(availability)?;
        Ok(remote.is_interesting(&self.inner.lock().have))
    }

    /// Picks up to `count` blocks `remote` can serve and marks them requested by `peer`.
    ///
    /// Pieces are considered in ascending index order; blocks already held,
    /// already received for an incomplete piece, or in flight to any peer
    /// are skipped.
    pub fn schedule_requests(&self, peer: PeerAddress, remote: &Bitfield, count: usize) -> Vec<BlockIndex> {
        if count == 0 {
            return Vec::new();
        }

        let mut inner = self.inner.lock();
        let Some(layout) = inner.layout else {
            return Vec::new();
        };

        let mut scheduled = Vec::with_capacity(count);
        'pieces: for piece in remote.pieces() {
            if inner.have.has(piece) {
                continue;
            }
            for block in layout.blocks(piece, inner.block_size) {
                let already_received = inner
                    .received
                    .get(&piece)
                    .is_some_and(|offsets| offsets.contains(&block.offset));
                if already_received || inner.in_flight.contains(&block) {
                    continue;
                }
                scheduled.push(block);
                if scheduled.len() == count {
                    break 'pieces;
                }
            }
        }

        for block in &scheduled {
            inner.in_flight.insert(*block);
        }
        inner
            .requested
            .entry(peer)
            .or_default()
            .extend(scheduled.iter().copied());
        scheduled
    }

    /// Number of blocks currently requested from `peer`.
    pub fn pending_count(&self, peer: &PeerAddress) -> usize {
        self.inner.lock().requested.get(peer).map_or(0, BTreeSet::len)
    }

    /// Blocks still requested from `peer`, to be asked for again.
    ///
    /// A second copy of each returned block arriving from `peer` is dropped
    /// instead of being treated as unsolicited.
    pub fn resend_pending(&self, peer: &PeerAddress) -> Vec<BlockIndex> {
        let mut inner = self.inner.lock();
        let blocks: Vec<BlockIndex> = inner
            .requested
            .get(peer)
            .map(|blocks| blocks.iter().copied().collect())
            .unwrap_or_default();
        if !blocks.is_empty() {
            inner.resent.entry(*peer).or_default().extend(blocks.iter().copied());
        }
        blocks
    }

    /// Applies a received block, writing it through `storage`.
    ///
    /// Returns true when the block completed a verified piece. The lock is
    /// released while storage performs I/O.
    ///
    /// # Errors
    /// - `TorrentError::UnsolicitedBlock` - Block was not requested from `peer`;
    ///   nothing is changed
    /// - `TorrentError::CorruptedPiece` - Piece assembled but failed verification;
    ///   all of its blocks become requestable again
    /// - `TorrentError::Storage` - Storage rejected the write
    pub async fn fulfill_block(
        &self,
        peer: PeerAddress,
        block: Block<Bytes>,
        storage: &dyn PieceStorage,
    ) -> Result<bool, TorrentError> {
        let index = block.index();
        {
            let mut inner = self.inner.lock();
            let removed = inner
                .requested
                .get_mut(&peer)
                .is_some_and(|blocks| blocks.remove(&index));
            if !removed {
                let duplicate = inner
                    .resent
                    .get_mut(&peer)
                    .is_some_and(|blocks| blocks.remove(&index));
                if duplicate {
                    tracing::trace!(peer = %peer, block = %index, "Dropping duplicate of a resent block");
                    return Ok(false);
                }
                return Err(TorrentError::UnsolicitedBlock {
                    peer: peer.socket(),
                    block: index,
                });
            }
            inner.in_flight.remove(&index);
            inner
                .received
                .entry(index.piece)
                .or_default()
                .insert(index.offset);
        }

        let result = storage.write_block(block).await;

        let mut inner = self.inner.lock();
        match result {
            Ok(true) => {
                inner.have.set(index.piece);
                inner.received.remove(&index.piece);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(StorageError::PieceHashMismatch { index: piece }) => {
                inner.received.remove(&piece);
                Err(TorrentError::CorruptedPiece { index: piece })
            }
            Err(e) => {
                if let Some(offsets) = inner.received.get_mut(&index.piece) {
                    offsets.remove(&index.offset);
                }
                Err(e.into())
            }
        }
    }

    /// Forgets every request attributed to `peer` so others may be asked.
    ///
    /// Returns the number of requests released.
    pub fn reset_pending(&self, peer: &PeerAddress) -> usize {
        let mut inner = self.inner.lock();
        inner.resent.remove(peer);
        let Some(blocks) = inner.requested.remove(peer) else {
            return 0;
        };
        for block in &blocks {
            inner.in_flight.remove(block);
        }
        blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use proptest::collection;
    use proptest::prelude::ProptestConfig;
    use proptest::proptest;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::storage::test_fixtures::{TestTorrent, create_test_torrent};

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::new(SocketAddr::from(([10, 0, 0, 1], port)))
    }

    fn tracker_for(torrent: &TestTorrent, block_size: u32) -> StatusTracker {
        let tracker = StatusTracker::new(block_size);
        tracker.initialize(
            torrent.info().layout(),
            Bitfield::new(torrent.info().piece_count()),
        );
        tracker
    }

    fn block_for(torrent: &TestTorrent, index: BlockIndex) -> Block<Bytes> {
        let start = index.piece.as_u32() as usize * torrent.info().piece_length as usize
            + index.offset as usize;
        Block::new(
            index.piece,
            index.offset,
            torrent.content.slice(start..start + index.length as usize),
        )
    }

    #[test]
    fn test_schedule_requests_ascending_piece_order() {
        let torrent = create_test_torrent(32, 128);
        let tracker = tracker_for(&torrent, 16);
        let remote = Bitfield::full(4);

        let blocks = tracker.schedule_requests(peer(1), &remote, 3);
        assert_eq!(blocks, vec![
            BlockIndex::new(PieceIndex::new(0), 0, 16),
            BlockIndex::new(PieceIndex::new(0), 16, 16),
            BlockIndex::new(PieceIndex::new(1), 0, 16),
        ]);
    }

    #[test]
    fn test_schedule_requests_uninitialized_returns_nothing() {
        let tracker = StatusTracker::new(16);
        assert!(tracker.schedule_requests(peer(1), &Bitfield::full(4), 4).is_empty());
    }

    #[test]
    fn test_schedule_requests_other_peer_skips_in_flight() {
        let torrent = create_test_torrent(32, 64);
        let tracker = tracker_for(&torrent, 16);
        let remote = Bitfield::full(2);

        let first = tracker.schedule_requests(peer(1), &remote, 2);
        let second = tracker.schedule_requests(peer(2), &remote, 10);
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|block| !first.contains(block)));
    }

    #[test]
    fn test_reset_pending_releases_blocks_for_others() {
        let torrent = create_test_torrent(32, 32);
        let tracker = tracker_for(&torrent, 16);
        let remote = Bitfield::full(1);

        let first = tracker.schedule_requests(peer(1), &remote, 2);
        assert!(tracker.schedule_requests(peer(2), &remote, 2).is_empty());

        assert_eq!(tracker.reset_pending(&peer(1)), 2);
        assert_eq!(tracker.pending_count(&peer(1)), 0);
        assert_eq!(tracker.schedule_requests(peer(2), &remote, 2), first);
    }

    #[tokio::test]
    async fn test_fulfill_block_unrequested_rejected_without_mutation() {
        let torrent = create_test_torrent(32, 64);
        let tracker = tracker_for(&torrent, 32);
        let storage = MemoryStorage::new(Arc::clone(torrent.info()));
        let index = BlockIndex::new(PieceIndex::new(0), 0, 32);

        tracker.schedule_requests(peer(1), &Bitfield::full(2), 1);
        let result = tracker
            .fulfill_block(peer(2), block_for(&torrent, index), &storage)
            .await;

        assert!(matches!(result, Err(TorrentError::UnsolicitedBlock { .. })));
        assert_eq!(tracker.have_bitfield().count(), 0);
        assert_eq!(tracker.pending_count(&peer(1)), 1);
    }

    #[tokio::test]
    async fn test_fulfill_block_wrong_length_unsolicited() {
        let torrent = create_test_torrent(32, 64);
        let tracker = tracker_for(&torrent, 32);
        let storage = MemoryStorage::new(Arc::clone(torrent.info()));

        tracker.schedule_requests(peer(1), &Bitfield::full(2), 1);
        let short = BlockIndex::new(PieceIndex::new(0), 0, 16);
        let result = tracker
            .fulfill_block(peer(1), block_for(&torrent, short), &storage)
            .await;
        assert!(matches!(result, Err(TorrentError::UnsolicitedBlock { .. })));
    }

    #[tokio::test]
    async fn test_fulfill_block_last_block_completes_piece() {
        let torrent = create_test_torrent(32, 64);
        let tracker = tracker_for(&torrent, 16);
        let storage = MemoryStorage::new(Arc::clone(torrent.info()));

        let blocks = tracker.schedule_requests(peer(1), &Bitfield::full(2), 2);
        assert!(
            !tracker
                .fulfill_block(peer(1), block_for(&torrent, blocks[1]), &storage)
                .await
                .unwrap()
        );
        assert!(
            tracker
                .fulfill_block(peer(1), block_for(&torrent, blocks[0]), &storage)
                .await
                .unwrap()
        );
        assert!(tracker.have_bitfield().has(PieceIndex::new(0)));
        assert!(!tracker.is_complete());
    }

    #[tokio::test]
    async fn test_fulfill_block_corrupted_piece_requestable_again() {
        let torrent = create_test_torrent(32, 32);
        let tracker = tracker_for(&torrent, 32);
        let storage = MemoryStorage::new(Arc::clone(torrent.info()));
        let remote = Bitfield::full(1);

        let blocks = tracker.schedule_requests(peer(1), &remote, 1);
        let corrupted = Block::new(PieceIndex::new(0), 0, Bytes::from(vec![0xAA; 32]));
        let result = tracker.fulfill_block(peer(1), corrupted, &storage).await;

        assert!(matches!(result, Err(TorrentError::CorruptedPiece { .. })));
        assert!(!tracker.have_bitfield().has(PieceIndex::new(0)));
        assert_eq!(tracker.schedule_requests(peer(2), &remote, 1), blocks);
    }

    #[tokio::test]
    async fn test_fulfill_block_resent_block_duplicate_dropped_once() {
        let torrent = create_test_torrent(32, 64);
        let tracker = tracker_for(&torrent, 32);
        let storage = MemoryStorage::new(Arc::clone(torrent.info()));

        let blocks = tracker.schedule_requests(peer(1), &Bitfield::full(2), 1);
        assert_eq!(tracker.resend_pending(&peer(1)), blocks);
        assert_eq!(tracker.pending_count(&peer(1)), 1);

        let copy = || block_for(&torrent, blocks[0]);
        assert!(tracker.fulfill_block(peer(1), copy(), &storage).await.unwrap());
        assert!(!tracker.fulfill_block(peer(1), copy(), &storage).await.unwrap());
        let third = tracker.fulfill_block(peer(1), copy(), &storage).await;
        assert!(matches!(third, Err(TorrentError::UnsolicitedBlock { .. })));
    }

    #[test]
    fn test_resend_pending_cleared_by_reset() {
        let torrent = create_test_torrent(32, 64);
        let tracker = tracker_for(&torrent, 32);

        tracker.schedule_requests(peer(1), &Bitfield::full(2), 2);
        assert_eq!(tracker.resend_pending(&peer(1)).len(), 2);
        tracker.reset_pending(&peer(1));
        assert!(tracker.resend_pending(&peer(1)).is_empty());
        assert!(tracker.resend_pending(&peer(2)).is_empty());
    }

    #[test]
    fn test_record_remote_has_interesting_only_for_missing_piece() {
        let torrent = create_test_torrent(16, 64);
        let tracker = StatusTracker::new(16);
        let mut have = Bitfield::new(4);
        have.set(PieceIndex::new(1));
        tracker.initialize(torrent.info().layout(), have);

        let mut remote = RemoteBitfield::sized(4);
        let held = Availability::Have(PieceIndex::new(1));
        assert!(!tracker.record_remote_has(&mut remote, &held).unwrap());

        let missing = Availability::Have(PieceIndex::new(3));
        assert!(tracker.record_remote_has(&mut remote, &missing).unwrap());
    }

    #[test]
    fn test_remote_bitfield_have_out_of_range_after_sizing_rejected() {
        let mut remote = RemoteBitfield::sized(4);
        let result = remote.merge(&Availability::Have(PieceIndex::new(4)));
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[test]
    fn test_remote_bitfield_unsized_announcements_kept_until_resize() {
        let mut remote = RemoteBitfield::unsized();
        remote.merge(&Availability::Have(PieceIndex::new(9))).unwrap();
        remote
            .merge(&Availability::Bitfield(Bytes::from_static(&[0b0010_0000])))
            .unwrap();
        assert!(!remote.is_interesting(&Bitfield::new(10)));

        remote.resize(5);
        assert_eq!(remote.bitfield().pieces().collect::<Vec<_>>(), vec![
            PieceIndex::new(2)
        ]);
        assert!(remote.is_interesting(&Bitfield::new(5)));
    }

    #[test]
    fn test_remote_bitfield_unsized_have_past_any_torrent_rejected() {
        let mut remote = RemoteBitfield::unsized();
        let result = remote.merge(&Availability::Have(PieceIndex::new(u32::MAX)));
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));

        let result = remote.merge(&Availability::Have(PieceIndex::new(MAX_UNSIZED_PIECES)));
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
        assert_eq!(remote.bitfield().len(), 0);

        remote
            .merge(&Availability::Have(PieceIndex::new(MAX_UNSIZED_PIECES - 1)))
            .unwrap();
        assert_eq!(remote.bitfield().len(), MAX_UNSIZED_PIECES);
    }

    #[test]
    fn test_remote_bitfield_unsized_oversized_bitfield_rejected() {
        let mut remote = RemoteBitfield::unsized();
        let bytes = Bytes::from(vec![0xffu8; MAX_UNSIZED_PIECES as usize / 8 + 2]);
        let result = remote.merge(&Availability::Bitfield(bytes));
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_schedule_requests_never_duplicates(
            remote_bits in collection::vec(proptest::bool::ANY, 8),
            have_bits in collection::vec(proptest::bool::ANY, 8),
            counts in collection::vec(0usize..6, 1..6),
        ) {
            let torrent = create_test_torrent(32, 8 * 32);
            let tracker = StatusTracker::new(16);
            let mut have = Bitfield::new(8);
            let mut remote = Bitfield::new(8);
            for i in 0..8u32 {
                if have_bits[i as usize] {
                    have.set(PieceIndex::new(i));
                }
                if remote_bits[i as usize] {
                    remote.set(PieceIndex::new(i));
                }
            }
            tracker.initialize(torrent.info().layout(), have.clone());

            let mut seen = HashSet::new();
            for (round, count) in counts.iter().enumerate() {
                let blocks = tracker.schedule_requests(peer(round as u16), &remote, *count);
                proptest::prop_assert!(blocks.len() <= *count);
                for block in blocks {
                    proptest::prop_assert!(remote.has(block.piece));
                    proptest::prop_assert!(!have.has(block.piece));
                    proptest::prop_assert!(seen.insert(block));
                }
            }
        }
    }
}
