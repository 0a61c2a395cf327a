//! Per-torrent session: shared state for every peer connection.
//!
//! The session owns the status and metadata trackers, the storage handle,
//! the membership views and the broadcast stream. Connection actors hold an
//! `Arc<Session>` and mutate it only through the methods here and in the
//! trackers.

pub mod membership;
pub mod metadata_cell;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpListener;
use tokio::sync::{Notify, OnceCell, broadcast, watch};

pub use membership::{ConnectionRecord, ConnectionRegistry};
pub use metadata_cell::MetadataCell;

use crate::config::{ReclaimPolicy, RiptideConfig};
use crate::connection::{Connector, TcpConnector};
use crate::exchange::{MetadataTracker, PeerAddress, StatusTracker};
use crate::storage::{FileStorageProvider, PieceStorage, StorageProvider};
use crate::torrent::{CachedInfoDict, InfoDictionary, InfoHash, PeerId, PeerMessage, TorrentError};

/// What a session knows about its torrent when it starts.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// Full metadata is available locally
    Metadata(CachedInfoDict),
    /// Only the info hash is known; metadata is fetched from peers
    InfoHash(InfoHash),
}

impl TorrentSource {
    /// Info hash of the torrent.
    pub fn info_hash(&self) -> InfoHash {
        match self {
            TorrentSource::Metadata(cached) => cached.info().info_hash,
            TorrentSource::InfoHash(info_hash) => *info_hash,
        }
    }
}

/// Point-in-time counters for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub pending: usize,
    pub established: usize,
    pub completed_pieces: u32,
    pub total_pieces: u32,
    pub metadata_complete: bool,
}

/// Shared state for exchanging one torrent with many peers.
pub struct Session {
    peer_id: PeerId,
    info_hash: InfoHash,
    config: RiptideConfig,
    registry: ConnectionRegistry,
    status: StatusTracker,
    metadata: MetadataTracker,
    info: MetadataCell,
    storage: OnceCell<Arc<dyn PieceStorage>>,
    storage_provider: Arc<dyn StorageProvider>,
    broadcast_tx: broadcast::Sender<PeerMessage>,
    /// Bumped whenever a requested metadata piece becomes requestable again
    metadata_freed: watch::Sender<u64>,
    connector: Arc<dyn Connector>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Session {
    /// Creates a session. With full metadata, storage is opened right away.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - Storage could not be opened
    pub async fn new(
        config: RiptideConfig,
        peer_id: PeerId,
        source: TorrentSource,
        storage_provider: Arc<dyn StorageProvider>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>, TorrentError> {
        let info_hash = source.info_hash();
        let (broadcast_tx, _) = broadcast::channel(config.exchange.broadcast_capacity.max(1));

        let session = Arc::new(Self {
            peer_id,
            info_hash,
            status: StatusTracker::new(config.exchange.block_size),
            metadata: MetadataTracker::new(info_hash),
            config,
            registry: ConnectionRegistry::new(),
            info: MetadataCell::new(None),
            storage: OnceCell::new(),
            storage_provider,
            broadcast_tx,
            metadata_freed: watch::Sender::new(0),
            connector,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        if let TorrentSource::Metadata(cached) = source {
            session.install_metadata(cached).await?;
        }

        tracing::info!(
            info_hash = %info_hash,
            metadata = session.info.is_set(),
            "Session created"
        );
        Ok(session)
    }

    /// Creates a session with file storage and TCP dialing from `config`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - Storage could not be opened
    pub async fn open(config: RiptideConfig, source: TorrentSource) -> Result<Arc<Self>, TorrentError> {
        let storage_provider = Arc::new(FileStorageProvider::new(config.storage.download_dir.clone()));
        let connector = Arc::new(TcpConnector::new(config.network.connect_timeout));
        Self::new(config, PeerId::generate(), source, storage_provider, connector).await
    }

    /// Local peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Torrent this session exchanges.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Session configuration.
    pub fn config(&self) -> &RiptideConfig {
        &self.config
    }

    /// Pending and established connection views.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Piece completion and block request tracker.
    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// Metadata fetching tracker.
    pub fn metadata(&self) -> &MetadataTracker {
        &self.metadata
    }

    /// Dialer used for outbound connections.
    pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Storage handle, once metadata is known.
    pub fn storage(&self) -> Option<Arc<dyn PieceStorage>> {
        self.storage.get().cloned()
    }

    /// Metadata, if already known.
    pub fn cached_metadata(&self) -> Option<CachedInfoDict> {
        self.info.get()
    }

    /// Waits until metadata is available.
    ///
    /// Never times out; callers wanting a deadline wrap this in
    /// `tokio::time::timeout`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SessionClosed` - Session dropped while waiting
    pub async fn wait_metadata(&self) -> Result<Arc<InfoDictionary>, TorrentError> {
        let cached = self.info.wait().await?;
        Ok(Arc::clone(cached.info()))
    }

    /// Waits for the full cached metadata, including its serialized bytes.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SessionClosed` - Session dropped while waiting
    pub(crate) async fn wait_cached_metadata(&self) -> Result<CachedInfoDict, TorrentError> {
        self.info.wait().await
    }

    /// Installs verified metadata: opens storage, initializes the status
    /// tracker from already verified pieces, then wakes waiters.
    ///
    /// Returns false when metadata was already installed.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidMetadata` - Metadata is for another torrent
    /// - `TorrentError::Storage` - Storage could not be opened
    pub async fn install_metadata(&self, cached: CachedInfoDict) -> Result<bool, TorrentError> {
        if cached.info().info_hash != self.info_hash {
            return Err(TorrentError::InvalidMetadata {
                reason: format!(
                    "metadata for {} installed into session for {}",
                    cached.info().info_hash,
                    self.info_hash
                ),
            });
        }
        if self.info.is_set() {
            return Ok(false);
        }

        let info = Arc::clone(cached.info());
        self.storage
            .get_or_try_init(|| async {
                let storage = self.storage_provider.open(&info).await?;
                let have = storage.verified_pieces().await?;
                tracing::info!(
                    info_hash = %self.info_hash,
                    name = %info.name,
                    verified = have.count(),
                    total = info.piece_count(),
                    "Storage opened"
                );
                self.status.initialize(info.layout(), have);
                Ok::<_, TorrentError>(storage)
            })
            .await?;

        self.metadata.mark_complete(cached.bytes().len() as u64);
        Ok(self.info.set(cached))
    }

    /// Publishes a message to every connection subscribed to the session.
    ///
    /// Returns how many subscribers were reached.
    pub fn broadcast(&self, message: PeerMessage) -> usize {
        self.broadcast_tx.send(message).unwrap_or(0)
    }

    /// New subscription to the broadcast stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerMessage> {
        self.broadcast_tx.subscribe()
    }

    /// Clears `peer`'s mark on a rejected metadata piece and wakes idle connections.
    pub(crate) fn metadata_rejected(&self, peer: &PeerAddress, piece: u32) {
        if self.metadata.cancel_pending(peer, piece) {
            self.wake_metadata_requesters();
        }
    }

    /// Frees every metadata piece requested from a departing peer.
    pub(crate) fn release_metadata_requests(&self, peer: &PeerAddress) {
        if self.metadata.release_peer(peer) {
            self.wake_metadata_requesters();
        }
    }

    /// Changes whenever metadata pieces are freed for other peers to serve.
    pub(crate) fn watch_freed_metadata(&self) -> watch::Receiver<u64> {
        self.metadata_freed.subscribe()
    }

    fn wake_metadata_requesters(&self) {
        self.metadata_freed.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Counters for monitoring.
    pub fn stats(&self) -> SessionStats {
        let (pending, established) = self.registry.counts();
        let have = self.status.have_bitfield();
        SessionStats {
            pending,
            established,
            completed_pieces: have.count(),
            total_pieces: have.len(),
            metadata_complete: self.info.is_set(),
        }
    }

    /// Snapshot of every established connection.
    pub fn established_peers(&self) -> Vec<ConnectionRecord> {
        self.registry.established()
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Accepts inbound peers on `listener` until the session is closed.
    ///
    /// Each accepted socket is handshaken on its own task and then handed to
    /// `establish`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - Listener failed
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), TorrentError> {
        if let Ok(local) = listener.local_addr() {
            tracing::info!(address = %local, info_hash = %self.info_hash, "Listening for peers");
        }

        loop {
            let (stream, remote): (_, SocketAddr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                () = self.shutdown.notified() => return Ok(()),
            };
            if self.is_closed() {
                return Ok(());
            }
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %remote, error = %e, "Could not disable Nagle");
            }

            let session = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = session.accept(Box::new(stream), remote).await {
                    tracing::debug!(peer = %remote, error = %e, "Inbound handshake failed");
                }
            });
        }
    }

    /// Releases the storage handle and stops the accept loop.
    ///
    /// Live connections are not torn down; they end on their own once the
    /// peers go away.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - Storage failed to close
    pub async fn close(&self) -> Result<(), TorrentError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.notify_waiters();

        if let Some(storage) = self.storage.get() {
            storage.close().await?;
        }
        tracing::info!(info_hash = %self.info_hash, "Session closed");
        Ok(())
    }

    /// Applies the reclaim policy after a connection went away.
    pub(crate) fn reclaim_if_idle(self: &Arc<Self>) {
        if self.config.exchange.reclaim_policy != ReclaimPolicy::CloseStorageWhenIdle
            || !self.registry.is_idle()
            || !self.status.is_complete()
            || self.is_closed()
        {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = Arc::clone(self);
        runtime.spawn(async move {
            if !session.registry.is_idle() {
                return;
            }
            tracing::info!(info_hash = %session.info_hash, "Session idle and complete, releasing storage");
            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "Failed to release idle storage");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageProvider;
    use crate::storage::test_fixtures::create_test_torrent;
    use crate::torrent::PieceIndex;

    async fn seeded_session() -> (Arc<Session>, crate::storage::test_fixtures::TestTorrent) {
        let torrent = create_test_torrent(16, 64);
        let session = Session::new(
            RiptideConfig::for_testing(),
            PeerId::generate(),
            TorrentSource::Metadata(torrent.cached.clone()),
            Arc::new(MemoryStorageProvider::seeded(torrent.content.clone())),
            Arc::new(TcpConnector::new(std::time::Duration::from_millis(100))),
        )
        .await
        .unwrap();
        (session, torrent)
    }

    #[tokio::test]
    async fn test_new_with_metadata_initializes_status() {
        let (session, torrent) = seeded_session().await;
        let stats = session.stats();

        assert!(stats.metadata_complete);
        assert_eq!(stats.total_pieces, torrent.info().piece_count());
        assert_eq!(stats.completed_pieces, stats.total_pieces);
        assert!(session.metadata().is_complete());
        assert!(session.storage().is_some());
    }

    #[tokio::test]
    async fn test_install_metadata_wrong_torrent_rejected() {
        let torrent = create_test_torrent(16, 64);
        let other = create_test_torrent(16, 80);
        let session = Session::new(
            RiptideConfig::for_testing(),
            PeerId::generate(),
            TorrentSource::InfoHash(torrent.info().info_hash),
            Arc::new(MemoryStorageProvider::empty()),
            Arc::new(TcpConnector::new(std::time::Duration::from_millis(100))),
        )
        .await
        .unwrap();

        let result = session.install_metadata(other.cached).await;
        assert!(matches!(result, Err(TorrentError::InvalidMetadata { .. })));
        assert!(!session.stats().metadata_complete);

        assert!(session.install_metadata(torrent.cached.clone()).await.unwrap());
        assert!(!session.install_metadata(torrent.cached).await.unwrap());
        assert!(session.wait_metadata().await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let (session, _torrent) = seeded_session().await;
        let mut first = session.subscribe();
        let mut second = session.subscribe();

        let have = PeerMessage::Have {
            piece_index: PieceIndex::new(2),
        };
        assert_eq!(session.broadcast(have.clone()), 2);
        assert_eq!(first.recv().await.unwrap(), have);
        assert_eq!(second.recv().await.unwrap(), have);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_noop() {
        let (session, _torrent) = seeded_session().await;
        assert_eq!(session.broadcast(PeerMessage::KeepAlive), 0);
    }

    #[tokio::test]
    async fn test_close_releases_storage_once() {
        let (session, _torrent) = seeded_session().await;
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(session.is_closed());
        let storage = session.storage().unwrap();
        assert!(storage.read_piece(PieceIndex::new(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_after_close() {
        let (session, _torrent) = seeded_session().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let serving = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.serve(listener).await })
        };
        tokio::task::yield_now().await;
        session.close().await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), serving).await;
        assert!(result.is_ok());
    }
}
