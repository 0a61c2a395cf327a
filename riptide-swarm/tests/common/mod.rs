//! In-memory peer network shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use riptide_swarm::storage::MemoryStorageProvider;
use riptide_swarm::torrent::protocol::MessageCodec;
use riptide_swarm::torrent::{PeerHandshake, PeerMessage};
use riptide_swarm::{
    BoxedStream, CachedInfoDict, Connector, PeerId, PendingConnection, RiptideConfig, Session,
    StorageProvider, TorrentCreator, TorrentError, TorrentSource,
};
use tokio::io::{DuplexStream, duplex};

pub const PIECE_SIZE: u32 = 32 * 1024;

/// Patterned content and the torrent describing it.
pub struct Fixture {
    pub cached: CachedInfoDict,
    pub content: Bytes,
}

pub fn fixture(total_length: usize) -> Fixture {
    let content: Vec<u8> = (0..total_length).map(|i| (i % 251) as u8).collect();
    let cached = TorrentCreator::with_piece_size(PIECE_SIZE).create("swarm.bin", &content);
    Fixture {
        cached,
        content: Bytes::from(content),
    }
}

/// Sessions reachable by address without sockets.
#[derive(Default)]
pub struct MemoryNetwork {
    peers: Mutex<HashMap<SocketAddr, Arc<Session>>>,
}

impl MemoryNetwork {
    pub fn register(&self, address: SocketAddr, session: Arc<Session>) {
        self.peers.lock().insert(address, session);
    }
}

/// Dials sessions on a `MemoryNetwork` and counts every attempt.
pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
    local: SocketAddr,
    pub dials: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(network: Arc<MemoryNetwork>, local: SocketAddr) -> Self {
        Self {
            network,
            local,
            dials: AtomicUsize::new(0),
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn dial(&self, address: SocketAddr) -> Result<BoxedStream, TorrentError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let target = self.network.peers.lock().get(&address).cloned().ok_or_else(|| {
            TorrentError::PeerConnectionError {
                reason: format!("No peer at {address}"),
            }
        })?;

        let (ours, theirs) = duplex(1 << 20);
        let local = self.local;
        tokio::spawn(async move {
            let _ = target.accept(Box::new(theirs), local).await;
        });
        Ok(Box::new(ours))
    }
}

pub fn address(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 5], port))
}

pub fn config() -> RiptideConfig {
    let mut config = RiptideConfig::for_testing();
    config.exchange.block_size = 16 * 1024;
    config
}

/// Session at `local` joined to `network`.
pub async fn join(
    network: &Arc<MemoryNetwork>,
    local: SocketAddr,
    config: RiptideConfig,
    source: TorrentSource,
    storage: impl StorageProvider + 'static,
) -> (Arc<Session>, Arc<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::new(Arc::clone(network), local));
    let session = Session::new(
        config,
        PeerId::generate(),
        source,
        Arc::new(storage),
        Arc::clone(&connector) as Arc<dyn Connector>,
    )
    .await
    .unwrap();
    network.register(local, Arc::clone(&session));
    (session, connector)
}

pub async fn seeder(network: &Arc<MemoryNetwork>, local: SocketAddr, fixture: &Fixture, config: RiptideConfig) -> Arc<Session> {
    let (session, _) = join(
        network,
        local,
        config,
        TorrentSource::Metadata(fixture.cached.clone()),
        MemoryStorageProvider::seeded(fixture.content.clone()),
    )
    .await;
    session
}

/// Hands `session` a connection whose far end the test drives by hand.
pub fn scripted_peer(session: &Arc<Session>, remote: SocketAddr) -> DuplexStream {
    let (ours, theirs) = duplex(1 << 20);
    let handshake = PeerHandshake::new(session.info_hash(), PeerId::generate());
    let pending = PendingConnection::new(remote, Box::new(ours), handshake);
    assert!(session.establish(pending).is_some());
    theirs
}

pub async fn read(stream: &mut DuplexStream) -> PeerMessage {
    tokio::time::timeout(Duration::from_secs(5), MessageCodec::read_message(stream))
        .await
        .expect("peer message within deadline")
        .expect("decodable peer message")
}

pub async fn write(stream: &mut DuplexStream, message: PeerMessage) {
    MessageCodec::write_message(stream, &message).await.unwrap();
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
