//! Full transfers between sessions over the in-memory network

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use riptide_swarm::storage::MemoryStorageProvider;
use riptide_swarm::torrent::protocol::extension::{EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID};
use riptide_swarm::torrent::protocol::{ExtensionHandshake, MetadataMessage};
use riptide_swarm::torrent::{PeerMessage, PieceIndex};
use riptide_swarm::{PeerAddress, ReclaimPolicy, Session, TorrentSource};
use tokio::io::DuplexStream;

async fn assert_content(session: &Arc<Session>, fixture: &Fixture) {
    let storage = session.storage().unwrap();
    let info = fixture.cached.info();
    for index in 0..info.piece_count() {
        let piece = storage.read_piece(PieceIndex::new(index)).await.unwrap();
        let start = index as usize * info.piece_length as usize;
        assert_eq!(piece, fixture.content.slice(start..start + piece.len()));
    }
}

async fn wait_complete(session: &Arc<Session>) {
    eventually(|| {
        let stats = session.stats();
        stats.metadata_complete && stats.completed_pieces == stats.total_pieces
    })
    .await;
}

#[tokio::test]
async fn test_leecher_with_metadata_downloads_from_seeder() {
    let network = Arc::new(MemoryNetwork::default());
    let fixture = fixture(5 * PIECE_SIZE as usize + 1000);
    seeder(&network, address(6881), &fixture, config()).await;

    let (leecher, _) = join(
        &network,
        address(1),
        config(),
        TorrentSource::Metadata(fixture.cached.clone()),
        MemoryStorageProvider::empty(),
    )
    .await;

    leecher.connect(address(6881)).unwrap();
    wait_complete(&leecher).await;
    assert_content(&leecher, &fixture).await;
}

#[tokio::test]
async fn test_leecher_from_info_hash_fetches_metadata_then_pieces() {
    let network = Arc::new(MemoryNetwork::default());
    let fixture = fixture(3 * PIECE_SIZE as usize);
    seeder(&network, address(6881), &fixture, config()).await;

    let (leecher, _) = join(
        &network,
        address(1),
        config(),
        TorrentSource::InfoHash(fixture.cached.info().info_hash),
        MemoryStorageProvider::empty(),
    )
    .await;
    assert!(!leecher.stats().metadata_complete);

    leecher.connect(address(6881)).unwrap();
    let info = tokio::time::timeout(Duration::from_secs(5), leecher.wait_metadata())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&info, fixture.cached.info());

    wait_complete(&leecher).await;
    assert_content(&leecher, &fixture).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leecher_splits_requests_across_two_seeders() {
    let network = Arc::new(MemoryNetwork::default());
    let fixture = fixture(12 * PIECE_SIZE as usize);
    seeder(&network, address(6881), &fixture, config()).await;
    seeder(&network, address(6882), &fixture, config()).await;

    let (leecher, _) = join(
        &network,
        address(1),
        config(),
        TorrentSource::InfoHash(fixture.cached.info().info_hash),
        MemoryStorageProvider::empty(),
    )
    .await;

    leecher.connect(address(6881)).unwrap();
    leecher.connect(address(6882)).unwrap();
    wait_complete(&leecher).await;
    assert_content(&leecher, &fixture).await;
}

#[tokio::test]
async fn test_idle_complete_seeder_releases_storage_under_reclaim_policy() {
    let network = Arc::new(MemoryNetwork::default());
    let fixture = fixture(2 * PIECE_SIZE as usize);

    let mut reclaiming = config();
    reclaiming.exchange.reclaim_policy = ReclaimPolicy::CloseStorageWhenIdle;
    let seeder = seeder(&network, address(6881), &fixture, reclaiming).await;

    let (leecher, _) = join(
        &network,
        address(1),
        config(),
        TorrentSource::Metadata(fixture.cached.clone()),
        MemoryStorageProvider::empty(),
    )
    .await;

    let handle = leecher.connect(address(6881)).unwrap();
    wait_complete(&leecher).await;
    assert!(!seeder.is_closed());

    handle.abort();
    eventually(|| seeder.is_closed()).await;
    assert!(seeder.registry().is_idle());
}

#[tokio::test]
async fn test_idle_seeder_keeps_storage_by_default() {
    let network = Arc::new(MemoryNetwork::default());
    let fixture = fixture(2 * PIECE_SIZE as usize);
    let seeder = seeder(&network, address(6881), &fixture, config()).await;

    let (leecher, _) = join(
        &network,
        address(1),
        config(),
        TorrentSource::Metadata(fixture.cached.clone()),
        MemoryStorageProvider::empty(),
    )
    .await;

    let handle = leecher.connect(address(6881)).unwrap();
    wait_complete(&leecher).await;
    handle.abort();

    eventually(|| seeder.registry().is_idle()).await;
    assert!(!seeder.is_closed());
    assert!(seeder.storage().unwrap().read_piece(PieceIndex::new(0)).await.is_ok());
}

/// Announces ut_metadata support and the metadata size to the session.
async fn offer_metadata(peer: &mut DuplexStream, fixture: &Fixture) {
    let handshake = ExtensionHandshake::local(Some(fixture.cached.bytes().len() as u64), "scripted");
    write(peer, PeerMessage::Extended {
        id: EXTENSION_HANDSHAKE_ID,
        payload: handshake.encode(),
    })
    .await;
}

/// Reads until the session asks for a metadata piece.
async fn next_metadata_request(peer: &mut DuplexStream) -> u32 {
    loop {
        if let PeerMessage::Extended {
            id: LOCAL_UT_METADATA_ID,
            payload,
        } = read(peer).await
        {
            if let MetadataMessage::Request { piece } = MetadataMessage::decode(&payload).unwrap() {
                return piece;
            }
        }
    }
}

/// Session waiting on metadata with two peers offering it; the first holds piece 0.
async fn metadata_race(fixture: &Fixture) -> (Arc<Session>, DuplexStream, DuplexStream) {
    let network = Arc::new(MemoryNetwork::default());
    let (session, _) = join(
        &network,
        address(1),
        config(),
        TorrentSource::InfoHash(fixture.cached.info().info_hash),
        MemoryStorageProvider::empty(),
    )
    .await;

    let mut first = scripted_peer(&session, address(6881));
    offer_metadata(&mut first, fixture).await;
    assert_eq!(next_metadata_request(&mut first).await, 0);

    let mut second = scripted_peer(&session, address(6882));
    offer_metadata(&mut second, fixture).await;
    let second_address = PeerAddress::new(address(6882));
    eventually(|| {
        session
            .established_peers()
            .iter()
            .any(|record| record.address == second_address && record.remote_metadata_id.is_some())
    })
    .await;

    (session, first, second)
}

async fn serve_metadata(peer: &mut DuplexStream, fixture: &Fixture) {
    let bytes = fixture.cached.bytes().clone();
    write(peer, PeerMessage::Extended {
        id: LOCAL_UT_METADATA_ID,
        payload: MetadataMessage::Data {
            piece: 0,
            total_size: bytes.len() as u64,
            data: bytes,
        }
        .encode(),
    })
    .await;
}

#[tokio::test]
async fn test_metadata_reject_hands_piece_to_waiting_peer() {
    let fixture = fixture(3 * PIECE_SIZE as usize);
    let (session, mut first, mut second) = metadata_race(&fixture).await;

    write(&mut first, PeerMessage::Extended {
        id: LOCAL_UT_METADATA_ID,
        payload: MetadataMessage::Reject { piece: 0 }.encode(),
    })
    .await;

    assert_eq!(next_metadata_request(&mut second).await, 0);
    serve_metadata(&mut second, &fixture).await;
    let info = tokio::time::timeout(Duration::from_secs(5), session.wait_metadata())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&info, fixture.cached.info());
}

#[tokio::test]
async fn test_metadata_peer_disconnect_hands_piece_to_waiting_peer() {
    let fixture = fixture(3 * PIECE_SIZE as usize);
    let (session, first, mut second) = metadata_race(&fixture).await;

    drop(first);

    assert_eq!(next_metadata_request(&mut second).await, 0);
    serve_metadata(&mut second, &fixture).await;
    tokio::time::timeout(Duration::from_secs(5), session.wait_metadata())
        .await
        .unwrap()
        .unwrap();
    eventually(|| session.stats().established == 1).await;
}
