//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::BytesMut;
use clap::Subcommand;
use riptide_swarm::storage::MemoryStorageProvider;
use riptide_swarm::torrent::PieceIndex;
use riptide_swarm::{
    InfoDictionary, InfoHash, PeerId, RiptideConfig, Session, TcpConnector, TorrentCreator, TorrentSource,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Interval between progress reports while fetching.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Serve a local file to peers
    Seed {
        /// File to seed
        file: PathBuf,
        /// Address to accept peers on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Piece size in bytes
        #[arg(long)]
        piece_size: Option<u32>,
    },
    /// Download a torrent by info hash from the given peers
    Fetch {
        /// Hex info hash of the torrent
        info_hash: InfoHash,
        /// Peer to download from; repeat for several
        #[arg(short, long = "peer", required = true)]
        peers: Vec<SocketAddr>,
        /// Directory for piece data and the finished file
        #[arg(short, long, default_value = "downloads")]
        output_dir: PathBuf,
    },
    /// Print the info hash a file would be seeded under
    Info {
        /// File to describe
        file: PathBuf,
        /// Piece size in bytes
        #[arg(long)]
        piece_size: Option<u32>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the failure of the command that ran
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Seed {
            file,
            listen,
            piece_size,
        } => seed(&file, listen, piece_size).await,
        Commands::Fetch {
            info_hash,
            peers,
            output_dir,
        } => fetch(info_hash, &peers, output_dir).await,
        Commands::Info { file, piece_size } => describe(&file, piece_size).await,
    }
}

fn creator(piece_size: Option<u32>) -> TorrentCreator {
    piece_size.map_or_else(TorrentCreator::new, TorrentCreator::with_piece_size)
}

/// Serves `file` until interrupted.
///
/// # Errors
/// - File unreadable or empty
/// - Listener could not be bound
pub async fn seed(file: &Path, listen: Option<SocketAddr>, piece_size: Option<u32>) -> anyhow::Result<()> {
    let mut config = RiptideConfig::from_env();
    config.validate()?;
    if let Some(listen) = listen {
        config.network.listen_address = listen;
    }

    let (cached, content) = creator(piece_size)
        .create_from_file(file)
        .await
        .with_context(|| format!("Failed to build torrent for {}", file.display()))?;
    let info_hash = cached.info().info_hash;

    let listener = TcpListener::bind(config.network.listen_address)
        .await
        .with_context(|| format!("Failed to listen on {}", config.network.listen_address))?;
    let local = listener.local_addr()?;

    let connector = Arc::new(TcpConnector::new(config.network.connect_timeout));
    let session = Session::new(
        config,
        PeerId::generate(),
        TorrentSource::Metadata(cached),
        Arc::new(MemoryStorageProvider::seeded(content)),
        connector,
    )
    .await?;

    println!("Seeding {}", file.display());
    println!("  Info hash: {info_hash}");
    println!("  Listening: {local}");
    println!("  Fetch with: riptide fetch {info_hash} --peer {local}");

    let serving = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    println!("Shutting down");
    session.close().await?;
    serving.await??;
    Ok(())
}

/// Downloads `info_hash` from `peers` into `output_dir`.
///
/// # Errors
/// - Every peer went away before the download finished
/// - Storage or output file could not be written
pub async fn fetch(info_hash: InfoHash, peers: &[SocketAddr], output_dir: PathBuf) -> anyhow::Result<()> {
    let mut config = RiptideConfig::from_env();
    config.validate()?;
    config.storage.download_dir = output_dir.join(".pieces");

    let session = Session::open(config, TorrentSource::InfoHash(info_hash)).await?;
    let handles: Vec<JoinHandle<()>> = peers
        .iter()
        .filter_map(|peer| {
            let handle = session.connect(*peer);
            if handle.is_none() {
                tracing::warn!(peer = %peer, "Skipping duplicate peer");
            }
            handle
        })
        .collect();
    println!("Fetching {info_hash} from {} peer(s)", handles.len());

    let result = tokio::select! {
        result = wait_for_download(&session) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("Interrupted")),
    };

    for handle in &handles {
        handle.abort();
    }

    let info = result?;
    let written = write_content(&session, &info, &output_dir).await?;
    session.close().await?;

    for path in written {
        println!("  Wrote {}", path.display());
    }
    Ok(())
}

async fn wait_for_download(session: &Arc<Session>) -> anyhow::Result<Arc<InfoDictionary>> {
    let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
    let mut announced = false;

    loop {
        interval.tick().await;
        let stats = session.stats();

        if stats.metadata_complete && !announced {
            if let Some(cached) = session.cached_metadata() {
                println!(
                    "Metadata received: {} ({} bytes, {} pieces)",
                    cached.info().name,
                    cached.info().total_length,
                    cached.info().piece_count()
                );
            }
            announced = true;
        }

        println!(
            "  peers: {} connected, {} connecting | pieces: {}/{}",
            stats.established, stats.pending, stats.completed_pieces, stats.total_pieces
        );

        if stats.metadata_complete && stats.completed_pieces == stats.total_pieces {
            return Ok(session.wait_metadata().await?);
        }
        if stats.pending == 0 && stats.established == 0 {
            bail!("All peers disconnected before the download finished");
        }
    }
}

/// Reassembles verified pieces into the torrent's files under `output_dir`.
async fn write_content(session: &Session, info: &InfoDictionary, output_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let storage = session.storage().context("Storage not open")?;

    let mut content = BytesMut::with_capacity(info.total_length as usize);
    for index in 0..info.piece_count() {
        let piece = storage.read_piece(PieceIndex::new(index)).await?;
        content.extend_from_slice(&piece);
    }
    let content = content.freeze();

    let root = if info.files.len() > 1 {
        output_dir.join(&info.name)
    } else {
        output_dir.to_path_buf()
    };

    let mut written = Vec::with_capacity(info.files.len());
    let mut offset = 0usize;
    for file in &info.files {
        let path = file.path.iter().fold(root.clone(), |path, part| path.join(part));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let end = offset + file.length as usize;
        tokio::fs::write(&path, &content[offset..end])
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        offset = end;
        written.push(path);
    }
    Ok(written)
}

/// Prints the info hash and layout for `file`.
///
/// # Errors
/// - File unreadable or empty
pub async fn describe(file: &Path, piece_size: Option<u32>) -> anyhow::Result<()> {
    let (cached, _) = creator(piece_size).create_from_file(file).await?;
    let info = cached.info();
    println!("{}", info.info_hash);
    println!("  Name: {}", info.name);
    println!("  Size: {} bytes", info.total_length);
    println!("  Pieces: {} x {} bytes", info.piece_count(), info.piece_length);
    Ok(())
}
