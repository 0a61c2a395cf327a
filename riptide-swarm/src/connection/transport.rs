//! Peer transport: dialing, handshakes and already-accepted connections

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::exchange::PeerAddress;
use crate::torrent::protocol::HandshakeCodec;
use crate::torrent::{InfoHash, PeerHandshake, PeerId, TorrentError};

/// Byte stream a peer conversation runs over.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Type-erased peer stream, so TCP and in-memory pipes share one code path.
pub type BoxedStream = Box<dyn PeerStream>;

/// Cleanup run exactly once when a connection ends.
pub type Finalizer = Box<dyn FnOnce() + Send>;

/// Opens byte streams to peers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dials `address`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Peer unreachable or dial timed out
    async fn dial(&self, address: SocketAddr) -> Result<BoxedStream, TorrentError>;
}

/// Connector dialing plain TCP with a deadline.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates connector giving up after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn dial(&self, address: SocketAddr) -> Result<BoxedStream, TorrentError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TorrentError::PeerConnectionError {
                reason: format!("Connection to {address} timed out"),
            })?
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to connect to {address}: {e}"),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %address, error = %e, "Could not disable Nagle");
        }
        Ok(Box::new(stream))
    }
}

/// A connection whose remote handshake has already been read.
///
/// Produced by an accept loop and handed to `Session::establish`. The
/// finalizer runs when the connection ends, including when it is dropped
/// without ever being established.
pub struct PendingConnection {
    address: PeerAddress,
    stream: Option<BoxedStream>,
    remote: PeerHandshake,
    finalizer: Option<Finalizer>,
}

impl PendingConnection {
    /// Wraps an accepted stream and the handshake read from it.
    pub fn new(address: SocketAddr, stream: BoxedStream, remote: PeerHandshake) -> Self {
        Self {
            address: PeerAddress::with_peer_id(address, remote.peer_id),
            stream: Some(stream),
            remote,
            finalizer: None,
        }
    }

    /// Attaches cleanup to run once the connection is gone.
    pub fn with_finalizer(mut self, finalizer: impl FnOnce() + Send + 'static) -> Self {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Remote address, carrying the peer id from its handshake.
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// Handshake the remote sent.
    pub fn remote(&self) -> &PeerHandshake {
        &self.remote
    }

    /// Hands out the finalizer so the caller owns running it.
    pub(crate) fn take_finalizer(&mut self) -> Option<Finalizer> {
        self.finalizer.take()
    }

    /// Takes the stream; `None` if already taken.
    pub(crate) fn take_stream(&mut self) -> Option<BoxedStream> {
        self.stream.take()
    }
}

impl fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConnection")
            .field("address", &self.address)
            .field("remote", &self.remote)
            .field("has_finalizer", &self.finalizer.is_some())
            .finish()
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer();
        }
    }
}

/// Checks a remote handshake against the torrent and ourselves.
fn check_remote(remote: &PeerHandshake, info_hash: InfoHash, local: PeerId) -> Result<(), TorrentError> {
    if remote.info_hash != info_hash {
        return Err(TorrentError::ProtocolError {
            message: format!(
                "Handshake for {} but session serves {info_hash}",
                remote.info_hash
            ),
        });
    }
    if remote.peer_id == local {
        return Err(TorrentError::PeerConnectionError {
            reason: "Connected to ourselves".to_string(),
        });
    }
    Ok(())
}

fn timed_out(phase: &str) -> TorrentError {
    TorrentError::PeerConnectionError {
        reason: format!("Handshake {phase} timed out"),
    }
}

/// Outbound handshake: sends ours, then reads and checks theirs.
///
/// # Errors
///
/// - `TorrentError::PeerConnectionError` - Stream failed or deadline passed
/// - `TorrentError::ProtocolError` - Malformed handshake or wrong torrent
pub(crate) async fn outbound_handshake(
    stream: &mut BoxedStream,
    local: &PeerHandshake,
    deadline: Duration,
) -> Result<PeerHandshake, TorrentError> {
    let exchange = async {
        HandshakeCodec::write_handshake(stream, local).await?;
        let remote = HandshakeCodec::read_handshake(stream).await?;
        check_remote(&remote, local.info_hash, local.peer_id)?;
        Ok::<_, TorrentError>(remote)
    };
    tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| timed_out("exchange"))?
}

/// Inbound handshake: reads and checks theirs, then replies with ours.
///
/// # Errors
///
/// - `TorrentError::PeerConnectionError` - Stream failed or deadline passed
/// - `TorrentError::ProtocolError` - Malformed handshake or wrong torrent
pub(crate) async fn inbound_handshake(
    stream: &mut BoxedStream,
    local: &PeerHandshake,
    deadline: Duration,
) -> Result<PeerHandshake, TorrentError> {
    let exchange = async {
        let remote = HandshakeCodec::read_handshake(stream).await?;
        check_remote(&remote, local.info_hash, local.peer_id)?;
        HandshakeCodec::write_handshake(stream, local).await?;
        Ok::<_, TorrentError>(remote)
    };
    tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| timed_out("reply"))?
}
